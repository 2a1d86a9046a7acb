#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tokio::task::JoinHandle;
    use tokio_util::codec::{FramedRead, FramedWrite};
    use tokio_util::sync::CancellationToken;

    use scan_types::worker::UNSOLICITED_ID;
    use scan_types::{
        FrameCodec, PaperSource, ScanOptions, WorkerCommand, WorkerEvent, WorkerReply,
        WorkerRequest, DEFAULT_MAX_FRAME_LEN,
    };
    use scan_worker::{MockConfig, MockFault, MockScanner, ScanJournal};

    use crate::bridge::{DeviceBridge, Operation, OperationOutput, ScanProgress};
    use crate::config::{BridgeConfig, RestartPolicy, WorkerConfig};
    use crate::error::BrokerError;
    use crate::worker::spawner::{
        LocalSpawner, WorkerControl, WorkerExit, WorkerLink, WorkerSpawner,
    };
    use crate::worker::supervisor::{StopOutcome, WorkerState, WorkerSupervisor};

    struct Harness {
        bridge: DeviceBridge,
        dispatcher: JoinHandle<StopOutcome>,
        shutdown: CancellationToken,
    }

    impl Harness {
        async fn stop(self) -> StopOutcome {
            self.shutdown.cancel();
            self.dispatcher.await.unwrap()
        }
    }

    fn bridge_config(queue_depth: usize) -> BridgeConfig {
        BridgeConfig {
            queue_depth,
            enumerate_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(5),
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            startup_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_secs(1),
            ..WorkerConfig::default()
        }
    }

    async fn start(spawner: Arc<dyn WorkerSpawner>, config: BridgeConfig, max_failures: u32) -> Harness {
        start_with_worker(spawner, config, max_failures, worker_config()).await
    }

    async fn start_with_worker(
        spawner: Arc<dyn WorkerSpawner>,
        config: BridgeConfig,
        max_failures: u32,
        worker_config: WorkerConfig,
    ) -> Harness {
        let policy = RestartPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            factor: 2.0,
            max_consecutive_failures: max_failures,
        };
        let mut supervisor = WorkerSupervisor::new(spawner, worker_config, policy);
        supervisor.start().await.unwrap();
        let shutdown = CancellationToken::new();
        let (bridge, dispatcher) = DeviceBridge::start(supervisor, config, shutdown.clone());
        Harness {
            bridge,
            dispatcher,
            shutdown,
        }
    }

    fn feeder_scan(device_id: &str) -> Operation {
        Operation::Scan {
            device_id: device_id.to_string(),
            options: ScanOptions {
                source: PaperSource::Feeder,
                ..ScanOptions::default()
            },
        }
    }

    fn labelled_scan(label: &str) -> Operation {
        Operation::Scan {
            device_id: "mock-flatbed".to_string(),
            options: ScanOptions {
                job_name: Some(label.to_string()),
                ..ScanOptions::default()
            },
        }
    }

    #[tokio::test]
    async fn test_requests_reach_worker_in_submission_order() {
        let journal = ScanJournal::new();
        let config = MockConfig {
            scan_delay: Duration::from_millis(5),
            ..MockConfig::default()
        }
        .with_journal(journal.clone());
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner), bridge_config(32), 5).await;

        let labels: Vec<String> = (0..8).map(|i| format!("job-{}", i)).collect();
        let handles: Vec<_> = labels
            .iter()
            .map(|label| h.bridge.submit(labelled_scan(label)).unwrap())
            .collect();
        let results = futures::future::join_all(handles.into_iter().map(|h| h.scan_result())).await;
        assert!(results.iter().all(|r| r.is_ok()));

        assert_eq!(journal.entries(), labels);
        assert_eq!(journal.peak_concurrency(), 1);
        let stats = h.bridge.stats();
        assert_eq!(stats.peak_in_service, 1);
        assert_eq!(stats.completed, 8);
        assert_eq!(h.stop().await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_full_queue_overloads_immediately() {
        let spawner = LocalSpawner::new(MockConfig::default(), DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner), bridge_config(2), 5).await;

        let first = h.bridge.submit(Operation::EnumerateDevices).unwrap();
        let second = h.bridge.submit(Operation::EnumerateDevices).unwrap();
        let third = h.bridge.submit(Operation::EnumerateDevices);
        assert!(matches!(third, Err(BrokerError::Overloaded { depth: 2 })));
        assert_eq!(h.bridge.stats().rejected, 1);

        assert!(first.devices().await.is_ok());
        assert!(second.devices().await.is_ok());
        h.stop().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_frees_its_slot() {
        let journal = ScanJournal::new();
        let config = MockConfig::default().with_journal(journal.clone());
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner), bridge_config(1), 5).await;

        let abandoned = h.bridge.submit(labelled_scan("abandoned")).unwrap();
        drop(abandoned);
        assert_eq!(h.bridge.queued(), 0);

        let kept = h.bridge.submit(labelled_scan("kept")).unwrap();
        kept.scan_result().await.unwrap();
        assert_eq!(journal.entries(), vec!["kept"]);
        assert_eq!(h.bridge.stats().cancelled, 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_driver_error_is_device_failure() {
        let spawner = LocalSpawner::new(MockConfig::default(), DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner.clone()), bridge_config(4), 5).await;

        let err = h
            .bridge
            .scan("missing-device", ScanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::DeviceFailure(ref m) if m.contains("missing-device")));
        assert!(h.bridge.enumerate_devices().await.is_ok());
        assert_eq!(spawner.spawn_count(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_crash_fails_request_and_worker_is_replaced() {
        let config = MockConfig::default().with_fault("boom", MockFault::Panic);
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner.clone()), bridge_config(4), 5).await;

        let err = h.bridge.scan("boom", ScanOptions::default()).await.unwrap_err();
        assert!(matches!(err, BrokerError::WorkerCrashed(_)));

        let devices = h.bridge.enumerate_devices().await.unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(spawner.spawn_count(), 2);
        assert_eq!(h.stop().await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_deadline_counts_from_entering_service() {
        let config =
            MockConfig::default().with_fault("slow", MockFault::Hang(Duration::from_millis(400)));
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let mut bridge_config = bridge_config(4);
        bridge_config.scan_timeout = Duration::from_millis(150);
        let h = start(Arc::new(spawner), bridge_config, 5).await;

        let slow = h
            .bridge
            .submit(Operation::Scan {
                device_id: "slow".to_string(),
                options: ScanOptions::default(),
            })
            .unwrap();
        // Queued behind the slow scan for longer than its own deadline.
        let quick = h.bridge.submit(labelled_scan("quick")).unwrap();

        assert!(matches!(
            slow.scan_result().await,
            Err(BrokerError::OperationTimeout { operation: "scan", .. })
        ));
        assert!(quick.scan_result().await.is_ok());
        h.stop().await;
    }

    #[tokio::test]
    async fn test_restart_ceiling_then_operator_restart() {
        let config = MockConfig::default().with_fault("boom", MockFault::Panic);
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner), bridge_config(4), 2).await;

        for _ in 0..2 {
            let err = h.bridge.scan("boom", ScanOptions::default()).await.unwrap_err();
            assert_eq!(err.kind(), scan_types::ErrorKind::WorkerCrashed);
        }

        let mut unavailable = false;
        for _ in 0..50 {
            match h.bridge.submit(Operation::EnumerateDevices) {
                Err(BrokerError::WorkerUnavailable { failures }) => {
                    assert_eq!(failures, 2);
                    unavailable = true;
                    break;
                }
                Ok(handle) => drop(handle),
                Err(e) => panic!("unexpected error {}", e),
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(unavailable);

        let mut state = h.bridge.worker_state();
        h.bridge.restart_worker();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == WorkerState::Ready),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(h.bridge.enumerate_devices().await.is_ok());
        h.stop().await;
    }

    #[tokio::test]
    async fn test_idle_worker_death_is_noticed() {
        let spawner = LocalSpawner::new(MockConfig::default(), DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner.clone()), bridge_config(4), 5).await;

        assert!(spawner.kill_current());
        for _ in 0..100 {
            if spawner.spawn_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(spawner.spawn_count(), 2);
        assert!(h.bridge.enumerate_devices().await.is_ok());
        h.stop().await;
    }

    #[tokio::test]
    async fn test_drain_fails_queued_requests_after_grace() {
        let config = MockConfig {
            scan_delay: Duration::from_millis(300),
            ..MockConfig::default()
        };
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner), bridge_config(8), 5).await;

        let handles: Vec<_> = (0..3)
            .map(|i| h.bridge.submit(labelled_scan(&format!("job-{}", i))).unwrap())
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.bridge.close();
        assert!(matches!(
            h.bridge.submit(Operation::EnumerateDevices),
            Err(BrokerError::ShuttingDown)
        ));
        assert!(!h.bridge.drain(Duration::from_millis(100)).await);

        let bridge = h.bridge.clone();
        let outcome = h.stop().await;
        let results = futures::future::join_all(handles.into_iter().map(|h| h.outcome())).await;
        for result in results {
            assert!(matches!(result, Err(BrokerError::ShuttingDown)));
        }
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(bridge.queued(), 0);
    }

    #[tokio::test]
    async fn test_drain_returns_once_idle() {
        let spawner = LocalSpawner::new(MockConfig::default(), DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner), bridge_config(8), 5).await;

        let handle = h.bridge.submit(Operation::EnumerateDevices).unwrap();
        h.bridge.close();
        let (drained, outcome) = tokio::join!(h.bridge.drain(Duration::from_secs(2)), handle.devices());
        assert!(drained);
        assert!(outcome.is_ok());
        assert_eq!(h.stop().await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_scans_larger_than_frame_limit_are_streamed() {
        // Ten 16.9 KB pages per scan against a 64 KiB frame limit.
        let limit = 64 * 1024;
        let config = MockConfig {
            feeder_pages: 10,
            ..MockConfig::default()
        };
        let spawner = LocalSpawner::new(config, limit);
        let worker = WorkerConfig {
            max_frame_len: limit,
            ..worker_config()
        };
        let h = start_with_worker(Arc::new(spawner.clone()), bridge_config(4), 5, worker).await;

        for _ in 0..5 {
            let handle = h.bridge.submit(feeder_scan("mock-feeder")).unwrap();
            let result = handle.scan_result().await.unwrap();
            assert_eq!(result.pages.len(), 10);
            assert!(result.summary().total_bytes > limit as u64);
        }
        assert_eq!(h.bridge.enumerate_devices().await.unwrap().len(), 2);
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(h.stop().await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_page_over_frame_limit_fails_only_that_scan() {
        let limit = 8 * 1024;
        let spawner = LocalSpawner::new(MockConfig::default(), limit);
        let worker = WorkerConfig {
            max_frame_len: limit,
            ..worker_config()
        };
        let h = start_with_worker(Arc::new(spawner.clone()), bridge_config(4), 5, worker).await;

        let err = h
            .bridge
            .submit(feeder_scan("mock-feeder"))
            .unwrap()
            .scan_result()
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::DeviceFailure(ref m) if m.contains("frame")));
        assert!(h.bridge.enumerate_devices().await.is_ok());
        assert_eq!(spawner.spawn_count(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_pages_reach_caller_before_scan_completes() {
        let config = MockConfig {
            scan_delay: Duration::from_millis(50),
            ..MockConfig::default()
        };
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner), bridge_config(4), 5).await;

        let mut handle = h.bridge.submit(feeder_scan("mock-feeder")).unwrap();
        assert!(matches!(
            handle.next_progress().await,
            Some(ScanProgress::Started(ref m)) if m.device_id == "mock-feeder"
        ));
        let Some(ScanProgress::Page(first)) = handle.next_progress().await else {
            panic!("expected the first page");
        };
        assert_eq!(first.index, 0);
        assert_eq!(first.data, MockScanner::page_bytes("mock-feeder", 0, first.data.len()));
        assert_eq!(h.bridge.stats().completed, 0);

        let mut pages = 1;
        while let Some(update) = handle.next_progress().await {
            assert!(matches!(update, ScanProgress::Page(_)));
            pages += 1;
        }
        assert_eq!(pages, 3);
        let Ok(OperationOutput::ScanComplete(summary)) = handle.outcome().await else {
            panic!("expected a completed scan");
        };
        assert_eq!(summary.page_count, 3);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_jam_fails_scan_after_delivered_pages() {
        let config = MockConfig::default().with_fault("jammy", MockFault::Jam { after_pages: 2 });
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner.clone()), bridge_config(4), 5).await;

        let mut handle = h.bridge.submit(feeder_scan("jammy")).unwrap();
        let mut pages = 0;
        while let Some(update) = handle.next_progress().await {
            if let ScanProgress::Page(_) = update {
                pages += 1;
            }
        }
        assert_eq!(pages, 2);
        assert!(matches!(
            handle.outcome().await,
            Err(BrokerError::DeviceFailure(ref m)) if m.contains("paper jam")
        ));
        assert_eq!(spawner.spawn_count(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_caller_ignoring_progress_does_not_stall_worker() {
        let config = MockConfig {
            feeder_pages: 20,
            ..MockConfig::default()
        };
        let spawner = LocalSpawner::new(config, DEFAULT_MAX_FRAME_LEN);
        let h = start(Arc::new(spawner.clone()), bridge_config(4), 5).await;

        let handle = h.bridge.submit(feeder_scan("mock-feeder")).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.outcome())
            .await
            .unwrap();
        assert!(matches!(outcome, Ok(OperationOutput::ScanComplete(s)) if s.page_count == 20));
        assert_eq!(spawner.spawn_count(), 1);
        h.stop().await;
    }

    /// Run a fake worker over in-memory pipes. `respond` decides the reply
    /// to each request; `None` leaves it unanswered. The fake exits after
    /// answering `Shutdown`.
    fn scripted_worker<F>(respond: F) -> WorkerLink
    where
        F: Fn(&WorkerRequest) -> Option<WorkerReply> + Send + 'static,
    {
        let (broker_out, worker_in) = tokio::io::duplex(4096);
        let (worker_out, broker_in) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut requests =
                FramedRead::new(worker_in, FrameCodec::<WorkerRequest, WorkerReply>::new());
            let mut replies =
                FramedWrite::new(worker_out, FrameCodec::<WorkerRequest, WorkerReply>::new());
            let ready = WorkerReply {
                id: UNSOLICITED_ID,
                event: WorkerEvent::Ready {
                    pid: 0,
                    driver: "scripted".to_string(),
                },
            };
            if replies.send(ready).await.is_err() {
                return;
            }
            while let Some(Ok(request)) = requests.next().await {
                if let Some(reply) = respond(&request) {
                    if replies.send(reply).await.is_err() {
                        return;
                    }
                }
                if request.command == WorkerCommand::Shutdown {
                    return;
                }
            }
        });
        WorkerLink {
            reader: Box::new(broker_in),
            writer: Box::new(broker_out),
            control: Box::new(TaskControl(Some(task))),
        }
    }

    /// Never answers a heartbeat but honours `Shutdown`.
    struct DeafToPing {
        pings: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerSpawner for DeafToPing {
        async fn spawn(&self) -> io::Result<WorkerLink> {
            let pings = self.pings.clone();
            Ok(scripted_worker(move |request| {
                let event = match request.command {
                    WorkerCommand::Ping => {
                        pings.fetch_add(1, Ordering::SeqCst);
                        return None;
                    }
                    WorkerCommand::Shutdown => WorkerEvent::ShuttingDown,
                    WorkerCommand::EnumerateDevices => WorkerEvent::Devices(Vec::new()),
                    WorkerCommand::Scan { .. } => WorkerEvent::Failed {
                        message: "no scanner".to_string(),
                    },
                };
                Some(WorkerReply {
                    id: request.id,
                    event,
                })
            }))
        }
    }

    #[tokio::test]
    async fn test_shutdown_cuts_heartbeat_short() {
        let pings = Arc::new(AtomicUsize::new(0));
        let spawner = Arc::new(DeafToPing {
            pings: pings.clone(),
        });
        let worker = WorkerConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            ..worker_config()
        };
        let h = start_with_worker(spawner, bridge_config(4), 5, worker).await;

        for _ in 0..100 {
            if pings.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pings.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        assert_eq!(h.stop().await, StopOutcome::Graceful);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// First worker answers with the wrong correlation id; later ones are
    /// healthy in-process workers.
    struct DesyncOnce {
        healthy: LocalSpawner,
        used: AtomicBool,
    }

    struct TaskControl(Option<JoinHandle<()>>);

    #[async_trait]
    impl WorkerControl for TaskControl {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> WorkerExit {
            if let Some(task) = self.0.as_mut() {
                let _ = task.await;
                self.0 = None;
            }
            WorkerExit::Exited(Some(0))
        }

        async fn kill(&mut self) {
            if let Some(task) = self.0.take() {
                task.abort();
            }
        }
    }

    #[async_trait]
    impl WorkerSpawner for DesyncOnce {
        async fn spawn(&self) -> io::Result<WorkerLink> {
            if self.used.swap(true, Ordering::SeqCst) {
                return self.healthy.spawn().await;
            }
            Ok(scripted_worker(|request| {
                Some(WorkerReply {
                    id: request.id + 100,
                    event: WorkerEvent::Devices(Vec::new()),
                })
            }))
        }
    }

    #[tokio::test]
    async fn test_wrong_correlation_id_is_desync_and_replaces_worker() {
        let healthy = LocalSpawner::new(MockConfig::default(), DEFAULT_MAX_FRAME_LEN);
        let spawner = Arc::new(DesyncOnce {
            healthy: healthy.clone(),
            used: AtomicBool::new(false),
        });
        let h = start(spawner, bridge_config(4), 5).await;

        let err = h.bridge.enumerate_devices().await.unwrap_err();
        assert!(matches!(err, BrokerError::ProtocolDesync(_)));

        let devices = h.bridge.enumerate_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(healthy.spawn_count(), 1);
        h.stop().await;
    }
}
