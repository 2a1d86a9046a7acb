//! Simulated scanner.
//!
//! Produces deterministic page bytes so that a scan can be verified end to end,
//! and can be told to misbehave on specific devices to exercise the broker's
//! crash and timeout handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use scan_types::{
    ConnectionType, DeviceDescriptor, ImageFormat, PageImage, PaperSource, ScanMetadata,
    ScanOptions,
};

use crate::driver::{DriverError, PageSink, ScanDriver};

const MIN_DPI: u32 = 50;
const MAX_DPI: u32 = 1200;

/// Misbehaviour injected for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFault {
    /// The driver panics mid-scan, taking the worker down.
    Panic,
    /// The driver blocks for the given time before answering.
    Hang(Duration),
    /// The feeder jams after delivering this many pages.
    Jam { after_pages: u32 },
}

/// Configuration for the simulated scanner.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub devices: Vec<DeviceDescriptor>,
    /// Pages delivered by the feeder per job (doubled for duplex).
    pub feeder_pages: u32,
    pub page_width_px: u32,
    pub page_height_px: u32,
    /// Time spent per page.
    pub scan_delay: Duration,
    /// Time spent opening the driver before reporting ready.
    pub init_delay: Duration,
    pub faults: HashMap<String, MockFault>,
    /// Records the operations the driver observed.
    pub journal: Option<Arc<ScanJournal>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            devices: vec![
                DeviceDescriptor {
                    id: "mock-flatbed".to_string(),
                    name: "Mock Flatbed Scanner".to_string(),
                    connection: ConnectionType::Usb,
                },
                DeviceDescriptor {
                    id: "mock-feeder".to_string(),
                    name: "Mock Document Feeder".to_string(),
                    connection: ConnectionType::Network,
                },
            ],
            feeder_pages: 3,
            page_width_px: 64,
            page_height_px: 88,
            scan_delay: Duration::ZERO,
            init_delay: Duration::ZERO,
            faults: HashMap::new(),
            journal: None,
        }
    }
}

impl MockConfig {
    pub fn with_fault(mut self, device_id: &str, fault: MockFault) -> Self {
        self.devices.push(DeviceDescriptor {
            id: device_id.to_string(),
            name: format!("Faulty device ({:?})", fault),
            connection: ConnectionType::Virtual,
        });
        self.faults.insert(device_id.to_string(), fault);
        self
    }

    pub fn with_journal(mut self, journal: Arc<ScanJournal>) -> Self {
        self.journal = Some(journal);
        self
    }
}

/// Order and overlap of the operations a driver instance observed.
///
/// Shared across worker generations so a test can inspect what the
/// "hardware" saw regardless of restarts.
#[derive(Debug, Default)]
pub struct ScanJournal {
    entries: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScanJournal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self, label: String) -> JournalGuard<'_> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(label);
        JournalGuard { journal: self }
    }

    /// Operation labels in the order the driver started them.
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Highest number of operations ever running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct JournalGuard<'a> {
    journal: &'a ScanJournal,
}

impl Drop for JournalGuard<'_> {
    fn drop(&mut self) {
        self.journal.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A driver that does not access any hardware.
pub struct MockScanner {
    config: MockConfig,
    initialized: bool,
}

impl MockScanner {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            initialized: false,
        }
    }

    /// Bytes of page `page_index` of a job on `device_id`, as this driver
    /// produces them.
    pub fn page_bytes(device_id: &str, page_index: u32, len: usize) -> Vec<u8> {
        let seed = device_id
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        let page_seed = seed.wrapping_add(page_index.wrapping_mul(131));
        (0..len)
            .map(|i| (page_seed.wrapping_add((i as u32).wrapping_mul(7)) & 0xff) as u8)
            .collect()
    }

    /// Number of pages a job with `options` produces.
    pub fn page_count(&self, options: &ScanOptions) -> u32 {
        let available = match options.source {
            PaperSource::Glass => 1,
            PaperSource::Feeder => self.config.feeder_pages,
            PaperSource::Duplex => self.config.feeder_pages * 2,
        };
        options.max_pages.map_or(available, |max| available.min(max))
    }

    fn journal_label(device_id: &str, options: &ScanOptions) -> String {
        options
            .job_name
            .clone()
            .unwrap_or_else(|| format!("scan:{}", device_id))
    }

    fn apply_fault(&self, device_id: &str) {
        match self.config.faults.get(device_id) {
            Some(MockFault::Panic) => {
                warn!(device_id, "Injected fault: driver panic");
                panic!("mock driver fault on device '{}'", device_id);
            }
            Some(MockFault::Hang(duration)) => {
                warn!(device_id, ?duration, "Injected fault: driver hang");
                thread::sleep(*duration);
            }
            Some(MockFault::Jam { .. }) | None => {}
        }
    }
}

impl ScanDriver for MockScanner {
    fn name(&self) -> &str {
        "mock"
    }

    fn initialize(&mut self) -> Result<(), DriverError> {
        if !self.config.init_delay.is_zero() {
            thread::sleep(self.config.init_delay);
        }
        self.initialized = true;
        info!(devices = self.config.devices.len(), "MockScanner initialized");
        Ok(())
    }

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, DriverError> {
        if !self.initialized {
            return Err(DriverError::InitializationError(
                "driver not initialized".to_string(),
            ));
        }
        let _guard = self
            .config
            .journal
            .as_ref()
            .map(|j| j.enter("enumerate".to_string()));
        Ok(self.config.devices.clone())
    }

    fn scan(
        &mut self,
        device_id: &str,
        options: &ScanOptions,
        sink: &mut dyn PageSink,
    ) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::InitializationError(
                "driver not initialized".to_string(),
            ));
        }
        if !self.config.devices.iter().any(|d| d.id == device_id) {
            return Err(DriverError::DeviceNotFound(device_id.to_string()));
        }
        if !(MIN_DPI..=MAX_DPI).contains(&options.dpi) {
            return Err(DriverError::Unsupported(format!(
                "resolution {} dpi is outside {}-{} dpi",
                options.dpi, MIN_DPI, MAX_DPI
            )));
        }
        if options.max_pages == Some(0) {
            return Err(DriverError::Unsupported(
                "max_pages must be at least 1".to_string(),
            ));
        }

        let _guard = self
            .config
            .journal
            .as_ref()
            .map(|j| j.enter(Self::journal_label(device_id, options)));

        self.apply_fault(device_id);

        sink.begin(ScanMetadata {
            device_id: device_id.to_string(),
            resolution_dpi: options.dpi,
            color_mode: options.color_mode,
            format: ImageFormat::Raw,
            acquired_at: Utc::now(),
        })?;

        let jam_after = match self.config.faults.get(device_id) {
            Some(MockFault::Jam { after_pages }) => Some(*after_pages),
            _ => None,
        };
        let (width, height) = (self.config.page_width_px, self.config.page_height_px);
        let page_len = width as usize * height as usize * options.color_mode.bytes_per_pixel();

        for index in 0..self.page_count(options) {
            if jam_after == Some(index) {
                warn!(device_id, page = index, "Injected fault: paper jam");
                return Err(DriverError::HardwareError(format!(
                    "paper jam at page {}",
                    index + 1
                )));
            }
            if !self.config.scan_delay.is_zero() {
                thread::sleep(self.config.scan_delay);
            }
            sink.page(PageImage {
                index,
                width_px: width,
                height_px: height,
                data: Self::page_bytes(device_id, index, page_len),
            })?;
            debug!(device_id, page = index, "Page acquired");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_types::ColorMode;

    /// Keeps everything a scan hands over.
    #[derive(Default)]
    struct Collected {
        metadata: Option<ScanMetadata>,
        pages: Vec<PageImage>,
        /// Refuse pages once this many were taken.
        accept: Option<usize>,
    }

    impl PageSink for Collected {
        fn begin(&mut self, metadata: ScanMetadata) -> Result<(), DriverError> {
            assert!(self.metadata.is_none(), "begin called twice");
            self.metadata = Some(metadata);
            Ok(())
        }

        fn page(&mut self, page: PageImage) -> Result<(), DriverError> {
            assert!(self.metadata.is_some(), "page before begin");
            if self.accept.map_or(false, |limit| self.pages.len() >= limit) {
                return Err(DriverError::Aborted("full".to_string()));
            }
            self.pages.push(page);
            Ok(())
        }
    }

    fn scanner() -> MockScanner {
        let mut scanner = MockScanner::new(MockConfig::default());
        scanner.initialize().unwrap();
        scanner
    }

    fn scan(
        scanner: &mut MockScanner,
        device_id: &str,
        options: &ScanOptions,
    ) -> (Result<(), DriverError>, Collected) {
        let mut collected = Collected::default();
        let result = scanner.scan(device_id, options, &mut collected);
        (result, collected)
    }

    #[test]
    fn test_enumerate_lists_configured_devices() {
        let devices = scanner().enumerate_devices().unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["mock-flatbed", "mock-feeder"]);
    }

    #[test]
    fn test_uninitialized_driver_refuses_work() {
        let mut scanner = MockScanner::new(MockConfig::default());
        assert!(matches!(
            scanner.enumerate_devices(),
            Err(DriverError::InitializationError(_))
        ));
    }

    #[test]
    fn test_glass_scan_is_single_deterministic_page() {
        let options = ScanOptions {
            color_mode: ColorMode::Grayscale,
            ..ScanOptions::default()
        };
        let (result, collected) = scan(&mut scanner(), "mock-flatbed", &options);
        result.unwrap();
        let metadata = collected.metadata.unwrap();
        assert_eq!(metadata.device_id, "mock-flatbed");
        assert_eq!(metadata.color_mode, ColorMode::Grayscale);
        assert_eq!(collected.pages.len(), 1);
        assert_eq!(collected.pages[0].data.len(), 64 * 88);
        assert_eq!(
            collected.pages[0].data,
            MockScanner::page_bytes("mock-flatbed", 0, 64 * 88)
        );
    }

    #[test]
    fn test_feeder_page_count_honours_max_pages() {
        let scanner = scanner();
        let feeder = ScanOptions {
            source: PaperSource::Feeder,
            ..ScanOptions::default()
        };
        assert_eq!(scanner.page_count(&feeder), 3);
        let duplex = ScanOptions {
            source: PaperSource::Duplex,
            max_pages: Some(4),
            ..ScanOptions::default()
        };
        assert_eq!(scanner.page_count(&duplex), 4);
    }

    #[test]
    fn test_pages_differ_between_pages_and_devices() {
        assert_ne!(
            MockScanner::page_bytes("mock-feeder", 0, 32),
            MockScanner::page_bytes("mock-feeder", 1, 32)
        );
        assert_ne!(
            MockScanner::page_bytes("mock-feeder", 0, 32),
            MockScanner::page_bytes("mock-flatbed", 0, 32)
        );
    }

    #[test]
    fn test_unknown_device_and_bad_options_are_rejected() {
        let mut scanner = scanner();
        let (result, collected) = scan(&mut scanner, "nope", &ScanOptions::default());
        assert_eq!(result, Err(DriverError::DeviceNotFound("nope".to_string())));
        assert!(collected.metadata.is_none());

        let options = ScanOptions {
            dpi: 9600,
            ..ScanOptions::default()
        };
        let (result, _) = scan(&mut scanner, "mock-flatbed", &options);
        assert!(matches!(result, Err(DriverError::Unsupported(_))));
    }

    #[test]
    fn test_sink_refusal_stops_the_job() {
        let mut scanner = scanner();
        let options = ScanOptions {
            source: PaperSource::Feeder,
            ..ScanOptions::default()
        };
        let mut collected = Collected {
            accept: Some(1),
            ..Collected::default()
        };
        let result = scanner.scan("mock-feeder", &options, &mut collected);
        assert!(matches!(result, Err(DriverError::Aborted(_))));
        assert_eq!(collected.pages.len(), 1);
    }

    #[test]
    fn test_jam_fails_after_delivered_pages() {
        let mut scanner = MockScanner::new(
            MockConfig::default().with_fault("jammy", MockFault::Jam { after_pages: 2 }),
        );
        scanner.initialize().unwrap();
        let options = ScanOptions {
            source: PaperSource::Feeder,
            ..ScanOptions::default()
        };
        let (result, collected) = scan(&mut scanner, "jammy", &options);
        assert!(matches!(result, Err(DriverError::HardwareError(ref m)) if m.contains("jam")));
        assert_eq!(collected.pages.len(), 2);
    }

    #[test]
    fn test_journal_records_labels_in_order() {
        let journal = ScanJournal::new();
        let mut scanner = MockScanner::new(MockConfig::default().with_journal(journal.clone()));
        scanner.initialize().unwrap();
        scanner.enumerate_devices().unwrap();
        let options = ScanOptions {
            job_name: Some("job-1".to_string()),
            ..ScanOptions::default()
        };
        scan(&mut scanner, "mock-flatbed", &options).0.unwrap();
        scan(&mut scanner, "mock-feeder", &ScanOptions::default()).0.unwrap();
        assert_eq!(
            journal.entries(),
            vec!["enumerate", "job-1", "scan:mock-feeder"]
        );
        assert_eq!(journal.peak_concurrency(), 1);
    }

    #[test]
    #[should_panic(expected = "mock driver fault")]
    fn test_panic_fault() {
        let mut scanner = MockScanner::new(MockConfig::default().with_fault("boom", MockFault::Panic));
        scanner.initialize().unwrap();
        let _ = scan(&mut scanner, "boom", &ScanOptions::default());
    }
}
