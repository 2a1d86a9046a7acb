//! Ways to bring up a worker.
//!
//! [`ProcessSpawner`] launches the `scan_worker` executable. [`LocalSpawner`]
//! runs the same worker loop as a task inside the broker, which is what the
//! tests and the `--in-process` development mode use.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use scan_worker::{serve, MockConfig, MockScanner, WorkerError};

use crate::config::WorkerConfig;
use crate::worker::channel::{BoxedReader, BoxedWriter};

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited on its own; `None` when terminated by a signal.
    Exited(Option<i32>),
    /// Killed by the broker.
    Killed,
    /// The exit could not be observed.
    Lost(String),
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Exited(Some(code)) => write!(f, "exited with status {}", code),
            WorkerExit::Exited(None) => write!(f, "terminated by signal"),
            WorkerExit::Killed => write!(f, "killed"),
            WorkerExit::Lost(reason) => write!(f, "lost ({})", reason),
        }
    }
}

/// Lifetime control over one spawned worker.
#[async_trait]
pub trait WorkerControl: Send {
    /// OS process id, if the worker is a process.
    fn pid(&self) -> Option<u32>;

    /// Resolve when the worker has ended. Cancel safe, and returns the same
    /// value again once the worker is gone.
    async fn wait(&mut self) -> WorkerExit;

    /// End the worker now.
    async fn kill(&mut self);
}

/// A freshly spawned worker: its channel ends and its control handle.
pub struct WorkerLink {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub control: Box<dyn WorkerControl>,
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self) -> io::Result<WorkerLink>;
}

const MAX_FRAME_LEN_FLAG: &str = "--max-frame-len";

/// Launches the worker executable with piped stdin/stdout.
///
/// stderr is inherited so the worker's logs land next to the broker's.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The worker is told the broker's frame limit unless `args` already
    /// set one.
    pub fn from_config(config: &WorkerConfig) -> Self {
        let mut args = config.args.clone();
        let has_limit = args
            .iter()
            .any(|arg| arg == MAX_FRAME_LEN_FLAG || arg.starts_with("--max-frame-len="));
        if !has_limit {
            args.push(MAX_FRAME_LEN_FLAG.to_string());
            args.push(config.max_frame_len.to_string());
        }
        Self::new(resolve_program(&config.program), args)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// A bare program name resolves to a sibling of the running executable when
/// one exists there.
fn resolve_program(program: &Path) -> PathBuf {
    let is_bare = program.components().count() == 1 && !program.is_absolute();
    if is_bare {
        if let Some(sibling) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(program)))
        {
            if sibling.is_file() {
                return sibling;
            }
        }
    }
    program.to_path_buf()
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self) -> io::Result<WorkerLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stdout not piped"))?;

        info!(program = %self.program.display(), pid = ?child.id(), "Spawned worker process");
        Ok(WorkerLink {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            control: Box::new(ProcessControl { child, exit: None }),
        })
    }
}

struct ProcessControl {
    child: Child,
    exit: Option<WorkerExit>,
}

#[async_trait]
impl WorkerControl for ProcessControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match self.child.wait().await {
            Ok(status) => WorkerExit::Exited(status.code()),
            Err(e) => WorkerExit::Lost(e.to_string()),
        };
        self.exit = Some(exit.clone());
        exit
    }

    async fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "Failed to kill worker process");
        }
        self.exit = Some(WorkerExit::Killed);
    }
}

/// Runs the worker loop with a [`MockScanner`] as an in-process task,
/// connected through in-memory pipes.
///
/// Every spawn gets a fresh scanner built from the same [`MockConfig`], so a
/// shared [`scan_worker::ScanJournal`] sees all generations.
#[derive(Clone)]
pub struct LocalSpawner {
    config: MockConfig,
    max_frame_len: usize,
    ready_delay: Duration,
    spawned: Arc<AtomicU64>,
    current: Arc<Mutex<Option<AbortHandle>>>,
}

impl LocalSpawner {
    pub fn new(config: MockConfig, max_frame_len: usize) -> Self {
        Self {
            config,
            max_frame_len,
            ready_delay: Duration::ZERO,
            spawned: Arc::new(AtomicU64::new(0)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Hold back each worker's `Ready` for `delay`.
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    /// Number of workers spawned so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Abort the most recently spawned worker, as if its process died.
    pub fn kill_current(&self) -> bool {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match current {
            Some(handle) => {
                warn!("Killing in-process worker");
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl WorkerSpawner for LocalSpawner {
    async fn spawn(&self) -> io::Result<WorkerLink> {
        let (broker_out, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, broker_in) = tokio::io::duplex(64 * 1024);
        let scanner = MockScanner::new(self.config.clone());
        let ready_delay = self.ready_delay;
        let max_frame_len = self.max_frame_len;

        let task = tokio::spawn(async move {
            if !ready_delay.is_zero() {
                tokio::time::sleep(ready_delay).await;
            }
            serve(worker_in, worker_out, Box::new(scanner), max_frame_len).await
        });

        let generation = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task.abort_handle());
        debug!(generation, "Spawned in-process worker");

        Ok(WorkerLink {
            reader: Box::new(broker_in),
            writer: Box::new(broker_out),
            control: Box::new(LocalControl { task, exit: None }),
        })
    }
}

struct LocalControl {
    task: JoinHandle<Result<(), WorkerError>>,
    exit: Option<WorkerExit>,
}

#[async_trait]
impl WorkerControl for LocalControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> WorkerExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match (&mut self.task).await {
            Ok(Ok(())) => WorkerExit::Exited(Some(0)),
            Ok(Err(e)) => {
                warn!(error = %e, "In-process worker failed");
                WorkerExit::Exited(Some(1))
            }
            Err(e) if e.is_cancelled() => WorkerExit::Killed,
            Err(e) => WorkerExit::Lost(e.to_string()),
        };
        self.exit = Some(exit.clone());
        exit
    }

    async fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        self.task.abort();
        self.wait().await;
    }
}
