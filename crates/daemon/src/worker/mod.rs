//! The worker side of the broker: the framed channel, the ways to spawn a
//! worker, and the supervisor that keeps one healthy.

pub mod channel;
pub mod spawner;
pub mod supervisor;

pub use channel::{ChannelError, WorkerChannel};
pub use spawner::{LocalSpawner, ProcessSpawner, WorkerControl, WorkerExit, WorkerLink, WorkerSpawner};
pub use supervisor::{ScanProgress, StopOutcome, WorkerState, WorkerSupervisor};
