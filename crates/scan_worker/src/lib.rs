//! The scan worker: the isolated child process that owns the scanning driver.
//!
//! The broker never touches a driver directly. It spawns this program, talks
//! to it over stdin/stdout with the framed protocol from
//! [`scan_types::worker`], and replaces it whenever it misbehaves.

pub mod driver;
pub mod mock;
pub mod serve;

// Re-export the main types that users need
pub use driver::{DriverError, PageSink, ScanDriver};
pub use mock::{MockConfig, MockFault, MockScanner, ScanJournal};
pub use serve::{serve, WorkerError};
