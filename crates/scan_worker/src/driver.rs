//! Common types and traits for scanning drivers

use scan_types::{DeviceDescriptor, PageImage, ScanMetadata, ScanOptions};
use thiserror::Error;

/// Errors reported by a driver for a single operation.
///
/// These are returned to the caller as `DeviceFailure`; they do not make the
/// worker unhealthy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// No device with the given id is attached.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    /// The device cannot honour the requested options.
    #[error("Unsupported option: {0}")]
    Unsupported(String),
    /// Hardware communication error
    #[error("Hardware error: {0}")]
    HardwareError(String),
    /// The driver could not be opened.
    #[error("Initialization error: {0}")]
    InitializationError(String),
    /// The receiving side stopped taking pages; the driver should end the job.
    #[error("Scan aborted: {0}")]
    Aborted(String),
}

/// Receives the output of a scan as it is acquired.
pub trait PageSink {
    /// Called once, before the first page.
    fn begin(&mut self, metadata: ScanMetadata) -> Result<(), DriverError>;

    /// An error means no further pages are wanted.
    fn page(&mut self, page: PageImage) -> Result<(), DriverError>;
}

/// A scanning backend hosted by the worker.
///
/// Calls are blocking and never overlap: the worker drives one call at a time
/// on a blocking thread.
pub trait ScanDriver: Send + 'static {
    /// Short driver name reported in the worker's ready message.
    fn name(&self) -> &str;

    /// Open the driver. Called once before the worker reports readiness.
    fn initialize(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceDescriptor>, DriverError>;

    /// Acquire a job, handing each page to `sink` as soon as it is read.
    ///
    /// A driver must call [`PageSink::begin`] before the first page and stop
    /// at the first sink error, returning it.
    fn scan(
        &mut self,
        device_id: &str,
        options: &ScanOptions,
        sink: &mut dyn PageSink,
    ) -> Result<(), DriverError>;
}
