use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a scanning device is attached to the machine running the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Usb,
    Network,
    /// A software device, e.g. the simulated scanner.
    Virtual,
}

/// Describes one enumerated scanning device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable identifier used to address the device in a scan request.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub connection: ConnectionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    BlackWhite,
    Grayscale,
    Color,
}

impl ColorMode {
    /// Bytes per pixel of an uncompressed page in this mode.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorMode::BlackWhite | ColorMode::Grayscale => 1,
            ColorMode::Color => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperSource {
    Glass,
    Feeder,
    Duplex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    /// Uncompressed pixel rows.
    Raw,
    Png,
    Jpeg,
}

/// Options for a single scan job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Resolution in dots per inch.
    pub dpi: u32,
    pub color_mode: ColorMode,
    pub source: PaperSource,
    /// Upper bound on pages pulled from a feeder. `None` means until empty.
    pub max_pages: Option<u32>,
    /// Free-form label for the job. Drivers may use it to name output.
    pub job_name: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            dpi: 300,
            color_mode: ColorMode::Color,
            source: PaperSource::Glass,
            max_pages: None,
            job_name: None,
        }
    }
}

/// Describes a scan job. Known before the first page is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMetadata {
    pub device_id: String,
    pub resolution_dpi: u32,
    pub color_mode: ColorMode,
    pub format: ImageFormat,
    pub acquired_at: DateTime<Utc>,
}

/// Totals of a finished scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub page_count: u32,
    pub total_bytes: u64,
}

impl ScanSummary {
    pub fn record(&mut self, page: &PageImage) {
        self.page_count += 1;
        self.total_bytes += page.data.len() as u64;
    }
}

/// One scanned page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    /// Zero-based position of the page in the job.
    pub index: u32,
    pub width_px: u32,
    pub height_px: u32,
    pub data: Vec<u8>,
}

/// A whole scan held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub metadata: ScanMetadata,
    pub pages: Vec<PageImage>,
}

impl ScanResult {
    pub fn summary(&self) -> ScanSummary {
        let mut summary = ScanSummary::default();
        for page in &self.pages {
            summary.record(page);
        }
        summary
    }
}
