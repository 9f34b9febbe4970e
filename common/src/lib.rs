pub mod config;
#[cfg(feature = "esp32")]
pub mod esp_node;
#[cfg(feature = "host")]
pub mod host_http;
pub mod identity;
pub mod led;
pub mod link;
pub mod multipart;
pub mod ota;
pub mod params;
pub mod readings;
pub mod signal;
pub mod storage;
pub mod upload;
pub mod web;

pub use config::{LedConfig, NetworkConfig, NodeConfig, RuntimeConfig};
pub use identity::{ClientId, ClientIdentity, PreferenceStore};
pub use led::{Indicator, PixelDriver, Rgb, StatusLed};
pub use readings::{SensorData, SensorRegistry};
pub use signal::{ReportForm, ReportScheduler, SignalKind};
pub use storage::{FileEntry, FlashStore, StorageError};
pub use upload::{UploadError, UploadSession, UploadSink, UploadStatus};
