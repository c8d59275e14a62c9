//! MySmartGrid logging backend.
//!
//! Uploads a channel's buffered counter readings (or device registration and
//! heartbeat messages) to the MySmartGrid middleware, signing every body with
//! an HMAC-SHA1 digest of the channel's secret key.

pub mod config;
pub mod digest;
pub mod errors;
pub mod net;
pub mod simulate;
pub mod storage;
pub mod types;
pub mod uploader;

pub use config::{DaemonConfig, RuntimeOptions, UploaderConfig};
pub use errors::{ConfigError, UploadError};
pub use storage::SampleBuffer;
pub use types::{Channel, ChannelType, Delivery, Sample};
pub use uploader::Uploader;
