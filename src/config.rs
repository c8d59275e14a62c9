use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::ConfigError;
use crate::types::ChannelType;

pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SCALER: i64 = 1;
pub const DEFAULT_MIDDLEWARE: &str = "https://api.mysmartgrid.de:8443";

/// Per-channel uploader settings, fixed once the uploader is built.
#[derive(Debug, Clone, PartialEq)]
pub struct UploaderConfig {
    pub middleware_url: String,
    pub secret_key: String,
    pub channel_type: ChannelType,
    pub min_interval: Duration,
    pub scale_factor: i64,
    /// Skip TLS certificate and hostname checks. Compatibility mode for
    /// middleware deployments with self-signed certificates.
    pub insecure_tls: bool,
}

impl UploaderConfig {
    /// Parses the channel's `api` options.
    ///
    /// `middleware`, `secretKey` and `type` are required. `interval` and
    /// `scaler` fall back to their defaults when absent or unusable.
    pub fn from_options(options: &Map<String, Value>) -> Result<Self, ConfigError> {
        let middleware_url = required_str(options, "middleware")?;
        let secret_key = required_str(options, "secretKey")?;
        let channel_type = required_str(options, "type")?.parse::<ChannelType>()?;

        let interval_secs = optional(options, "interval", Value::as_u64, DEFAULT_INTERVAL_SECS);
        let scale_factor = optional(options, "scaler", Value::as_i64, DEFAULT_SCALER);
        let insecure_tls = optional(options, "insecureTls", Value::as_bool, false);

        Ok(Self {
            middleware_url,
            secret_key,
            channel_type,
            min_interval: Duration::from_secs(interval_secs),
            scale_factor,
            insecure_tls,
        })
    }
}

fn required_str(options: &Map<String, Value>, key: &'static str) -> Result<String, ConfigError> {
    match options.get(key) {
        None | Some(Value::Null) => Err(ConfigError::MissingOption(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ConfigError::WrongType {
            key,
            expected: "string",
        }),
    }
}

fn optional<T: std::fmt::Debug>(
    options: &Map<String, Value>,
    key: &str,
    extract: fn(&Value) -> Option<T>,
    default: T,
) -> T {
    match options.get(key) {
        None => default,
        Some(value) => extract(value).unwrap_or_else(|| {
            warn!(option = key, value = %value, default = ?default, "Invalid option value, using default");
            default
        }),
    }
}

/// Process-wide settings handed to each uploader instead of being read from
/// global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Long-running mode: failed sends pause for `retry_pause`.
    pub daemon: bool,
    pub retry_pause: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            daemon: false,
            retry_pause: Duration::from_secs(10),
        }
    }
}

/// Settings of the `msg-uploader` daemon.
///
/// Loaded from `msg_config.json` when present, then overridden by any of the
/// environment variables that are set. The secret key is never written back
/// to the file; supply it through `MSG_SECRET_KEY`.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    pub channel_uuid: String,
    pub channel_name: String,
    pub middleware: String,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub channel_type: Option<String>,
    pub interval_secs: Option<u64>,
    pub scaler: Option<i64>,
    pub insecure_tls: bool,
    pub sample_interval_secs: u64,
    pub send_tick_secs: u64,
    pub retry_pause_secs: u64,
    pub db_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            channel_uuid: Uuid::new_v4().to_string(),
            channel_name: "meter".to_string(),
            middleware: DEFAULT_MIDDLEWARE.to_string(),
            secret_key: None,
            channel_type: None,
            interval_secs: None,
            scaler: None,
            insecure_tls: false,
            sample_interval_secs: 10,
            send_tick_secs: 30,
            retry_pause_secs: 10,
            db_path: "./msg_buffer.db".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Replaces every setting whose variable `lookup` can resolve.
    /// Unparsable numbers leave the current value in place.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHANNEL_UUID") {
            self.channel_uuid = v;
        }
        if let Some(v) = lookup("CHANNEL_NAME") {
            self.channel_name = v;
        }
        if let Some(v) = lookup("MSG_MIDDLEWARE") {
            self.middleware = v;
        }
        if let Some(v) = lookup("MSG_SECRET_KEY") {
            self.secret_key = Some(v);
        }
        if let Some(v) = lookup("MSG_CHANNEL_TYPE") {
            self.channel_type = Some(v);
        }
        if let Some(v) = lookup("MSG_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.interval_secs = Some(v);
        }
        if let Some(v) = lookup("MSG_SCALER").and_then(|v| v.parse().ok()) {
            self.scaler = Some(v);
        }
        if let Some(v) = lookup("MSG_INSECURE_TLS") {
            self.insecure_tls = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("SAMPLE_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.sample_interval_secs = v;
        }
        if let Some(v) = lookup("SEND_TICK_SECS").and_then(|v| v.parse().ok()) {
            self.send_tick_secs = v;
        }
        if let Some(v) = lookup("RETRY_PAUSE_SECS").and_then(|v| v.parse().ok()) {
            self.retry_pause_secs = v;
        }
        if let Some(v) = lookup("DB_PATH") {
            self.db_path = v;
        }
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("msg_config.json")
    }

    /// File settings merged with the process environment.
    pub fn load() -> Result<Self> {
        Self::load_with(&Self::get_config_file_path(), |key| env::var(key).ok())
    }

    /// Reads `path` if it exists and applies `lookup` on top. A missing file is
    /// created from the merged settings, but only once they form a valid
    /// uploader configuration.
    pub fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if path.exists() {
            let mut config = Self::load_from_path(path)?;
            config.apply_overrides(lookup);
            return Ok(config);
        }

        let mut config = Self::default();
        config.apply_overrides(lookup);
        match config.validate() {
            Ok(_) => {
                if let Err(e) = config.save_to_path(path) {
                    warn!(error = %e, path = %path.display(), "Failed to persist config");
                }
            }
            Err(e) => {
                info!(error = %e, "Config incomplete, not persisting it");
            }
        }
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    /// Parses the uploader options these settings produce.
    pub fn validate(&self) -> Result<UploaderConfig, ConfigError> {
        UploaderConfig::from_options(&self.uploader_options())
    }

    /// Option map in the shape [`UploaderConfig::from_options`] expects.
    pub fn uploader_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert("middleware".into(), Value::from(self.middleware.clone()));
        if let Some(key) = &self.secret_key {
            options.insert("secretKey".into(), Value::from(key.clone()));
        }
        if let Some(channel_type) = &self.channel_type {
            options.insert("type".into(), Value::from(channel_type.clone()));
        }
        if let Some(interval) = self.interval_secs {
            options.insert("interval".into(), Value::from(interval));
        }
        if let Some(scaler) = self.scaler {
            options.insert("scaler".into(), Value::from(scaler));
        }
        options.insert("insecureTls".into(), Value::from(self.insecure_tls));
        options
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            daemon: true,
            retry_pause: Duration::from_secs(self.retry_pause_secs),
        }
    }
}
