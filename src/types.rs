use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::ConfigError;
use crate::storage::SampleBuffer;

/// A single counter reading as held in the channel buffer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Kind of MySmartGrid resource a channel uploads to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Device,
    Sensor,
}

impl ChannelType {
    /// URL path segment under the middleware base URL.
    pub fn path_segment(&self) -> &'static str {
        match self {
            ChannelType::Device => "device",
            ChannelType::Sensor => "sensor",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

impl FromStr for ChannelType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device" => Ok(ChannelType::Device),
            "sensor" => Ok(ChannelType::Sensor),
            other => Err(ConfigError::BadChannelType(other.to_string())),
        }
    }
}

/// The logical data source an uploader serves.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub uuid: String,
    pub buffer: Arc<SampleBuffer>,
}

impl Channel {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>, buffer: Arc<SampleBuffer>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
            buffer,
        }
    }
}

// Device registration, sent once per session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Registration {
    pub key: String,
}

// Device lifesign. The telemetry fields are sent but not populated.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Heartbeat {
    pub memtotal: String,
    pub version: String,
    pub memcached: String,
    pub membuffers: String,
    pub memfree: String,
    pub uptime: String,
    pub reset: String,
}

/// Sensor upload: `[timestamp_ms, delta_from_baseline]` tuples.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MeasurementsPayload {
    pub measurements: Vec<(i64, i64)>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Payload {
    Registration(Registration),
    Heartbeat(Heartbeat),
    Measurements(MeasurementsPayload),
}

impl Payload {
    /// Number of measurement tuples carried, zero for device payloads.
    pub fn measurement_count(&self) -> usize {
        match self {
            Payload::Measurements(m) => m.measurements.len(),
            _ => 0,
        }
    }
}

/// Result of a `send` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The minimum interval has not elapsed; nothing was sent.
    Skipped,
    /// The middleware answered 200.
    Accepted { measurements: usize },
}
