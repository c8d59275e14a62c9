use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::config::{RuntimeOptions, UploaderConfig};
use crate::digest::hmac_sha1_hex;
use crate::errors::{ConfigError, UploadError, UploadResult};
use crate::net;
use crate::types::{
    Channel, ChannelType, Delivery, Heartbeat, MeasurementsPayload, Payload, Registration, Sample,
};

/// Sensor counter state. A copy is advanced while a payload is built and
/// only replaces the live state once the middleware accepts the upload.
#[derive(Debug, Clone, Default, PartialEq)]
struct Session {
    last_accepted_sample_ms: i64,
    first_counter: i64,
    last_counter: i64,
}

/// MySmartGrid backend for a single channel.
pub struct Uploader {
    channel: Channel,
    config: UploaderConfig,
    runtime: RuntimeOptions,
    client: Client,
    channel_identifier: String,
    url: String,
    session: Session,
    // Device state machine: set by the first registration attempt, never reset.
    registered_at: Option<DateTime<Utc>>,
    last_upload: Option<Instant>,
    last_response: String,
}

impl Uploader {
    pub fn new(
        channel: Channel,
        options: &Map<String, Value>,
        runtime: RuntimeOptions,
    ) -> Result<Self, ConfigError> {
        let config = UploaderConfig::from_options(options)?;
        Self::with_config(channel, config, runtime)
    }

    pub fn with_config(
        channel: Channel,
        config: UploaderConfig,
        runtime: RuntimeOptions,
    ) -> Result<Self, ConfigError> {
        debug!(channel = %channel.name, "Creating MySmartGrid uploader");

        let channel_identifier: String = channel.uuid.chars().filter(|c| *c != '-').collect();
        let url = format!(
            "{}/{}/{}",
            config.middleware_url.trim_end_matches('/'),
            config.channel_type.path_segment(),
            channel_identifier
        );
        let client = net::build_client(config.insecure_tls)?;

        info!(channel = %channel.name, url = %url, "MySmartGrid uploader ready");

        Ok(Self {
            channel,
            config,
            runtime,
            client,
            channel_identifier,
            url,
            session: Session::default(),
            registered_at: None,
            last_upload: None,
            last_response: String::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn channel_identifier(&self) -> &str {
        &self.channel_identifier
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Raw body of the most recent middleware response.
    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    /// Makes one upload attempt.
    ///
    /// Returns [`Delivery::Skipped`] without touching the network while the
    /// minimum interval has not elapsed. The interval runs from the last
    /// accepted sensor upload, or from the last device registration/heartbeat
    /// attempt. On a sensor failure the samples read for this attempt are
    /// pending again and the counter state is left as it was, so the next call
    /// retries the same data. In daemon mode a failure additionally pauses for
    /// the retry interval.
    pub async fn send(&mut self) -> UploadResult<Delivery> {
        if let Some(last) = self.last_upload {
            if last.elapsed() < self.config.min_interval {
                debug!(channel = %self.channel.name, "Interval not elapsed, skip message");
                return Ok(Delivery::Skipped);
            }
        }

        let (payload, session, marked) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(e, &[]).await,
        };

        match self.transmit(&payload).await {
            Ok(()) => {
                self.session = session;
                self.last_upload = Some(Instant::now());
                self.channel.buffer.purge()?;
                let measurements = payload.measurement_count();
                info!(
                    channel = %self.channel.name,
                    measurements,
                    "Upload accepted by middleware"
                );
                Ok(Delivery::Accepted { measurements })
            }
            Err(e) => self.fail(e, &marked).await,
        }
    }

    /// Rolls back the samples of a failed attempt, reports the failure and,
    /// in daemon mode, waits out the retry pause.
    async fn fail(&self, e: UploadError, marked: &[i64]) -> UploadResult<Delivery> {
        if !marked.is_empty() {
            if let Err(rollback) = self.channel.buffer.undelete(marked) {
                error!(channel = %self.channel.name, error = %rollback, "Failed to roll back sample buffer");
            }
        }
        error!(channel = %self.channel.name, error = %e, "Upload failed");

        if self.runtime.daemon {
            info!(
                channel = %self.channel.name,
                pause_secs = self.runtime.retry_pause.as_secs(),
                "Waiting for next request due to previous failure"
            );
            tokio::time::sleep(self.runtime.retry_pause).await;
        }
        Err(e)
    }

    async fn transmit(&mut self, payload: &Payload) -> UploadResult<()> {
        let body = serde_json::to_string(payload)?;
        debug!(channel = %self.channel.name, body = %body, "JSON request body");

        let digest = hmac_sha1_hex(&self.config.secret_key, body.as_bytes());
        debug!(channel = %self.channel.name, digest = %digest, "Header digest");

        let (status, text) = net::post_signed(&self.client, &self.url, body, &digest).await?;
        self.last_response = text;

        if status != StatusCode::OK {
            debug!(channel = %self.channel.name, response = %self.last_response, "Middleware response");
            return Err(UploadError::Protocol {
                status,
                message: net::parse_exception(&self.last_response),
            });
        }

        debug!(channel = %self.channel.name, status = status.as_u16(), "Request succeeded");
        Ok(())
    }

    /// Builds the payload for this attempt along with the counter state it
    /// implies and the buffer rows it marked. Device channels advance their
    /// registration state and send time right away.
    fn prepare(&mut self) -> UploadResult<(Payload, Session, Vec<i64>)> {
        let mut session = self.session.clone();
        match self.config.channel_type {
            ChannelType::Device => {
                self.last_upload = Some(Instant::now());
                let payload = self.device_payload(Utc::now());
                Ok((payload, session, Vec::new()))
            }
            ChannelType::Sensor => {
                let batch = self.channel.buffer.mark_pending()?;
                let payload = self.measurements_payload(&batch.samples, &mut session);
                Ok((payload, session, batch.ids))
            }
        }
    }

    fn device_payload(&mut self, now: DateTime<Utc>) -> Payload {
        let registered = self.registered_at.is_some();
        self.registered_at = Some(now);

        if registered {
            Payload::Heartbeat(Heartbeat::default())
        } else {
            Payload::Registration(Registration {
                key: self.config.secret_key.clone(),
            })
        }
    }

    fn measurements_payload(&self, samples: &[Sample], session: &mut Session) -> Payload {
        let mut measurements = Vec::new();

        for sample in samples {
            let timestamp = sample.timestamp.timestamp_millis();
            let value = (sample.value * self.config.scale_factor as f64) as i64;

            if session.first_counter < 1 {
                session.first_counter = value;
                session.last_counter = value;
            } else if value > session.last_counter && timestamp > session.last_accepted_sample_ms {
                measurements.push((timestamp, value - session.first_counter));
                session.last_counter = value;
                session.last_accepted_sample_ms = timestamp;
            }
        }

        Payload::Measurements(MeasurementsPayload { measurements })
    }
}
