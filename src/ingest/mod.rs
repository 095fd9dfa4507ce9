//! Stream ingestion
//!
//! Each upstream source gets its own adapter running on a dedicated OS thread:
//!
//! ```text
//! ReadingSource ─[RawRecord]→ StreamAdapter ─[DirectionEvent]→ EventBus
//! (blocking pull)             (parse, classify, ack)            (non-blocking)
//! ```
//!
//! Sources are pulled one record at a time and a record is acknowledged only
//! after it went through its classifier (or was dropped as malformed), giving
//! at-least-once consumption. Adapters share nothing but the bus, so a stalled
//! source never holds up another stream.

pub mod adapter;
pub mod mqtt_source;
pub mod replay_source;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::gesture::StreamId;

pub use adapter::{AdapterStats, IngestHandle, PollOutcome, StreamAdapter};
pub use mqtt_source::{MqttSource, MqttSourceConfig, StreamBinding};
pub use replay_source::{ReplaySource, ReplaySourceConfig};

// Ingestion errors
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Transport unavailable for source {source_name}: {reason}")]
    TransportUnavailable { source_name: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to acknowledge record: {0}")]
    Acknowledge(String),

    #[error("Source exhausted")]
    Exhausted,

    #[error("Failed to start ingestion thread: {0}")]
    Thread(String),
}

/// How a record is confirmed back to its transport once consumed
#[derive(Debug, Clone)]
pub enum AckToken {
    /// Nothing to confirm (local sources)
    Immediate,
    Mqtt(Box<rumqttc::Publish>),
}

/// One unit of input as handed out by a source
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub stream: StreamId,
    pub payload: String,
    pub ack: AckToken,
}

impl RawRecord {
    pub fn new(stream: StreamId, payload: impl Into<String>) -> Self {
        Self {
            stream,
            payload: payload.into(),
            ack: AckToken::Immediate,
        }
    }
}

/// Blocking pull interface implemented by every upstream transport.
///
/// `next_record` returns `Ok(None)` when nothing arrived within `timeout`, which
/// gives the adapter a chance to observe cancellation.
pub trait ReadingSource: Send + fmt::Debug {
    fn name(&self) -> &str;

    fn streams(&self) -> Vec<StreamId>;

    fn next_record(&mut self, timeout: Duration) -> Result<Option<RawRecord>, IngestError>;

    fn acknowledge(&mut self, record: RawRecord) -> Result<(), IngestError>;

    /// Releases transport resources. Called once on shutdown.
    fn close(&mut self);
}

/// Upstream source definition as found in the configuration file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Mqtt(MqttSourceConfig),
    Replay(ReplaySourceConfig),
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::Mqtt(config) => &config.name,
            SourceConfig::Replay(config) => &config.name,
        }
    }

    pub fn streams(&self) -> Vec<StreamId> {
        match self {
            SourceConfig::Mqtt(config) => config.streams.iter().map(|b| b.id.clone()).collect(),
            SourceConfig::Replay(config) => vec![config.stream.clone()],
        }
    }

    /// Connects to the transport. Must run on the thread that will own the
    /// source: the MQTT client drives its own runtime internally.
    pub fn open(&self) -> Result<Box<dyn ReadingSource>, IngestError> {
        match self {
            SourceConfig::Mqtt(config) => Ok(Box::new(MqttSource::connect(config)?)),
            SourceConfig::Replay(config) => Ok(Box::new(ReplaySource::open(config)?)),
        }
    }
}

/// Settings shared by all adapters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Upper bound on how long an adapter blocks waiting for one record
    pub poll_timeout_ms: u64,

    /// Period of the per-adapter stats log line
    pub stats_interval_secs: u64,

    /// Pause after a transport error before pulling again
    pub error_backoff_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 250,
            stats_interval_secs: 30,
            error_backoff_ms: 1000,
        }
    }
}

impl IngestSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}
