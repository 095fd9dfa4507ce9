//! Service configuration
//!
//! Loaded from a TOML file, by default `<config dir>/tiltstep/config.toml`.
//! Every section falls back to its defaults when omitted, so a file only has
//! to list what it changes. A missing file means defaults throughout.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastSettings;
use crate::gesture::{ClassifierSettings, StreamId};
use crate::ingest::{IngestSettings, MqttSourceConfig, SourceConfig, StreamBinding};
use crate::server::ServerSettings;

const CONFIG_DIR: &str = "tiltstep";
const CONFIG_FILE: &str = "config.toml";

// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("No configuration directory available on this platform")]
    NoConfigDir,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub classifier: ClassifierSettings,
    pub broadcast: BroadcastSettings,
    pub ingest: IngestSettings,
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    // One local broker carrying two controllers
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            classifier: ClassifierSettings::default(),
            broadcast: BroadcastSettings::default(),
            ingest: IngestSettings::default(),
            sources: vec![SourceConfig::Mqtt(MqttSourceConfig {
                name: "broker".to_string(),
                host: "localhost".to_string(),
                port: 1883,
                client_id: "tiltstep".to_string(),
                user: None,
                password: None,
                keep_alive_secs: 5,
                connect_timeout_ms: 5000,
                streams: ["controller-1", "controller-2"]
                    .into_iter()
                    .map(|id| StreamBinding {
                        id: StreamId::from(id),
                        topic: format!("tiltstep/{}", id),
                    })
                    .collect(),
            })],
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the file at `path`. A missing file yields defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        if !exists {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        let config = Self::from_toml(&content, path)?;
        info!(
            "Loaded configuration from {} ({} sources)",
            path.display(),
            config.sources.len()
        );
        Ok(config)
    }

    /// Writes the default configuration to `path` unless a file is already
    /// there. Returns whether a file was written.
    pub async fn ensure_default(path: &Path) -> Result<bool, ConfigError> {
        let io_err = |e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        };

        if tokio::fs::try_exists(path).await.map_err(io_err)? {
            debug!("Config file {} already present", path.display());
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let content = toml::to_string_pretty(&Config::default())?;
        tokio::fs::write(path, content).await.map_err(io_err)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(true)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.classifier
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("classifier: {}", e)))?;

        if self.broadcast.client_buffer == 0 {
            return Err(ConfigError::Invalid(
                "broadcast.client_buffer must be at least 1".to_string(),
            ));
        }
        if self.ingest.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ingest.poll_timeout_ms must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut streams = HashSet::new();
        let mut client_ids = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name {}",
                    source.name()
                )));
            }
            // Persistent sessions sharing an id would keep taking each other over
            if let SourceConfig::Mqtt(mqtt) = source {
                if !client_ids.insert(mqtt.client_id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "source {} reuses MQTT client_id {}",
                        source.name(),
                        mqtt.client_id
                    )));
                }
            }
            let source_streams = source.streams();
            if source_streams.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source {} has no streams",
                    source.name()
                )));
            }
            // Each identity owns exactly one classifier, so it may appear once
            for stream in source_streams {
                if !streams.insert(stream.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "stream {} is bound more than once",
                        stream
                    )));
                }
            }
        }

        Ok(())
    }
}
