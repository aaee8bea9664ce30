use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::ChannelKey;
use crate::error::ConfigError;
use crate::node_id::NodeId;

#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    /// Directory of the JSON state files.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// One tracked mesh node.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub title: Option<String>,
    /// Node id as `!` plus 8 hex digits.
    pub id: String,
    /// Topic carrying the node's protobuf service envelopes.
    pub pb_topic: String,
    #[serde(default)]
    pub stat_topic: Option<String>,
    /// Base64 channel key; the default channel key when absent.
    #[serde(default)]
    pub key: Option<String>,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("mtastic-state")
}

impl BridgeConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(input)?;
        for device in &cfg.devices {
            device.validate()?;
        }
        Ok(cfg)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, pb_topic: impl Into<String>) -> Self {
        Self { title: None, id: id.into(), pb_topic: pb_topic.into(), stat_topic: None, key: None }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node_id()?;
        if self.pb_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic(self.id.clone()));
        }
        self.channel_key()?;
        Ok(())
    }

    pub fn node_id(&self) -> Result<NodeId, ConfigError> {
        self.id.parse()
    }

    pub fn channel_key(&self) -> Result<ChannelKey, ConfigError> {
        match self.key.as_deref() {
            None => Ok(ChannelKey::default()),
            Some(descriptor) => ChannelKey::from_descriptor(descriptor)
                .map_err(|source| ConfigError::InvalidKey { id: self.id.clone(), source }),
        }
    }

    /// Status topic, ignoring blank values.
    pub fn stat_topic(&self) -> Option<&str> {
        self.stat_topic.as_deref().map(str::trim).filter(|topic| !topic.is_empty())
    }

    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}
