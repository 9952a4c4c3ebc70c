use std::{fs, io, path::Path, time::Duration};

use gallerysync_core::MAX_SUBMISSION_FILE_BYTES;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{channel::ChannelConfig, gallery::DuplicatePolicy};

/// Config files are expected to be tiny; refuse anything bigger than this.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8000/ws";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub connect_timeout_ms: u64,
    pub duplicate_policy: DuplicatePolicy,
    /// After this long without a result a submission is reported as possibly lost.
    pub pending_timeout_secs: u64,
    pub max_file_bytes: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            connect_timeout_ms: 10_000,
            duplicate_policy: DuplicatePolicy::default(),
            pending_timeout_secs: 30,
            max_file_bytes: MAX_SUBMISSION_FILE_BYTES as u64,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        let url = Url::parse(&self.server_url)
            .map_err(|err| format!("invalid server_url `{}`: {err}", self.server_url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!(
                "server_url must use ws or wss, got `{}`",
                url.scheme()
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than zero".to_owned());
        }
        if self.pending_timeout_secs == 0 {
            return Err("pending_timeout_secs must be greater than zero".to_owned());
        }
        if self.max_file_bytes == 0 || self.max_file_bytes > MAX_SUBMISSION_FILE_BYTES as u64 {
            return Err(format!(
                "max_file_bytes must be between 1 and {MAX_SUBMISSION_FILE_BYTES}"
            ));
        }
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            server_url: self.server_url.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}

#[derive(Debug)]
pub enum ConfigLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            ConfigLoadError::TooLarge { size, max } => {
                write!(f, "config file too large: {size} bytes (max {max})")
            }
            ConfigLoadError::Read(e) => write!(f, "read failed: {e}"),
            ConfigLoadError::Parse(e) => write!(f, "parse failed: {e}"),
            ConfigLoadError::Invalid(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl std::error::Error for ConfigLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigLoadError::Metadata(e) => Some(e),
            ConfigLoadError::Read(e) => Some(e),
            ConfigLoadError::Parse(e) => Some(e),
            ConfigLoadError::TooLarge { .. } | ConfigLoadError::Invalid(_) => None,
        }
    }
}

pub fn parse_config_json(data: &str) -> Result<ClientConfig, serde_json::Error> {
    serde_json::from_str::<ClientConfig>(data)
}

pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigLoadError> {
    let meta = fs::metadata(path).map_err(ConfigLoadError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    let config = parse_config_json(&data).map_err(ConfigLoadError::Parse)?;
    config.validate().map_err(ConfigLoadError::Invalid)?;
    Ok(config)
}
