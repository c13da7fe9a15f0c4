use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DOCKER_HOST_UNIX_SCHEME: &str = "unix://";

/// When the periodic info poll is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PollPolicy {
    /// Fixed ticker, independent of responses
    #[default]
    Interval,
    /// One poll per successful info response; a failed poll is never re-armed
    AfterSuccess,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Version prefix placed in front of every request path
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub poll_policy: PollPolicy,

    /// Whether each poll also refreshes the resource list
    #[serde(default = "default_true")]
    pub poll_resources: bool,

    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_max_reconnect_backoff")]
    pub max_reconnect_backoff_ms: u64,

    #[serde(default)]
    pub reconnect_on_malformed: bool,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}
fn default_api_version() -> String {
    "v1.30".to_string()
}
fn default_poll_interval() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_reconnect_backoff() -> u64 {
    1000
}
fn default_max_reconnect_backoff() -> u64 {
    16000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            api_version: default_api_version(),
            poll_interval_ms: default_poll_interval(),
            poll_policy: PollPolicy::default(),
            poll_resources: true,
            reconnect_backoff_ms: default_reconnect_backoff(),
            max_reconnect_backoff_ms: default_max_reconnect_backoff(),
            reconnect_on_malformed: false,
        }
    }
}

impl ClientConfig {
    /// Load config from file.
    ///
    /// A missing file yields the defaults. Unknown fields are logged and
    /// otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// holds values that fail [`ClientConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        super::validation::warn_unknown_fields(&content, "config.json");
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::config("socketPath must not be empty"));
        }
        if !self
            .api_version
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'/' | b'_' | b'-'))
        {
            return Err(Error::config(format!(
                "apiVersion contains invalid characters: {:?}",
                self.api_version
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("pollIntervalMs must be greater than zero"));
        }
        if self.reconnect_backoff_ms == 0 {
            return Err(Error::config("reconnectBackoffMs must be greater than zero"));
        }
        if self.max_reconnect_backoff_ms < self.reconnect_backoff_ms {
            return Err(Error::config(
                "maxReconnectBackoffMs must not be below reconnectBackoffMs",
            ));
        }
        Ok(())
    }

    /// Replace the socket path when `DOCKER_HOST` names a unix socket.
    #[must_use]
    pub fn with_docker_host(mut self, docker_host: Option<&str>) -> Self {
        if let Some(path) = docker_host.and_then(socket_from_docker_host) {
            self.socket_path = path;
        }
        self
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    #[must_use]
    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_backoff_ms)
    }
}

/// Socket path named by a `DOCKER_HOST` value, if it uses the unix scheme.
#[must_use]
pub fn socket_from_docker_host(value: &str) -> Option<PathBuf> {
    value
        .trim()
        .strip_prefix(DOCKER_HOST_UNIX_SCHEME)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}
