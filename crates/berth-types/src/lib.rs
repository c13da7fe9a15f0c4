//! Shared types for berth components.
//!
//! This crate provides the application-level message shapes returned by the
//! daemon's control API. They are decoded by `berth-client` and consumed by
//! whatever presentation layer sits on top of it.

use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle state reported for a resource that is currently running.
pub const RUNNING_STATE: &str = "running";

/// Deserialize a Vec that may be null or missing (both become empty vec)
fn deserialize_null_as_empty_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt: Option<Vec<T>> = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Daemon summary returned by the info endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DaemonInfo {
    #[serde(rename = "ID")]
    pub id: String,

    /// Total number of resources, in any state
    pub containers: u64,

    pub containers_running: u64,

    pub containers_paused: u64,

    pub containers_stopped: u64,

    pub images: u64,

    /// Host name of the daemon, when reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

/// A single entry of the resource list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    pub id: String,

    /// Display names in the order the daemon reports them, usually `/name`
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    pub names: Vec<String>,

    /// Image reference the resource was created from
    pub image: String,

    #[serde(rename = "ImageID")]
    pub image_id: String,

    /// Lifecycle state string (`running`, `exited`, `paused`, ...)
    pub state: String,

    /// Creation time, seconds since the Unix epoch
    pub created: i64,
}

impl Resource {
    /// Human readable name of the resource.
    ///
    /// The first single-segment name wins; names carrying extra path segments
    /// (link aliases such as `/web/db`) are skipped. Falls back to the id.
    #[must_use]
    pub fn name(&self) -> &str {
        self.names
            .iter()
            .map(|name| name.strip_prefix('/').unwrap_or(name))
            .find(|name| !name.is_empty() && !name.contains('/'))
            .unwrap_or(&self.id)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == RUNNING_STATE
    }

    /// Short form of the id, as shown by most daemon tooling.
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }
}

/// Free-form `{"message": "..."}` object the daemon returns for some calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericMessage {
    pub message: String,
}

/// Application message decoded from a single response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiMessage {
    /// Daemon summary
    Info(DaemonInfo),

    /// Ordered resource list
    ResourceList { resources: Vec<Resource> },

    /// Generic message text
    Message { text: String },

    /// Successful call that carries no payload (204/205)
    NoContent,

    /// Body that matched none of the known shapes, kept verbatim
    UnknownBody { raw: String },
}

impl ApiMessage {
    #[must_use]
    pub fn is_info(&self) -> bool {
        matches!(self, ApiMessage::Info(_))
    }
}
