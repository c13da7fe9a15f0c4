//! Outbound request framing.
//!
//! Every named call maps to a fixed method and path. Requests are written as
//! bare HTTP/1.1 heads on a keep-alive connection:
//!
//! ```text
//! GET /v1.30/info HTTP/1.1\r\n
//! Host: localhost\r\n
//! Connection: keep-alive\r\n
//! \r\n
//! ```

use std::fmt;
use std::io;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::Encoder;

/// HTTP methods used by the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named API calls the client knows how to make
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "call", content = "id", rename_all = "snake_case")]
pub enum ApiCall {
    /// Daemon summary
    Info,
    /// Every resource, running or not
    ListResources,
    Start(String),
    Stop(String),
    Delete(String),
}

impl ApiCall {
    #[must_use]
    pub fn method(&self) -> Method {
        match self {
            ApiCall::Info | ApiCall::ListResources => Method::Get,
            ApiCall::Start(_) | ApiCall::Stop(_) => Method::Post,
            ApiCall::Delete(_) => Method::Delete,
        }
    }

    /// Unversioned path of the call.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            ApiCall::Info => "/info".to_string(),
            ApiCall::ListResources => "/containers/json?all=true".to_string(),
            ApiCall::Start(id) => format!("/containers/{id}/start"),
            ApiCall::Stop(id) => format!("/containers/{id}/stop"),
            ApiCall::Delete(id) => format!("/containers/{id}"),
        }
    }

    /// The resource id targeted by this call, if any.
    #[must_use]
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            ApiCall::Info | ApiCall::ListResources => None,
            ApiCall::Start(id) | ApiCall::Stop(id) | ApiCall::Delete(id) => Some(id),
        }
    }
}

impl fmt::Display for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiCall::Info => f.write_str("info"),
            ApiCall::ListResources => f.write_str("list"),
            ApiCall::Start(id) => write!(f, "start {id}"),
            ApiCall::Stop(id) => write!(f, "stop {id}"),
            ApiCall::Delete(id) => write!(f, "delete {id}"),
        }
    }
}

/// Whether `id` can be placed in a request path as-is.
#[must_use]
pub fn is_valid_resource_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// A request ready to be framed onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    /// Full path including the API version prefix
    pub path: String,
}

impl ApiRequest {
    /// Build the request for `call` against API version `api_version`.
    ///
    /// Returns `None` when the call targets an id that cannot be placed in a
    /// path.
    #[must_use]
    pub fn for_call(call: &ApiCall, api_version: &str) -> Option<Self> {
        if let Some(id) = call.resource_id()
            && !is_valid_resource_id(id)
        {
            return None;
        }

        let version = api_version.trim_matches('/');
        let path = if version.is_empty() {
            call.path()
        } else {
            format!("/{version}{}", call.path())
        };

        Some(Self {
            method: call.method(),
            path,
        })
    }
}

/// Encoder for outbound request heads
#[derive(Debug, Default)]
pub struct RequestCodec;

impl RequestCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<ApiRequest> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ApiRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let head = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
            item.method, item.path
        );
        dst.reserve(head.len());
        dst.put_slice(head.as_bytes());
        Ok(())
    }
}
