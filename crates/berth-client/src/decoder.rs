//! Classification of parsed responses into application messages.
//!
//! The control API answers structurally different JSON depending on the call,
//! with no discriminator on the wire. Successful bodies are therefore tried
//! against the known shapes in a fixed priority order, and anything that
//! matches none of them is surfaced verbatim rather than dropped.

use berth_types::{ApiMessage, DaemonInfo, GenericMessage, Resource};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::parser::ParsedResponse;

/// A response the daemon reported as failed (5xx, or any status without a
/// dedicated meaning).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignal {
    pub status: u16,
    /// Raw body text as received
    pub body: String,
}

impl ErrorSignal {
    /// Human readable text for the failure.
    ///
    /// Uses the daemon's `{"message": ...}` field when the body carries one,
    /// otherwise the raw body, otherwise the status code.
    #[must_use]
    pub fn message(&self) -> String {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&self.body)
            && let Some(generic) = try_shape::<GenericMessage>(&value)
        {
            return generic.message;
        }
        let trimmed = self.body.trim();
        if trimmed.is_empty() {
            format!("daemon returned status {}", self.status)
        } else {
            trimmed.to_string()
        }
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

impl std::fmt::Display for ErrorSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.status)
    }
}

/// Classifies parsed responses by status code and body shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseDecoder;

impl ResponseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Turn one parsed response into exactly one message or error signal.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorSignal`] for any status other than 200, 204 and 205.
    pub fn classify(&self, response: ParsedResponse) -> Result<ApiMessage, ErrorSignal> {
        match response.status_code {
            200 => Ok(Self::decode_body(response.body)),
            204 | 205 => Ok(ApiMessage::NoContent),
            status => {
                if !(500..600).contains(&status) {
                    debug!(status, "Treating unrecognised status as an error");
                }
                Err(ErrorSignal {
                    status,
                    body: response.body,
                })
            }
        }
    }

    fn decode_body(body: String) -> ApiMessage {
        let decoded = match serde_json::from_str::<Value>(&body) {
            Ok(value @ Value::Object(_)) => try_shape::<DaemonInfo>(&value)
                .map(ApiMessage::Info)
                .or_else(|| {
                    try_shape::<GenericMessage>(&value)
                        .map(|generic| ApiMessage::Message { text: generic.message })
                }),
            Ok(value @ Value::Array(_)) => try_shape::<Vec<Resource>>(&value)
                .map(|resources| ApiMessage::ResourceList { resources }),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Body is not JSON");
                None
            }
        };

        decoded.unwrap_or_else(|| {
            warn!(len = body.len(), "Response body matched no known shape");
            ApiMessage::UnknownBody { raw: body }
        })
    }
}

fn try_shape<T: DeserializeOwned>(value: &Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(shape) => Some(shape),
        Err(e) => {
            debug!(
                shape = std::any::type_name::<T>(),
                error = %e,
                "Body does not match shape"
            );
            None
        }
    }
}
