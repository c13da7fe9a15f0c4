//! Error types for the berth-client crate.
//!
//! This module provides a unified error type for everything the client can
//! fail at outside of the event stream.

use crate::connection::ConnectionError;
use crate::parser::ParseError;

/// Unified error type for client operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Client task stopped")]
    Disconnected,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
