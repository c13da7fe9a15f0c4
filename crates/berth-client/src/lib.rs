//! Streaming client for a container daemon's HTTP control API over a Unix
//! socket.
//!
//! # Architecture
//!
//! The crate is organized into the following modules, leaves first:
//!
//! - [`parser`]: incremental HTTP/1.x response parser (bytes in, units out)
//! - [`request`]: named calls and the outbound request codec
//! - [`decoder`]: classification of parsed bodies into [`ApiMessage`]s
//! - [`connection`]: socket ownership, serialized writes and the read loop
//! - [`client`]: reconnect and poll policy behind a [`ClientHandle`]
//! - [`config`]: client settings loaded from JSON
//! - [`error`]: unified error and `Result` alias
//!
//! # Example
//!
//! ```no_run
//! use berth_client::{ApiCall, Client, ClientConfig, ClientEvent};
//!
//! # async fn example() -> berth_client::Result<()> {
//! let mut client = Client::spawn(ClientConfig::default());
//! client.send(ApiCall::ListResources)?;
//!
//! while let Some(event) = client.recv().await {
//!     if let ClientEvent::Message(message) = event {
//!         println!("{message:?}");
//!         break;
//!     }
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod parser;
pub mod request;

pub use berth_types::{ApiMessage, DaemonInfo, GenericMessage, Resource};

pub use client::{Client, ClientEvent, ClientHandle, Health};
pub use config::{ClientConfig, PollPolicy};
pub use connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionState, TransportEvent,
};
pub use decoder::{ErrorSignal, ResponseDecoder};
pub use error::{Error, Result};
pub use parser::{Headers, ParseError, ParsedResponse, ParserEvent, ResponseParser};
pub use request::{ApiCall, ApiRequest, Method, RequestCodec};
