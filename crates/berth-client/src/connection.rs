//! Socket ownership and the read loop.
//!
//! A [`Connection`] is created once and reused across reconnects. Each
//! successful [`Connection::connect`] starts a new generation: a fresh read
//! loop that feeds the shared parser and tags every [`TransportEvent`] with
//! the generation that produced it, so the consumer can discard anything
//! left over from an earlier socket.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::UnixSocket;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, error, info, trace, warn};

use crate::parser::{Headers, ParseError, ParsedResponse, ParserEvent, ResponseParser};
use crate::request::{ApiRequest, RequestCodec};

/// Size of a single socket read. Any read size works; the parser accepts
/// fragments down to one byte.
const READ_BUFFER_SIZE: usize = 4096;

type RequestSink = FramedWrite<OwnedWriteHalf, RequestCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Errors raised by socket setup and request writes
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to create socket for {}: {source}", path.display())]
    SocketCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect to {}: {source}", path.display())]
    SocketConnect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Failed to write request: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("Invalid resource id: {0:?}")]
    InvalidResourceId(String),
}

impl ConnectionError {
    /// Whether the error means the socket itself is gone.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        !matches!(self, ConnectionError::InvalidResourceId(_))
    }
}

/// What the read loop observed
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete unit came out of the parser
    Response(ParsedResponse),
    /// A chunked body delivered as `Response` units is over
    ChunkedEnd { status_code: u16, headers: Headers },
    /// The parser rejected part of the stream; the socket stays open
    Malformed(ParseError),
    /// The daemon closed the stream
    Closed,
    ReadFailed(io::Error),
}

#[derive(Debug)]
pub struct TransportEvent {
    pub generation: u64,
    pub event: ConnectionEvent,
}

/// Owns the socket, the parser and the read loop for one daemon endpoint.
pub struct Connection {
    socket_path: PathBuf,
    state: ConnectionState,
    generation: u64,
    parser: Arc<Mutex<ResponseParser>>,
    writer: Option<Arc<Mutex<RequestSink>>>,
    reader: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Connection {
    #[must_use]
    pub fn new(socket_path: PathBuf, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            socket_path,
            state: ConnectionState::Disconnected,
            generation: 0,
            parser: Arc::new(Mutex::new(ResponseParser::new())),
            writer: None,
            reader: None,
            events,
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation of the current (or most recent) socket.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Open the socket and start a new read loop.
    ///
    /// An existing socket is torn down first.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::SocketCreate`] if no socket can be
    /// allocated and [`ConnectionError::SocketConnect`] if the daemon is not
    /// reachable at the configured path.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Disconnected {
            self.disconnect().await;
        }
        self.state = ConnectionState::Connecting;

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        self.generation += 1;
        let (read_half, write_half) = stream.into_split();

        self.writer = Some(Arc::new(Mutex::new(FramedWrite::new(
            write_half,
            RequestCodec::new(),
        ))));
        self.reader = Some(tokio::spawn(read_loop(
            read_half,
            Arc::clone(&self.parser),
            self.generation,
            self.events.clone(),
        )));
        self.state = ConnectionState::Connected;

        info!(
            path = %self.socket_path.display(),
            generation = self.generation,
            "Connected to daemon"
        );
        Ok(())
    }

    async fn open_stream(&self) -> Result<tokio::net::UnixStream, ConnectionError> {
        let socket = UnixSocket::new_stream().map_err(|source| ConnectionError::SocketCreate {
            path: self.socket_path.clone(),
            source,
        })?;

        socket
            .connect(&self.socket_path)
            .await
            .map_err(|source| ConnectionError::SocketConnect {
                path: self.socket_path.clone(),
                source,
            })
    }

    /// Write one request.
    ///
    /// Writes are serialized: concurrent callers never interleave bytes of two
    /// requests on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] without a socket and
    /// [`ConnectionError::WriteFailed`] if the socket rejects the bytes.
    pub async fn write(&self, request: ApiRequest) -> Result<(), ConnectionError> {
        let Some(writer) = self.writer.as_ref().map(Arc::clone) else {
            return Err(ConnectionError::NotConnected);
        };

        trace!(method = %request.method, path = %request.path, "Writing request");
        let mut sink = writer.lock().await;
        sink.send(request).await.map_err(|e| {
            error!("Failed to write request: {e}");
            ConnectionError::WriteFailed(e)
        })
    }

    /// Close the socket and discard any partially parsed response.
    ///
    /// Safe to call in any state.
    pub async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        if self.writer.take().is_some() {
            info!(generation = self.generation, "Disconnected from daemon");
        }
        self.parser.lock().await.reset();
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    parser: Arc<Mutex<ResponseParser>>,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let send = |event| events.send(TransportEvent { generation, event }).is_ok();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(generation, "Daemon closed the stream");
                parser.lock().await.reset();
                send(ConnectionEvent::Closed);
                return;
            }
            Ok(n) => {
                trace!(generation, bytes = n, "Read from socket");
                let mut open = true;
                let result = parser.lock().await.feed_events(&buf[..n], |event| {
                    open &= send(match event {
                        ParserEvent::Response(response) => ConnectionEvent::Response(response),
                        ParserEvent::ChunkedEnd {
                            status_code,
                            headers,
                        } => ConnectionEvent::ChunkedEnd {
                            status_code,
                            headers,
                        },
                    });
                });
                if let Err(e) = result {
                    warn!(generation, "Malformed response stream: {e}");
                    open &= send(ConnectionEvent::Malformed(e));
                }
                if !open {
                    debug!(generation, "Event receiver dropped, stopping read loop");
                    return;
                }
            }
            Err(e) => {
                warn!(generation, "Socket read failed: {e}");
                send(ConnectionEvent::ReadFailed(e));
                return;
            }
        }
    }
}
