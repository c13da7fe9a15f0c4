//! Reconnect and poll policy on top of a [`Connection`].
//!
//! [`Client::spawn`] starts one background task that owns the connection and
//! the decoder. The caller talks to it through a [`ClientHandle`]: named calls
//! go in, and a single ordered stream of [`ClientEvent`]s comes out.
//!
//! Chunked bodies arrive from the connection one chunk at a time. The task
//! joins them and classifies the whole body once its end is reported, so a
//! consumer sees one message per response whatever the framing.

use std::time::Duration;

use berth_types::ApiMessage;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, PollPolicy};
use crate::connection::{Connection, ConnectionError, ConnectionEvent, TransportEvent};
use crate::decoder::{ErrorSignal, ResponseDecoder};
use crate::parser::{Headers, MAX_BODY_SIZE, ParsedResponse};
use crate::request::{ApiCall, ApiRequest};
use crate::{Error, Result};

/// Connectivity as seen by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    Connected,
    Disconnected { reason: String },
}

/// Everything the client reports, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Health(Health),
    Message(ApiMessage),
    /// The daemon answered with an error status
    Failed(ErrorSignal),
    /// Part of the response stream could not be parsed
    Malformed { reason: String },
    /// A call could not be issued
    ActionRejected { action: ApiCall, reason: String },
}

enum Command {
    Call(ApiCall),
    Shutdown,
}

enum SessionOutcome {
    Reconnect { reason: String },
    Shutdown,
}

/// A chunked body being joined back together
#[derive(Debug, Default)]
enum ChunkedBody {
    #[default]
    Idle,
    Collecting(String),
    /// Past the size limit; chunks are dropped until the body ends
    Overflowed,
}

impl ChunkedBody {
    /// Append one chunk. Returns `false` the first time the limit is crossed.
    fn push(&mut self, chunk: &str) -> bool {
        match self {
            ChunkedBody::Idle => {
                *self = ChunkedBody::Collecting(String::new());
                self.push(chunk)
            }
            ChunkedBody::Collecting(body) if body.len() + chunk.len() > MAX_BODY_SIZE => {
                *self = ChunkedBody::Overflowed;
                false
            }
            ChunkedBody::Collecting(body) => {
                body.push_str(chunk);
                true
            }
            ChunkedBody::Overflowed => true,
        }
    }

    /// The joined body, or `None` if it was dropped for size.
    fn finish(&mut self) -> Option<String> {
        match std::mem::take(self) {
            ChunkedBody::Idle => Some(String::new()),
            ChunkedBody::Collecting(body) => Some(body),
            ChunkedBody::Overflowed => None,
        }
    }
}

/// Handle to a running client task.
///
/// Dropping the handle stops the task.
pub struct ClientHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    event_rx: mpsc::UnboundedReceiver<ClientEvent>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Queue a named call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the client task has stopped.
    pub fn send(&self, call: ApiCall) -> Result<()> {
        self.command_tx
            .send(Command::Call(call))
            .map_err(|_| Error::Disconnected)
    }

    /// Next event, or `None` once the client task has stopped.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    /// Stop the client task, closing the socket.
    pub async fn disconnect(self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            warn!("Client task panicked: {e}");
        }
    }
}

/// Policy task state
pub struct Client {
    config: ClientConfig,
    connection: Connection,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    decoder: ResponseDecoder,
    events: mpsc::UnboundedSender<ClientEvent>,
    backoff: Duration,
    next_poll: Option<Instant>,
    disconnect_reported: bool,
    chunked: ChunkedBody,
}

impl Client {
    /// Start the client task on the current tokio runtime.
    #[must_use]
    pub fn spawn(config: ClientConfig) -> ClientHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = Self::new(config, event_tx);
        let task = tokio::spawn(client.run(command_rx));

        ClientHandle {
            command_tx,
            event_rx,
            task,
        }
    }

    fn new(config: ClientConfig, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            connection: Connection::new(config.socket_path.clone(), transport_tx),
            transport_rx,
            decoder: ResponseDecoder::new(),
            events,
            backoff: config.reconnect_backoff(),
            next_poll: None,
            disconnect_reported: false,
            chunked: ChunkedBody::Idle,
            config,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            match self.connection.connect().await {
                Ok(()) => {
                    self.backoff = self.config.reconnect_backoff();
                    self.disconnect_reported = false;
                    self.emit(ClientEvent::Health(Health::Connected));

                    let outcome = self.session(&mut commands).await;
                    self.connection.disconnect().await;
                    self.next_poll = None;
                    self.chunked = ChunkedBody::Idle;

                    match outcome {
                        SessionOutcome::Reconnect { reason } => {
                            info!("Connection lost: {reason}");
                            self.report_disconnected(reason);
                        }
                        SessionOutcome::Shutdown => break,
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to daemon: {e}");
                    self.report_disconnected(e.to_string());
                }
            }

            if !self.wait_before_reconnect(&mut commands).await {
                break;
            }
        }

        info!("Client task stopped");
    }

    async fn session(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> SessionOutcome {
        for call in [ApiCall::Info, ApiCall::ListResources] {
            if let Some(outcome) = self.issue(call).await {
                return outcome;
            }
        }
        if self.config.poll_policy == PollPolicy::Interval {
            self.arm_poll();
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Call(call)) => {
                        if let Some(outcome) = self.issue(call).await {
                            return outcome;
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        info!("Shutdown requested");
                        return SessionOutcome::Shutdown;
                    }
                },

                Some(event) = self.transport_rx.recv() => {
                    if let Some(outcome) = self.handle_transport(event).await {
                        return outcome;
                    }
                }

                () = poll_deadline(self.next_poll) => {
                    if let Some(outcome) = self.poll().await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Write one call. Returns an outcome only when the socket is unusable.
    async fn issue(&mut self, call: ApiCall) -> Option<SessionOutcome> {
        let Some(request) = ApiRequest::for_call(&call, &self.config.api_version) else {
            let reason = match call.resource_id() {
                Some(id) => ConnectionError::InvalidResourceId(id.to_string()).to_string(),
                None => "invalid request".to_string(),
            };
            warn!(%call, "Rejecting call: {reason}");
            self.emit(ClientEvent::ActionRejected {
                action: call,
                reason,
            });
            return None;
        };

        debug!(%call, "Issuing call");
        match self.connection.write(request).await {
            Ok(()) => None,
            Err(e) => Some(SessionOutcome::Reconnect {
                reason: e.to_string(),
            }),
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) -> Option<SessionOutcome> {
        if event.generation != self.connection.generation() {
            trace!(
                stale = event.generation,
                current = self.connection.generation(),
                "Dropping event from previous connection"
            );
            return None;
        }

        match event.event {
            ConnectionEvent::Response(response) if response.is_chunk() => {
                if !self.chunked.push(&response.body) {
                    warn!("Chunked body exceeds {MAX_BODY_SIZE} bytes, dropping it");
                }
                None
            }
            ConnectionEvent::Response(response) => self.handle_response(response).await,
            ConnectionEvent::ChunkedEnd {
                status_code,
                headers,
            } => self.finish_chunked(status_code, headers).await,
            ConnectionEvent::Malformed(e) => {
                // The parser dropped the rest of whatever it was reading
                self.chunked = ChunkedBody::Idle;
                let reason = e.to_string();
                self.emit(ClientEvent::Malformed {
                    reason: reason.clone(),
                });
                self.config
                    .reconnect_on_malformed
                    .then_some(SessionOutcome::Reconnect { reason })
            }
            ConnectionEvent::Closed => Some(SessionOutcome::Reconnect {
                reason: "connection closed by daemon".to_string(),
            }),
            ConnectionEvent::ReadFailed(e) => Some(SessionOutcome::Reconnect {
                reason: e.to_string(),
            }),
        }
    }

    async fn handle_response(&mut self, response: ParsedResponse) -> Option<SessionOutcome> {
        match self.decoder.classify(response) {
            Ok(message) => self.handle_message(message).await,
            Err(signal) => {
                warn!("Daemon reported an error: {signal}");
                self.emit(ClientEvent::Failed(signal));
                None
            }
        }
    }

    async fn finish_chunked(
        &mut self,
        status_code: u16,
        headers: Headers,
    ) -> Option<SessionOutcome> {
        let Some(body) = self.chunked.finish() else {
            self.emit(ClientEvent::Malformed {
                reason: format!("Chunked body too large (max: {MAX_BODY_SIZE} bytes)"),
            });
            return None;
        };
        trace!(status_code, len = body.len(), "Chunked body complete");
        self.handle_response(ParsedResponse {
            status_code,
            headers,
            body,
        })
        .await
    }

    async fn handle_message(&mut self, message: ApiMessage) -> Option<SessionOutcome> {
        let refresh = matches!(message, ApiMessage::NoContent);
        if message.is_info() && self.config.poll_policy == PollPolicy::AfterSuccess {
            self.arm_poll();
        }
        self.emit(ClientEvent::Message(message));

        if refresh {
            return self.issue(ApiCall::ListResources).await;
        }
        None
    }

    async fn poll(&mut self) -> Option<SessionOutcome> {
        match self.config.poll_policy {
            PollPolicy::Interval => self.arm_poll(),
            PollPolicy::AfterSuccess => self.next_poll = None,
        }

        trace!("Polling daemon");
        if let Some(outcome) = self.issue(ApiCall::Info).await {
            return Some(outcome);
        }
        if self.config.poll_resources {
            return self.issue(ApiCall::ListResources).await;
        }
        None
    }

    fn arm_poll(&mut self) {
        self.next_poll = Some(Instant::now() + self.config.poll_interval());
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn report_disconnected(&mut self, reason: String) {
        if self.disconnect_reported {
            return;
        }
        self.disconnect_reported = true;
        self.emit(ClientEvent::Health(Health::Disconnected { reason }));
    }

    /// Sleep for the current backoff, rejecting calls meanwhile.
    ///
    /// Returns `false` if the client should stop.
    async fn wait_before_reconnect(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let delay = self.backoff;
        self.backoff = next_backoff(delay, self.config.max_reconnect_backoff());
        debug!(?delay, "Waiting before reconnect");

        let sleep = sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,

                command = commands.recv() => match command {
                    Some(Command::Call(call)) => {
                        self.emit(ClientEvent::ActionRejected {
                            action: call,
                            reason: ConnectionError::NotConnected.to_string(),
                        });
                    }
                    Some(Command::Shutdown) | None => {
                        info!("Shutdown requested while waiting to reconnect");
                        return false;
                    }
                },
            }
        }
    }
}

/// Double `current`, capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

async fn poll_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
