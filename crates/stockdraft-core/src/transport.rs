// Transport channel: one logical websocket connection to the draft server,
// kept alive across failures.
//
// A single actor task owns the connection, the outbound queue and the
// reconnect timer. `TransportChannel` is a cloneable handle that talks to the
// actor over a command channel, so every state transition happens on one
// task in event order.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

use crate::config::ReconnectConfig;
use crate::protocol::Envelope;

const INBOUND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

// ---------------------------------------------------------------------------
// Errors and states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("send failed with {pending} message(s) still queued: {message}")]
    Send { message: String, pending: usize },

    #[error("failed to encode outbound envelope: {0}")]
    Encode(String),

    #[error("transport channel has shut down")]
    Shutdown,
}

/// Lifecycle of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or closed on request. No reconnect is pending.
    Disconnected,
    Connecting,
    Open,
    /// Lost; a reconnect is scheduled.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Connector seam
// ---------------------------------------------------------------------------

/// Opens the underlying socket. Production code uses
/// [`TungsteniteConnector`]; tests substitute an in-memory server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        debug!("WebSocket handshake with {url} returned {}", response.status());
        let (sink, stream) = ws_stream.split();
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Capped exponential reconnect delay: `base * 2^attempt`, at most `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    Connect,
    Send(Envelope),
    Close,
    Shutdown,
}

/// Handle to the transport actor. Cheap to clone; all clones address the
/// same connection.
#[derive(Clone)]
pub struct TransportChannel {
    commands: mpsc::UnboundedSender<Command>,
    inbound: broadcast::Sender<Envelope>,
    transitions: broadcast::Sender<ConnectionState>,
    errors: broadcast::Sender<TransportError>,
    state: watch::Receiver<ConnectionState>,
}

impl TransportChannel {
    /// Spawn the transport actor for `url`. Nothing is opened until the
    /// first `connect()` or `send()`.
    pub fn spawn<C: Connector>(connector: C, url: impl Into<String>, reconnect: &ReconnectConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (transitions, _) = broadcast::channel(EVENT_CAPACITY);
        let (errors, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let task = ChannelTask {
            connector: Arc::new(connector),
            url: url.into(),
            state: ConnectionState::Disconnected,
            queue: VecDeque::new(),
            sink: None,
            stream: None,
            backoff: Backoff::from_config(reconnect),
            connect_timeout: reconnect.connect_timeout(),
            reconnect_at: None,
            generation: 0,
            commands: commands_rx,
            outcomes_tx,
            outcomes_rx,
            inbound: inbound.clone(),
            transitions: transitions.clone(),
            errors: errors.clone(),
            state_tx,
        };
        tokio::spawn(task.run());

        TransportChannel {
            commands,
            inbound,
            transitions,
            errors,
            state,
        }
    }

    /// Open the connection. A no-op while already open or connecting.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.command(Command::Connect)
    }

    /// Deliver `envelope` to the server. Sent immediately when open, queued
    /// otherwise (opening the connection if nothing is in progress).
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.command(Command::Send(envelope))
    }

    /// Close the connection without scheduling a reconnect. Queued messages
    /// are kept for the next open.
    pub fn close(&self) -> Result<(), TransportError> {
        self.command(Command::Close)
    }

    /// Stop the actor. Subsequent calls return [`TransportError::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Every decoded inbound envelope, delivered to all subscribers.
    pub fn messages(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    /// Every state transition, in order.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Send failures surfaced while draining the queue.
    pub fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.errors.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Shutdown)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct ConnectOutcome {
    generation: u64,
    result: Result<(FrameSink, FrameStream), TransportError>,
}

struct ChannelTask<C: Connector> {
    connector: Arc<C>,
    url: String,
    state: ConnectionState,
    queue: VecDeque<Envelope>,
    sink: Option<FrameSink>,
    stream: Option<FrameStream>,
    backoff: Backoff,
    connect_timeout: Duration,
    reconnect_at: Option<Instant>,
    /// Identifies the current connect attempt; outcomes of older attempts
    /// are discarded.
    generation: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    outcomes_tx: mpsc::UnboundedSender<ConnectOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    inbound: broadcast::Sender<Envelope>,
    transitions: broadcast::Sender<ConnectionState>,
    errors: broadcast::Sender<TransportError>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<C: Connector> ChannelTask<C> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Connect) => self.connect(),
                    Some(Command::Send(envelope)) => self.send(envelope).await,
                    Some(Command::Close) => self.close().await,
                    Some(Command::Shutdown) | None => break,
                },
                Some(outcome) = self.outcomes_rx.recv() => self.on_connect_outcome(outcome).await,
                frame = next_frame(&mut self.stream) => self.on_frame(frame),
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    info!("Reconnecting to {}", self.url);
                    self.connect();
                }
            }
        }

        self.close().await;
        debug!("Transport actor for {} stopped", self.url);
    }

    fn connect(&mut self) {
        if matches!(self.state, ConnectionState::Open | ConnectionState::Connecting) {
            trace!("connect() ignored while {}", self.state);
            return;
        }

        self.reconnect_at = None;
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let outcomes = self.outcomes_tx.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Connect {
                    message: format!("timed out after {}ms", timeout.as_millis()),
                    url,
                }),
            };
            let _ = outcomes.send(ConnectOutcome { generation, result });
        });
    }

    async fn on_connect_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.generation != self.generation || self.state != ConnectionState::Connecting {
            debug!("Discarding outcome of superseded connect attempt {}", outcome.generation);
            return;
        }

        match outcome.result {
            Ok((sink, stream)) => {
                self.sink = Some(sink);
                self.stream = Some(stream);
                self.backoff.reset();
                self.set_state(ConnectionState::Open);
                info!("WebSocket connected to {}", self.url);
                self.drain().await;
            }
            Err(e) => {
                warn!("{e}");
                self.on_connection_lost();
            }
        }
    }

    async fn send(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
        match self.state {
            ConnectionState::Open => self.drain().await,
            ConnectionState::Connecting => {
                debug!("Queued message while connecting ({} pending)", self.queue.len());
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                warn!("WebSocket is not connected; queued message ({} pending)", self.queue.len());
                self.connect();
            }
        }
    }

    /// Send queued messages in order. On the first failure the message goes
    /// back to the front of the queue and draining stops; the connection is
    /// left as it is.
    async fn drain(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        while let Some(envelope) = self.queue.pop_front() {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Dropping unencodable {} envelope: {e}", envelope.kind);
                    let _ = self.errors.send(TransportError::Encode(e.to_string()));
                    continue;
                }
            };

            if let Err(e) = sink.send(Message::text(text)).await {
                self.queue.push_front(envelope);
                let err = TransportError::Send {
                    message: e.to_string(),
                    pending: self.queue.len(),
                };
                warn!("{err}");
                let _ = self.errors.send(err);
                return;
            }
        }
    }

    fn on_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.publish(text.as_str()),
            Some(Ok(Message::Close(_))) => {
                info!("Server sent close frame");
                self.on_connection_lost();
            }
            Some(Ok(_)) => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
            Some(Err(e)) => {
                warn!("WebSocket error: {e}");
                self.on_connection_lost();
            }
            None => {
                info!("WebSocket disconnected");
                self.on_connection_lost();
            }
        }
    }

    fn publish(&self, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => {
                trace!("Inbound {}", envelope.kind);
                // No subscribers is not an error.
                let _ = self.inbound.send(envelope);
            }
            Err(e) => warn!("Failed to parse WebSocket message: {e}; frame dropped"),
        }
    }

    fn on_connection_lost(&mut self) {
        self.sink = None;
        self.stream = None;
        self.set_state(ConnectionState::Closed);
        let delay = self.backoff.next_delay();
        self.reconnect_at = Some(Instant::now() + delay);
        info!("Reconnecting to {} in {:?}", self.url, delay);
    }

    async fn close(&mut self) {
        self.generation += 1;
        self.reconnect_at = None;
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if self.state == ConnectionState::Disconnected {
            debug!("WebSocket is already closed");
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("WebSocket connection closed ({} message(s) still queued)", self.queue.len());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("Transport {} -> {}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        let _ = self.transitions.send(state);
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<Result<Message, WsError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// In-memory server for tests
// ---------------------------------------------------------------------------

/// An in-memory stand-in for the draft server, usable as a [`Connector`].
/// Exposed for this crate's tests and for downstream integration tests.
pub mod mock {
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::task::{Context, Poll};

    use super::*;

    #[derive(Default)]
    struct ServerState {
        refuse_next: usize,
        connect_delay: Option<Duration>,
        attempts: usize,
        send_attempts: usize,
        fail_send_attempt: Option<usize>,
        received: Vec<String>,
        to_client: Option<mpsc::UnboundedSender<Result<Message, WsError>>>,
    }

    #[derive(Clone, Default)]
    pub struct MockServer {
        state: Arc<Mutex<ServerState>>,
    }

    impl MockServer {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, ServerState> {
            self.state.lock().expect("mock server mutex poisoned")
        }

        pub fn connector(&self) -> MockConnector {
            MockConnector {
                server: self.clone(),
            }
        }

        /// Refuse the next `n` connection attempts.
        pub fn refuse_next(&self, n: usize) {
            self.lock().refuse_next = n;
        }

        /// Hold every connection attempt for `delay` before answering.
        pub fn set_connect_delay(&self, delay: Duration) {
            self.lock().connect_delay = Some(delay);
        }

        /// Fail the `n`-th (1-based) send attempt counted from now on.
        pub fn fail_send_attempt(&self, n: usize) {
            let mut state = self.lock();
            state.fail_send_attempt = Some(state.send_attempts + n);
        }

        pub fn connect_attempts(&self) -> usize {
            self.lock().attempts
        }

        /// Text frames the server has received, in arrival order.
        pub fn received(&self) -> Vec<String> {
            self.lock().received.clone()
        }

        pub fn received_envelopes(&self) -> Vec<Envelope> {
            self.received()
                .iter()
                .filter_map(|text| Envelope::from_json(text).ok())
                .collect()
        }

        /// Push a raw text frame to the connected client.
        pub fn push_text(&self, text: &str) -> bool {
            self.push(Ok(Message::text(text.to_string())))
        }

        pub fn push_envelope(&self, envelope: &Envelope) -> bool {
            match envelope.to_json() {
                Ok(text) => self.push_text(&text),
                Err(_) => false,
            }
        }

        pub fn push(&self, frame: Result<Message, WsError>) -> bool {
            match &self.lock().to_client {
                Some(tx) => tx.send(frame).is_ok(),
                None => false,
            }
        }

        /// Drop the current connection; the client's stream ends.
        pub fn drop_connection(&self) {
            self.lock().to_client = None;
        }
    }

    pub struct MockConnector {
        server: MockServer,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), TransportError> {
            let delay = self.server.lock().connect_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.server.lock();
            state.attempts += 1;
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                return Err(TransportError::Connect {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            state.to_client = Some(tx);
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            });
            let sink = MockSink {
                server: self.server.clone(),
            };
            Ok((Box::pin(sink), Box::pin(stream)))
        }
    }

    struct MockSink {
        server: MockServer,
    }

    impl Sink<Message> for MockSink {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            let mut state = self.server.lock();
            state.send_attempts += 1;
            if state.fail_send_attempt == Some(state.send_attempts) {
                state.fail_send_attempt = None;
                return Err(WsError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "injected send failure",
                )));
            }
            if let Message::Text(text) = item {
                state.received.push(text.as_str().to_string());
            }
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockServer;
    use super::*;
    use crate::protocol::MessageType;
    use serde_json::json;

    fn reconnect_config() -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            connect_timeout_ms: 2_000,
        }
    }

    fn numbered(seq: u64) -> Envelope {
        Envelope::new(MessageType::QueueUp, json!({ "seq": seq }))
    }

    fn sequence(server: &MockServer) -> Vec<u64> {
        server
            .received_envelopes()
            .iter()
            .filter_map(|e| e.data["seq"].as_u64())
            .collect()
    }

    /// Let every ready task run. Time is paused, so this only advances the
    /// clock once all tasks are idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_never_overflows() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_sends_flush_in_call_order() {
        let server = MockServer::new();
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());

        for seq in 1..=5 {
            channel.send(numbered(seq)).unwrap();
        }
        settle().await;

        assert_eq!(channel.state(), ConnectionState::Open);
        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(sequence(&server), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_failed_and_later_messages_queued() {
        let server = MockServer::new();
        server.fail_send_attempt(3);
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());
        let mut errors = channel.errors();

        for seq in 1..=5 {
            channel.send(numbered(seq)).unwrap();
        }
        settle().await;

        assert_eq!(sequence(&server), vec![1, 2]);
        match errors.try_recv().unwrap() {
            TransportError::Send { message, pending } => {
                assert!(message.contains("injected send failure"), "got {message}");
                assert_eq!(pending, 3);
            }
            other => panic!("expected send error, got {other:?}"),
        }
        // The connection is not torn down by a send failure.
        assert_eq!(channel.state(), ConnectionState::Open);

        // The next send drains the leftovers first.
        channel.send(numbered(6)).unwrap();
        settle().await;
        assert_eq!(sequence(&server), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_times_out_and_retries() {
        let server = MockServer::new();
        server.set_connect_delay(Duration::from_secs(3_600));
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());
        let mut errors = channel.errors();
        let mut transitions = channel.transitions();

        channel.send(numbered(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(channel.state(), ConnectionState::Connecting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert!(errors.try_recv().is_err(), "a connect timeout is not a send error");

        server.set_connect_delay(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(channel.state(), ConnectionState::Open);
        assert_eq!(sequence(&server), vec![1]);

        let mut seen = Vec::new();
        while let Ok(state) = transitions.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Closed,
                ConnectionState::Connecting,
                ConnectionState::Open,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let server = MockServer::new();
        server.set_connect_delay(Duration::from_millis(100));
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());

        channel.connect().unwrap();
        channel.connect().unwrap();
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Connecting);
        channel.connect().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.state(), ConnectionState::Open);
        channel.connect().unwrap();
        settle().await;
        assert_eq!(server.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_reach_every_subscriber() {
        let server = MockServer::new();
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());
        let mut first = channel.messages();
        let mut second = channel.messages();

        channel.connect().unwrap();
        settle().await;
        server.push_envelope(&numbered(1));
        settle().await;

        assert_eq!(first.try_recv().unwrap(), numbered(1));
        assert_eq!(second.try_recv().unwrap(), numbered(1));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_dropped_without_closing() {
        let server = MockServer::new();
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());
        let mut messages = channel.messages();

        channel.connect().unwrap();
        settle().await;
        server.push_text("{not json");
        server.push(Ok(Message::Ping(Default::default())));
        server.push_envelope(&numbered(2));
        settle().await;

        assert_eq!(messages.try_recv().unwrap(), numbered(2));
        assert!(messages.try_recv().is_err());
        assert_eq!(channel.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_reconnects_after_backoff() {
        let server = MockServer::new();
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());
        let mut transitions = channel.transitions();

        channel.connect().unwrap();
        settle().await;
        server.drop_connection();
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert_eq!(server.connect_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Open);
        assert_eq!(server.connect_attempts(), 2);

        let mut seen = Vec::new();
        while let Ok(state) = transitions.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Open,
                ConnectionState::Closed,
                ConnectionState::Connecting,
                ConnectionState::Open,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connects_back_off_exponentially_then_recover() {
        let server = MockServer::new();
        server.refuse_next(3);
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());

        channel.connect().unwrap();
        settle().await;
        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(channel.state(), ConnectionState::Closed);

        // 1s, then 2s, then 4s.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(server.connect_attempts(), 2);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(server.connect_attempts(), 2);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(server.connect_attempts(), 3);

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(server.connect_attempts(), 4);
        assert_eq!(channel.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_sent_while_closed_are_delivered_after_reopen() {
        let server = MockServer::new();
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());

        channel.send(numbered(1)).unwrap();
        settle().await;
        server.drop_connection();
        server.refuse_next(1);
        settle().await;

        // Sending while closed triggers an immediate (refused) reconnect; the
        // message stays queued through the backoff.
        channel.send(numbered(2)).unwrap();
        channel.send(numbered(3)).unwrap();
        settle().await;
        assert_eq!(sequence(&server), vec![1]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(channel.state(), ConnectionState::Open);
        assert_eq!(sequence(&server), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_does_not_reconnect() {
        let server = MockServer::new();
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());

        channel.connect().unwrap();
        settle().await;
        channel.close().unwrap();
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.connect_attempts(), 1);

        channel.send(numbered(9)).unwrap();
        settle().await;
        assert_eq!(server.connect_attempts(), 2);
        assert_eq!(sequence(&server), vec![9]);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_superseded_by_close_is_discarded() {
        let server = MockServer::new();
        server.set_connect_delay(Duration::from_millis(500));
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());

        channel.connect().unwrap();
        settle().await;
        assert_eq!(channel.state(), ConnectionState::Connecting);
        channel.close().unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_further_commands() {
        let server = MockServer::new();
        let channel = TransportChannel::spawn(server.connector(), "ws://test/ws", &reconnect_config());
        channel.shutdown();
        settle().await;
        assert_eq!(channel.send(numbered(1)), Err(TransportError::Shutdown));
    }
}
