//! Chat session transport.
//!
//! Keeps a best-effort socket to the assistant, reconnects with exponential
//! backoff, and falls back to HTTP when the socket is not open. Every reply
//! shape is normalized into [`ChatMessage`] values on a shared [`Transcript`].
//!
//! Socket pump and reconnect timer tasks hold only a `Weak` reference plus the
//! socket generation they belong to, so a replaced, disabled, or disposed
//! transport never hears from them again.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use finchat_core::{
    BackendError, ChatBackend, ChatMessage, ChatMode, ChatRequest, ConnectionState,
    ConversationSummary, ReconnectPolicy, ServiceStatus, SocketConnector, SocketEvent, SocketLink,
    Transcript, TransportConfig,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};

use crate::protocol::{IncomingEnvelope, OutgoingEnvelope, Reply};

const EMPTY_REPLY: &str = "The assistant did not return an answer. Please try again.";

/// What [`ChatTransport::send`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Empty or whitespace-only input; nothing happened.
    Ignored,
    /// Written to the open socket; the answer arrives as a frame.
    Streamed,
    /// Answered over HTTP; the reply (or error) was appended.
    Answered,
    /// The transport was disposed; nothing (more) was appended.
    Discarded,
}

struct ActiveSocket {
    generation: u64,
    session_id: String,
    /// Set once the socket is open.
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: JoinHandle<()>,
}

struct State {
    session_id: String,
    mode: ChatMode,
    realtime: bool,
    disposed: bool,
    typing: bool,
    loading: bool,
    generation: u64,
    socket: Option<ActiveSocket>,
    reconnect: ReconnectPolicy,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl State {
    fn current(&mut self, generation: u64) -> Option<&mut ActiveSocket> {
        self.socket
            .as_mut()
            .filter(|socket| socket.generation == generation)
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    /// Drop the socket; its pump stops and the connector closes the link.
    fn close_socket(&mut self) -> bool {
        self.socket.take().is_some_and(|socket| {
            socket.task.abort();
            true
        })
    }

    const fn settle(&mut self) {
        self.typing = false;
        self.loading = false;
    }
}

struct Inner {
    config: TransportConfig,
    connector: Arc<dyn SocketConnector>,
    backend: Arc<dyn ChatBackend>,
    transcript: Arc<Transcript>,
    state: Mutex<State>,
    connection: watch::Sender<ConnectionState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_reconnect();
        state.close_socket();
    }
}

fn send_frame(outbound: &mpsc::UnboundedSender<String>, envelope: &OutgoingEnvelope) -> bool {
    match envelope.to_frame() {
        Ok(frame) => outbound.send(frame).is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize envelope: {e}");
            false
        }
    }
}

fn message_for(reply: Reply) -> ChatMessage {
    match reply {
        Reply::Answer { content, insights } => ChatMessage::bot(content, insights),
        Reply::Notice(text) => ChatMessage::bot(text, Vec::new()),
        Reply::Failure(text) => ChatMessage::error(text),
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(self: &Arc<Self>, session_id: &str) {
        let mut state = self.lock_state();
        if state.disposed {
            tracing::debug!(session_id, "connect ignored, transport disposed");
            return;
        }
        if !state.realtime {
            tracing::debug!(session_id, "connect ignored, real-time chat disabled");
            session_id.clone_into(&mut state.session_id);
            return;
        }
        if state
            .socket
            .as_ref()
            .is_some_and(|socket| socket.session_id == session_id)
        {
            tracing::debug!(session_id, "socket already open or connecting");
            return;
        }

        state.cancel_reconnect();
        if state.close_socket() {
            tracing::debug!(session_id, "replacing previous socket");
        }
        state.generation += 1;
        let generation = state.generation;
        session_id.clone_into(&mut state.session_id);
        self.connection.send_replace(ConnectionState::Connecting);

        let url = self.config.socket_url(session_id);
        let keepalive = self
            .config
            .keepalive_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        tracing::info!(session_id, generation, %url, "opening chat socket");

        let task = tokio::spawn(run_socket(Arc::downgrade(self), generation, url, keepalive));
        state.socket = Some(ActiveSocket {
            generation,
            session_id: session_id.to_owned(),
            outbound: None,
            task,
        });
    }

    fn on_open(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut state = self.lock_state();
        if state.disposed {
            return false;
        }
        let Some(socket) = state.current(generation) else {
            tracing::debug!(generation, "stale socket opened, dropping it");
            return false;
        };
        socket.outbound = Some(outbound.clone());
        let session_id = socket.session_id.clone();
        state.reconnect.reset();
        self.connection.send_replace(ConnectionState::Connected);
        tracing::info!(session_id = %session_id, generation, "chat socket connected");

        if self.config.send_connection_init {
            send_frame(
                &outbound,
                &OutgoingEnvelope::ConnectionInit {
                    content: session_id,
                },
            );
        }
        true
    }

    fn on_frame(&self, generation: u64, raw: &str) {
        if self.lock_state().current(generation).is_none() {
            tracing::debug!(generation, "frame from stale socket ignored");
            return;
        }
        self.handle_frame(raw);
    }

    fn handle_frame(&self, raw: &str) {
        match IncomingEnvelope::parse(raw) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => tracing::warn!("Discarding malformed frame: {e}"),
        }
    }

    fn dispatch(&self, envelope: IncomingEnvelope) {
        let mut state = self.lock_state();
        if state.disposed {
            return;
        }

        match &envelope {
            IncomingEnvelope::Typing => {
                state.typing = true;
                return;
            }
            IncomingEnvelope::ConnectionEstablished { message } => {
                tracing::info!(
                    greeting = message.as_deref().unwrap_or_default(),
                    "server acknowledged connection"
                );
                return;
            }
            IncomingEnvelope::Pong => {
                tracing::trace!("pong");
                return;
            }
            IncomingEnvelope::HistoryCleared => {
                tracing::debug!("server confirmed history clear");
                return;
            }
            _ => {}
        }

        if envelope.rejects_connection_init() {
            tracing::debug!("server does not accept connection_init, ignoring its error");
            return;
        }

        let unrecognized = matches!(envelope, IncomingEnvelope::Unrecognized(_));
        let settles = envelope.settles_request();
        let reply = envelope.into_reply();
        if settles || (unrecognized && reply.is_some()) {
            state.settle();
        }

        match reply {
            Some(reply) => self.transcript.push(message_for(reply)),
            None => tracing::debug!("frame carried no displayable text"),
        }
    }

    fn on_close(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: &str) {
        let mut state = self.lock_state();
        if state.current(generation).is_none() {
            tracing::debug!(generation, "close from stale socket ignored");
            return;
        }
        state.socket = None;
        state.settle();
        self.connection.send_replace(ConnectionState::Disconnected);
        tracing::info!(generation, ?code, reason, "chat socket closed");

        if state.disposed || !state.realtime {
            return;
        }
        self.schedule_reconnect(&mut state);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut State) {
        state.cancel_reconnect();
        let delay = state.reconnect.next_delay();
        tracing::info!(
            attempt = state.reconnect.attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );

        let weak = Arc::downgrade(self);
        state.reconnect_timer = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_due();
            }
        }));
    }

    fn reconnect_due(self: &Arc<Self>) {
        let session_id = {
            let mut state = self.lock_state();
            // Our own handle; it has already fired.
            state.reconnect_timer = None;
            if state.disposed || !state.realtime {
                return;
            }
            state.session_id.clone()
        };
        self.connect(&session_id);
    }

    fn send_envelope(&self, generation: u64, envelope: &OutgoingEnvelope) {
        let outbound = self
            .lock_state()
            .current(generation)
            .and_then(|socket| socket.outbound.clone());
        if let Some(outbound) = outbound {
            send_frame(&outbound, envelope);
        }
    }

    async fn send(&self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Ignored;
        }

        let (outbound, mode, request) = {
            let mut state = self.lock_state();
            if state.disposed {
                tracing::debug!("send ignored, transport disposed");
                return SendOutcome::Discarded;
            }
            self.transcript.push(ChatMessage::user(text));
            state.loading = true;
            let outbound = state
                .socket
                .as_ref()
                .and_then(|socket| socket.outbound.clone());
            let request = ChatRequest {
                user_id: state.session_id.clone(),
                query: text.to_owned(),
            };
            (outbound, state.mode, request)
        };

        if let Some(outbound) = outbound {
            if send_frame(&outbound, &OutgoingEnvelope::chat(text)) {
                return SendOutcome::Streamed;
            }
            tracing::warn!("socket unavailable, falling back to HTTP");
        }

        let message = match self.backend.chat(mode, &request).await {
            Ok(body) => IncomingEnvelope::from_value(body)
                .into_reply()
                .map_or_else(|| ChatMessage::bot(EMPTY_REPLY, Vec::new()), message_for),
            Err(e) => {
                tracing::warn!(%mode, "HTTP chat failed: {e}");
                ChatMessage::error(&e)
            }
        };

        let mut state = self.lock_state();
        if state.disposed {
            tracing::debug!("transport disposed, dropping HTTP reply");
            return SendOutcome::Discarded;
        }
        state.loading = false;
        self.transcript.push(message);
        SendOutcome::Answered
    }

    async fn clear_history(&self) {
        let session_id = {
            let state = self.lock_state();
            if state.disposed {
                return;
            }
            state.session_id.clone()
        };

        if let Err(e) = self.backend.clear_history(&session_id).await {
            tracing::warn!(session_id = %session_id, "Remote history clear failed: {e}");
        }

        let mut state = self.lock_state();
        if state.disposed {
            return;
        }
        state.settle();
        self.transcript
            .reset(ChatMessage::system(self.config.greeting.as_str()));
    }

    fn disable(&self) {
        let mut state = self.lock_state();
        state.realtime = false;
        state.cancel_reconnect();
        if state.close_socket() {
            tracing::info!(session_id = %state.session_id, "real-time chat disabled, socket closed");
        }
        state.settle();
        self.connection.send_replace(ConnectionState::Disconnected);
    }

    fn enable(self: &Arc<Self>) {
        let session_id = {
            let mut state = self.lock_state();
            if state.disposed {
                return;
            }
            state.realtime = true;
            state.reconnect.reset();
            state.session_id.clone()
        };
        self.connect(&session_id);
    }

    fn dispose(&self) {
        let mut state = self.lock_state();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.cancel_reconnect();
        state.close_socket();
        state.settle();
        self.connection.send_replace(ConnectionState::Disconnected);
        tracing::debug!(session_id = %state.session_id, "chat transport disposed");
    }
}

/// Socket pump: open, then forward events until the socket closes.
async fn run_socket(
    weak: Weak<Inner>,
    generation: u64,
    url: String,
    keepalive: Option<Duration>,
) {
    let Some(connector) = weak.upgrade().map(|inner| Arc::clone(&inner.connector)) else {
        return;
    };
    let result = connector.connect(&url).await;
    drop(connector);

    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mut inbound = match result {
        Ok(SocketLink { outbound, inbound }) => {
            if !inner.on_open(generation, outbound) {
                return;
            }
            inbound
        }
        Err(e) => {
            tracing::warn!(generation, "Chat socket failed to open: {e}");
            inner.on_close(generation, None, &e.to_string());
            return;
        }
    };
    drop(inner);

    let mut ticker = keepalive.map(|period| time::interval_at(time::Instant::now() + period, period));
    loop {
        let event = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                event = inbound.recv() => event,
                _ = ticker.tick() => {
                    match weak.upgrade() {
                        Some(inner) => inner.send_envelope(generation, &OutgoingEnvelope::Ping),
                        None => return,
                    }
                    continue;
                }
            },
            None => inbound.recv().await,
        };

        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            Some(SocketEvent::Frame(raw)) => inner.on_frame(generation, &raw),
            // The close event that follows drives reconnection.
            Some(SocketEvent::Error(e)) => tracing::warn!(generation, "Chat socket error: {e}"),
            Some(SocketEvent::Closed { code, reason }) => {
                inner.on_close(generation, code, &reason);
                return;
            }
            None => {
                inner.on_close(generation, None, "connection dropped");
                return;
            }
        }
    }
}

/// Handle to one chat session's transport.
///
/// Cloning is cheap and shares the same session. Dropping the last handle
/// tears the session down like [`ChatTransport::dispose`].
#[derive(Clone)]
pub struct ChatTransport {
    inner: Arc<Inner>,
}

impl ChatTransport {
    /// Create a transport for `session_id`. Nothing is opened until
    /// [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(
        config: TransportConfig,
        session_id: impl Into<String>,
        connector: Arc<dyn SocketConnector>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let transcript = Arc::new(Transcript::with_greeting(ChatMessage::system(
            config.greeting.as_str(),
        )));
        let state = State {
            session_id: session_id.into(),
            mode: config.mode,
            realtime: config.realtime,
            disposed: false,
            typing: false,
            loading: false,
            generation: 0,
            socket: None,
            reconnect: ReconnectPolicy::from_config(&config.reconnect),
            reconnect_timer: None,
        };
        let (connection, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                backend,
                transcript,
                state: Mutex::new(state),
                connection,
            }),
        }
    }

    /// Create a transport using the WebSocket connector and HTTP backend.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    #[cfg(all(feature = "websocket", feature = "http"))]
    pub fn from_config(
        config: TransportConfig,
        session_id: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let backend = crate::http::HttpBackend::from_config(&config)?;
        Ok(Self::new(
            config,
            session_id,
            Arc::new(crate::websocket::WsConnector::new()),
            Arc::new(backend),
        ))
    }

    /// Open the socket for `session_id`.
    ///
    /// No-op if a socket for that session is already open or connecting, if
    /// real-time chat is disabled, or after [`dispose`](Self::dispose). Must be
    /// called from within a Tokio runtime.
    pub fn connect(&self, session_id: &str) {
        self.inner.connect(session_id);
    }

    /// Handle one raw socket frame.
    ///
    /// Malformed frames are logged and dropped. Frames with displayable text
    /// append exactly one message.
    pub fn handle_frame(&self, raw: &str) {
        self.inner.handle_frame(raw);
    }

    /// Send user text.
    ///
    /// The user message is appended before anything touches the network. With
    /// an open socket the call returns right away; otherwise it waits for the
    /// HTTP fallback and appends exactly one bot message (answer or error).
    pub async fn send(&self, text: &str) -> SendOutcome {
        self.inner.send(text).await
    }

    /// Clear server-side memory (best effort) and reset the local transcript
    /// to a single fresh greeting.
    pub async fn clear_history(&self) {
        self.inner.clear_history().await;
    }

    /// Close the socket and use HTTP only until [`enable`](Self::enable).
    pub fn disable(&self) {
        self.inner.disable();
    }

    /// Re-enable real-time chat and connect to the current session.
    pub fn enable(&self) {
        self.inner.enable();
    }

    /// Select the HTTP endpoint used by the fallback path.
    pub fn set_mode(&self, mode: ChatMode) {
        self.inner.lock_state().mode = mode;
    }

    /// Cancel timers, close the socket and stop appending. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Ask the backend whether the assistant is configured.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn service_status(&self) -> Result<ServiceStatus, BackendError> {
        self.inner.backend.status().await
    }

    /// Ask the backend what it remembers of this session.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn conversation_summary(&self) -> Result<ConversationSummary, BackendError> {
        let session_id = self.session_id();
        self.inner.backend.conversation_summary(&session_id).await
    }

    #[must_use]
    pub fn transcript(&self) -> Arc<Transcript> {
        Arc::clone(&self.inner.transcript)
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    /// Receiver for connection state changes.
    #[must_use]
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        self.inner.lock_state().session_id.clone()
    }

    #[must_use]
    pub fn mode(&self) -> ChatMode {
        self.inner.lock_state().mode
    }

    #[must_use]
    pub fn is_realtime_enabled(&self) -> bool {
        self.inner.lock_state().realtime
    }

    /// Whether the assistant signalled it is composing an answer.
    #[must_use]
    pub fn is_typing(&self) -> bool {
        self.inner.lock_state().typing
    }

    /// Whether a sent message is still waiting for its answer.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.inner.lock_state().loading
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_state().reconnect.attempts()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use finchat_core::{ConnectError, ReconnectConfig, Role};
    use serde_json::{Value, json};
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    struct Peer {
        url: String,
        to_client: mpsc::UnboundedSender<SocketEvent>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        async fn next_frame(&mut self) -> Value {
            let frame = self.from_client.recv().await.unwrap();
            serde_json::from_str(&frame).unwrap()
        }
    }

    #[derive(Default)]
    struct MockConnector {
        refuse: bool,
        attempts: Mutex<Vec<time::Instant>>,
        peers: Mutex<Vec<Peer>>,
    }

    impl MockConnector {
        fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::default()
            }
        }

        fn attempts(&self) -> Vec<time::Instant> {
            self.attempts.lock().unwrap().clone()
        }

        fn take_peer(&self) -> Peer {
            self.peers.lock().unwrap().pop().unwrap()
        }
    }

    #[async_trait]
    impl SocketConnector for MockConnector {
        async fn connect(&self, url: &str) -> Result<SocketLink, ConnectError> {
            self.attempts.lock().unwrap().push(time::Instant::now());
            if self.refuse {
                return Err(ConnectError::Handshake("connection refused".to_string()));
            }
            let (outbound, from_client) = mpsc::unbounded_channel();
            let (to_client, inbound) = mpsc::unbounded_channel();
            self.peers.lock().unwrap().push(Peer {
                url: url.to_string(),
                to_client,
                from_client,
            });
            Ok(SocketLink { outbound, inbound })
        }
    }

    struct MockBackend {
        reply: Result<Value, BackendError>,
        clear: Result<(), BackendError>,
        requests: Mutex<Vec<(ChatMode, ChatRequest)>>,
        clears: AtomicUsize,
        entered: Notify,
        gate: Option<Arc<Notify>>,
    }

    impl MockBackend {
        fn replying(reply: Value) -> Self {
            Self {
                reply: Ok(reply),
                clear: Ok(()),
                requests: Mutex::new(Vec::new()),
                clears: AtomicUsize::new(0),
                entered: Notify::new(),
                gate: None,
            }
        }

        fn failing(err: BackendError) -> Self {
            Self {
                reply: Err(err.clone()),
                clear: Err(err),
                ..Self::replying(Value::Null)
            }
        }

        fn requests(&self) -> Vec<(ChatMode, ChatRequest)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for MockBackend {
        async fn chat(&self, mode: ChatMode, request: &ChatRequest) -> Result<Value, BackendError> {
            self.requests.lock().unwrap().push((mode, request.clone()));
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.reply.clone()
        }

        async fn clear_history(&self, _session_id: &str) -> Result<(), BackendError> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            self.clear.clone()
        }

        async fn status(&self) -> Result<ServiceStatus, BackendError> {
            Ok(ServiceStatus {
                available: true,
                configured: true,
                api_key_set: true,
                message: "Gemini AI is ready".to_string(),
            })
        }

        async fn conversation_summary(
            &self,
            _session_id: &str,
        ) -> Result<ConversationSummary, BackendError> {
            Err(BackendError::Rejected("no history".to_string()))
        }
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            reconnect: ReconnectConfig {
                base_delay_ms: 500,
                max_delay_ms: 30_000,
            },
            ..TransportConfig::default()
        }
    }

    fn transport_with(connector: &Arc<MockConnector>, backend: &Arc<MockBackend>) -> ChatTransport {
        ChatTransport::new(
            test_config(),
            "user-1",
            Arc::clone(connector) as Arc<dyn SocketConnector>,
            Arc::clone(backend) as Arc<dyn ChatBackend>,
        )
    }

    async fn wait_for_state(transport: &ChatTransport, wanted: ConnectionState) {
        let mut rx = transport.watch_connection();
        assert_ok!(rx.wait_for(|state| *state == wanted).await);
    }

    async fn connected(transport: &ChatTransport, connector: &MockConnector) -> Peer {
        transport.connect("user-1");
        wait_for_state(transport, ConnectionState::Connected).await;
        connector.take_peer()
    }

    #[tokio::test]
    async fn test_http_fallback_when_disconnected() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(json!({"response": "hello"})));
        let transport = transport_with(&connector, &backend);

        assert_eq!(transport.send("hi").await, SendOutcome::Answered);

        let messages = transport.transcript().snapshot();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role(), Role::User);
        assert_eq!(messages[1].content(), "hi");
        assert_eq!(messages[2].role(), Role::Bot);
        assert_eq!(messages[2].content(), "hello");

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, ChatMode::Gemini);
        assert_eq!(requests[0].1.user_id, "user-1");
        assert_eq!(requests[0].1.query, "hi");
        assert!(!transport.is_loading());
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(json!({"response": "hello"})));
        let transport = transport_with(&connector, &backend);

        assert_eq!(transport.send("   \n").await, SendOutcome::Ignored);
        assert_eq!(transport.transcript().len(), 1);
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_open_socket_skips_http() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(json!({"response": "unused"})));
        let transport = transport_with(&connector, &backend);
        let mut peer = connected(&transport, &connector).await;
        assert!(peer.url.ends_with("/ws/user-1"));

        assert_eq!(transport.send("  hi ").await, SendOutcome::Streamed);
        assert_eq!(peer.next_frame().await, json!({"type": "chat", "content": "hi"}));

        assert!(backend.requests().is_empty());
        assert!(transport.is_loading());
        let last = transport.transcript().last().unwrap();
        assert_eq!((last.role(), last.content()), (Role::User, "hi"));
    }

    #[tokio::test]
    async fn test_socket_reply_appends_bot_message() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);
        let peer = connected(&transport, &connector).await;
        let mut updates = transport.transcript().subscribe();

        assert_ok!(peer.to_client.send(SocketEvent::Frame(
            r#"{"type":"ai_response","response":"Balance: 100","insights":["Spend less"]}"#
                .to_string()
        )));

        let finchat_core::TranscriptEvent::Appended(msg) = updates.recv().await.unwrap() else {
            panic!("expected an append");
        };
        assert_eq!(msg.role(), Role::Bot);
        assert_eq!(msg.content(), "Balance: 100");
        assert_eq!(msg.insights().to_vec(), vec!["Spend less".to_string()]);
    }

    #[tokio::test]
    async fn test_typing_then_response() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);

        transport.handle_frame(r#"{"type":"typing","message":"AI is thinking..."}"#);
        assert!(transport.is_typing());
        assert_eq!(transport.transcript().len(), 1);

        transport.handle_frame(r#"{"event":"reply","content":"Done"}"#);
        assert!(!transport.is_typing());
        assert_eq!(transport.transcript().len(), 2);
        assert_eq!(transport.transcript().last().unwrap().content(), "Done");
    }

    #[tokio::test]
    async fn test_frames_without_text_do_not_append() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);

        transport.handle_frame("{broken");
        transport.handle_frame(r#"{"type":"connection_established","message":"Connected"}"#);
        transport.handle_frame(r#"{"type":"pong"}"#);
        transport.handle_frame(r#"{"type":"ai_stream","chunk":"partial"}"#);
        assert_eq!(transport.transcript().len(), 1);

        transport.handle_frame(r#"{"type":"data_analysis","message":"Analysis ready"}"#);
        transport.handle_frame(r#"{"type":"notification","message":"Budget exceeded"}"#);
        transport.handle_frame(r#"{"type":"error","message":"Server error"}"#);
        let messages = transport.transcript().snapshot();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content(), "Analysis ready");
        assert_eq!(messages[2].content(), "Budget exceeded");
        assert!(messages[3].content().contains("Server error"));
    }

    #[tokio::test]
    async fn test_http_error_becomes_single_bot_message() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::failing(BackendError::Status {
            status: 500,
            detail: "boom".to_string(),
        }));
        let transport = transport_with(&connector, &backend);

        assert_eq!(transport.send("hi").await, SendOutcome::Answered);
        let messages = transport.transcript().snapshot();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].role(), Role::Bot);
        assert!(messages[2].content().contains("Request failed (500): boom"));
    }

    #[tokio::test]
    async fn test_http_body_without_text_still_answers() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(json!({"status": "ok"})));
        let transport = transport_with(&connector, &backend);

        assert_eq!(transport.send("hi").await, SendOutcome::Answered);
        assert_eq!(transport.transcript().len(), 3);
        assert_eq!(transport.transcript().last().unwrap().content(), EMPTY_REPLY);
    }

    #[tokio::test]
    async fn test_mode_selects_endpoint() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(json!({"message": "ok"})));
        let transport = transport_with(&connector, &backend);

        transport.set_mode(ChatMode::Agent);
        transport.send("hi").await;
        assert_eq!(backend.requests()[0].0, ChatMode::Agent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_sequence() {
        let connector = Arc::new(MockConnector::refusing());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);

        transport.connect("user-1");
        time::sleep(Duration::from_millis(7_500)).await;

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 4);
        for (pair, expected) in attempts.windows(2).zip([1000, 2000, 4000]) {
            let gap = pair[1] - pair[0];
            let expected = Duration::from_millis(expected);
            assert!(gap >= expected && gap < expected + Duration::from_millis(5), "{gap:?}");
        }
        assert_eq!(transport.reconnect_attempts(), 4);
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reconnects_and_open_resets_attempts() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);
        let peer = connected(&transport, &connector).await;

        assert_ok!(peer.to_client.send(SocketEvent::Closed {
            code: Some(1006),
            reason: "abnormal".to_string(),
        }));
        wait_for_state(&transport, ConnectionState::Disconnected).await;
        assert_eq!(transport.reconnect_attempts(), 1);

        wait_for_state(&transport, ConnectionState::Connected).await;
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(transport.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_error_waits_for_close() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);
        let peer = connected(&transport, &connector).await;

        assert_ok!(peer.to_client.send(SocketEvent::Error("connection reset".to_string())));
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connection_state(), ConnectionState::Connected);
        assert_eq!(transport.transcript().len(), 1);
        assert_eq!(transport.reconnect_attempts(), 0);
        assert_eq!(connector.attempts().len(), 1);

        assert_ok!(peer.to_client.send(SocketEvent::Closed {
            code: None,
            reason: "stream ended".to_string(),
        }));
        wait_for_state(&transport, ConnectionState::Disconnected).await;
        assert_eq!(transport.reconnect_attempts(), 1);
        assert_eq!(transport.transcript().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_connection_init_is_not_shown() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = ChatTransport::new(
            TransportConfig {
                send_connection_init: true,
                ..test_config()
            },
            "user-1",
            Arc::clone(&connector) as Arc<dyn SocketConnector>,
            Arc::clone(&backend) as Arc<dyn ChatBackend>,
        );
        let mut peer = connected(&transport, &connector).await;
        assert_eq!(
            peer.next_frame().await,
            json!({"type": "connection_init", "content": "user-1"})
        );
        let mut updates = transport.transcript().subscribe();

        assert_ok!(peer.to_client.send(SocketEvent::Frame(
            r#"{"type":"error","message":"Unknown message type: connection_init"}"#.to_string()
        )));
        // A later frame on the same socket proves the rejection was processed.
        assert_ok!(peer.to_client.send(SocketEvent::Frame(
            r#"{"type":"ai_response","response":"still here"}"#.to_string()
        )));
        let finchat_core::TranscriptEvent::Appended(msg) = updates.recv().await.unwrap() else {
            panic!("expected an append");
        };
        assert_eq!(msg.content(), "still here");
        assert_eq!(transport.transcript().len(), 2);
        assert_eq!(transport.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_default_config_sends_no_connection_init() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);
        let mut peer = connected(&transport, &connector).await;

        transport.send("hi").await;
        assert_eq!(peer.next_frame().await, json!({"type": "chat", "content": "hi"}));
    }

    #[tokio::test]
    async fn test_connect_same_session_is_noop() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);

        let mut first = connected(&transport, &connector).await;
        transport.connect("user-1");
        assert_eq!(connector.attempts().len(), 1);

        transport.connect("user-2");
        wait_for_state(&transport, ConnectionState::Connected).await;
        let second = connector.take_peer();
        assert!(second.url.ends_with("/ws/user-2"));
        assert_eq!(transport.session_id(), "user-2");
        // The replaced socket's outbound side is dropped.
        assert!(first.from_client.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_closes_socket_and_uses_http() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(json!({"response": "over http"})));
        let transport = transport_with(&connector, &backend);
        let mut peer = connected(&transport, &connector).await;

        transport.disable();
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
        assert!(peer.from_client.recv().await.is_none());

        assert_eq!(transport.send("hi").await, SendOutcome::Answered);
        assert_eq!(backend.requests().len(), 1);

        transport.connect("user-1");
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts().len(), 1);

        transport.enable();
        wait_for_state(&transport, ConnectionState::Connected).await;
        assert_eq!(connector.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending_reconnect() {
        let connector = Arc::new(MockConnector::refusing());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);

        transport.connect("user-1");
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.attempts().len(), 1);

        transport.dispose();
        transport.dispose();
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(transport.send("hi").await, SendOutcome::Discarded);
        assert_eq!(transport.transcript().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_stops_reconnects() {
        let connector = Arc::new(MockConnector::refusing());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);

        transport.connect("user-1");
        time::sleep(Duration::from_millis(10)).await;
        drop(transport);
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_discards_in_flight_reply() {
        let connector = Arc::new(MockConnector::default());
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(MockBackend {
            gate: Some(Arc::clone(&gate)),
            ..MockBackend::replying(json!({"response": "too late"}))
        });
        let transport = transport_with(&connector, &backend);

        let sender = transport.clone();
        let pending = tokio::spawn(async move { sender.send("hi").await });
        backend.entered.notified().await;

        transport.dispose();
        gate.notify_one();
        assert_eq!(pending.await.unwrap(), SendOutcome::Discarded);

        let messages = transport.transcript().snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content(), "hi");
    }

    #[tokio::test]
    async fn test_clear_history_leaves_one_message() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::failing(BackendError::Network(
            "connection refused".to_string(),
        )));
        let transport = transport_with(&connector, &backend);
        transport.send("hi").await;
        assert_eq!(transport.transcript().len(), 3);

        transport.clear_history().await;
        assert_eq!(backend.clears.load(Ordering::SeqCst), 1);
        let messages = transport.transcript().snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role(), Role::System);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = ChatTransport::new(
            TransportConfig {
                keepalive_secs: Some(30),
                ..test_config()
            },
            "user-1",
            Arc::clone(&connector) as Arc<dyn SocketConnector>,
            Arc::clone(&backend) as Arc<dyn ChatBackend>,
        );
        let mut peer = connected(&transport, &connector).await;

        time::sleep(Duration::from_secs(31)).await;
        assert_eq!(peer.next_frame().await, json!({"type": "ping"}));
    }

    #[tokio::test]
    async fn test_backend_passthroughs() {
        let connector = Arc::new(MockConnector::default());
        let backend = Arc::new(MockBackend::replying(Value::Null));
        let transport = transport_with(&connector, &backend);

        let status = assert_ok!(transport.service_status().await);
        assert!(status.available);
        assert_err!(transport.conversation_summary().await);
    }
}
