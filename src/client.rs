//! # ChatClient
//!
//! The synchronization service. One session task owns the connection, the
//! correlator, the subscription manager and the dispatch table; callers hold
//! a cheap cloneable [`ChatClient`] handle.
//!
//! ## Session loop
//! The task multiplexes, one at a time and in arrival order:
//! - caller commands (connect, select, send, history, handler registration),
//! - inbound frames from the open duplex,
//! - results of socket opens and HTTP fallbacks spawned off the loop,
//! - the reconnect timer,
//! - the earliest pending-request deadline.
//!
//! Nothing inside the loop blocks: socket opens and HTTP fetches run in
//! spawned tasks and report back on an internal channel. Each open carries a
//! generation number; a result from an older generation (for example one
//! that lands after `disconnect()`) is closed and ignored.
//!
//! ## Observing the session
//! - [`ChatClient::subscribe`] yields [`SyncEvent`]s for re-rendering.
//! - [`ChatClient::state`] / [`ChatClient::state_changes`] expose the
//!   connection state.
//! - [`ChatClient::messages`] returns an immutable timeline snapshot.

use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::correlator::{Correlator, Outcome, Registration, Settled};
use crate::dispatch::{Dispatched, ErrorHandler, FrameHandler, HandlerTable};
use crate::error::{Result, SyncError};
use crate::history::HttpHistory;
use crate::protocol::{
    decode_inbound, now_ms, ChannelId, HistoryBatch, InboundFrame, Message, MessageId,
    OutboundFrame, OutgoingPayload, PushedMessage, Sender,
};
use crate::store::{BeginLoad, MessageStore, PushOutcome, Timeline};
use crate::subscription::SubscriptionManager;
use crate::transport::ws::WsConnector;
use crate::transport::{
    endpoint_url, redacted, CloseDecision, ConnectionState, Connector, Credential, Duplex,
    ReconnectPolicy, WireMessage, CLOSE_ABNORMAL, CLOSE_NORMAL,
};

/// How a message entered a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddKind {
    /// Local send, not yet echoed.
    Optimistic,
    /// New message pushed by the server.
    Pushed,
    /// Server echo that replaced an optimistic entry in place.
    Confirmed,
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ConnectionOpened,
    ConnectionClosed { code: u16 },
    MessageAdded {
        channel_id: ChannelId,
        message_id: MessageId,
        kind: AddKind,
    },
    HistoryLoaded { channel_id: ChannelId, count: usize },
    ProtocolError { message: String },
}

type LoadReply = oneshot::Sender<Result<Timeline>>;

enum Command {
    Connect(Credential),
    Disconnect,
    Select(Option<ChannelId>),
    SetActiveServer(String),
    SendMessage {
        channel_id: ChannelId,
        sender: Sender,
        content: String,
        attachment_ids: Vec<String>,
        reply: oneshot::Sender<Option<MessageId>>,
    },
    Request {
        channel_id: ChannelId,
        reply: oneshot::Sender<Outcome>,
    },
    LoadHistory {
        channel_id: ChannelId,
        reply: Option<LoadReply>,
    },
    On {
        kind: String,
        handler: FrameHandler,
    },
    Off {
        kind: String,
    },
    OnError(ErrorHandler),
    Shutdown,
}

enum Internal {
    Opened {
        generation: u64,
        result: Result<Duplex>,
    },
    HttpHistory {
        channel_id: ChannelId,
        result: Result<Vec<Message>>,
    },
}

fn read_store(store: &RwLock<MessageStore>) -> RwLockReadGuard<'_, MessageStore> {
    store.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_store(store: &RwLock<MessageStore>) -> RwLockWriteGuard<'_, MessageStore> {
    store.write().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running sync session. Clones share the session.
///
/// The session stops when [`shutdown`](Self::shutdown) is called or the last
/// handle is dropped.
#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
    state: watch::Receiver<ConnectionState>,
    store: Arc<RwLock<MessageStore>>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    /// Start a session that connects over websockets.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Start a session over any [`Connector`].
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let store = Arc::new(RwLock::new(MessageStore::new(config.dedup_window_ms)));

        let history = config
            .http_fallback_enabled()
            .then(|| HttpHistory::new(config.http_base_url.clone(), config.http_timeout()));

        let session = Session {
            policy: ReconnectPolicy::new(config.max_retries, config.reconnect_interval()),
            correlator: Correlator::new(config.request_timeout()),
            config,
            connector,
            credential: None,
            state: ConnectionState::Disconnected,
            state_tx,
            events: events.clone(),
            link: None,
            generation: 0,
            reconnect_at: None,
            subscriptions: SubscriptionManager::new(),
            store: Arc::clone(&store),
            handlers: HandlerTable::new(),
            load_waiters: HashMap::new(),
            awaiting_open: HashSet::new(),
            history,
            internal_tx,
        };
        tokio::spawn(session.run(command_rx, internal_rx));

        Ok(Self {
            commands,
            events,
            state,
            store,
        })
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            tracing::warn!("sync session is gone, command dropped");
        }
    }

    /// Open the duplex channel. No-op while already open or opening.
    pub fn connect(&self, credential: Credential) {
        self.command(Command::Connect(credential));
    }

    /// Close with a normal-closure code and suppress auto-reconnect.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Make `channel_id` the active channel (leaving the previous one) and
    /// start loading its history. `None` leaves the active channel.
    pub fn select_channel(&self, channel_id: Option<ChannelId>) {
        self.command(Command::Select(channel_id));
    }

    /// Switch server context: leave the active channel and drop all timelines.
    pub fn set_active_server(&self, server_id: impl Into<String>) {
        self.command(Command::SetActiveServer(server_id.into()));
    }

    /// Send a chat message to the joined channel.
    ///
    /// Returns the id of the optimistic entry, or `None` when the message was
    /// dropped because the session is disconnected or `channel_id` is not the
    /// joined channel.
    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        sender: Sender,
        content: impl Into<String>,
        attachment_ids: Vec<String>,
    ) -> Option<MessageId> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendMessage {
            channel_id,
            sender,
            content: content.into(),
            attachment_ids,
            reply,
        });
        rx.await.ok().flatten()
    }

    /// Correlated history fetch over the duplex channel. Does not touch the
    /// store.
    pub async fn request(&self, channel_id: ChannelId) -> Result<Vec<Message>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request { channel_id, reply });
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Load a channel's history into the store, once per session.
    ///
    /// Falls back to HTTP when the duplex fetch fails. Concurrent calls share
    /// one fetch. Resolves to the timeline snapshot after the load.
    pub async fn load_history(&self, channel_id: ChannelId) -> Result<Timeline> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::LoadHistory {
            channel_id,
            reply: Some(reply),
        });
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Register the handler for an inbound `type` tag the core does not
    /// consume. Replaces any earlier handler for the same tag.
    pub fn on<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: FnMut(&InboundFrame) + Send + 'static,
    {
        self.command(Command::On {
            kind: kind.into(),
            handler: Box::new(handler),
        });
    }

    pub fn off(&self, kind: impl Into<String>) {
        self.command(Command::Off { kind: kind.into() });
    }

    /// Register the handler for server `ERROR` frames.
    pub fn on_error<F>(&self, handler: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.command(Command::OnError(Box::new(handler)));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Timeline snapshot, empty when the channel has none.
    pub fn messages(&self, channel_id: &ChannelId) -> Timeline {
        read_store(&self.store).messages(channel_id)
    }

    pub fn has_timeline(&self, channel_id: &ChannelId) -> bool {
        read_store(&self.store).has_timeline(channel_id)
    }

    pub fn is_loading(&self, channel_id: &ChannelId) -> bool {
        read_store(&self.store).is_loading(channel_id)
    }

    /// Disconnect and stop the session task.
    pub fn shutdown(&self) {
        self.command(Command::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

struct Link {
    outbound: mpsc::UnboundedSender<WireMessage>,
    inbound: futures_util::stream::BoxStream<'static, WireMessage>,
}

struct Session {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    credential: Option<Credential>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SyncEvent>,
    link: Option<Link>,
    generation: u64,
    policy: ReconnectPolicy,
    reconnect_at: Option<Instant>,
    correlator: Correlator,
    subscriptions: SubscriptionManager,
    store: Arc<RwLock<MessageStore>>,
    handlers: HandlerTable,
    load_waiters: HashMap<ChannelId, Vec<LoadReply>>,
    /// Loads requested while the socket was still opening.
    awaiting_open: HashSet<ChannelId>,
    history: Option<HttpHistory>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

async fn next_inbound(link: &mut Option<Link>) -> Option<WireMessage> {
    match link {
        Some(link) => link.inbound.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            let reconnect_at = self.reconnect_at;
            let deadline = self.correlator.next_deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(msg) = internal.recv() => self.handle_internal(msg),
                wire = next_inbound(&mut self.link) => self.handle_wire(wire),
                _ = sleep_until(reconnect_at) => self.fire_reconnect(),
                _ = sleep_until(deadline) => self.expire_requests(),
            }
        }
        self.disconnect();
        tracing::debug!("sync session stopped");
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(credential) => self.connect(credential),
            Command::Disconnect => self.disconnect(),
            Command::Select(target) => self.select(target),
            Command::SetActiveServer(server_id) => self.set_active_server(&server_id),
            Command::SendMessage {
                channel_id,
                sender,
                content,
                attachment_ids,
                reply,
            } => {
                let id = self.send_message(channel_id, sender, content, attachment_ids);
                let _ = reply.send(id);
            }
            Command::Request { channel_id, reply } => self.request(channel_id, Some(reply)),
            Command::LoadHistory { channel_id, reply } => self.load_history(channel_id, reply),
            Command::On { kind, handler } => {
                if self.handlers.on(kind.clone(), handler) {
                    tracing::debug!(kind = %kind, "replaced frame handler");
                }
            }
            Command::Off { kind } => {
                self.handlers.off(&kind);
            }
            Command::OnError(handler) => self.handlers.on_error(handler),
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Opened { generation, result } => self.opened(generation, result),
            Internal::HttpHistory { channel_id, result } => {
                if let Err(e) = &result {
                    tracing::warn!(channel_id = %channel_id, error = %e, "HTTP history fallback failed");
                }
                self.complete_load(&channel_id, result);
            }
        }
    }

    // -- connection lifecycle ------------------------------------------------

    fn connect(&mut self, credential: Credential) {
        if self.state != ConnectionState::Disconnected {
            tracing::debug!(state = %self.state, "connect ignored");
            return;
        }
        self.credential = Some(credential);
        self.policy.reset();
        self.reconnect_at = None;
        self.open();
    }

    fn open(&mut self) {
        let Some(credential) = self.credential.as_ref() else {
            tracing::warn!("no credential, cannot open connection");
            return;
        };
        let url = match endpoint_url(&self.config.endpoint, credential) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = %e, "cannot build endpoint url");
                return;
            }
        };

        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %redacted(&url), attempt = self.policy.retries(), "connecting");

        let connecting = self.connector.connect(&url);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connecting.await;
            let _ = internal.send(Internal::Opened { generation, result });
        });
    }

    fn opened(&mut self, generation: u64, result: Result<Duplex>) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            if let Ok(stale) = result {
                let _ = stale.outbound.send(WireMessage::normal_close("superseded"));
            }
            tracing::debug!(generation, "discarding stale connection result");
            return;
        }

        match result {
            Ok(duplex) => {
                self.link = Some(Link {
                    outbound: duplex.outbound,
                    inbound: duplex.inbound,
                });
                self.set_state(ConnectionState::Connected);
                self.policy.on_open();
                tracing::info!("connected");
                self.emit(SyncEvent::ConnectionOpened);

                // Requests from a previous connection can never be answered.
                for settled in self.correlator.reject_all(SyncError::ConnectionReset) {
                    self.request_failed(settled, SyncError::ConnectionReset);
                }
                if let Some(join) = self.subscriptions.on_connection_opened() {
                    tracing::info!(channel_id = %join.channel_id(), "re-joining channel");
                    self.send(join);
                }
                self.issue_deferred_loads();
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection attempt failed");
                self.closed(CLOSE_ABNORMAL);
            }
        }
    }

    fn closed(&mut self, code: u16) {
        self.link = None;
        self.set_state(ConnectionState::Disconnected);
        self.emit(SyncEvent::ConnectionClosed { code });
        self.fail_deferred_loads();

        match self.policy.on_close(code) {
            CloseDecision::Normal => {
                tracing::info!(code, "connection closed normally");
                self.subscriptions.clear();
            }
            CloseDecision::Reconnect { attempt, delay } => {
                tracing::info!(
                    code,
                    attempt,
                    max_retries = self.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "connection lost, scheduling reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            CloseDecision::Exhausted => {
                tracing::error!(
                    code,
                    max_retries = self.config.max_retries,
                    "reconnect attempts exhausted, staying disconnected"
                );
            }
            CloseDecision::Suppressed => {
                tracing::debug!(code, "closed after user disconnect");
            }
        }
    }

    fn fire_reconnect(&mut self) {
        self.reconnect_at = None;
        if self.policy.is_suppressed() || self.state != ConnectionState::Disconnected {
            return;
        }
        tracing::info!(
            attempt = self.policy.retries(),
            max_retries = self.config.max_retries,
            "reconnecting"
        );
        self.open();
    }

    fn disconnect(&mut self) {
        let was = self.state;
        self.policy.suppress();
        self.reconnect_at = None;
        // Invalidate any open still in flight.
        self.generation += 1;
        if let Some(link) = self.link.take() {
            let _ = link
                .outbound
                .send(WireMessage::normal_close("Client disconnect"));
        }
        self.subscriptions.clear();
        self.set_state(ConnectionState::Disconnected);
        self.fail_deferred_loads();
        if was != ConnectionState::Disconnected {
            tracing::info!("disconnected by client");
            self.emit(SyncEvent::ConnectionClosed { code: CLOSE_NORMAL });
        }
    }

    /// Fire-and-forget write. Dropped with a warning when not connected.
    fn send(&self, frame: OutboundFrame) {
        let link = match (&self.link, self.state) {
            (Some(link), ConnectionState::Connected) => link,
            _ => {
                tracing::warn!(kind = frame.kind(), channel_id = %frame.channel_id(), "not connected, frame dropped");
                return;
            }
        };
        match frame.encode() {
            Ok(text) => {
                tracing::debug!(kind = frame.kind(), channel_id = %frame.channel_id(), "sending frame");
                if link.outbound.send(WireMessage::Text(text)).is_err() {
                    tracing::warn!(kind = frame.kind(), "socket writer gone, frame dropped");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode frame"),
        }
    }

    // -- inbound -------------------------------------------------------------

    fn handle_wire(&mut self, wire: Option<WireMessage>) {
        match wire {
            Some(WireMessage::Text(text)) => match decode_inbound(&text) {
                Ok(frame) => self.dispatch(frame),
                Err(e) => tracing::warn!(error = %e, "dropping malformed frame"),
            },
            Some(WireMessage::Binary(bytes)) => {
                tracing::warn!(len = bytes.len(), "dropping non-text frame");
            }
            Some(WireMessage::Close { code, reason }) => {
                tracing::info!(code, reason = %reason, "server closed connection");
                self.closed(code);
            }
            None => self.closed(CLOSE_ABNORMAL),
        }
    }

    fn dispatch(&mut self, frame: InboundFrame) {
        tracing::debug!(kind = frame.kind(), "received frame");
        let frame = match frame {
            InboundFrame::ChannelMessage(push) => return self.on_pushed(push),
            InboundFrame::FetchMessagesResponse(batch) => return self.on_history(batch),
            other => other,
        };

        if let InboundFrame::Error { message } = &frame {
            self.emit(SyncEvent::ProtocolError {
                message: message.clone(),
            });
        }
        if self.handlers.dispatch(&frame) == Dispatched::Unhandled {
            match &frame {
                InboundFrame::Error { message } => tracing::warn!(message = %message, "server error"),
                _ => tracing::debug!(kind = frame.kind(), "no handler registered, frame dropped"),
            }
        }
    }

    fn on_pushed(&mut self, push: PushedMessage) {
        let message = push.into_message(now_ms());
        let (channel_id, message_id) = (message.channel_id.clone(), message.id.clone());
        let outcome = write_store(&self.store).record_pushed(message);
        let kind = match outcome {
            PushOutcome::Appended { .. } => AddKind::Pushed,
            PushOutcome::Confirmed { .. } => AddKind::Confirmed,
            PushOutcome::Duplicate { index } => {
                tracing::debug!(channel_id = %channel_id, index, "skipping duplicate message");
                return;
            }
        };
        self.emit(SyncEvent::MessageAdded {
            channel_id,
            message_id,
            kind,
        });
    }

    fn on_history(&mut self, batch: HistoryBatch) {
        let channel_id = batch.channel_id.clone();
        if !self.correlator.is_pending(&channel_id) {
            tracing::debug!(channel_id = %channel_id, "ignoring history response with no pending request");
            return;
        }
        let timeline = batch.into_timeline(now_ms());
        self.correlator.resolve(&channel_id, timeline.clone());
        if read_store(&self.store).is_loading(&channel_id) {
            self.complete_load(&channel_id, Ok(timeline));
        }
    }

    // -- channels and messages -----------------------------------------------

    fn select(&mut self, target: Option<ChannelId>) {
        for frame in self.subscriptions.select(target.clone()) {
            self.send(frame);
        }
        if let Some(channel_id) = target {
            self.load_history(channel_id, None);
        }
    }

    fn set_active_server(&mut self, server_id: &str) {
        tracing::info!(server_id, "switching server, clearing timelines");
        for frame in self.subscriptions.select(None) {
            self.send(frame);
        }
        write_store(&self.store).clear();
        for (_, waiters) in self.load_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SyncError::Superseded));
            }
        }
    }

    fn send_message(
        &mut self,
        channel_id: ChannelId,
        sender: Sender,
        content: String,
        attachment_ids: Vec<String>,
    ) -> Option<MessageId> {
        if self.state != ConnectionState::Connected || !self.subscriptions.accepts(&channel_id) {
            tracing::warn!(channel_id = %channel_id, state = %self.state, "not connected or channel not joined, message dropped");
            return None;
        }

        let message = Message::optimistic(channel_id.clone(), sender, content.clone(), now_ms());
        let message_id = message.id.clone();
        write_store(&self.store).record_optimistic(message);
        self.emit(SyncEvent::MessageAdded {
            channel_id: channel_id.clone(),
            message_id: message_id.clone(),
            kind: AddKind::Optimistic,
        });

        self.send(OutboundFrame::ChannelMessage {
            channel_id,
            payload: OutgoingPayload {
                content,
                attachment_ids,
            },
        });
        Some(message_id)
    }

    // -- correlated history --------------------------------------------------

    fn request(&mut self, channel_id: ChannelId, reply: Option<oneshot::Sender<Outcome>>) {
        if self.state != ConnectionState::Connected {
            match reply {
                Some(reply) => {
                    let _ = reply.send(Err(SyncError::NotConnected));
                }
                None if self.state == ConnectionState::Connecting => {
                    tracing::debug!(channel_id = %channel_id, "history load waits for the socket to open");
                    self.awaiting_open.insert(channel_id);
                }
                None => self.load_failed(&channel_id, SyncError::NotConnected),
            }
            return;
        }
        match self.correlator.attach(channel_id.clone(), Instant::now(), reply) {
            Registration::Issued => {
                tracing::debug!(channel_id = %channel_id, "fetching history");
                self.send(OutboundFrame::FetchMessages { channel_id });
            }
            Registration::Joined => {
                tracing::debug!(channel_id = %channel_id, "joined in-flight history fetch");
            }
        }
    }

    /// The socket opened: fetch loads that were waiting for it, and the
    /// joined channel's history if no load holds or is fetching it.
    fn issue_deferred_loads(&mut self) {
        let waiting: Vec<ChannelId> = self.awaiting_open.drain().collect();
        for channel_id in waiting {
            if read_store(&self.store).is_loading(&channel_id) {
                self.request(channel_id, None);
            }
        }

        let Some(joined) = self.subscriptions.current().cloned() else {
            return;
        };
        let needs_load = {
            let store = read_store(&self.store);
            !store.is_loaded(&joined) && !store.is_loading(&joined)
        };
        if needs_load {
            self.load_history(joined, None);
        }
    }

    /// The socket went down before a deferred load could be fetched.
    fn fail_deferred_loads(&mut self) {
        let waiting: Vec<ChannelId> = self.awaiting_open.drain().collect();
        for channel_id in waiting {
            if read_store(&self.store).is_loading(&channel_id) {
                self.load_failed(&channel_id, SyncError::NotConnected);
            }
        }
    }

    fn expire_requests(&mut self) {
        let after_ms = self.correlator.timeout().as_millis() as u64;
        for settled in self.correlator.expire(Instant::now()) {
            tracing::warn!(channel_id = %settled.channel_id, after_ms, "history fetch timed out");
            let error = SyncError::Timeout {
                channel_id: settled.channel_id.clone(),
                after_ms,
            };
            self.request_failed(settled, error);
        }
    }

    fn request_failed(&mut self, settled: Settled, error: SyncError) {
        if read_store(&self.store).is_loading(&settled.channel_id) {
            self.load_failed(&settled.channel_id, error);
        }
    }

    fn load_history(&mut self, channel_id: ChannelId, reply: Option<LoadReply>) {
        let begin = write_store(&self.store).begin_load(&channel_id);
        match begin {
            BeginLoad::AlreadyLoaded => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(read_store(&self.store).messages(&channel_id)));
                }
            }
            BeginLoad::InFlight => {
                self.load_waiters.entry(channel_id).or_default().extend(reply);
            }
            BeginLoad::Started => {
                self.load_waiters
                    .entry(channel_id.clone())
                    .or_default()
                    .extend(reply);
                self.request(channel_id, None);
            }
        }
    }

    /// The duplex fetch for a load failed: try HTTP, else give up.
    fn load_failed(&mut self, channel_id: &ChannelId, error: SyncError) {
        if let (Some(history), Some(credential)) = (self.history.clone(), self.credential.clone()) {
            tracing::info!(channel_id = %channel_id, error = %error, "falling back to HTTP history");
            let internal = self.internal_tx.clone();
            let channel_id = channel_id.clone();
            tokio::spawn(async move {
                let result = history.fetch(&channel_id, &credential).await;
                let _ = internal.send(Internal::HttpHistory { channel_id, result });
            });
            return;
        }
        self.complete_load(channel_id, Err(error));
    }

    fn complete_load(&mut self, channel_id: &ChannelId, result: Result<Vec<Message>>) {
        let (installed, count) = {
            let mut store = write_store(&self.store);
            match &result {
                Ok(messages) => {
                    let count = messages.len();
                    (store.finish_load(channel_id, Some(messages.clone())), count)
                }
                Err(_) => (store.finish_load(channel_id, None), 0),
            }
        };
        if !installed {
            tracing::debug!(channel_id = %channel_id, "discarding stale history result");
            return;
        }

        let outcome = match result {
            Ok(_) => {
                tracing::info!(channel_id = %channel_id, count, "history loaded");
                self.emit(SyncEvent::HistoryLoaded {
                    channel_id: channel_id.clone(),
                    count,
                });
                Ok(read_store(&self.store).messages(channel_id))
            }
            Err(e) => Err(e),
        };
        for waiter in self.load_waiters.remove(channel_id).unwrap_or_default() {
            let _ = waiter.send(outcome.clone());
        }
    }
}
