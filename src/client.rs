//! Connection supervisor: owns the transport lifecycle
//! (`connecting → handshaking → open → closing → closed`), the reconnect
//! policy, and the inbound stanza demultiplexer.

use crate::binary::jid::Jid;
use crate::binary::node::{Node, NodeBuilder};
use crate::config::SocketConfig;
use crate::error::ClientError;
use crate::event_bus::EventBus;
use crate::handshake;
use crate::proto;
use crate::socket::{FrameSocket, NoiseSocket};
use crate::store::DeviceStore;
use crate::types::events::{
    AuthClearRequired, ConnectionState, ConnectionUpdate, DisconnectReason, Event, LoggedOut,
    TemporaryBan,
};
use crate::{binary, pair};
use log::{debug, error, info, warn};
use rand::RngCore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{sleep, timeout, Duration, Instant};

/// Context retained from a call offer so later events inherit it.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub is_video: bool,
    pub is_group: bool,
}

pub struct Client {
    pub config: SocketConfig,
    pub store: Arc<DeviceStore>,
    pub event_bus: Arc<EventBus>,

    pub(crate) is_logged_in: AtomicBool,
    is_connecting: AtomicBool,
    is_running: AtomicBool,
    pub(crate) shutdown: Notify,

    frame_socket: Mutex<Option<Arc<FrameSocket>>>,
    noise_socket: Mutex<Option<Arc<NoiseSocket>>>,
    frames_rx: Mutex<Option<Receiver<bytes::Bytes>>>,

    pub(crate) response_waiters: Mutex<HashMap<String, oneshot::Sender<Node>>>,
    pub(crate) unique_id: String,
    pub(crate) id_counter: AtomicU64,

    pub(crate) expected_disconnect: AtomicBool,
    pub(crate) enable_auto_reconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    pub(crate) last_disconnect: Mutex<Option<DisconnectReason>>,

    /// Serializes all inbound business logic so listeners observe
    /// consistent state.
    pub(crate) processing_mutex: Mutex<()>,
    /// Serializes decrypt-retry handling across the connection.
    pub(crate) retry_mutex: Mutex<()>,

    pub(crate) flood_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    pub(crate) msg_retry_cache: moka::future::Cache<String, u8>,
    pub(crate) call_offer_cache: moka::future::Cache<String, CallSnapshot>,
    pub(crate) placeholder_cache: moka::future::Cache<String, ()>,
    pub(crate) recent_messages: moka::future::Cache<String, proto::Message>,
    pub(crate) retry_dedupe: moka::future::Cache<String, ()>,
    pub(crate) pending_retries: Mutex<HashSet<String>>,
    pub(crate) device_cache: moka::future::Cache<String, Vec<Jid>>,

    offline_tx: Mutex<Option<UnboundedSender<Node>>>,
    pub(crate) offline_pending: AtomicUsize,
    offline_drained: Notify,
    offline_preview_total: AtomicUsize,

    /// Key derived from the link code; bridges the two pairing-code steps.
    pub(crate) pairing_code_key: Mutex<Option<[u8; 32]>>,
}

impl Client {
    pub fn new(config: SocketConfig, store: Arc<DeviceStore>) -> Arc<Self> {
        let mut unique_id_bytes = [0u8; 2];
        rand::thread_rng().fill_bytes(&mut unique_id_bytes);

        let event_bus = Arc::new(EventBus::new());
        if let Some(sink) = config.on_unexpected_error.clone() {
            event_bus.set_error_sink(sink);
        }

        Arc::new(Self {
            event_bus,
            is_logged_in: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            shutdown: Notify::new(),
            frame_socket: Mutex::new(None),
            noise_socket: Mutex::new(None),
            frames_rx: Mutex::new(None),
            response_waiters: Mutex::new(HashMap::new()),
            unique_id: format!("{}.{}", unique_id_bytes[0], unique_id_bytes[1]),
            id_counter: AtomicU64::new(0),
            expected_disconnect: AtomicBool::new(false),
            enable_auto_reconnect: AtomicBool::new(true),
            reconnect_attempts: AtomicU32::new(0),
            last_disconnect: Mutex::new(None),
            processing_mutex: Mutex::new(()),
            retry_mutex: Mutex::new(()),
            flood_windows: Mutex::new(HashMap::new()),
            msg_retry_cache: moka::future::Cache::builder()
                .max_capacity(4096)
                .time_to_live(config.msg_retry_cache_ttl)
                .build(),
            call_offer_cache: moka::future::Cache::builder()
                .max_capacity(256)
                .time_to_live(config.call_offer_cache_ttl)
                .build(),
            placeholder_cache: moka::future::Cache::builder()
                .max_capacity(1024)
                .time_to_live(config.placeholder_resend_cache_ttl)
                .build(),
            recent_messages: moka::future::Cache::builder()
                .max_capacity(512)
                .time_to_live(Duration::from_secs(1800))
                .build(),
            retry_dedupe: moka::future::Cache::builder()
                .max_capacity(2048)
                .time_to_live(Duration::from_secs(300))
                .build(),
            pending_retries: Mutex::new(HashSet::new()),
            device_cache: moka::future::Cache::builder()
                .max_capacity(1024)
                .time_to_live(Duration::from_secs(60))
                .build(),
            offline_tx: Mutex::new(None),
            offline_pending: AtomicUsize::new(0),
            offline_drained: Notify::new(),
            offline_preview_total: AtomicUsize::new(0),
            pairing_code_key: Mutex::new(None),
            config,
            store,
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.is_logged_in.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.noise_socket
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn emit(&self, event: Event) {
        self.event_bus.dispatch(event);
    }

    pub(crate) fn report_unexpected(&self, message: String, context: &'static str) {
        error!(target: "Client", "[{context}] {message}");
        if let Some(sink) = &self.config.on_unexpected_error {
            sink(message, context);
        }
    }

    /// Runs the connection until logged out, fatally failed, or closed.
    /// Reconnects with the per-code backoff policy in between attempts.
    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Client", "run() called while already running");
            return;
        }

        while self.is_running.load(Ordering::Relaxed) {
            self.expected_disconnect.store(false, Ordering::Relaxed);

            match self.connect().await {
                Err(e) => {
                    warn!(target: "Client", "connect failed: {e}");
                }
                Ok(()) => {
                    if let Err(e) = self.read_loop().await {
                        debug!(target: "Client", "read loop ended: {e}");
                    }
                    self.cleanup_connection_state().await;
                }
            }

            if !self.enable_auto_reconnect.load(Ordering::Relaxed)
                || !self.is_running.load(Ordering::Relaxed)
            {
                break;
            }

            let reason = *self.last_disconnect.lock().await;
            let reconnect = reason.map(|r| r.should_reconnect()).unwrap_or(true);
            if !reconnect {
                info!(target: "Client", "disconnect reason {reason:?} is fatal, stopping");
                break;
            }

            // A restart-required close reconnects immediately with the same
            // credentials (post-pairing flow).
            if reason == Some(DisconnectReason::RestartRequired) {
                info!(target: "Client", "restart required, reconnecting immediately");
                continue;
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_reconnect_attempts {
                warn!(target: "Client", "max reconnect attempts ({}) reached", attempt - 1);
                self.emit(Event::ConnectionUpdate(ConnectionUpdate {
                    connection: Some(ConnectionState::Closed),
                    last_disconnect: reason,
                    ..Default::default()
                }));
                break;
            }

            let code = reason.map(|r| r.code()).unwrap_or(0);
            let delay = reconnect_delay(code, attempt);
            info!(target: "Client", "reconnecting in {delay:?} (attempt {attempt}, code {code})");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        self.is_running.store(false, Ordering::Relaxed);
        info!(target: "Client", "run loop finished");
    }

    /// One connection attempt: socket dial, Noise handshake, background
    /// tasks. A no-op error while already connecting or open.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        *self.last_disconnect.lock().await = None;
        self.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionState::Connecting),
            ..Default::default()
        }));

        let (frame_socket, mut frames_rx) = FrameSocket::new();
        timeout(self.config.connect_timeout, frame_socket.connect())
            .await
            .map_err(|_| ClientError::Timeout)??;

        let noise_socket = timeout(
            self.config.connect_timeout,
            handshake::do_handshake(&self.store, &self.config, &frame_socket, &mut frames_rx),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|e| ClientError::Socket(crate::socket::SocketError::NoiseHandshake(e.to_string())))?;

        *self.frame_socket.lock().await = Some(Arc::new(frame_socket));
        *self.noise_socket.lock().await = Some(Arc::new(noise_socket));
        *self.frames_rx.lock().await = Some(frames_rx);

        // Fresh offline lane per connection.
        let (offline_tx, offline_rx) = mpsc::unbounded_channel();
        *self.offline_tx.lock().await = Some(offline_tx);
        self.offline_pending.store(0, Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).offline_queue_loop(offline_rx));
        tokio::spawn(Arc::clone(self).keepalive_loop());
        Ok(())
    }

    /// Manual shutdown: disables reconnect, fails pending iq waiters, and
    /// closes the socket.
    pub async fn close(&self) {
        info!(target: "Client", "closing client");
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.enable_auto_reconnect.store(false, Ordering::Relaxed);
        self.is_running.store(false, Ordering::Relaxed);
        *self.last_disconnect.lock().await = Some(DisconnectReason::Manual);
        self.shutdown.notify_waiters();
        self.cancel_response_waiters().await;
        if let Some(fs) = self.frame_socket.lock().await.as_ref() {
            fs.close().await;
        }
        self.cleanup_connection_state().await;
        self.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionState::Closed),
            last_disconnect: Some(DisconnectReason::Manual),
            ..Default::default()
        }));
    }

    async fn cleanup_connection_state(&self) {
        self.is_logged_in.store(false, Ordering::Relaxed);
        *self.frame_socket.lock().await = None;
        *self.noise_socket.lock().await = None;
        *self.frames_rx.lock().await = None;
        *self.offline_tx.lock().await = None;
    }

    async fn read_loop(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut frames_rx = self
            .frames_rx
            .lock()
            .await
            .take()
            .ok_or(ClientError::NotConnected)?;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    debug!(target: "Client", "shutdown signalled, leaving read loop");
                    return Ok(());
                }
                frame = frames_rx.recv() => {
                    match frame {
                        Some(encrypted) => self.process_encrypted_frame(&encrypted).await,
                        None => {
                            if self.expected_disconnect.load(Ordering::Relaxed) {
                                debug!(target: "Client", "socket closed as expected");
                                return Ok(());
                            }
                            let mut last = self.last_disconnect.lock().await;
                            if last.is_none() {
                                *last = Some(DisconnectReason::Transient(1006));
                            }
                            drop(last);
                            self.emit(Event::ConnectionUpdate(ConnectionUpdate {
                                connection: Some(ConnectionState::Closed),
                                last_disconnect: *self.last_disconnect.lock().await,
                                ..Default::default()
                            }));
                            return Err(ClientError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    async fn process_encrypted_frame(self: &Arc<Self>, encrypted: &bytes::Bytes) {
        let noise_socket = match self.noise_socket.lock().await.clone() {
            Some(s) => s,
            None => {
                error!(target: "Client", "frame received while not connected");
                return;
            }
        };

        let decrypted = match noise_socket.decrypt_frame(encrypted) {
            Ok(p) => p,
            Err(e) => {
                // A MAC failure means the frame counters diverged; the
                // stream cannot recover.
                error!(target: "Client", "frame decrypt failed, forcing restart: {e}");
                *self.last_disconnect.lock().await = Some(DisconnectReason::Transient(1006));
                self.shutdown.notify_waiters();
                return;
            }
        };

        match binary::unmarshal_frame(&decrypted) {
            Ok(node) => self.route_stanza(node).await,
            Err(e) => warn!(target: "Client/Recv", "dropping malformed frame: {e}"),
        }
    }

    /// Offline-marked stanzas go through the FIFO lane; live stanzas wait
    /// for that lane to drain so replayed backlog never interleaves after
    /// fresh traffic.
    async fn route_stanza(self: &Arc<Self>, node: Node) {
        let ackable = matches!(node.tag.as_str(), "message" | "receipt" | "notification" | "call");
        let offline = node.attrs.get("offline").is_some();

        if ackable && offline {
            let tx = self.offline_tx.lock().await.clone();
            if let Some(tx) = tx {
                self.offline_pending.fetch_add(1, Ordering::SeqCst);
                if tx.send(node).is_err() {
                    self.offline_pending.fetch_sub(1, Ordering::SeqCst);
                }
                return;
            }
        }

        if ackable {
            self.wait_for_offline_queue().await;
        }
        self.dispatch_guarded(node, false).await;
    }

    /// Runs the stanza handler with panic isolation: a handler panic is
    /// reported and the connection survives.
    pub(crate) async fn dispatch_guarded(self: &Arc<Self>, node: Node, from_offline: bool) {
        use futures_util::FutureExt;
        let tag = node.tag.clone();
        let result = std::panic::AssertUnwindSafe(self.dispatch_stanza(node, from_offline))
            .catch_unwind()
            .await;
        if result.is_err() {
            self.report_unexpected(format!("handler for <{tag}> panicked"), "dispatch");
        }
    }

    pub(crate) async fn wait_for_offline_queue(&self) {
        loop {
            if self.offline_pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.offline_drained.notified();
            if self.offline_pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn offline_queue_loop(self: Arc<Self>, mut rx: UnboundedReceiver<Node>) {
        loop {
            tokio::select! {
                node = rx.recv() => {
                    let Some(node) = node else { break };
                    self.dispatch_guarded(node, true).await;
                    if self.offline_pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        self.offline_drained.notify_waiters();
                        let total = self.offline_preview_total.swap(0, Ordering::SeqCst);
                        if total > 0 {
                            self.emit(Event::OfflineSyncCompleted(
                                crate::types::events::OfflineSyncCompleted {
                                    count: total as i32,
                                },
                            ));
                        }
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    pub(crate) async fn dispatch_stanza(self: &Arc<Self>, node: Node, from_offline: bool) {
        debug!(target: "Client/Recv", "{node}");
        match node.tag.as_str() {
            "iq" => {
                if self.handle_iq_response(node.clone()).await {
                    return;
                }
                if pair::handle_pairing_iq(self, &node).await {
                    return;
                }
                if self.handle_ping(&node).await {
                    return;
                }
                debug!(target: "Client", "unhandled iq: {node}");
            }
            "success" => self.handle_success().await,
            "failure" => self.handle_connect_failure(&node).await,
            "stream:error" => self.handle_stream_error(&node).await,
            "xmlstreamend" => self.handle_stream_end().await,
            "message" => self.handle_message(node, from_offline).await,
            "receipt" => self.handle_receipt(&node).await,
            "notification" => self.handle_notification(&node).await,
            "call" => self.handle_call(&node).await,
            "ib" => self.handle_ib(&node).await,
            "ack" => debug!(target: "Client", "server ack: {node}"),
            _ => debug!(target: "Client", "unhandled stanza <{}>", node.tag),
        }
    }

    async fn handle_ping(&self, node: &Node) -> bool {
        if node.attrs.get("type").map(String::as_str) != Some("get")
            || node.get_optional_child("ping").is_none()
        {
            return false;
        }
        let mut parser = node.attrs();
        let from = parser.jid("from");
        let id = parser.string("id");
        let pong = NodeBuilder::new("iq")
            .attr("to", from.to_string())
            .attr("id", id)
            .attr("type", "result")
            .build();
        if let Err(e) = self.send_node(pong).await {
            warn!(target: "Client", "failed to answer ping: {e}");
        }
        true
    }

    async fn handle_success(self: &Arc<Self>) {
        info!(target: "Client", "authenticated with the server");
        self.is_logged_in.store(true, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionState::Open),
            received_pending_notifications: Some(false),
            ..Default::default()
        }));

        let client = Arc::clone(self);
        tokio::spawn(async move {
            // Leave passive mode so the server starts pushing stanzas.
            if let Err(e) = client.send_active_iq().await {
                client.report_unexpected(format!("passive/active iq failed: {e}"), "login");
            }
            if let Err(e) = client.refill_prekeys_if_needed().await {
                client.report_unexpected(format!("pre-key refill failed: {e}"), "prekeys");
            }
            if client.config.mark_online_on_connect {
                if let Err(e) = client.send_presence_available().await {
                    client.report_unexpected(format!("presence send failed: {e}"), "presence");
                }
            }
        });
    }

    async fn send_active_iq(&self) -> Result<(), ClientError> {
        use crate::binary::node::NodeContent;
        self.send_iq(crate::request::InfoQuery::set(
            "passive",
            Jid::server_jid(),
            Some(NodeContent::Nodes(vec![NodeBuilder::new("active").build()])),
        ))
        .await?;
        Ok(())
    }

    pub(crate) async fn send_presence_available(&self) -> Result<(), ClientError> {
        let push_name = self.store.creds().await.push_name;
        let mut builder = NodeBuilder::new("presence").attr("type", "available");
        if !push_name.is_empty() {
            builder = builder.attr("name", push_name);
        }
        self.send_node(builder.build()).await
    }

    async fn handle_stream_end(&self) {
        info!(target: "Client", "server ended the stream, logging out");
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.enable_auto_reconnect.store(false, Ordering::Relaxed);
        *self.last_disconnect.lock().await = Some(DisconnectReason::LoggedOut);
        self.emit(Event::LoggedOut(LoggedOut {
            on_connect: false,
            code: 401,
        }));
        self.maybe_request_auth_clear(401, "stream ended by server").await;
        self.shutdown.notify_waiters();
    }

    async fn handle_stream_error(&self, node: &Node) {
        self.is_logged_in.store(false, Ordering::Relaxed);
        self.expected_disconnect.store(true, Ordering::Relaxed);

        let mut attrs = node.attrs();
        let code: u16 = attrs
            .optional_string("code")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let conflict_type = node
            .get_optional_child("conflict")
            .and_then(|n| n.attrs.get("type").cloned())
            .unwrap_or_default();

        let reason = match (code, conflict_type.as_str()) {
            (515, _) => {
                info!(target: "Client", "stream error 515, restart required");
                self.expected_disconnect.store(false, Ordering::Relaxed);
                DisconnectReason::RestartRequired
            }
            (401, "device_removed") => {
                info!(target: "Client", "device removed, logging out");
                self.enable_auto_reconnect.store(false, Ordering::Relaxed);
                self.emit(Event::LoggedOut(LoggedOut {
                    on_connect: false,
                    code: 401,
                }));
                self.maybe_request_auth_clear(401, "device removed").await;
                DisconnectReason::LoggedOut
            }
            (_, "replaced") => {
                info!(target: "Client", "stream replaced by another client");
                self.enable_auto_reconnect.store(false, Ordering::Relaxed);
                self.emit(Event::StreamReplaced);
                DisconnectReason::StreamReplaced
            }
            _ => {
                let classified = classify_disconnect(code);
                match classified {
                    DisconnectReason::AuthFailure(c) => {
                        self.enable_auto_reconnect.store(false, Ordering::Relaxed);
                        self.maybe_request_auth_clear(c, "stream error").await;
                    }
                    _ => {
                        self.expected_disconnect.store(false, Ordering::Relaxed);
                    }
                }
                classified
            }
        };

        *self.last_disconnect.lock().await = Some(reason);
        self.shutdown.notify_waiters();
    }

    async fn handle_connect_failure(&self, node: &Node) {
        self.expected_disconnect.store(true, Ordering::Relaxed);
        let mut attrs = node.attrs();
        let code = attrs.optional_u64("reason").unwrap_or(0) as u16;

        let reason = classify_disconnect(code);
        match reason {
            DisconnectReason::AuthFailure(c) => {
                self.enable_auto_reconnect.store(false, Ordering::Relaxed);
                if c == 401 || c == 403 {
                    self.emit(Event::LoggedOut(LoggedOut {
                        on_connect: true,
                        code: c,
                    }));
                }
                self.maybe_request_auth_clear(c, "connect failure").await;
            }
            DisconnectReason::Transient(_) => {
                self.expected_disconnect.store(false, Ordering::Relaxed);
            }
            _ => {}
        }

        if code == 402 {
            let expire_secs = attrs.optional_u64("expire").unwrap_or(0);
            let ban_code = attrs.optional_u64("code").unwrap_or(0) as i32;
            warn!(target: "Client", "temporarily banned: code {ban_code}, {expire_secs}s");
            self.emit(Event::TemporaryBan(TemporaryBan {
                code: ban_code,
                expire_secs,
            }));
            self.enable_auto_reconnect.store(false, Ordering::Relaxed);
        }

        *self.last_disconnect.lock().await = Some(reason);
        self.shutdown.notify_waiters();
    }

    async fn maybe_request_auth_clear(&self, code: u16, reason: &str) {
        if !self.config.clear_auth_on_error {
            return;
        }
        self.emit(Event::AuthClearRequired(AuthClearRequired {
            code,
            reason: reason.to_string(),
        }));
    }

    pub async fn send_node(&self, node: Node) -> Result<(), ClientError> {
        let noise_socket = self
            .noise_socket
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        let frame_socket = self
            .frame_socket
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;

        debug!(target: "Client/Send", "{node}");
        let payload = binary::marshal(&node)?;
        let encrypted = noise_socket.encrypt_frame(&payload)?;
        frame_socket.send_frame(&encrypted).await?;
        Ok(())
    }

    /// Acks an inbound stanza; exactly once per stanza, after processing.
    pub(crate) async fn send_ack(&self, node: &Node, error_code: Option<u16>) {
        let mut attrs = node.attrs();
        let id = attrs.string("id");
        let from = attrs.jid("from");
        let participant = attrs.optional_string("participant").map(str::to_string);
        let message_type = attrs.optional_string("type").map(str::to_string);

        let mut builder = NodeBuilder::new("ack")
            .attr("class", node.tag.clone())
            .attr("id", id)
            .attr("to", from.to_string());
        if let Some(p) = participant {
            builder = builder.attr("participant", p);
        }
        if node.tag == "message" {
            if let Some(t) = message_type {
                builder = builder.attr("type", t);
            }
        }
        if let Some(code) = error_code {
            builder = builder.attr("error", code.to_string());
        }

        if let Err(e) = self.send_node(builder.build()).await {
            debug!(target: "Client", "ack send failed: {e}");
        }
    }

    async fn handle_ib(&self, node: &Node) {
        if let Some(offline) = node.get_optional_child("offline") {
            let count = offline.attrs().optional_u64("count").unwrap_or(0) as usize;
            self.offline_preview_total.store(count, Ordering::SeqCst);
            self.emit(Event::OfflineSyncPreview(
                crate::types::events::OfflineSyncPreview {
                    total: count as i32,
                    messages: 0,
                    notifications: 0,
                    receipts: 0,
                },
            ));
        }
        if node.get_optional_child("dirty").is_some() {
            debug!(target: "Client", "server marked state dirty: {node}");
            self.emit(Event::Notification(node.clone()));
        }
    }

    async fn handle_call(self: &Arc<Self>, node: &Node) {
        let _processing = self.processing_mutex.lock().await;
        self.event_bus.buffer();

        let mut attrs = node.attrs();
        let from = attrs.jid("from");
        let timestamp = attrs.unix_time("t");

        for child in node.children().unwrap_or_default() {
            let kind = match child.tag.as_str() {
                "offer" => crate::types::events::CallEventKind::Offer,
                "accept" => crate::types::events::CallEventKind::Accept,
                "reject" => crate::types::events::CallEventKind::Reject,
                "terminate" => crate::types::events::CallEventKind::Terminate,
                "relaylatency" | "relay" => crate::types::events::CallEventKind::Relay,
                "timeout" => crate::types::events::CallEventKind::Timeout,
                _ => continue,
            };
            let mut child_attrs = child.attrs();
            let call_id = child_attrs
                .optional_string("call-id")
                .unwrap_or_default()
                .to_string();

            let snapshot = if kind == crate::types::events::CallEventKind::Offer {
                let snapshot = CallSnapshot {
                    is_video: child.get_optional_child("video").is_some(),
                    is_group: child.get_optional_child("group").is_some(),
                };
                self.call_offer_cache
                    .insert(call_id.clone(), snapshot.clone())
                    .await;
                snapshot
            } else {
                // Later events inherit the offer's context.
                self.call_offer_cache
                    .get(&call_id)
                    .await
                    .unwrap_or(CallSnapshot {
                        is_video: false,
                        is_group: false,
                    })
            };

            self.emit(Event::Call(crate::types::events::CallEvent {
                kind,
                call_id,
                from: from.clone(),
                timestamp,
                is_video: snapshot.is_video,
                is_group: snapshot.is_group,
            }));
        }

        self.send_ack(node, None).await;
        self.event_bus.flush();
    }

    async fn handle_notification(self: &Arc<Self>, node: &Node) {
        let _processing = self.processing_mutex.lock().await;
        self.event_bus.buffer();

        let mut attrs = node.attrs();
        let notification_type = attrs.optional_string("type").unwrap_or_default().to_string();
        let from = attrs.jid("from");

        match notification_type.as_str() {
            "encrypt" => {
                // Server signals our pre-key stock ran low.
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = client.refill_prekeys_if_needed().await {
                        client.report_unexpected(format!("pre-key refill failed: {e}"), "prekeys");
                    }
                });
            }
            "link_code_companion_reg" => {
                let client = Arc::clone(self);
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.handle_code_pair_notification(&node).await {
                        client.report_unexpected(format!("pairing-code step failed: {e}"), "pair-code");
                    }
                });
            }
            "w:gp2" => {
                if let Some(update) = parse_group_notification(&from, node) {
                    self.emit(Event::GroupParticipantsUpdate(update));
                } else {
                    self.emit(Event::Notification(node.clone()));
                }
            }
            _ => self.emit(Event::Notification(node.clone())),
        }

        self.send_ack(node, None).await;
        self.event_bus.flush();
    }

    pub(crate) async fn keepalive_loop(self: Arc<Self>) {
        crate::keepalive::keepalive_loop(self).await;
    }
}

fn parse_group_notification(
    from: &Jid,
    node: &Node,
) -> Option<crate::types::events::GroupParticipantsUpdate> {
    use crate::types::events::{GroupParticipantsUpdate, ParticipantAction};
    for child in node.children().unwrap_or_default() {
        let action = match child.tag.as_str() {
            "add" => ParticipantAction::Add,
            "remove" => ParticipantAction::Remove,
            "promote" => ParticipantAction::Promote,
            "demote" => ParticipantAction::Demote,
            _ => continue,
        };
        let participants = child
            .get_children_by_tag("participant")
            .iter()
            .filter_map(|p| p.attrs().optional_jid("jid"))
            .collect();
        return Some(GroupParticipantsUpdate {
            jid: from.clone(),
            action,
            participants,
        });
    }
    None
}

/// Maps a transport close code to its disconnect class.
pub fn classify_disconnect(code: u16) -> DisconnectReason {
    match code {
        401 | 403 | 419 | 428 => DisconnectReason::AuthFailure(code),
        515 => DisconnectReason::RestartRequired,
        440 => DisconnectReason::StreamReplaced,
        _ => DisconnectReason::Transient(code),
    }
}

/// Backoff before reconnect attempt `attempt` (1-based) after a close with
/// `code`. Base schedule {2, 4, 8, 16, 30}s, scaled per code.
pub fn reconnect_delay(code: u16, attempt: u32) -> Duration {
    const BASE_SECS: [f64; 5] = [2.0, 4.0, 8.0, 16.0, 30.0];
    let base = BASE_SECS[(attempt.saturating_sub(1) as usize).min(BASE_SECS.len() - 1)];
    let (multiplier, floor) = match code {
        503 => (2.0, 0.0),
        429 => (3.0, 0.0),
        408 => (0.5, 1.0),
        428 | 401 | 403 => (1.5, 3.0),
        405 => (0.8, 2.0),
        1006 => (1.2, 0.0),
        _ => (1.0, 0.0),
    };
    Duration::from_secs_f64((base * multiplier).max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::node::NodeBuilder;
    use crate::store::memory::MemoryStore;
    use crate::store::{AuthCreds, DeviceStore};

    fn test_client() -> Arc<Client> {
        let store = DeviceStore::new(AuthCreds::init(), Arc::new(MemoryStore::new()));
        Client::new(SocketConfig::default(), store)
    }

    fn receipt_node(id: &str, offline: bool) -> Node {
        let mut builder = NodeBuilder::new("receipt")
            .attr("from", "15550001111@s.whatsapp.net")
            .attr("id", id)
            .attr("t", "1700000000");
        if offline {
            builder = builder.attr("offline", "1");
        }
        builder.build()
    }

    #[tokio::test]
    async fn offline_backlog_never_interleaves_with_live_traffic() {
        let client = test_client();

        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observed2 = observed.clone();
        client.event_bus.add_handler(Arc::new(move |event: &Event| {
            if let Event::MessageReceiptUpdate(update) = event {
                observed2
                    .lock()
                    .unwrap()
                    .push(update.message_ids[0].clone());
            }
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        *client.offline_tx.lock().await = Some(tx);
        tokio::spawn(Arc::clone(&client).offline_queue_loop(rx));

        for i in 1..=4 {
            client.route_stanza(receipt_node(&format!("o{i}"), true)).await;
        }
        for i in 1..=3 {
            client.route_stanza(receipt_node(&format!("l{i}"), false)).await;
        }

        let order = observed.lock().unwrap().clone();
        assert_eq!(order, vec!["o1", "o2", "o3", "o4", "l1", "l2", "l3"]);
    }

    #[tokio::test]
    async fn offline_completion_event_fires_after_drain() {
        let client = test_client();
        let completed = Arc::new(std::sync::Mutex::new(None));
        let completed2 = completed.clone();
        client.event_bus.add_handler(Arc::new(move |event: &Event| {
            if let Event::OfflineSyncCompleted(c) = event {
                *completed2.lock().unwrap() = Some(c.count);
            }
        }));

        client.offline_preview_total.store(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *client.offline_tx.lock().await = Some(tx);
        tokio::spawn(Arc::clone(&client).offline_queue_loop(rx));

        client.route_stanza(receipt_node("o1", true)).await;
        client.route_stanza(receipt_node("o2", true)).await;
        client.wait_for_offline_queue().await;

        // The worker emits completion as the last queued item finishes.
        tokio::task::yield_now().await;
        assert_eq!(*completed.lock().unwrap(), Some(2));
    }

    #[test]
    fn reconnect_delay_matrix() {
        // 503 doubles the base schedule.
        assert_eq!(reconnect_delay(503, 2), Duration::from_secs(8));
        assert_eq!(reconnect_delay(503, 1), Duration::from_secs(4));
        // 408 halves it, floored at one second.
        assert_eq!(reconnect_delay(408, 1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(408, 3), Duration::from_secs(4));
        // 429 triples.
        assert_eq!(reconnect_delay(429, 1), Duration::from_secs(6));
        // Auth-ish codes get 1.5x with a 3s floor.
        assert_eq!(reconnect_delay(401, 1), Duration::from_secs(3));
        assert_eq!(reconnect_delay(428, 2), Duration::from_secs(6));
        // 405 is 0.8x with a 2s floor.
        assert_eq!(reconnect_delay(405, 1), Duration::from_secs(2));
        // 1006 is 1.2x.
        assert_eq!(reconnect_delay(1006, 1), Duration::from_secs_f64(2.4));
        // Unknown codes use the base schedule, capped at the last slot.
        assert_eq!(reconnect_delay(0, 5), Duration::from_secs(30));
        assert_eq!(reconnect_delay(0, 99), Duration::from_secs(30));
    }

    #[test]
    fn disconnect_classification() {
        assert_eq!(classify_disconnect(401), DisconnectReason::AuthFailure(401));
        assert_eq!(classify_disconnect(403), DisconnectReason::AuthFailure(403));
        assert_eq!(classify_disconnect(419), DisconnectReason::AuthFailure(419));
        assert_eq!(classify_disconnect(428), DisconnectReason::AuthFailure(428));
        assert_eq!(classify_disconnect(515), DisconnectReason::RestartRequired);
        assert_eq!(classify_disconnect(503), DisconnectReason::Transient(503));
        assert_eq!(classify_disconnect(1006), DisconnectReason::Transient(1006));
        assert!(!classify_disconnect(401).should_reconnect());
        assert!(classify_disconnect(503).should_reconnect());
        assert!(classify_disconnect(515).should_reconnect());
    }

    #[test]
    fn logged_out_never_reconnects() {
        assert!(!DisconnectReason::LoggedOut.should_reconnect());
        assert!(!DisconnectReason::Manual.should_reconnect());
        assert!(!DisconnectReason::StreamReplaced.should_reconnect());
    }
}
