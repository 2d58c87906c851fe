//! The connection supervisor: owns the WebSocket, routes inbound frames
//! between the liveness sentinel and the frame codec, drives the handshake,
//! and keeps the session alive across unexpected disconnects.

use log::{debug, error, info, trace, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::sleep;

use crate::framing::{self, CodecError, FramePayload, SessionCipher};
use crate::handshake::AuthError;
use crate::request::{Registry, WaitError};
use crate::socket::consts::{DEFAULT_CONNECT_TIMEOUT, RECONNECT_TIMEOUT};
use crate::socket::{FrameSocket, SocketError};
use crate::store::AuthInfo;
use crate::types::events::{Event, EventHandler};
use crate::types::{Chat, Contact, SessionPhase, UserMetaData};

/// Decodes the binary payloads carried inside encrypted frames.
///
/// The wire decoder lives outside this crate; decoded payloads use the
/// `[name, attrs_map, children]` value shape the registry dispatches on.
pub trait BinaryDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> anyhow::Result<Value>;
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is not connected")]
    NotConnected,
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("transport closed: {0}")]
    TransportClosed(String),
}

/// Everything `connect` returns once the initial server sync lands.
#[derive(Debug)]
pub struct SessionData {
    pub user: UserMetaData,
    pub chats: Vec<Chat>,
    pub contacts: Vec<Contact>,
    pub unread_messages: Vec<Value>,
}

pub(crate) struct WrappedHandler {
    pub(crate) id: usize,
    handler: EventHandler,
}

pub struct Client {
    // Handle to ourselves for the tasks we spawn.
    weak_self: Weak<Client>,

    pub(crate) auth: Mutex<AuthInfo>,
    pub(crate) decoder: Arc<dyn BinaryDecoder>,

    // Correlation state
    pub(crate) registry: Mutex<Registry>,
    pub(crate) tag_counter: AtomicU64,

    // Socket and cipher slots; both are None while disconnected
    pub(crate) socket: Mutex<Option<FrameSocket>>,
    cipher: Mutex<Option<SessionCipher>>,

    // Phase and liveness
    phase: Mutex<SessionPhase>,
    pub(crate) last_seen: Mutex<Instant>,
    is_connecting: AtomicBool,
    expected_disconnect: AtomicBool,
    disconnect_reason: Mutex<Option<String>>,
    pub(crate) shutdown_tx: watch::Sender<bool>,

    // Reconnection
    pub enable_auto_reconnect: AtomicBool,
    auto_reconnect_errors: AtomicU32,

    // Event handling
    event_handlers: RwLock<Vec<WrappedHandler>>,
    next_handler_id: AtomicUsize,
}

impl Client {
    /// Builds a client over existing credentials, or fresh ones when the
    /// host has nothing persisted yet.
    pub fn new(auth: Option<AuthInfo>, decoder: Arc<dyn BinaryDecoder>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            auth: Mutex::new(auth.unwrap_or_default()),
            decoder,
            registry: Mutex::new(Registry::default()),
            tag_counter: AtomicU64::new(0),
            socket: Mutex::new(None),
            cipher: Mutex::new(None),
            phase: Mutex::new(SessionPhase::Disconnected),
            last_seen: Mutex::new(Instant::now()),
            is_connecting: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            disconnect_reason: Mutex::new(None),
            shutdown_tx,
            enable_auto_reconnect: AtomicBool::new(true),
            auto_reconnect_errors: AtomicU32::new(0),
            event_handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicUsize::new(1),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("a live &self implies a live Arc")
    }

    /// Establishes the session and performs the initial data load.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<SessionData, ClientError> {
        let user = self.connect_slim(timeout).await?;

        // The load phase is cancellable too; a dropped connect still closes
        // the socket and drains the registry.
        let cancel_guard = scopeguard::guard(self.arc(), |client| {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { client.teardown().await });
            }
        });
        let outcome = self.receive_chats_and_contacts().await;
        let _ = scopeguard::ScopeGuard::into_inner(cancel_guard);

        match outcome {
            Ok((chats, contacts, unread_messages)) => Ok(SessionData {
                user,
                chats,
                contacts,
                unread_messages,
            }),
            Err(e) => {
                warn!(target: "Client", "Initial data load failed: {e}");
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Establishes the session without waiting for the initial data load.
    pub async fn connect_slim(&self, timeout: Option<Duration>) -> Result<UserMetaData, ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }
        let _connecting = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        // A caller dropping or aborting this future mid-handshake must still
        // close the socket and fail every pending await with Cancelled; an
        // Err return never runs on a dropped future, so the cleanup hangs
        // off a drop guard, disarmed once the attempt finishes on its own.
        let cancel_guard = scopeguard::guard(self.arc(), |client| {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { client.teardown().await });
            }
        });
        let result = self.do_connect_slim(timeout).await;
        let _ = scopeguard::ScopeGuard::into_inner(cancel_guard);

        match result {
            Ok(user) => Ok(user),
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn do_connect_slim(&self, timeout: Option<Duration>) -> Result<UserMetaData, ClientError> {
        self.expected_disconnect.store(false, Ordering::Relaxed);
        self.shutdown_tx.send_replace(false);
        *self.disconnect_reason.lock().await = None;
        self.set_phase(SessionPhase::Opening).await;

        let (socket, frames_rx) = FrameSocket::new();
        socket.connect().await?;
        *self.socket.lock().await = Some(socket);

        // On the restore path the stored keys cover frames from the start;
        // a fresh session gets its cipher after validation.
        self.install_cipher_from_auth().await;
        *self.last_seen.lock().await = Instant::now();
        self.spawn_read_pump(frames_rx);

        let budget = timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let user = match tokio::time::timeout(budget, self.authenticate()).await {
            Ok(result) => result?,
            Err(_) => return Err(AuthError::Timeout.into()),
        };

        self.install_cipher_from_auth().await;
        self.set_phase(SessionPhase::Live {
            since: chrono::Utc::now(),
        })
        .await;
        self.auto_reconnect_errors.store(0, Ordering::Relaxed);
        tokio::spawn(self.arc().keepalive_loop());
        self.dispatch_event(&Event::Connected(user.clone())).await;
        Ok(user)
    }

    /// Connects and keeps the session alive until `disconnect()` is called.
    /// Reconnection on unexpected closes happens in the background either way.
    pub async fn run(&self) -> Result<(), ClientError> {
        self.connect(None).await?;
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }
            if shutdown.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Closes the session on purpose; no reconnect follows.
    pub async fn disconnect(&self) {
        info!(target: "Client", "Disconnecting client intentionally.");
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.shutdown_tx.send_replace(true);
        if let Some(socket) = self.socket.lock().await.take() {
            socket.close().await;
        }
        self.cleanup_connection_state().await;
        self.set_phase(SessionPhase::Disconnected).await;
    }

    /// Tells the server goodbye, clears the restorable credentials and
    /// closes the socket. The client id survives for the next pairing.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let goodbye = serde_json::json!(["admin", "Conn", "disconnect"]);
        if let Err(e) = self.send_json_frame("goodbye,", &goodbye).await {
            debug!(target: "Client", "Goodbye frame failed: {e}");
        }
        self.auth.lock().await.reset();
        self.disconnect().await;
        self.dispatch_event(&Event::LoggedOut).await;
        Ok(())
    }

    /// Failure and cancellation path: close the socket, fail every pending
    /// wait with `Cancelled`, and surface nothing to the reconnect
    /// machinery. Safe to run more than once.
    pub(crate) async fn teardown(&self) {
        self.expected_disconnect.store(true, Ordering::Relaxed);
        if let Some(socket) = self.socket.lock().await.take() {
            socket.close().await;
        }
        self.cleanup_connection_state().await;
        self.set_phase(SessionPhase::Disconnected).await;
    }

    async fn cleanup_connection_state(&self) {
        *self.socket.lock().await = None;
        *self.cipher.lock().await = None;
        self.drain_waiters().await;
    }

    async fn install_cipher_from_auth(&self) {
        let auth = self.auth.lock().await;
        if let (Some(enc_key), Some(mac_key)) = (auth.enc_key, auth.mac_key) {
            *self.cipher.lock().await = Some(SessionCipher::new(enc_key, mac_key));
        }
    }

    fn spawn_read_pump(&self, mut frames_rx: mpsc::Receiver<bytes::Bytes>) {
        let client = self.arc();
        tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                client.process_frame(&frame).await;
            }
            client.handle_socket_closed().await;
        });
    }

    /// Routes one inbound frame: heartbeat, encrypted envelope, or
    /// plaintext JSON, in that order of checks.
    pub(crate) async fn process_frame(&self, frame: &[u8]) {
        if let Some(ts) = parse_heartbeat(frame) {
            trace!(target: "Client/Recv", "Server heartbeat at {ts}");
            *self.last_seen.lock().await = Instant::now();
            return;
        }

        let cipher_guard = self.cipher.lock().await;
        let opened = match cipher_guard.as_ref() {
            Some(cipher) => cipher.decrypt_frame(frame),
            // No keys yet; pre-validation traffic is plaintext JSON.
            None => framing::decode_plain(frame).map(|(tag, value)| (tag, FramePayload::Json(value))),
        };
        drop(cipher_guard);

        match opened {
            Ok((tag, FramePayload::Json(value))) => self.dispatch(&tag, value).await,
            Ok((tag, FramePayload::Binary(plaintext))) => {
                match self.decoder.decode(&plaintext) {
                    Ok(value) => self.dispatch(&tag, value).await,
                    Err(e) => warn!(target: "Client/Recv", "Dropping undecodable frame {tag}: {e}"),
                }
            }
            // Opaque or versioned-past-us frames; the session survives.
            Err(e) => warn!(target: "Client/Recv", "Dropping frame that failed to open: {e}"),
        }
    }

    async fn handle_socket_closed(&self) {
        let reason = self
            .disconnect_reason
            .lock()
            .await
            .take()
            .unwrap_or_else(|| "closed".to_string());
        self.cleanup_connection_state().await;

        if self.expected_disconnect.load(Ordering::Relaxed) {
            info!(target: "Client", "Socket closed as expected.");
            self.set_phase(SessionPhase::Disconnected).await;
            return;
        }

        warn!(target: "Client", "Unexpected disconnect: {reason}");
        self.dispatch_event(&Event::Disconnected { reason }).await;
        if self.enable_auto_reconnect.load(Ordering::Relaxed) {
            self.arc().spawn_reconnect_loop();
        } else {
            self.set_phase(SessionPhase::Disconnected).await;
        }
    }

    /// Keep-alive found the connection dead: record the cause and close the
    /// socket; the read pump winding down does the rest.
    pub(crate) async fn handle_lost_connection(&self) {
        *self.disconnect_reason.lock().await = Some("lost connection".to_string());
        if let Some(socket) = self.socket.lock().await.take() {
            socket.close().await;
        }
    }

    /// Indefinite retries with capped exponential backoff; stops when a
    /// connect succeeds, reconnection is disabled, or `disconnect()` runs.
    fn spawn_reconnect_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut attempt = 0u32;
            loop {
                // Failed attempts leave expected_disconnect set via teardown,
                // so only the shutdown watch and the enable flag end the loop.
                if !self.enable_auto_reconnect.load(Ordering::Relaxed)
                    || *shutdown.borrow_and_update()
                {
                    self.set_phase(SessionPhase::Disconnected).await;
                    return;
                }
                attempt += 1;
                let error_count = self.auto_reconnect_errors.fetch_add(1, Ordering::SeqCst);
                let delay = Duration::from_secs(u64::from(error_count * 2).min(30));
                self.set_phase(SessionPhase::Reconnecting { attempt }).await;
                self.dispatch_event(&Event::Reconnecting { attempt }).await;
                info!(target: "Client", "Will attempt to reconnect in {delay:?} (attempt {attempt})");

                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow_and_update() {
                            self.set_phase(SessionPhase::Disconnected).await;
                            return;
                        }
                        continue;
                    }
                }

                match self.connect(Some(RECONNECT_TIMEOUT)).await {
                    Ok(data) => {
                        info!(target: "Client", "Reconnected as {}", data.user.id);
                        self.dispatch_event(&Event::Reconnected(data.user)).await;
                        return;
                    }
                    Err(e) => {
                        error!(target: "Client", "Reconnect attempt {attempt} failed: {e}");
                    }
                }
            }
        });
    }

    /// Sends a plaintext JSON-array frame under `tag`.
    pub(crate) async fn send_json_frame(
        &self,
        tag: &str,
        payload: &Value,
    ) -> Result<(), SocketError> {
        let frame = format!("{tag},{payload}");
        debug!(target: "Client/Send", "{frame}");
        let socket_guard = self.socket.lock().await;
        let socket = socket_guard.as_ref().ok_or(SocketError::SocketClosed)?;
        socket.send_text(frame).await
    }

    /// Encrypts and sends a binary payload under `tag`. Requires a live
    /// session (the keys exist only after validation).
    pub async fn send_binary_frame(&self, tag: &str, payload: &[u8]) -> Result<(), ClientError> {
        let frame = {
            let cipher_guard = self.cipher.lock().await;
            let cipher = cipher_guard.as_ref().ok_or(ClientError::NotConnected)?;
            cipher.encrypt_frame(tag, payload)?
        };
        let socket_guard = self.socket.lock().await;
        let socket = socket_guard.as_ref().ok_or(ClientError::NotConnected)?;
        socket.send_binary(frame).await.map_err(Into::into)
    }

    pub fn is_connected(&self) -> bool {
        self.socket
            .try_lock()
            .map_or(false, |guard| guard.is_some())
    }

    pub async fn phase(&self) -> SessionPhase {
        self.phase.lock().await.clone()
    }

    pub(crate) async fn set_phase(&self, phase: SessionPhase) {
        let mut current = self.phase.lock().await;
        debug!(target: "Client", "Session phase: {:?} -> {:?}", *current, phase);
        *current = phase;
    }

    /// Snapshot of the credentials, e.g. for persisting after validation.
    pub async fn auth_info(&self) -> AuthInfo {
        self.auth.lock().await.clone()
    }

    pub async fn add_event_handler(&self, handler: EventHandler) -> usize {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.event_handlers
            .write()
            .await
            .push(WrappedHandler { id, handler });
        id
    }

    pub async fn remove_event_handler(&self, id: usize) -> bool {
        let mut handlers = self.event_handlers.write().await;
        let initial_len = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() < initial_len
    }

    pub(crate) async fn dispatch_event(&self, event: &Event) {
        let handlers = self.event_handlers.read().await;
        for wrapped in handlers.iter() {
            (wrapped.handler)(event);
        }
    }
}

/// `!<unix-ms-digits>`: the server's reply to a keep-alive probe.
fn parse_heartbeat(frame: &[u8]) -> Option<i64> {
    let digits = frame.strip_prefix(b"!")?;
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
