//! High-level client facade over the two loops.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dispatch::{dispatch_loop, DispatchCommand, DispatchContext};
use crate::events::EventHub;
use crate::identity::{ClientId, Credentials};
use crate::state::{SessionStatus, Shared};
use crate::stats::{NullStats, WireStats};
use crate::transport::{TcpDealerSocket, TransportError, WireSocket};
use crate::wire::{wire_loop, Outbound};

pub const MIN_HEARTBEAT_MS: u64 = 1_000;
pub const MAX_HEARTBEAT_MS: u64 = 600_000;
pub const DEFAULT_HEARTBEAT_MS: u64 = 30_000;

const QUEUE_DEPTH: usize = 128;

/// Errors surfaced synchronously from the public API. Asynchronous failures
/// (wire errors, protocol rejections, host silence) never throw; they reach
/// the caller through events and the readiness observables.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client has been disposed")]
    Disposed,
    #[error("frames must contain at least one frame")]
    InvalidArgument,
    #[error("session is not ready to send")]
    NotReady,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Construction parameters for [`WireClient`].
#[derive(Clone)]
pub struct ClientOptions {
    connection: String,
    credentials: Option<Credentials>,
    heartbeat_ms: u64,
    stats: Option<Arc<dyn WireStats>>,
}

impl ClientOptions {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            credentials: None,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            stats: None,
        }
    }

    /// Supplying both the identity-name and identity-secret selects secured
    /// mode: the handshake must complete before application sends pass.
    pub fn with_credentials(
        mut self,
        identity: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials::new(identity, secret));
        self
    }

    /// Heartbeat period in milliseconds, clamped to [1s, 10min].
    pub fn with_heartbeat_ms(mut self, heartbeat_ms: u64) -> Self {
        self.heartbeat_ms = heartbeat_ms.clamp(MIN_HEARTBEAT_MS, MAX_HEARTBEAT_MS);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn WireStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn heartbeat_ms(&self) -> u64 {
        self.heartbeat_ms
    }

    fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("connection", &self.connection)
            .field("secured", &self.credentials.is_some())
            .field("heartbeat_ms", &self.heartbeat_ms)
            .finish()
    }
}

/// One point-to-point session with a remote peer.
///
/// # Guarantees
/// * Wire I/O and user callbacks run on two separate loops; a slow event
///   handler never stalls the socket.
/// * `send` refuses frames until the session is usable: secured mode gates
///   on handshake completion, and a host declared dead latches the gate
///   shut for the lifetime of the client.
/// * Frames are transmitted in enqueue order and delivered in receive
///   order; every delivered message is tagged with this client's id.
/// * Disposal is idempotent, callable from any thread, and also runs on
///   drop.
pub struct WireClient {
    client_id: ClientId,
    secured: bool,
    shared: Arc<Shared>,
    events: Arc<EventHub>,
    outbound: mpsc::Sender<Outbound>,
    commands: mpsc::Sender<DispatchCommand>,
    status: watch::Receiver<SessionStatus>,
    wire_handle: JoinHandle<()>,
    dispatch_handle: JoinHandle<()>,
}

impl WireClient {
    /// Opens the dealer socket named by the options' connection string,
    /// attaches a freshly minted identity, and starts both loops.
    ///
    /// # Errors
    /// Returns `ClientError::Transport` when the connection string is
    /// malformed or the socket cannot connect.
    pub async fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        let client_id = ClientId::mint();
        let socket = TcpDealerSocket::connect(&options.connection, client_id).await?;
        Ok(Self::start(socket, options, client_id))
    }

    /// Starts a client over an already-open socket. Integration tests use
    /// this with the in-memory pair socket to script the peer side.
    pub fn with_socket<S>(socket: S, options: ClientOptions) -> Self
    where
        S: WireSocket + 'static,
    {
        Self::start(socket, options, ClientId::mint())
    }

    fn start<S>(socket: S, options: ClientOptions, client_id: ClientId) -> Self
    where
        S: WireSocket + 'static,
    {
        let secured = options.credentials.is_some();
        let heartbeat = options.heartbeat();
        let shared = Arc::new(Shared::new(secured));
        let events = Arc::new(EventHub::new());
        let stats: Arc<dyn WireStats> = options.stats.unwrap_or_else(|| Arc::new(NullStats));

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);

        let wire_handle = tokio::spawn(wire_loop(
            socket,
            outbound_rx,
            inbound_tx,
            shared.clone(),
            stats.clone(),
        ));
        let ctx = DispatchContext {
            client_id,
            credentials: options.credentials,
            heartbeat,
            shared: shared.clone(),
            events: events.clone(),
            outbound: outbound_tx.clone(),
            status: status_tx,
            stats,
        };
        let dispatch_handle = tokio::spawn(dispatch_loop(ctx, inbound_rx, command_rx));

        debug!(
            target: "framewire::client",
            client_id = %client_id,
            secured,
            "client started"
        );
        Self {
            client_id,
            secured,
            shared,
            events,
            outbound: outbound_tx,
            commands: command_tx,
            status: status_rx,
            wire_handle,
            dispatch_handle,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// False while `send` would fail with `NotReady`.
    pub fn can_send(&self) -> bool {
        !self.shared.throw_on_send()
    }

    /// Flips to false permanently once heartbeat liveness fails.
    pub fn is_host_alive(&self) -> bool {
        !self.shared.host_dead()
    }

    /// Subscription points for the four event kinds.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Drives the mutual-authentication handshake.
    ///
    /// # Behavior
    /// * Plaintext mode returns false immediately; there is nothing to
    ///   secure.
    /// * An already-established session returns true without touching it.
    /// * Otherwise a fresh handshake starts. Non-blocking calls return
    ///   false right away; blocking calls wait up to `timeout` for the
    ///   session to become usable.
    /// * A timeout does not cancel the exchange: a late server step can
    ///   still establish the session and fire `protocol-established`, which
    ///   callers should treat as authoritative.
    pub async fn secure_connection(&self, blocking: bool, timeout: Duration) -> bool {
        if !self.secured || self.shared.disposed() {
            return false;
        }
        let mut status = self.status.clone();
        if *status.borrow() == SessionStatus::Established {
            return true;
        }
        if self
            .commands
            .send(DispatchCommand::BeginHandshake)
            .await
            .is_err()
        {
            return false;
        }
        if !blocking {
            return false;
        }
        let established = async {
            loop {
                if *status.borrow_and_update() == SessionStatus::Established {
                    return true;
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, established)
            .await
            .unwrap_or(false)
    }

    /// Enqueues application frames for transmission.
    ///
    /// # Errors
    /// * `Disposed` after the client has been released.
    /// * `InvalidArgument` for an empty frames batch.
    /// * `NotReady` while the handshake is incomplete or the host has been
    ///   declared dead.
    pub async fn send(&self, frames: Vec<Vec<u8>>) -> Result<(), ClientError> {
        if self.shared.disposed() {
            return Err(ClientError::Disposed);
        }
        if frames.is_empty() {
            return Err(ClientError::InvalidArgument);
        }
        if self.shared.throw_on_send() {
            return Err(ClientError::NotReady);
        }
        self.outbound
            .send(Outbound::Payload(frames))
            .await
            .map_err(|_| ClientError::Disposed)
    }

    /// Releases the socket, queues, and timer. Idempotent and callable from
    /// any thread; subsequent `send` calls fail with `Disposed`.
    pub fn dispose(&self) {
        if !self.shared.mark_disposed() {
            return;
        }
        self.shared.set_throw_on_send(true);
        // stopping the wire loop releases the socket and outbound queue;
        // stopping the dispatch loop releases the inbound queue and timer
        self.wire_handle.abort();
        self.dispatch_handle.abort();
        debug!(target: "framewire::client", client_id = %self.client_id, "client disposed");
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for WireClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireClient")
            .field("client_id", &self.client_id)
            .field("secured", &self.secured)
            .field("can_send", &self.can_send())
            .field("host_alive", &self.is_host_alive())
            .finish()
    }
}
