//! Reconnecting, line-framed message transports.
//!
//! A transport owns at most one physical connection at a time and moves
//! JSON line records across it.  It publishes everything it observes on its
//! [`CallbackManager`]: every received record as `msg_<type>`, plus the
//! lifecycle events in [`remote_core::events`].
//!
//! # Lifecycle
//!
//! ```text
//!          start()                run() ok            EOF / error / kill
//!  Idle ────────────► Connecting ─────────► Connected ──────────────────► Disconnected
//!   ▲                     │ run() err                                        │
//!   │                     ▼                                                  │
//!   │               wait reconnect_delay ◄───────────────────────────────────┘
//!   │                     │ close()
//!   └──── Closing ◄───────┘
//! ```
//!
//! # Pieces
//!
//! - [`Transport`] – the trait every variant implements.  Variants supply
//!   [`Transport::run`] (one connection attempt, returning when it ends) and
//!   reuse everything else from [`TransportCore`].
//! - [`TransportCore`] – shared state: flags, the bounded send queue, the
//!   receive framer, the kill switch that unblocks `run()`, and the
//!   reconnect supervisor.
//! - Variants: [`tcp::TcpTransport`], [`relay::RelayTransport`] (TCP plus the
//!   relay join handshake) and [`virtual_channel::VirtualChannelTransport`].
//!
//! # Threading
//!
//! `send()` never blocks: it serializes on the caller's thread and
//! `try_send`s into a bounded queue that a per-connection drain task writes
//! out.  Received records are dispatched on the task running `run()`, in
//! arrival order.

pub mod mock;
pub mod relay;
mod supervisor;
pub mod tcp;
pub mod virtual_channel;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use remote_core::protocol::codec::{message_type, TYPE_FIELD};
use remote_core::protocol::messages::{message_event, ORIGIN_FIELD};
use remote_core::{events, CallbackManager, Fields, JsonSerializer, PeerId, Serializer};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::session::SessionLink;

use self::supervisor::Supervisor;

/// Wait between the end of one connection attempt and the next.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Records that may wait in the send queue before new ones are dropped.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Longest a single outbound write may stall before the connection is
/// treated as dead.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors a connection attempt can end with.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// The TCP connection was not established within the timeout.
    #[error("connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    /// An I/O error occurred on the established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The remote side rejected our protocol version.
    #[error("remote side reported a protocol version mismatch")]
    VersionMismatch,
    /// The virtual channel driver reported a failure.
    #[error("virtual channel driver: {0}")]
    Driver(String),
    /// `close()` was called; no further attempts are made.
    #[error("transport is closing")]
    Closing,
}

/// Tunables shared by every transport variant.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub reconnect_delay: Duration,
    pub send_queue_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

/// Items in the send queue.  `Stop` tells the drain task to exit.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Vec<u8>),
    Stop,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── TransportCore ─────────────────────────────────────────────────────────────

/// State and plumbing shared by all transport variants.
pub struct TransportCore {
    serializer: Arc<dyn Serializer>,
    callbacks: CallbackManager,
    connected: AtomicBool,
    successful_connects: AtomicU64,
    closing: AtomicBool,
    closed: AtomicBool,
    handshake_failed: AtomicBool,
    queue_capacity: usize,
    /// Stamped into every outbound record when set.
    origin: Option<PeerId>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    drain: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    kill_switch: Mutex<Option<oneshot::Sender<()>>>,
    framer: Mutex<remote_core::LineFramer>,
    supervisor: Supervisor,
}

impl TransportCore {
    pub fn new(options: &TransportOptions) -> Self {
        Self::with_serializer(Arc::new(JsonSerializer), options)
    }

    pub fn with_serializer(serializer: Arc<dyn Serializer>, options: &TransportOptions) -> Self {
        Self {
            serializer,
            callbacks: CallbackManager::new(),
            connected: AtomicBool::new(false),
            successful_connects: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handshake_failed: AtomicBool::new(false),
            queue_capacity: options.send_queue_capacity.max(1),
            origin: None,
            outbound: Mutex::new(None),
            drain: tokio::sync::Mutex::new(None),
            kill_switch: Mutex::new(None),
            framer: Mutex::new(remote_core::LineFramer::new()),
            supervisor: Supervisor::new(options.reconnect_delay),
        }
    }

    /// Stamps `origin = id` into every outbound record.
    pub(crate) fn with_origin(mut self, id: PeerId) -> Self {
        self.origin = Some(id);
        self
    }

    pub fn callbacks(&self) -> &CallbackManager {
        &self.callbacks
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn successful_connects(&self) -> u64 {
        self.successful_connects.load(Ordering::SeqCst)
    }

    /// `true` once `close()` has completed, until the next `start()`.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `true` while the reconnect supervisor is alive.
    pub fn is_supervised(&self) -> bool {
        self.supervisor.is_running()
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Serializes and enqueues a record.  Dropped when not connected or when
    /// the queue is full.
    pub fn send(&self, msg_type: &str, fields: &Fields) {
        if !self.is_connected() {
            debug!("not connected; dropping outbound '{msg_type}'");
            return;
        }

        let frame = match self.origin {
            Some(origin) => {
                let mut stamped = fields.clone();
                stamped.insert(ORIGIN_FIELD.to_string(), Value::from(origin));
                self.serializer.serialize(msg_type, &stamped)
            }
            None => self.serializer.serialize(msg_type, fields),
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to serialize outbound '{msg_type}': {e}");
                return;
            }
        };

        let Some(sender) = lock(&self.outbound).clone() else {
            debug!("no open send queue; dropping outbound '{msg_type}'");
            return;
        };
        match sender.try_send(Outbound::Frame(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(
                "send queue full ({} records); dropping outbound '{msg_type}'",
                self.queue_capacity
            ),
            Err(TrySendError::Closed(_)) => {
                debug!("connection writer has exited; dropping outbound '{msg_type}'")
            }
        }
    }

    /// Opens a fresh send queue for a new connection and returns its receiving
    /// end for the drain task.
    pub(crate) fn open_queue(&self) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        *lock(&self.outbound) = Some(tx);
        rx
    }

    pub(crate) async fn set_drain(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.drain.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stops accepting sends, lets the drain task flush and exit, and waits
    /// for it.  Safe to call from several places; only the first does work.
    pub(crate) async fn shutdown_queue(&self) {
        let sender = lock(&self.outbound).take();
        let stop_delivered = match sender {
            Some(tx) => tx.try_send(Outbound::Stop).is_ok(),
            None => true,
        };

        let mut drain = self.drain.lock().await;
        if let Some(handle) = drain.take() {
            if !stop_delivered {
                debug!("send queue full during shutdown; aborting writer");
                handle.abort();
            }
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("connection writer task failed: {e}");
                }
            }
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Feeds received bytes through the framer and dispatches every complete
    /// record.
    pub(crate) fn receive(&self, data: &[u8]) {
        let lines = lock(&self.framer).push(data);
        for line in lines {
            self.parse_line(&line);
        }
    }

    fn parse_line(&self, line: &[u8]) {
        let mut fields = match self.serializer.deserialize(line) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("dropping malformed record: {e}");
                return;
            }
        };
        let Some(msg_type) = message_type(&fields).map(str::to_string) else {
            warn!("dropping record without a string 'type'");
            return;
        };
        fields.remove(TYPE_FIELD);
        self.callbacks.dispatch(&message_event(&msg_type), &fields);
    }

    // ── Connection state ──────────────────────────────────────────────────────

    pub(crate) fn mark_connected(&self) {
        lock(&self.framer).clear();
        self.connected.store(true, Ordering::SeqCst);
        let count = self.successful_connects.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("connection #{count} established");
        self.callbacks
            .dispatch(events::TRANSPORT_CONNECTED, &Fields::new());
    }

    /// Clears `connected` and publishes `transport_disconnected`, once per
    /// connection.
    pub(crate) fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.callbacks
                .dispatch(events::TRANSPORT_DISCONNECTED, &Fields::new());
        }
    }

    pub(crate) fn connection_failed(&self, error: &TransportError) {
        debug!("connection attempt failed: {error}");
        let mut fields = Fields::new();
        fields.insert("error".to_string(), Value::from(error.to_string()));
        self.callbacks
            .dispatch(events::TRANSPORT_CONNECTION_FAILED, &fields);
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Installs the kill switch for one `run()`.  Fails when `close()` has
    /// already begun, so a late attempt never outlives it.
    pub(crate) fn arm_kill_switch(&self) -> Result<KillSwitch<'_>, TransportError> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.kill_switch) = Some(tx);
        if self.closing.load(Ordering::SeqCst) {
            lock(&self.kill_switch).take();
            return Err(TransportError::Closing);
        }
        Ok(KillSwitch {
            core: self,
            signal: rx,
        })
    }

    /// Fires the kill switch of the running attempt, if any.
    pub fn trigger_kill_switch(&self) -> bool {
        match lock(&self.kill_switch).take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Ends the current connection and stops reconnecting.  Used when the
    /// remote side rejects the handshake.
    pub(crate) fn fail_handshake(&self) {
        self.handshake_failed.store(true, Ordering::SeqCst);
        self.supervisor.request_stop();
        self.trigger_kill_switch();
    }

    /// Result `run()` should return for a connection that ended normally.
    pub(crate) fn finish_attempt(&self) -> Result<(), TransportError> {
        if self.handshake_failed.load(Ordering::SeqCst) {
            Err(TransportError::VersionMismatch)
        } else {
            Ok(())
        }
    }

    fn reset_for_start(&self) {
        self.closing.store(false, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        self.handshake_failed.store(false, Ordering::SeqCst);
    }
}

/// Resolves when the running attempt must end.  Dropping it uninstalls it.
pub(crate) struct KillSwitch<'a> {
    core: &'a TransportCore,
    pub(crate) signal: oneshot::Receiver<()>,
}

impl Drop for KillSwitch<'_> {
    fn drop(&mut self) {
        lock(&self.core.kill_switch).take();
    }
}

// ── Transport trait ───────────────────────────────────────────────────────────

/// A reconnecting message transport.
///
/// Implementors provide [`core`](Transport::core) and
/// [`run`](Transport::run); sending, receiving and callbacks come from the
/// blanket [`SessionLink`] implementation.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn core(&self) -> &TransportCore;

    /// Makes one connection attempt and services it until it ends.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt failed or ended abnormally; the
    /// supervisor logs it and retries after the reconnect delay.
    async fn run(&self) -> Result<(), TransportError>;

    /// Forces the current connection (or connection attempt) to end.
    fn disconnect(&self) {
        self.core().trigger_kill_switch();
    }

    fn successful_connects(&self) -> u64 {
        self.core().successful_connects()
    }

    /// Starts the reconnect supervisor.  Returns `false` if it is already
    /// running.
    fn start(self: Arc<Self>) -> bool {
        let transport = Arc::clone(&self);
        let core = self.core();
        core.reset_for_start();
        core.supervisor.arm(transport)
    }

    /// Stops reconnecting, tears down the connection and waits for the
    /// writer and the supervisor to exit.
    async fn close(&self) {
        close_transport(self).await;
    }
}

/// The shared `close()` sequence.
pub(crate) async fn close_transport<T: Transport + ?Sized>(transport: &T) {
    let core = transport.core();
    core.callbacks
        .dispatch(events::TRANSPORT_CLOSING, &Fields::new());
    core.closing.store(true, Ordering::SeqCst);

    let supervisor = core.supervisor.disarm();
    transport.disconnect();
    core.shutdown_queue().await;
    if let Some(handle) = supervisor {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!("reconnect supervisor failed: {e}");
            }
        }
    }
    core.mark_disconnected();
    core.closed.store(true, Ordering::SeqCst);
    info!("transport closed");
}

impl<T: Transport + ?Sized> SessionLink for T {
    fn callbacks(&self) -> &CallbackManager {
        self.core().callbacks()
    }

    fn send(&self, msg_type: &str, fields: &Fields) {
        self.core().send(msg_type, fields);
    }

    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_core::callback;
    use std::sync::Mutex as StdMutex;

    fn recorder(core: &TransportCore, event: &str) -> Arc<StdMutex<Vec<Fields>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.callbacks().register(
            event,
            callback(move |fields| {
                sink.lock().unwrap().push(fields.clone());
                Ok(())
            }),
        );
        seen
    }

    #[test]
    fn test_send_while_disconnected_queues_nothing() {
        // Arrange
        let core = TransportCore::new(&TransportOptions::default());
        let mut rx = core.open_queue();

        // Act
        core.send("speak", &Fields::new());

        // Assert
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_when_connected_enqueues_serialized_frame() {
        let core = TransportCore::new(&TransportOptions::default());
        let mut rx = core.open_queue();
        core.mark_connected();

        core.send("cancel", &Fields::new());

        match rx.try_recv() {
            Ok(Outbound::Frame(bytes)) => assert_eq!(bytes, b"{\"type\":\"cancel\"}\n"),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_full_queue_drops_newest_record() {
        let options = TransportOptions {
            send_queue_capacity: 1,
            ..TransportOptions::default()
        };
        let core = TransportCore::new(&options);
        let mut rx = core.open_queue();
        core.mark_connected();

        core.send("first", &Fields::new());
        core.send("second", &Fields::new());

        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(ref b)) if b.starts_with(b"{\"type\":\"first\"")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_origin_is_stamped_into_outbound_records() {
        let core = TransportCore::new(&TransportOptions::default()).with_origin(-1);
        let mut rx = core.open_queue();
        core.mark_connected();

        core.send("key", &Fields::new());

        match rx.try_recv() {
            Ok(Outbound::Frame(bytes)) => {
                assert_eq!(bytes, b"{\"type\":\"key\",\"origin\":-1}\n")
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_receive_dispatches_complete_records_without_type() {
        // Arrange
        let core = TransportCore::new(&TransportOptions::default());
        let spoken = recorder(&core, "msg_speak");

        // Act
        core.receive(b"{\"type\":\"speak\",\"sequence\":[\"Hel");
        core.receive(b"lo\"]}\nnot json\n{\"sequence\":[]}\n");

        // Assert
        let spoken = spoken.lock().unwrap();
        assert_eq!(spoken.len(), 1);
        assert!(!spoken[0].contains_key("type"));
        assert_eq!(spoken[0]["sequence"], serde_json::json!(["Hello"]));
    }

    #[test]
    fn test_connection_counter_and_lifecycle_events() {
        let core = TransportCore::new(&TransportOptions::default());
        let connected = recorder(&core, events::TRANSPORT_CONNECTED);
        let disconnected = recorder(&core, events::TRANSPORT_DISCONNECTED);

        core.mark_connected();
        core.mark_disconnected();
        core.mark_disconnected();
        core.mark_connected();

        assert_eq!(core.successful_connects(), 2);
        assert!(core.is_connected());
        assert_eq!(connected.lock().unwrap().len(), 2);
        assert_eq!(disconnected.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_kill_switch_refuses_to_arm_while_closing() {
        let core = TransportCore::new(&TransportOptions::default());
        core.closing.store(true, Ordering::SeqCst);

        assert!(matches!(core.arm_kill_switch(), Err(TransportError::Closing)));
        assert!(!core.trigger_kill_switch());
    }

    #[tokio::test]
    async fn test_trigger_kill_switch_resolves_signal() {
        let core = TransportCore::new(&TransportOptions::default());
        let mut kill = core.arm_kill_switch().unwrap();

        assert!(core.trigger_kill_switch());

        tokio_test::assert_ok!((&mut kill.signal).await);
    }

    #[tokio::test]
    async fn test_shutdown_queue_waits_for_drain_to_flush() {
        // Arrange
        let core = TransportCore::new(&TransportOptions::default());
        let mut rx = core.open_queue();
        core.mark_connected();
        core.send("a", &Fields::new());
        core.send("b", &Fields::new());
        let written = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&written);
        core.set_drain(tokio::spawn(async move {
            while let Some(Outbound::Frame(bytes)) = rx.recv().await {
                sink.lock().unwrap().push(bytes);
            }
        }))
        .await;

        // Act
        core.shutdown_queue().await;

        // Assert
        assert_eq!(written.lock().unwrap().len(), 2);
        core.send("c", &Fields::new());
        assert_eq!(written.lock().unwrap().len(), 2);
    }
}
