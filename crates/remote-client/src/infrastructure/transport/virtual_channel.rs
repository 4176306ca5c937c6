//! Point-to-point transport over a remote-desktop virtual channel.
//!
//! When both machines are already joined by a remote desktop session, the
//! session records can ride a dynamic virtual channel instead of a relay.
//! The OS plumbing lives behind [`ChannelDriver`]; this module only adapts
//! its callbacks to the common [`Transport`] state machine.
//!
//! Differences from the relay transport:
//!
//! - Frames are NUL-terminated on the channel.  NULs are stripped on receipt
//!   and the remaining bytes go through the usual line framer.
//! - There is no relay to assign ids, so every outbound record carries
//!   `origin = -1` and the remote peer is always [`DIRECT_PEER`].
//! - The two ends exchange `protocol_version` themselves.  A matching
//!   version is answered with `client_joined`, anything else with
//!   `version_mismatch`.
//! - A close request from the driver is surfaced to the session as the
//!   remote peer leaving.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use remote_core::protocol::codec::{from_fields, to_fields};
use remote_core::protocol::messages::{
    ClientInfo, ClientJoined, ClientLeft, ClientMembership, ProtocolVersion, VersionMismatch,
};
use remote_core::{callback, ChannelToken, ConnectionType, MessageType, DIRECT_PEER, PROTOCOL_VERSION};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::{Outbound, Transport, TransportCore, TransportError, TransportOptions};
use crate::application::session::{SessionLink, SessionLinkExt};

/// Error reported by a [`ChannelDriver`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("driver error {code}: {message}")]
pub struct DriverError {
    pub code: u32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Notifications from the driver, delivered on the channel passed to
/// [`ChannelDriver::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The driver attached to the remote desktop session.
    Connected,
    /// The remote desktop session went away.
    Disconnected { code: u32 },
    /// The driver shut down.
    Terminated,
    /// The remote end opened the channel; records can flow.
    NewChannelConnection,
    /// Raw channel bytes, possibly containing NUL terminators.
    DataReceived(Vec<u8>),
    ReadError { code: u32 },
    /// The remote end closed the channel.
    CloseRequested,
}

/// The OS-specific virtual channel binding.
///
/// Calls are made from async tasks and must not block for long.
#[cfg_attr(test, mockall::automock)]
pub trait ChannelDriver: Send + Sync {
    /// Registers the event sink.  Called once, before any other method.
    fn initialize(
        &self,
        role: ConnectionType,
        channel: &str,
        events: mpsc::UnboundedSender<DriverEvent>,
    ) -> Result<(), DriverError>;

    /// Opens the channel from the controlled (server) side.
    fn open(&self) -> Result<(), DriverError>;

    /// Whether the controller (client) side can currently see the remote end.
    fn remote_endpoint_available(&self) -> bool;

    fn write(&self, frame: &[u8]) -> Result<(), DriverError>;

    fn close(&self) -> Result<(), DriverError>;

    fn terminate(&self) -> Result<(), DriverError>;
}

/// A [`Transport`] over a [`ChannelDriver`].
pub struct VirtualChannelTransport {
    core: TransportCore,
    driver: Arc<dyn ChannelDriver>,
    connection_type: ConnectionType,
    channel: ChannelToken,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<DriverEvent>>,
    initialized: std::sync::atomic::AtomicBool,
}

impl VirtualChannelTransport {
    /// # Errors
    ///
    /// Returns [`TransportError::Driver`] when `channel` is empty.
    pub fn new(
        driver: Arc<dyn ChannelDriver>,
        channel: ChannelToken,
        connection_type: ConnectionType,
        options: &TransportOptions,
    ) -> Result<Arc<Self>, TransportError> {
        if channel.is_empty() {
            return Err(TransportError::Driver("a channel name is required".into()));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let core = TransportCore::new(options).with_origin(DIRECT_PEER);

            let this = weak.clone();
            core.callbacks().register(
                &MessageType::ProtocolVersion.event(),
                callback(move |fields| {
                    let announced: ProtocolVersion = from_fields(fields)?;
                    if let Some(transport) = this.upgrade() {
                        transport.answer_version(announced.version);
                    }
                    Ok(())
                }),
            );

            let this = weak.clone();
            core.callbacks().register(
                &MessageType::VersionMismatch.event(),
                callback(move |_| {
                    if let Some(transport) = this.upgrade() {
                        warn!("remote end rejected protocol version {PROTOCOL_VERSION}");
                        transport.core.fail_handshake();
                    }
                    Ok(())
                }),
            );

            Self {
                core,
                driver,
                connection_type,
                channel,
                events_tx,
                events_rx: AsyncMutex::new(events_rx),
                initialized: std::sync::atomic::AtomicBool::new(false),
            }
        }))
    }

    fn answer_version(&self, version: u32) {
        if version == PROTOCOL_VERSION {
            self.send_message(&ClientJoined(ClientMembership {
                user_id: None,
                client: Some(ClientInfo {
                    id: DIRECT_PEER,
                    connection_type: Some(self.connection_type),
                }),
            }));
        } else {
            warn!("remote end speaks protocol version {version}, expected {PROTOCOL_VERSION}");
            self.send_message(&VersionMismatch {});
        }
    }

    fn ensure_initialized(&self) -> Result<(), TransportError> {
        use std::sync::atomic::Ordering;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.driver
            .initialize(
                self.connection_type,
                self.channel.as_str(),
                self.events_tx.clone(),
            )
            .map_err(|e| TransportError::Driver(e.to_string()))?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn open_channel(&self) -> Result<(), TransportError> {
        match self.connection_type {
            ConnectionType::Controlled => self
                .driver
                .open()
                .map_err(|e| TransportError::Driver(e.to_string())),
            ConnectionType::Controller if self.driver.remote_endpoint_available() => Ok(()),
            ConnectionType::Controller => Err(TransportError::Driver(
                "remote endpoint is not available".into(),
            )),
        }
    }

    fn peer_left(&self) {
        let left = ClientLeft(ClientMembership {
            user_id: None,
            client: Some(ClientInfo {
                id: DIRECT_PEER,
                connection_type: None,
            }),
        });
        match to_fields(&left) {
            Ok(fields) => {
                self.callbacks()
                    .dispatch(&MessageType::ClientLeft.event(), &fields);
            }
            Err(e) => warn!("could not build client_left: {e}"),
        }
    }
}

#[async_trait]
impl Transport for VirtualChannelTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn run(&self) -> Result<(), TransportError> {
        let core = &self.core;
        let mut kill = core.arm_kill_switch()?;

        if let Err(error) = self.ensure_initialized().and_then(|()| self.open_channel()) {
            core.connection_failed(&error);
            return Err(error);
        }

        let queue = core.open_queue();
        core.set_drain(tokio::spawn(drain_to_driver(queue, Arc::clone(&self.driver))))
            .await;

        let mut events = self.events_rx.lock().await;
        let mut failure = None;
        loop {
            tokio::select! {
                _ = &mut kill.signal => {
                    debug!("disconnect requested for virtual channel");
                    break;
                }
                event = events.recv() => match event {
                    None => break,
                    Some(DriverEvent::Connected) => debug!("virtual channel driver attached"),
                    Some(DriverEvent::NewChannelConnection) => {
                        info!("virtual channel {} opened", self.channel);
                        core.mark_connected();
                        self.send_message(&ProtocolVersion::default());
                    }
                    Some(DriverEvent::DataReceived(bytes)) => {
                        let cleaned: Vec<u8> = bytes.into_iter().filter(|b| *b != 0).collect();
                        core.receive(&cleaned);
                    }
                    Some(DriverEvent::CloseRequested) => {
                        info!("remote end closed the virtual channel");
                        self.peer_left();
                        break;
                    }
                    Some(DriverEvent::Disconnected { code }) => {
                        info!("remote desktop session disconnected (code {code})");
                        break;
                    }
                    Some(DriverEvent::Terminated) => {
                        info!("virtual channel driver terminated");
                        break;
                    }
                    Some(DriverEvent::ReadError { code }) => {
                        warn!("virtual channel read error {code}");
                        failure = Some(TransportError::Driver(format!("read error {code}")));
                        break;
                    }
                },
            }
        }
        drop(events);

        core.mark_disconnected();
        if let Err(e) = self.driver.close() {
            debug!("closing virtual channel: {e}");
        }
        core.shutdown_queue().await;
        core.finish_attempt()?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        super::close_transport(self).await;
        if self.initialized.swap(false, std::sync::atomic::Ordering::SeqCst) {
            if let Err(e) = self.driver.terminate() {
                warn!("terminating virtual channel driver: {e}");
            }
        }
    }
}

/// Writes queued frames to the driver, each followed by a NUL terminator.
async fn drain_to_driver(mut queue: mpsc::Receiver<Outbound>, driver: Arc<dyn ChannelDriver>) {
    while let Some(item) = queue.recv().await {
        let mut frame = match item {
            Outbound::Frame(frame) => frame,
            Outbound::Stop => break,
        };
        frame.push(0);
        if let Err(e) = driver.write(&frame) {
            warn!("virtual channel write failed; discarding remaining outbound records: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::sync::Mutex;
    use std::time::Duration;

    type Writes = Arc<Mutex<Vec<Vec<u8>>>>;
    type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<DriverEvent>>>>;

    /// A driver mock that captures the event sink and every written frame.
    fn driver(role: ConnectionType) -> (MockChannelDriver, EventSink, Writes) {
        let sink: EventSink = Arc::new(Mutex::new(None));
        let writes: Writes = Arc::new(Mutex::new(Vec::new()));
        let mut driver = MockChannelDriver::new();

        let captured = Arc::clone(&sink);
        driver
            .expect_initialize()
            .with(eq(role), eq("chan"), mockall::predicate::always())
            .times(1)
            .returning(move |_, _, events| {
                *captured.lock().unwrap() = Some(events);
                Ok(())
            });
        driver.expect_open().returning(|| Ok(()));
        driver.expect_remote_endpoint_available().return_const(true);
        let written = Arc::clone(&writes);
        driver.expect_write().returning(move |frame| {
            written.lock().unwrap().push(frame.to_vec());
            Ok(())
        });
        driver.expect_close().returning(|| Ok(()));
        driver.expect_terminate().times(1).returning(|| Ok(()));
        (driver, sink, writes)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn emit(sink: &EventSink, event: DriverEvent) {
        sink.lock()
            .unwrap()
            .as_ref()
            .expect("driver initialized")
            .send(event)
            .unwrap();
    }

    fn frames(writes: &Writes) -> Vec<String> {
        writes
            .lock()
            .unwrap()
            .iter()
            .map(|f| String::from_utf8(f.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_channel_is_rejected() {
        let result = VirtualChannelTransport::new(
            Arc::new(MockChannelDriver::new()),
            ChannelToken::from(""),
            ConnectionType::Controlled,
            &TransportOptions::default(),
        );
        assert!(matches!(result, Err(TransportError::Driver(_))));
    }

    #[tokio::test]
    async fn test_handshake_frames_and_peer_left() {
        // Arrange
        let (driver, sink, writes) = driver(ConnectionType::Controlled);
        let transport = VirtualChannelTransport::new(
            Arc::new(driver),
            ChannelToken::from("chan"),
            ConnectionType::Controlled,
            &TransportOptions::default(),
        )
        .unwrap();
        let left = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&left);
        transport.callbacks().register(
            "msg_client_left",
            callback(move |fields| {
                record.lock().unwrap().push(fields.clone());
                Ok(())
            }),
        );
        let runner = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.run().await }
        });
        wait_for(|| sink.lock().unwrap().is_some()).await;

        // Act
        emit(&sink, DriverEvent::NewChannelConnection);
        emit(
            &sink,
            DriverEvent::DataReceived(b"{\"type\":\"protocol_version\",\"version\":2}\0".to_vec()),
        );
        wait_for(|| writes.lock().unwrap().len() >= 2).await;
        emit(&sink, DriverEvent::CloseRequested);
        let result = runner.await.unwrap();
        transport.close().await;

        // Assert
        assert!(result.is_ok());
        assert_eq!(
            frames(&writes),
            vec![
                "{\"type\":\"protocol_version\",\"version\":2,\"origin\":-1}\n\0".to_string(),
                "{\"type\":\"client_joined\",\"client\":{\"id\":-1,\"connection_type\":\"controlled\"},\"origin\":-1}\n\0".to_string(),
            ]
        );
        let left = left.lock().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["client"]["id"], serde_json::json!(-1));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_answered_and_fails_the_attempt() {
        let (driver, sink, writes) = driver(ConnectionType::Controller);
        let transport = VirtualChannelTransport::new(
            Arc::new(driver),
            ChannelToken::from("chan"),
            ConnectionType::Controller,
            &TransportOptions::default(),
        )
        .unwrap();
        let runner = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.run().await }
        });
        wait_for(|| sink.lock().unwrap().is_some()).await;

        emit(&sink, DriverEvent::NewChannelConnection);
        emit(
            &sink,
            DriverEvent::DataReceived(b"{\"type\":\"protocol_version\",\"version\":1}\0".to_vec()),
        );
        wait_for(|| writes.lock().unwrap().len() >= 2).await;
        emit(
            &sink,
            DriverEvent::DataReceived(b"{\"type\":\"version_mismatch\"}\0".to_vec()),
        );
        let result = runner.await.unwrap();
        transport.close().await;

        assert!(matches!(result, Err(TransportError::VersionMismatch)));
        assert!(frames(&writes)[1].starts_with("{\"type\":\"version_mismatch\""));
    }

    #[tokio::test]
    async fn test_controller_without_remote_endpoint_fails_to_connect() {
        let mut driver = MockChannelDriver::new();
        driver.expect_initialize().returning(|_, _, _| Ok(()));
        driver.expect_remote_endpoint_available().return_const(false);
        driver.expect_terminate().returning(|| Ok(()));
        let transport = VirtualChannelTransport::new(
            Arc::new(driver),
            ChannelToken::from("chan"),
            ConnectionType::Controller,
            &TransportOptions::default(),
        )
        .unwrap();

        let result = transport.run().await;
        transport.close().await;

        assert!(matches!(result, Err(TransportError::Driver(_))));
        assert!(!transport.is_connected());
    }
}
