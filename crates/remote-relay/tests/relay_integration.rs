//! End-to-end tests: real client transports and sessions talking through a
//! relay on a local listener.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remote_client::application::local_events::Interception;
use remote_client::application::session::controller::{ControllerOptions, NOT_CONNECTED_NOTICE};
use remote_client::application::session::{ControlledSession, ControllerSession, SessionLink};
use remote_client::infrastructure::local_events::recording::{LocalCall, RecordingEventSource};
use remote_client::infrastructure::transport::relay::RelayTransport;
use remote_client::infrastructure::transport::tcp::TcpTransportConfig;
use remote_client::infrastructure::transport::{Transport, TransportOptions};
use remote_core::protocol::messages::SpeechItem;
use remote_core::{callback, ChannelToken, ConnectionType, MessageType, PeerId};
use remote_relay::application::RelayService;
use remote_relay::domain::RelayConfig;
use remote_relay::infrastructure::{bind, serve};
use serde_json::json;
use tokio::time::{sleep, Instant};

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Relay {
    address: String,
    service: Arc<RelayService>,
}

async fn start_relay() -> Relay {
    let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let service = Arc::new(RelayService::new(RelayConfig::default()));
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(serve(listener, Arc::clone(&service), running));
    Relay { address, service }
}

fn client_config(address: &str) -> TcpTransportConfig {
    TcpTransportConfig {
        address: address.to_string(),
        connect_timeout: Duration::from_secs(1),
        options: TransportOptions {
            reconnect_delay: Duration::from_millis(100),
            send_queue_capacity: 64,
        },
    }
}

fn client(relay: &Relay, channel: Option<&str>, role: ConnectionType) -> Arc<RelayTransport> {
    RelayTransport::new(
        client_config(&relay.address),
        channel.map(ChannelToken::from),
        role,
    )
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

fn speech(calls: &[LocalCall]) -> Vec<Vec<SpeechItem>> {
    calls
        .iter()
        .filter_map(|c| match c {
            LocalCall::Speak(items) => Some(items.clone()),
            _ => None,
        })
        .collect()
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_speech_and_gestures_cross_the_relay() {
    // Arrange
    let relay = start_relay().await;
    let controlled_transport = client(&relay, Some("4429117"), ConnectionType::Controlled);
    let controller_transport = client(&relay, Some("4429117"), ConnectionType::Controller);
    let controlled_source = Arc::new(RecordingEventSource::new());
    let controller_source = Arc::new(RecordingEventSource::new());
    let controlled = ControlledSession::new(controlled_transport.clone(), controlled_source.clone());
    let controller =
        ControllerSession::new(controller_transport.clone(), controller_source.clone());

    Arc::clone(&controlled_transport).start();
    Arc::clone(&controller_transport).start();
    wait_until("both sides to see each other", || {
        controlled.bindings_installed() && controller.bindings_installed()
    })
    .await;

    // Act
    controlled_source.host_speak(&["Hello"]);
    controller_source.host_gesture(json!({"source": "kb", "id": "kb(desktop):NVDA+t"}));

    // Assert
    wait_until("speech on the controller", || {
        !speech(&controller_source.calls()).is_empty()
    })
    .await;
    wait_until("gesture on the controlled side", || {
        controlled_source
            .calls()
            .iter()
            .any(|c| matches!(c, LocalCall::ExecuteInputGesture(_)))
    })
    .await;
    assert_eq!(
        speech(&controller_source.calls()),
        vec![vec![SpeechItem::Text("Hello".into())]]
    );
    assert!(controlled_source.is_intercepting(Interception::SpeechOutput));

    controller_transport.close().await;
    controlled_transport.close().await;
}

#[tokio::test]
async fn test_generated_key_is_adopted_and_joined() {
    // Arrange
    let relay = start_relay().await;
    let transport = client(&relay, None, ConnectionType::Controlled);

    // Act
    Arc::clone(&transport).start();
    wait_until("a generated key", || transport.channel().is_some()).await;

    // Assert
    let key = transport.channel().unwrap();
    assert_eq!(key.as_str().len(), 7);
    wait_until("the client to be a member", || {
        relay.service.channel_members(&key).len() == 1
    })
    .await;

    transport.close().await;
}

#[tokio::test]
async fn test_wrong_protocol_version_stops_the_client() {
    // Arrange
    let relay = start_relay().await;
    let transport = RelayTransport::with_protocol_version(
        client_config(&relay.address),
        Some(ChannelToken::from("abc")),
        ConnectionType::Controller,
        1,
    );
    let mismatches = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&mismatches);
    transport.callbacks().register(
        &MessageType::VersionMismatch.event(),
        callback(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        }),
    );

    // Act
    Arc::clone(&transport).start();

    // Assert
    wait_until("the supervisor to give up", || {
        *mismatches.lock().unwrap() == 1 && !transport.core().is_supervised()
    })
    .await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.successful_connects(), 1);
    assert!(relay
        .service
        .channel_members(&ChannelToken::from("abc"))
        .is_empty());
}

#[tokio::test]
async fn test_lonely_controller_is_notified() {
    // Arrange
    let relay = start_relay().await;
    let transport = client(&relay, Some("lonely"), ConnectionType::Controller);
    let source = Arc::new(RecordingEventSource::new());
    let controller = ControllerSession::new(transport.clone(), source.clone());
    Arc::clone(&transport).start();
    wait_until("the join", || {
        relay.service.channel_members(&ChannelToken::from("lonely")).len() == 1
    })
    .await;

    // Act
    controller.send_clipboard_text("anyone?");

    // Assert
    wait_until("the not-connected notice", || {
        source
            .calls()
            .contains(&LocalCall::Notify(NOT_CONNECTED_NOTICE.to_string()))
    })
    .await;

    transport.close().await;
}

#[tokio::test]
async fn test_lonely_controller_keeps_speaking_while_its_index_advances() {
    // Arrange
    let relay = start_relay().await;
    let transport = client(&relay, Some("alone"), ConnectionType::Controller);
    let source = Arc::new(RecordingEventSource::new());
    let controller = ControllerSession::with_options(
        transport.clone(),
        source.clone(),
        ControllerOptions {
            index_poll_interval: Duration::from_millis(10),
            muted: false,
        },
    );
    Arc::clone(&transport).start();
    wait_until("the join", || {
        relay.service.channel_members(&ChannelToken::from("alone")).len() == 1
    })
    .await;
    wait_until("the index poll", || controller.is_polling_index()).await;

    // Act
    for index in 1..=5 {
        source.set_spoken_index(Some(index));
        sleep(Duration::from_millis(40)).await;
    }
    sleep(Duration::from_millis(100)).await;

    // Assert
    let calls = source.calls();
    assert!(!calls.contains(&LocalCall::CancelSpeech));
    assert!(!calls.contains(&LocalCall::Notify(NOT_CONNECTED_NOTICE.to_string())));

    transport.close().await;
}

#[tokio::test]
async fn test_departing_controller_releases_the_controlled_side() {
    // Arrange
    let relay = start_relay().await;
    let controlled_transport = client(&relay, Some("k"), ConnectionType::Controlled);
    let controller_transport = client(&relay, Some("k"), ConnectionType::Controller);
    let controlled_source = Arc::new(RecordingEventSource::new());
    let controlled = ControlledSession::new(controlled_transport.clone(), controlled_source.clone());
    Arc::clone(&controlled_transport).start();
    Arc::clone(&controller_transport).start();
    wait_until("the controlled side to capture", || {
        controlled.bindings_installed()
    })
    .await;
    let controller_id: PeerId = controlled.live_peers()[0];

    // Act
    controller_transport.close().await;

    // Assert
    wait_until("the controlled side to release", || {
        !controlled.bindings_installed()
    })
    .await;
    assert!(controlled.live_peers().is_empty());
    assert!(!relay
        .service
        .channel_members(&ChannelToken::from("k"))
        .contains(&controller_id));
    assert!(!controlled_source.is_intercepting(Interception::SpeechOutput));

    controlled_transport.close().await;
}
