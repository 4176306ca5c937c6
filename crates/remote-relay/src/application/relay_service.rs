//! Record routing for the relay.
//!
//! [`RelayService`] owns every connected client's outbox and the channel
//! registry.  The infrastructure layer feeds it one complete line at a time
//! through [`RelayService::handle_line`] and does what the returned
//! [`Disposition`] says; everything the relay sends goes into the outboxes.
//!
//! # Handled records
//!
//! | Record             | Effect                                                        |
//! |--------------------|---------------------------------------------------------------|
//! | `protocol_version` | wrong version → `version_mismatch`, then disconnect           |
//! | `join`             | `channel_joined` to the joiner, `client_joined` to the others |
//! | `generate_key`     | `generate_key{key}` with a fresh 7-digit key                  |
//! | anything else      | forwarded to the other members with `origin` = sender id      |
//!
//! A controller whose channel has no controlled member is told so with
//! `nvda_not_connected` each time it sends a record on the user's behalf.
//! Its background `index` and `set_braille_info` records are not answered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use remote_core::protocol::codec::{from_fields, message_type, to_fields};
use remote_core::protocol::messages::{
    ChannelJoined, ClientInfo, ClientJoined, ClientLeft, ClientMembership, GenerateKey, Join,
    NvdaNotConnected, ProtocolVersion, VersionMismatch, ORIGIN_FIELD,
};
use remote_core::{
    ChannelToken, ConnectionType, Fields, JsonSerializer, MessageType, PeerId, ProtocolError,
    Serializer, WireMessage,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ChannelRegistry, Member, RelayConfig};

/// Frames queued for one client's socket writer.
pub type Outbox = mpsc::Sender<Vec<u8>>;

// ── Error type ────────────────────────────────────────────────────────────────

/// Why a record could not be handled.  None of these end the connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed record: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("record has no string 'type'")]
    MissingType,

    #[error("invalid '{msg_type}' payload: {source}")]
    InvalidPayload {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown client {0}")]
    UnknownPeer(PeerId),
}

/// What the connection should do after a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Disconnect,
}

// ── Service ───────────────────────────────────────────────────────────────────

struct PeerEntry {
    outbox: Outbox,
    membership: Option<(ChannelToken, ConnectionType)>,
}

#[derive(Default)]
struct RelayState {
    peers: HashMap<PeerId, PeerEntry>,
    channels: ChannelRegistry,
}

pub struct RelayService {
    config: RelayConfig,
    serializer: JsonSerializer,
    next_id: AtomicI64,
    state: Mutex<RelayState>,
}

impl RelayService {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            serializer: JsonSerializer,
            next_id: AtomicI64::new(1),
            state: Mutex::new(RelayState::default()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new client and returns its id.
    pub fn connect(&self, outbox: Outbox) -> PeerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.state().peers.insert(
            id,
            PeerEntry {
                outbox,
                membership: None,
            },
        );
        debug!("client {id} connected");
        id
    }

    /// Forgets a client, tells the rest of its channel, and drops its outbox
    /// so the writer can flush and exit.
    pub fn disconnect(&self, id: PeerId) {
        let mut state = self.state();
        let Some(entry) = state.peers.remove(&id) else {
            return;
        };
        if let Some((channel, _)) = entry.membership {
            self.leave_channel(&mut state, &channel, id);
        }
        debug!("client {id} disconnected");
    }

    /// Drops every client.  Used on shutdown.
    pub fn disconnect_all(&self) {
        let mut state = self.state();
        let count = state.peers.len();
        state.peers.clear();
        state.channels = ChannelRegistry::new();
        if count > 0 {
            info!("dropped {count} client(s) on shutdown");
        }
    }

    pub fn client_count(&self) -> usize {
        self.state().peers.len()
    }

    /// Ids in `channel`, in join order.
    pub fn channel_members(&self, channel: &ChannelToken) -> Vec<PeerId> {
        self.state()
            .channels
            .members(channel)
            .iter()
            .map(|m| m.id)
            .collect()
    }

    /// Handles one received line.  Malformed records are logged and
    /// skipped.
    pub fn handle_line(&self, id: PeerId, line: &[u8]) -> Disposition {
        let result = self
            .serializer
            .deserialize(line)
            .map_err(RelayError::from)
            .and_then(|fields| self.handle_record(id, fields));
        match result {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!("client {id}: dropping record: {e}");
                Disposition::Continue
            }
        }
    }

    /// Handles one decoded record.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] when the record has no type, its payload does
    /// not fit its type, or `id` is not connected.
    pub fn handle_record(&self, id: PeerId, fields: Fields) -> Result<Disposition, RelayError> {
        let msg_type = message_type(&fields)
            .ok_or(RelayError::MissingType)?
            .to_string();
        let invalid = |source: serde_json::Error| RelayError::InvalidPayload {
            msg_type: msg_type.clone(),
            source,
        };

        let mut state = self.state();
        if !state.peers.contains_key(&id) {
            return Err(RelayError::UnknownPeer(id));
        }

        match MessageType::from_wire(&msg_type) {
            Some(MessageType::ProtocolVersion) => {
                let ProtocolVersion { version } = from_fields(&fields).map_err(invalid)?;
                if version != self.config.protocol_version {
                    warn!(
                        "client {id} speaks protocol {version}, expected {}",
                        self.config.protocol_version
                    );
                    self.send_to(&state, id, &VersionMismatch {});
                    return Ok(Disposition::Disconnect);
                }
                Ok(Disposition::Continue)
            }
            Some(MessageType::Join) => {
                let join: Join = from_fields(&fields).map_err(invalid)?;
                self.join(&mut state, id, join);
                Ok(Disposition::Continue)
            }
            Some(MessageType::GenerateKey) => {
                let key = generate_key(&state.channels);
                debug!("client {id}: generated channel key");
                self.send_to(&state, id, &GenerateKey { key: Some(key) });
                Ok(Disposition::Continue)
            }
            _ => {
                self.forward(&state, id, &msg_type, fields);
                Ok(Disposition::Continue)
            }
        }
    }

    // ── Membership ────────────────────────────────────────────────────────────

    fn join(&self, state: &mut RelayState, id: PeerId, join: Join) {
        if join.channel.is_empty() {
            warn!("client {id} tried to join an empty channel");
            return;
        }
        let previous = state
            .peers
            .get_mut(&id)
            .and_then(|entry| entry.membership.replace((join.channel.clone(), join.connection_type)));
        if let Some((old_channel, _)) = previous {
            self.leave_channel(state, &old_channel, id);
        }

        let member = Member {
            id,
            connection_type: join.connection_type,
        };
        let existing = state.channels.join(&join.channel, member);
        info!(
            "client {id} joined a channel as {} ({} other member(s))",
            join.connection_type,
            existing.len()
        );

        let joined = ChannelJoined {
            channel: Some(join.channel.clone()),
            user_ids: existing.iter().map(|m| m.id).collect(),
            clients: existing.iter().copied().map(ClientInfo::from).collect(),
        };
        self.send_to(state, id, &joined);

        let announcement = ClientJoined(ClientMembership::for_client(member.into()));
        for other in &existing {
            self.send_to(state, other.id, &announcement);
        }
    }

    fn leave_channel(&self, state: &mut RelayState, channel: &ChannelToken, id: PeerId) {
        let Some((left, remaining)) = state.channels.leave(channel, id) else {
            return;
        };
        let announcement = ClientLeft(ClientMembership::for_client(left.into()));
        for other in &remaining {
            self.send_to(state, other.id, &announcement);
        }
    }

    // ── Forwarding ────────────────────────────────────────────────────────────

    fn forward(&self, state: &RelayState, id: PeerId, msg_type: &str, mut fields: Fields) {
        let Some((channel, connection_type)) = state
            .peers
            .get(&id)
            .and_then(|entry| entry.membership.clone())
        else {
            debug!("client {id} sent '{msg_type}' before joining; dropped");
            return;
        };

        let others = state.channels.others(&channel, id);
        if connection_type == ConnectionType::Controller
            && !is_background(msg_type)
            && !others
                .iter()
                .any(|m| m.connection_type == ConnectionType::Controlled)
        {
            self.send_to(state, id, &NvdaNotConnected {});
        }
        if others.is_empty() {
            return;
        }

        fields.insert(ORIGIN_FIELD.to_string(), Value::from(id));
        let frame = match self.serializer.serialize(msg_type, &fields) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("client {id}: failed to re-encode '{msg_type}': {e}");
                return;
            }
        };
        for other in &others {
            self.push_frame(state, other.id, frame.clone());
        }
    }

    fn send_to<M: WireMessage>(&self, state: &RelayState, id: PeerId, payload: &M) {
        let frame = to_fields(payload)
            .and_then(|fields| self.serializer.serialize(M::TYPE.as_str(), &fields));
        match frame {
            Ok(frame) => self.push_frame(state, id, frame),
            Err(e) => warn!("failed to encode '{}' for client {id}: {e}", M::TYPE.as_str()),
        }
    }

    fn push_frame(&self, state: &RelayState, id: PeerId, frame: Vec<u8>) {
        let Some(entry) = state.peers.get(&id) else {
            return;
        };
        match entry.outbox.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("outbox of client {id} is full; dropping record")
            }
            Err(TrySendError::Closed(_)) => debug!("client {id} writer has exited"),
        }
    }
}

/// Records a controller sends on its own, without the user doing anything.
/// They never earn a `nvda_not_connected` reply.
fn is_background(msg_type: &str) -> bool {
    matches!(
        MessageType::from_wire(msg_type),
        Some(MessageType::Index | MessageType::SetBrailleInfo)
    )
}

/// A 7-digit key no occupied channel uses.
fn generate_key(channels: &ChannelRegistry) -> ChannelToken {
    loop {
        let n = Uuid::new_v4().as_u128() % 9_000_000 + 1_000_000;
        let key = ChannelToken::from(n.to_string());
        if !channels.is_occupied(&key) {
            return key;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Client {
        id: PeerId,
        inbox: mpsc::Receiver<Vec<u8>>,
    }

    impl Client {
        fn connect(service: &RelayService) -> Self {
            let (tx, inbox) = mpsc::channel(16);
            Self {
                id: service.connect(tx),
                inbox,
            }
        }

        fn send(&self, service: &RelayService, record: Value) -> Disposition {
            service.handle_line(self.id, record.to_string().as_bytes())
        }

        fn received(&mut self) -> Vec<Value> {
            let mut records = Vec::new();
            while let Ok(frame) = self.inbox.try_recv() {
                assert_eq!(frame.last(), Some(&b'\n'));
                records.push(serde_json::from_slice(&frame).unwrap());
            }
            records
        }
    }

    fn join(service: &RelayService, client: &Client, channel: &str, role: &str) {
        client.send(
            service,
            json!({"type": "join", "channel": channel, "connection_type": role}),
        );
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let service = RelayService::new(RelayConfig::default());
        let a = Client::connect(&service);
        let b = Client::connect(&service);
        assert!(b.id > a.id);
        assert_eq!(service.client_count(), 2);
    }

    #[test]
    fn test_matching_protocol_version_is_accepted_silently() {
        let service = RelayService::new(RelayConfig::default());
        let mut client = Client::connect(&service);

        let disposition = client.send(&service, json!({"type": "protocol_version", "version": 2}));

        assert_eq!(disposition, Disposition::Continue);
        assert!(client.received().is_empty());
    }

    #[test]
    fn test_wrong_protocol_version_gets_mismatch_and_disconnect() {
        // Arrange
        let service = RelayService::new(RelayConfig::default());
        let mut client = Client::connect(&service);

        // Act
        let disposition = client.send(&service, json!({"type": "protocol_version", "version": 1}));

        // Assert
        assert_eq!(disposition, Disposition::Disconnect);
        assert_eq!(client.received(), vec![json!({"type": "version_mismatch"})]);
    }

    #[test]
    fn test_join_announces_membership_both_ways() {
        // Arrange
        let service = RelayService::new(RelayConfig::default());
        let mut controlled = Client::connect(&service);
        let mut controller = Client::connect(&service);
        join(&service, &controlled, "abc", "controlled");
        controlled.received();

        // Act
        join(&service, &controller, "abc", "controller");

        // Assert
        assert_eq!(
            controller.received(),
            vec![json!({
                "type": "channel_joined",
                "channel": "abc",
                "user_ids": [controlled.id],
                "clients": [{"id": controlled.id, "connection_type": "controlled"}],
            })]
        );
        assert_eq!(
            controlled.received(),
            vec![json!({
                "type": "client_joined",
                "user_id": controller.id,
                "client": {"id": controller.id, "connection_type": "controller"},
            })]
        );
        assert_eq!(
            service.channel_members(&ChannelToken::from("abc")),
            vec![controlled.id, controller.id]
        );
    }

    #[test]
    fn test_records_are_forwarded_with_origin_to_other_members_only() {
        let service = RelayService::new(RelayConfig::default());
        let mut controlled = Client::connect(&service);
        let mut controller = Client::connect(&service);
        let mut stranger = Client::connect(&service);
        join(&service, &controlled, "abc", "controlled");
        join(&service, &controller, "abc", "controller");
        join(&service, &stranger, "other", "controlled");
        controlled.received();
        controller.received();
        stranger.received();

        controlled.send(&service, json!({"type": "speak", "sequence": ["Hello"]}));

        assert_eq!(
            controller.received(),
            vec![json!({"type": "speak", "sequence": ["Hello"], "origin": controlled.id})]
        );
        assert!(controlled.received().is_empty());
        assert!(stranger.received().is_empty());
    }

    #[test]
    fn test_unknown_record_types_are_forwarded_too() {
        let service = RelayService::new(RelayConfig::default());
        let controlled = Client::connect(&service);
        let mut controller = Client::connect(&service);
        join(&service, &controlled, "abc", "controlled");
        join(&service, &controller, "abc", "controller");
        controller.received();

        controlled.send(&service, json!({"type": "future_feature", "x": 1}));

        assert_eq!(controller.received()[0]["type"], "future_feature");
    }

    #[test]
    fn test_lonely_controller_is_told_nobody_is_controlled() {
        let service = RelayService::new(RelayConfig::default());
        let mut controller = Client::connect(&service);
        join(&service, &controller, "abc", "controller");
        controller.received();

        controller.send(&service, json!({"type": "key", "vk_code": 65, "pressed": true}));

        assert_eq!(controller.received(), vec![json!({"type": "nvda_not_connected"})]);
    }

    #[test]
    fn test_lonely_controller_background_records_get_no_reply() {
        // Arrange
        let service = RelayService::new(RelayConfig::default());
        let mut controller = Client::connect(&service);
        join(&service, &controller, "abc", "controller");
        controller.received();

        // Act
        controller.send(&service, json!({"type": "index", "index": 3}));
        controller.send(
            &service,
            json!({"type": "set_braille_info", "name": "noBraille", "numCells": 0}),
        );

        // Assert
        assert!(controller.received().is_empty());
    }

    #[test]
    fn test_records_before_join_are_dropped() {
        let service = RelayService::new(RelayConfig::default());
        let mut a = Client::connect(&service);

        let disposition = a.send(&service, json!({"type": "speak", "sequence": []}));

        assert_eq!(disposition, Disposition::Continue);
        assert!(a.received().is_empty());
    }

    #[test]
    fn test_generated_key_has_seven_digits() {
        let service = RelayService::new(RelayConfig::default());
        let mut client = Client::connect(&service);

        client.send(&service, json!({"type": "generate_key"}));

        let reply = client.received();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0]["type"], "generate_key");
        let key = reply[0]["key"].as_str().unwrap();
        assert_eq!(key.len(), 7);
        assert!(key.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_disconnect_announces_client_left() {
        // Arrange
        let service = RelayService::new(RelayConfig::default());
        let mut controlled = Client::connect(&service);
        let controller = Client::connect(&service);
        join(&service, &controlled, "abc", "controlled");
        join(&service, &controller, "abc", "controller");
        controlled.received();

        // Act
        service.disconnect(controller.id);

        // Assert
        assert_eq!(
            controlled.received(),
            vec![json!({
                "type": "client_left",
                "user_id": controller.id,
                "client": {"id": controller.id, "connection_type": "controller"},
            })]
        );
        assert_eq!(
            service.channel_members(&ChannelToken::from("abc")),
            vec![controlled.id]
        );
    }

    #[test]
    fn test_joining_another_channel_leaves_the_first() {
        let service = RelayService::new(RelayConfig::default());
        let mut a = Client::connect(&service);
        let b = Client::connect(&service);
        join(&service, &a, "one", "controlled");
        join(&service, &b, "one", "controller");
        a.received();

        join(&service, &b, "two", "controller");

        assert_eq!(a.received()[0]["type"], "client_left");
        assert_eq!(service.channel_members(&ChannelToken::from("one")), vec![a.id]);
        assert_eq!(service.channel_members(&ChannelToken::from("two")), vec![b.id]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let service = RelayService::new(RelayConfig::default());
        let a = Client::connect(&service);

        assert_eq!(service.handle_line(a.id, b"not json"), Disposition::Continue);
        assert_eq!(service.handle_line(a.id, b"{\"no\":1}"), Disposition::Continue);
        assert!(matches!(
            service.handle_record(a.id, Fields::new()),
            Err(RelayError::MissingType)
        ));
        assert!(matches!(
            service.handle_record(999, serde_json::from_str(r#"{"type":"cancel"}"#).unwrap()),
            Err(RelayError::UnknownPeer(999))
        ));
    }
}
