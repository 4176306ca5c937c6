//! Remote session message types.
//!
//! Every record carries a `type` string; the rest of its fields depend on
//! that type.  The structs below give each known type a typed view.  Most
//! use `#[serde(default)]`: a peer running a slightly different build may
//! omit a field, and the receiver should fall back to a sensible value rather
//! than drop the record.
//!
//! Field names follow the established wire format exactly, including its
//! camelCase outliers (`numCells`, `fileName`, `scriptPath`) and the upper
//! case `send_SAS` type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ChannelToken, ConnectionType, PeerId};
use crate::protocol::codec::{Fields, TYPE_FIELD};

/// Current protocol version.  Peers announce it first on every connection.
pub const PROTOCOL_VERSION: u32 = 2;

/// Field a relay or point-to-point peer adds to say who sent a record.
pub const ORIGIN_FIELD: &str = "origin";

/// Prefix that turns a wire `type` into a callback event name.
pub const MESSAGE_EVENT_PREFIX: &str = "msg_";

/// Returns the callback event name for a wire type (`speak` → `msg_speak`).
pub fn message_event(msg_type: &str) -> String {
    format!("{MESSAGE_EVENT_PREFIX}{msg_type}")
}

/// All message types understood by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Handshake and membership
    ProtocolVersion,
    Join,
    GenerateKey,
    ClientJoined,
    ClientLeft,
    ChannelJoined,
    VersionMismatch,
    NvdaNotConnected,
    // Controller → controlled
    Key,
    Index,
    ExecuteGesture,
    SendSas,
    SendBrailleInfo,
    SendingBraille,
    // Controlled → controller
    Speak,
    Cancel,
    Tone,
    Wave,
    BrailleWriteCells,
    SetBrailleInfo,
    // Either direction
    SetClipboardText,
}

impl MessageType {
    /// Every variant, in declaration order.
    pub const ALL: [MessageType; 21] = [
        Self::ProtocolVersion,
        Self::Join,
        Self::GenerateKey,
        Self::ClientJoined,
        Self::ClientLeft,
        Self::ChannelJoined,
        Self::VersionMismatch,
        Self::NvdaNotConnected,
        Self::Key,
        Self::Index,
        Self::ExecuteGesture,
        Self::SendSas,
        Self::SendBrailleInfo,
        Self::SendingBraille,
        Self::Speak,
        Self::Cancel,
        Self::Tone,
        Self::Wave,
        Self::BrailleWriteCells,
        Self::SetBrailleInfo,
        Self::SetClipboardText,
    ];

    /// The wire `type` string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolVersion => "protocol_version",
            Self::Join => "join",
            Self::GenerateKey => "generate_key",
            Self::ClientJoined => "client_joined",
            Self::ClientLeft => "client_left",
            Self::ChannelJoined => "channel_joined",
            Self::VersionMismatch => "version_mismatch",
            Self::NvdaNotConnected => "nvda_not_connected",
            Self::Key => "key",
            Self::Index => "index",
            Self::ExecuteGesture => "execute_gesture",
            Self::SendSas => "send_SAS",
            Self::SendBrailleInfo => "send_braille_info",
            Self::SendingBraille => "sending_braille",
            Self::Speak => "speak",
            Self::Cancel => "cancel",
            Self::Tone => "tone",
            Self::Wave => "wave",
            Self::BrailleWriteCells => "braille_write_cells",
            Self::SetBrailleInfo => "set_braille_info",
            Self::SetClipboardText => "set_clipboard_text",
        }
    }

    /// Looks up a wire `type` string.  Unknown types return `None`; they are
    /// still dispatched by name, just not typed.
    pub fn from_wire(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// The callback event name a received record of this type is routed to.
    pub fn event(self) -> String {
        message_event(self.as_str())
    }
}

/// Binds a payload struct to the message type it travels as.
pub trait WireMessage: Serialize {
    const TYPE: MessageType;
}

macro_rules! wire_message {
    ($($payload:ty => $variant:ident),* $(,)?) => {
        $(impl WireMessage for $payload {
            const TYPE: MessageType = MessageType::$variant;
        })*
    };
}

// ── Handshake and membership ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolVersion {
    pub version: u32,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub channel: ChannelToken,
    pub connection_type: ConnectionType,
}

/// Sent empty to request a fresh pairing key; the relay answers with `key`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ChannelToken>,
}

/// Describes one member of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<ConnectionType>,
}

/// Payload of both `client_joined` and `client_left`.
///
/// Relays send `user_id` and usually a `client` block; point-to-point peers
/// only send `client`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientMembership {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
}

impl ClientMembership {
    pub fn for_client(client: ClientInfo) -> Self {
        Self {
            user_id: Some(client.id),
            client: Some(client),
        }
    }

    /// The peer this record is about, preferring `user_id`.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.user_id.or_else(|| self.client.as_ref().map(|c| c.id))
    }

    pub fn connection_type(&self) -> Option<ConnectionType> {
        self.client.as_ref().and_then(|c| c.connection_type)
    }
}

/// `client_joined`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientJoined(pub ClientMembership);

/// `client_left`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientLeft(pub ClientMembership);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelJoined {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelToken>,
    pub user_ids: Vec<PeerId>,
    pub clients: Vec<ClientInfo>,
}

impl ChannelJoined {
    /// Every peer id mentioned, `user_ids` first, without duplicates.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids = self.user_ids.clone();
        for client in &self.clients {
            if !ids.contains(&client.id) {
                ids.push(client.id);
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMismatch {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NvdaNotConnected {}

// ── Controller → controlled ───────────────────────────────────────────────────

/// A key transition to inject on the controlled machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Key {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vk_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_code: Option<u32>,
    pub extended: bool,
    pub pressed: bool,
}

/// Last synthesizer index reached on the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Index {
    pub index: Option<i64>,
}

/// An input gesture forwarded for execution on the controlled machine.
///
/// Only `scriptPath` is interpreted here; every other attribute the host
/// produced (source, id, identifiers, dots, space, routingIndex, ...) is
/// carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GestureDescriptor {
    #[serde(
        rename = "scriptPath",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub script_path: Option<Vec<Value>>,
    #[serde(flatten)]
    pub attributes: Fields,
}

impl GestureDescriptor {
    /// Removes the record-level keys (`type`, `origin`) a received record
    /// carries alongside the gesture's own attributes.
    pub fn strip_routing(mut self) -> Self {
        self.attributes.remove(TYPE_FIELD);
        self.attributes.remove(ORIGIN_FIELD);
        self
    }

    /// Reads a string attribute such as `source` or `id`.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendSas {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendBrailleInfo {}

/// Whether the controller wants braille cells mirrored to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendingBraille {
    pub state: bool,
}

impl Default for SendingBraille {
    fn default() -> Self {
        Self { state: true }
    }
}

// ── Controlled → controller ───────────────────────────────────────────────────

/// One element of a speech sequence: text, or a marker the synthesizer
/// reports back when it reaches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpeechItem {
    Text(String),
    Index(i64),
    Other(Value),
}

impl SpeechItem {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for SpeechItem {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Speak {
    pub sequence: Vec<SpeechItem>,
}

impl Speak {
    pub fn text(items: &[&str]) -> Self {
        Self {
            sequence: items.iter().map(|s| SpeechItem::from(*s)).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cancel {}

/// A beep: frequency, duration and stereo volumes (0-100).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tone {
    pub hz: u32,
    pub length: u32,
    pub left: u32,
    pub right: u32,
}

impl Default for Tone {
    fn default() -> Self {
        Self {
            hz: 440,
            length: 100,
            left: 50,
            right: 50,
        }
    }
}

impl Tone {
    pub fn new(hz: u32, length: u32) -> Self {
        Self {
            hz,
            length,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wave {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "async")]
    pub asynchronous: bool,
}

impl Default for Wave {
    fn default() -> Self {
        Self {
            file_name: String::new(),
            asynchronous: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrailleWriteCells {
    pub cells: Vec<u8>,
}

/// Describes the braille display on the sending side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetBrailleInfo {
    pub name: String,
    pub description: String,
    #[serde(rename = "numCells")]
    pub num_cells: u32,
}

// ── Either direction ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetClipboardText {
    pub text: String,
}

wire_message! {
    ProtocolVersion => ProtocolVersion,
    Join => Join,
    GenerateKey => GenerateKey,
    ClientJoined => ClientJoined,
    ClientLeft => ClientLeft,
    ChannelJoined => ChannelJoined,
    VersionMismatch => VersionMismatch,
    NvdaNotConnected => NvdaNotConnected,
    Key => Key,
    Index => Index,
    GestureDescriptor => ExecuteGesture,
    SendSas => SendSas,
    SendBrailleInfo => SendBrailleInfo,
    SendingBraille => SendingBraille,
    Speak => Speak,
    Cancel => Cancel,
    Tone => Tone,
    Wave => Wave,
    BrailleWriteCells => BrailleWriteCells,
    SetBrailleInfo => SetBrailleInfo,
    SetClipboardText => SetClipboardText,
}
