//! The seam between a session and the local assistive-technology host.
//!
//! A session never talks to a speech synthesizer, braille display or
//! keyboard directly.  It goes through a [`LocalEventSource`], which the
//! host application implements.  The trait has two directions:
//!
//! - **Actuation**: the session asks the host to do something locally
//!   (speak, beep, inject a key, ...).  These calls are fire-and-forget; a
//!   failure is returned as a [`LocalEventError`] and logged by the session,
//!   never sent back over the wire.
//!
//! - **Capture**: while a remote peer is attached, the session asks the host
//!   to intercept some of its output ([`Interception`]).  Intercepted output
//!   is published on the host's capture [`CallbackManager`] under the event
//!   names in [`capture`], with the same field layout as the matching wire
//!   payload, so the session can forward it unchanged.

use std::sync::Arc;

use remote_core::protocol::messages::{GestureDescriptor, Key, SetBrailleInfo, SpeechItem, Tone};
use remote_core::CallbackManager;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Event names published on [`LocalEventSource::captures`].
pub mod capture {
    /// Speech the host was about to speak. Fields: `sequence`.
    pub const SPEAK: &str = "speak";
    /// The host cancelled speech. No fields.
    pub const CANCEL_SPEECH: &str = "cancel_speech";
    /// A tone. Fields: `hz`, `length`, `left`, `right`.
    pub const BEEP: &str = "beep";
    /// A wave file. Fields: `fileName`, `async`.
    pub const WAVE: &str = "wave";
    /// Cells the host wrote to its (virtual) braille display. Fields: `cells`.
    pub const BRAILLE_CELLS: &str = "braille_cells";
    /// An input gesture the host would have executed. Fields: gesture attributes.
    pub const EXECUTE_GESTURE: &str = "execute_gesture";
    /// The local braille display changed. No fields.
    pub const SET_DISPLAY: &str = "set_display";
}

/// Error type for local event source operations.
#[derive(Debug, Error)]
pub enum LocalEventError {
    /// The device or service behind the call is not available right now.
    #[error("local device unavailable: {0}")]
    Unavailable(String),
    /// The host does not implement this operation.
    #[error("operation not supported by this host: {0}")]
    Unsupported(&'static str),
    /// The host reported a failure.
    #[error("host error: {0}")]
    Host(String),
}

/// Host subsystems a session can ask to have intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interception {
    /// Speech, cancel, tones and waves (controlled side).
    SpeechOutput,
    /// Braille cell output (controlled side).
    BrailleOutput,
    /// Locally typed gestures are captured instead of executed (controller side).
    InputGestures,
    /// Braille display selection changes (controller side).
    BrailleDisplay,
}

/// Audible session feedback, played locally and never captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCue {
    PeerJoined,
    PeerLeft,
    Disconnected,
}

impl SessionCue {
    /// The tone that represents this cue.
    pub fn tone(self) -> Tone {
        match self {
            Self::PeerJoined | Self::Disconnected => Tone::new(1000, 300),
            Self::PeerLeft => Tone::new(108, 300),
        }
    }
}

/// Description of the local braille display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrailleDisplayInfo {
    pub name: String,
    pub description: String,
    pub num_cells: u32,
}

impl From<BrailleDisplayInfo> for SetBrailleInfo {
    fn from(info: BrailleDisplayInfo) -> Self {
        Self {
            name: info.name,
            description: info.description,
            num_cells: info.num_cells,
        }
    }
}

/// A script resolved from an input gesture: the scriptable object's module,
/// class and script name, as the host names them.
pub type ScriptPath = Vec<Value>;

/// Supplies the synthesizer index the host should report instead of its own.
pub type IndexProvider = Arc<dyn Fn() -> Option<i64> + Send + Sync>;

/// Everything a session needs from the local host.
///
/// Implementations must be callable from any thread.
pub trait LocalEventSource: Send + Sync {
    // ── Actuation ─────────────────────────────────────────────────────────────

    fn speak(&self, sequence: &[SpeechItem]) -> Result<(), LocalEventError>;

    fn cancel_speech(&self) -> Result<(), LocalEventError>;

    fn beep(&self, tone: &Tone) -> Result<(), LocalEventError>;

    /// Plays a wave file.  `asynchronous = false` blocks until playback ends.
    fn play_wave(&self, file_name: &str, asynchronous: bool) -> Result<(), LocalEventError>;

    fn write_braille_cells(&self, cells: &[u8]) -> Result<(), LocalEventError>;

    fn inject_key(&self, key: &Key) -> Result<(), LocalEventError>;

    fn set_clipboard_text(&self, text: &str) -> Result<(), LocalEventError>;

    /// Ctrl+Alt+Del.
    fn send_secure_attention_sequence(&self) -> Result<(), LocalEventError>;

    /// Executes a gesture received from a controller as if typed locally.
    fn execute_input_gesture(&self, gesture: &GestureDescriptor) -> Result<(), LocalEventError>;

    // ── Braille display ───────────────────────────────────────────────────────

    /// The local display, or `None` when no display is connected.
    fn braille_display(&self) -> Option<BrailleDisplayInfo>;

    /// Overrides the size of the local virtual display with the remote one.
    /// Zero disables braille output.
    fn set_braille_display_size(&self, num_cells: u32) -> Result<(), LocalEventError>;

    // ── Queries ───────────────────────────────────────────────────────────────

    /// The last index reached by the local synthesizer, if any.
    fn last_spoken_index(&self) -> Option<i64>;

    /// Finds the script a gesture is bound to, for forwarding.
    fn resolve_script_path(&self, gesture: &GestureDescriptor) -> Option<ScriptPath>;

    // ── Feedback ──────────────────────────────────────────────────────────────

    /// Shows or speaks a short message to the local user.
    fn notify_user(&self, message: &str);

    fn play_cue(&self, cue: SessionCue);

    // ── Capture ───────────────────────────────────────────────────────────────

    /// Where intercepted output is published.
    fn captures(&self) -> &CallbackManager;

    fn set_interception(&self, kind: Interception, active: bool);

    /// Installs (or with `None`, removes) the provider consulted instead of
    /// the local synthesizer's own index.
    fn set_index_provider(&self, provider: Option<IndexProvider>);
}

/// Logs a failed actuation.  Used by the sessions at every call site.
pub(crate) fn log_failure(operation: &str, result: Result<(), LocalEventError>) {
    if let Err(e) = result {
        warn!("local {operation} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cue_tones() {
        assert_eq!(SessionCue::PeerJoined.tone(), Tone::new(1000, 300));
        assert_eq!(SessionCue::PeerLeft.tone(), Tone::new(108, 300));
    }

    #[test]
    fn test_display_info_converts_to_wire_payload() {
        let info = BrailleDisplayInfo {
            name: "focus40".into(),
            description: "Focus 40 Blue".into(),
            num_cells: 40,
        };
        let payload: SetBrailleInfo = info.into();
        assert_eq!(payload.num_cells, 40);
        assert_eq!(payload.name, "focus40");
    }
}
