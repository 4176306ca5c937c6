//! The controlled side of a session.
//!
//! While at least one controller is attached, local speech, cancels, tones,
//! waves and braille cells are captured and forwarded, and the local
//! synthesizer reports the controller's last index instead of its own.  The
//! capture bindings are installed when the first controller appears and
//! removed when the last one leaves or the transport closes.
//!
//! Inbound `key`, `execute_gesture`, `set_clipboard_text` and `send_SAS`
//! records are actuated locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use remote_core::protocol::codec::from_fields;
use remote_core::protocol::messages::{
    BrailleWriteCells, Cancel, ChannelJoined, ClientJoined, ClientLeft, GestureDescriptor, Index,
    Key, SendBrailleInfo, SendingBraille, SetBrailleInfo, SetClipboardText, Speak, Tone, Wave,
};
use remote_core::{events, CallbackError, ConnectionType, Fields, MessageType, PeerId, WireMessage};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{bind, BindingTable, SessionLink, SessionLinkExt};
use crate::application::local_events::{
    capture, log_failure, IndexProvider, Interception, LocalEventSource, SessionCue,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ControlledState {
    /// Attached controllers.  The flag is the peer's liveness.
    peers: HashMap<PeerId, bool>,
    bindings_installed: bool,
}

struct ControlledInner {
    link: Arc<dyn SessionLink>,
    source: Arc<dyn LocalEventSource>,
    state: Mutex<ControlledState>,
    last_controller_index: Arc<Mutex<Option<i64>>>,
    forward_braille: AtomicBool,
    captures: BindingTable,
    index_provider: IndexProvider,
}

/// Session endpoint for the machine being controlled.
pub struct ControlledSession {
    inner: Arc<ControlledInner>,
    wire: BindingTable,
}

impl ControlledSession {
    /// Binds `source` to `link` and starts listening for controllers.
    pub fn new(link: Arc<dyn SessionLink>, source: Arc<dyn LocalEventSource>) -> Self {
        let last_controller_index = Arc::new(Mutex::new(None));

        let inner = Arc::new_cyclic(|weak: &Weak<ControlledInner>| {
            let captures = BindingTable::default()
                .with(capture::SPEAK, bind(weak, ControlledInner::forward::<Speak>))
                .with(
                    capture::CANCEL_SPEECH,
                    bind(weak, |s: &ControlledInner, _| {
                        s.link.send_message(&Cancel {});
                        Ok(())
                    }),
                )
                .with(capture::BEEP, bind(weak, ControlledInner::forward::<Tone>))
                .with(capture::WAVE, bind(weak, ControlledInner::forward::<Wave>))
                .with(capture::BRAILLE_CELLS, bind(weak, ControlledInner::forward_cells));

            let reported = Arc::clone(&last_controller_index);
            let index_provider: IndexProvider = Arc::new(move || *lock(&reported));

            ControlledInner {
                link,
                source,
                state: Mutex::new(ControlledState::default()),
                last_controller_index,
                forward_braille: AtomicBool::new(true),
                captures,
                index_provider,
            }
        });

        let weak = Arc::downgrade(&inner);
        let wire = BindingTable::default()
            .with(
                MessageType::ClientJoined.event(),
                bind(&weak, ControlledInner::on_client_joined),
            )
            .with(
                MessageType::ChannelJoined.event(),
                bind(&weak, ControlledInner::on_channel_joined),
            )
            .with(
                MessageType::ClientLeft.event(),
                bind(&weak, ControlledInner::on_client_left),
            )
            .with(MessageType::Key.event(), bind(&weak, ControlledInner::on_key))
            .with(MessageType::Index.event(), bind(&weak, ControlledInner::on_index))
            .with(
                MessageType::SetClipboardText.event(),
                bind(&weak, ControlledInner::on_set_clipboard_text),
            )
            .with(MessageType::SendSas.event(), bind(&weak, ControlledInner::on_send_sas))
            .with(
                MessageType::ExecuteGesture.event(),
                bind(&weak, ControlledInner::on_execute_gesture),
            )
            .with(
                MessageType::SetBrailleInfo.event(),
                bind(&weak, ControlledInner::on_set_braille_info),
            )
            .with(
                MessageType::SendingBraille.event(),
                bind(&weak, ControlledInner::on_sending_braille),
            )
            .with(
                events::TRANSPORT_CLOSING,
                bind(&weak, ControlledInner::on_transport_closing),
            )
            .with(
                events::TRANSPORT_DISCONNECTED,
                bind(&weak, ControlledInner::on_transport_disconnected),
            );
        wire.register(inner.link.callbacks());

        Self { inner, wire }
    }

    /// Ids of the attached controllers, ascending.
    pub fn live_peers(&self) -> Vec<PeerId> {
        let state = lock(&self.inner.state);
        let mut peers: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, live)| **live)
            .map(|(id, _)| *id)
            .collect();
        peers.sort_unstable();
        peers
    }

    pub fn bindings_installed(&self) -> bool {
        lock(&self.inner.state).bindings_installed
    }

    /// The last synthesizer index a controller reported.
    pub fn last_controller_index(&self) -> Option<i64> {
        *lock(&self.inner.last_controller_index)
    }

    /// Whether captured braille cells are currently forwarded.
    pub fn forwarding_braille(&self) -> bool {
        self.inner.forward_braille.load(Ordering::SeqCst)
    }

    /// Asks the controller to describe its braille display; it answers with
    /// `set_braille_info`.
    pub fn request_braille_info(&self) {
        self.inner.link.send_message(&SendBrailleInfo {});
    }

    /// Pushes local clipboard text to the controller.
    pub fn send_clipboard_text(&self, text: &str) {
        self.inner.link.send_message(&SetClipboardText {
            text: text.to_string(),
        });
    }

    /// Unregisters every handler this session installed.  The session is
    /// inert afterwards.
    pub fn detach(&self) {
        self.wire.unregister(self.inner.link.callbacks());
        self.inner.remove_bindings_and_peers();
    }
}

impl Drop for ControlledSession {
    fn drop(&mut self) {
        self.detach();
    }
}

impl ControlledInner {
    // ── Peer tracking ─────────────────────────────────────────────────────────

    fn peer_joined(&self, id: PeerId) {
        let newly_joined = {
            let mut state = lock(&self.state);
            let newly_joined = state.peers.insert(id, true) != Some(true);
            if !state.bindings_installed {
                self.install_bindings();
                state.bindings_installed = true;
            }
            newly_joined
        };
        if newly_joined {
            info!("controller {id} attached");
            self.source.play_cue(SessionCue::PeerJoined);
        }
    }

    fn peer_left(&self, id: PeerId) {
        let was_known = {
            let mut state = lock(&self.state);
            let was_known = state.peers.remove(&id).is_some();
            if was_known && state.peers.is_empty() && state.bindings_installed {
                self.remove_bindings();
                state.bindings_installed = false;
            }
            was_known
        };
        if was_known {
            info!("controller {id} detached");
            self.source.play_cue(SessionCue::PeerLeft);
        }
    }

    /// Returns whether any peer was attached.
    fn remove_bindings_and_peers(&self) -> bool {
        let mut state = lock(&self.state);
        let had_peers = !state.peers.is_empty();
        state.peers.clear();
        if state.bindings_installed {
            self.remove_bindings();
            state.bindings_installed = false;
        }
        had_peers
    }

    fn install_bindings(&self) {
        debug!("installing capture bindings");
        self.captures.register(self.source.captures());
        self.source.set_interception(Interception::SpeechOutput, true);
        self.source.set_interception(Interception::BrailleOutput, true);
        self.source
            .set_index_provider(Some(Arc::clone(&self.index_provider)));
    }

    fn remove_bindings(&self) {
        debug!("removing capture bindings");
        self.source.set_index_provider(None);
        self.source.set_interception(Interception::BrailleOutput, false);
        self.source.set_interception(Interception::SpeechOutput, false);
        self.captures.unregister(self.source.captures());
    }

    // ── Capture → wire ────────────────────────────────────────────────────────

    fn forward<M>(&self, fields: &Fields) -> Result<(), CallbackError>
    where
        M: WireMessage + DeserializeOwned,
    {
        let payload: M = from_fields(fields)?;
        self.link.send_message(&payload);
        Ok(())
    }

    fn forward_cells(&self, fields: &Fields) -> Result<(), CallbackError> {
        if !self.forward_braille.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.forward::<BrailleWriteCells>(fields)
    }

    // ── Wire → local ──────────────────────────────────────────────────────────

    fn on_client_joined(&self, fields: &Fields) -> Result<(), CallbackError> {
        let ClientJoined(membership) = from_fields(fields)?;
        if membership.connection_type() == Some(ConnectionType::Controlled) {
            return Ok(());
        }
        match membership.peer_id() {
            Some(id) => self.peer_joined(id),
            None => debug!("client_joined without a peer id"),
        }
        Ok(())
    }

    fn on_channel_joined(&self, fields: &Fields) -> Result<(), CallbackError> {
        let joined: ChannelJoined = from_fields(fields)?;
        let same_role: Vec<PeerId> = joined
            .clients
            .iter()
            .filter(|c| c.connection_type == Some(ConnectionType::Controlled))
            .map(|c| c.id)
            .collect();
        for id in joined.peer_ids() {
            if !same_role.contains(&id) {
                self.peer_joined(id);
            }
        }
        Ok(())
    }

    fn on_client_left(&self, fields: &Fields) -> Result<(), CallbackError> {
        let ClientLeft(membership) = from_fields(fields)?;
        if let Some(id) = membership.peer_id() {
            self.peer_left(id);
        }
        Ok(())
    }

    fn on_key(&self, fields: &Fields) -> Result<(), CallbackError> {
        let key: Key = from_fields(fields)?;
        log_failure("key injection", self.source.inject_key(&key));
        Ok(())
    }

    fn on_index(&self, fields: &Fields) -> Result<(), CallbackError> {
        let Index { index } = from_fields(fields)?;
        // `null` means the controller's synthesizer has nothing in flight.
        *lock(&self.last_controller_index) = index;
        Ok(())
    }

    fn on_set_clipboard_text(&self, fields: &Fields) -> Result<(), CallbackError> {
        let SetClipboardText { text } = from_fields(fields)?;
        log_failure("clipboard update", self.source.set_clipboard_text(&text));
        Ok(())
    }

    fn on_send_sas(&self, _fields: &Fields) -> Result<(), CallbackError> {
        log_failure(
            "secure attention sequence",
            self.source.send_secure_attention_sequence(),
        );
        Ok(())
    }

    fn on_execute_gesture(&self, fields: &Fields) -> Result<(), CallbackError> {
        let gesture: GestureDescriptor = from_fields(fields)?;
        let gesture = gesture.strip_routing();
        log_failure("gesture execution", self.source.execute_input_gesture(&gesture));
        Ok(())
    }

    fn on_set_braille_info(&self, fields: &Fields) -> Result<(), CallbackError> {
        let info: SetBrailleInfo = from_fields(fields)?;
        debug!("controller braille display: {} ({} cells)", info.name, info.num_cells);
        log_failure(
            "braille display resize",
            self.source.set_braille_display_size(info.num_cells),
        );
        Ok(())
    }

    fn on_sending_braille(&self, fields: &Fields) -> Result<(), CallbackError> {
        let SendingBraille { state } = from_fields(fields)?;
        self.forward_braille.store(state, Ordering::SeqCst);
        Ok(())
    }

    fn on_transport_closing(&self, _fields: &Fields) -> Result<(), CallbackError> {
        self.remove_bindings_and_peers();
        Ok(())
    }

    fn on_transport_disconnected(&self, _fields: &Fields) -> Result<(), CallbackError> {
        if self.remove_bindings_and_peers() {
            self.source.play_cue(SessionCue::Disconnected);
        }
        Ok(())
    }
}
