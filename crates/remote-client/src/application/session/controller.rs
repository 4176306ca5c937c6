//! The controlling side of a session.
//!
//! # How it works (for beginners)
//!
//! The controller is the machine whose user drives the remote one.  Local
//! input gestures are captured (instead of being executed locally) and sent
//! as `execute_gesture` records.  What the remote machine produces in return
//! (speech, tones, waves, braille cells) is played back here.
//!
//! While the transport is connected a small background task polls the local
//! synthesizer's last spoken index and sends it whenever it changes, so the
//! controlled machine can report speech progress as if it were its own.
//!
//! ```text
//!  local keyboard ──capture──▶ execute_gesture ──▶ controlled machine
//!  local speaker  ◀── speak / tone / wave ◀──────── controlled machine
//!  synthesizer    ──poll────▶ index ────────────▶ controlled machine
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use remote_core::protocol::codec::from_fields;
use remote_core::protocol::messages::{
    BrailleWriteCells, ChannelJoined, ClientJoined, ClientLeft, GestureDescriptor, Index, Key,
    SendSas, SendingBraille, SetBrailleInfo, SetClipboardText, Speak, Tone, Wave,
};
use remote_core::{events, CallbackError, ConnectionType, Fields, MessageType, PeerId};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{bind, BindingTable, SessionLink, SessionLinkExt};
use crate::application::local_events::{
    capture, log_failure, Interception, LocalEventSource, SessionCue,
};

/// Shown to the user when the relay reports that nobody is being controlled.
pub const NOT_CONNECTED_NOTICE: &str = "Remote NVDA not connected.";

/// Default period between synthesizer index polls.
pub const DEFAULT_INDEX_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shortest accepted poll period; shorter values, zero included, are raised to it.
pub const MIN_INDEX_POLL_INTERVAL: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables for a [`ControllerSession`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub index_poll_interval: Duration,
    /// Start with remote speech, tones and waves silenced.
    pub muted: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            index_poll_interval: DEFAULT_INDEX_POLL_INTERVAL,
            muted: false,
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    peers: BTreeSet<PeerId>,
    bindings_installed: bool,
}

struct ControllerInner {
    link: Arc<dyn SessionLink>,
    source: Arc<dyn LocalEventSource>,
    state: Mutex<ControllerState>,
    index_poll: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    muted: AtomicBool,
    receiving_braille: AtomicBool,
    captures: BindingTable,
}

/// Session endpoint for the controlling machine.
pub struct ControllerSession {
    inner: Arc<ControllerInner>,
    wire: BindingTable,
}

impl ControllerSession {
    pub fn new(link: Arc<dyn SessionLink>, source: Arc<dyn LocalEventSource>) -> Self {
        Self::with_options(link, source, ControllerOptions::default())
    }

    pub fn with_options(
        link: Arc<dyn SessionLink>,
        source: Arc<dyn LocalEventSource>,
        options: ControllerOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ControllerInner>| {
            let captures = BindingTable::default()
                .with(
                    capture::EXECUTE_GESTURE,
                    bind(weak, ControllerInner::forward_gesture),
                )
                .with(
                    capture::SET_DISPLAY,
                    bind(weak, |s: &ControllerInner, _| {
                        s.send_braille_info();
                        Ok(())
                    }),
                );

            ControllerInner {
                link,
                source,
                state: Mutex::new(ControllerState::default()),
                index_poll: Mutex::new(None),
                poll_interval: options.index_poll_interval.max(MIN_INDEX_POLL_INTERVAL),
                muted: AtomicBool::new(options.muted),
                receiving_braille: AtomicBool::new(true),
                captures,
            }
        });

        let weak = Arc::downgrade(&inner);
        let wire = BindingTable::default()
            .with(MessageType::Speak.event(), bind(&weak, ControllerInner::on_speak))
            .with(MessageType::Cancel.event(), bind(&weak, ControllerInner::on_cancel))
            .with(MessageType::Tone.event(), bind(&weak, ControllerInner::on_tone))
            .with(MessageType::Wave.event(), bind(&weak, ControllerInner::on_wave))
            .with(
                MessageType::BrailleWriteCells.event(),
                bind(&weak, ControllerInner::on_braille_write_cells),
            )
            .with(
                MessageType::SetClipboardText.event(),
                bind(&weak, ControllerInner::on_set_clipboard_text),
            )
            .with(
                MessageType::SendBrailleInfo.event(),
                bind(&weak, |s: &ControllerInner, _| {
                    s.send_braille_info();
                    Ok(())
                }),
            )
            .with(
                MessageType::ClientJoined.event(),
                bind(&weak, ControllerInner::on_client_joined),
            )
            .with(
                MessageType::ChannelJoined.event(),
                bind(&weak, ControllerInner::on_channel_joined),
            )
            .with(
                MessageType::ClientLeft.event(),
                bind(&weak, ControllerInner::on_client_left),
            )
            .with(
                MessageType::NvdaNotConnected.event(),
                bind(&weak, ControllerInner::on_nvda_not_connected),
            )
            .with(
                events::TRANSPORT_CONNECTED,
                bind(&weak, |s: &ControllerInner, _| {
                    s.start_index_poll();
                    Ok(())
                }),
            )
            .with(
                events::TRANSPORT_DISCONNECTED,
                bind(&weak, ControllerInner::on_transport_disconnected),
            )
            .with(
                events::TRANSPORT_CLOSING,
                bind(&weak, |s: &ControllerInner, _| {
                    s.stop_index_poll();
                    s.remove_bindings_and_peers();
                    Ok(())
                }),
            );
        wire.register(inner.link.callbacks());

        if inner.link.is_connected() {
            inner.start_index_poll();
        }

        Self { inner, wire }
    }

    /// Sends a raw key event to the controlled machine.
    pub fn send_key(&self, key: &Key) {
        self.inner.link.send_message(key);
    }

    pub fn send_clipboard_text(&self, text: &str) {
        self.inner.link.send_message(&SetClipboardText {
            text: text.to_string(),
        });
    }

    /// Asks the controlled machine to emit its secure attention sequence.
    pub fn send_secure_attention_sequence(&self) {
        self.inner.link.send_message(&SendSas {});
    }

    /// Silences (or restores) remote speech, tones and waves.  Cancels are
    /// always honoured.
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::SeqCst);
        if muted {
            log_failure("speech cancel", self.inner.source.cancel_speech());
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    /// Starts or stops receiving remote braille and tells the controlled
    /// machine whether to keep forwarding cells.
    pub fn set_receiving_braille(&self, state: bool) {
        self.inner.receiving_braille.store(state, Ordering::SeqCst);
        self.inner.link.send_message(&SendingBraille { state });
    }

    pub fn is_receiving_braille(&self) -> bool {
        self.inner.receiving_braille.load(Ordering::SeqCst)
    }

    /// Controlled peers currently in the channel, ascending.
    pub fn known_peers(&self) -> Vec<PeerId> {
        lock(&self.inner.state).peers.iter().copied().collect()
    }

    pub fn bindings_installed(&self) -> bool {
        lock(&self.inner.state).bindings_installed
    }

    pub fn is_polling_index(&self) -> bool {
        lock(&self.inner.index_poll)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Unregisters every handler and stops the index poll.
    pub fn detach(&self) {
        self.wire.unregister(self.inner.link.callbacks());
        self.inner.stop_index_poll();
        self.inner.remove_bindings_and_peers();
    }
}

impl Drop for ControllerSession {
    fn drop(&mut self) {
        self.detach();
    }
}

impl ControllerInner {
    // ── Peer tracking ─────────────────────────────────────────────────────────

    fn peer_joined(&self, id: PeerId) {
        let newly_joined = {
            let mut state = lock(&self.state);
            let newly_joined = state.peers.insert(id);
            if !state.bindings_installed {
                self.install_bindings();
                state.bindings_installed = true;
            }
            newly_joined
        };
        if newly_joined {
            info!("controlled peer {id} attached");
            self.source.play_cue(SessionCue::PeerJoined);
        }
    }

    fn peer_left(&self, id: PeerId) {
        let was_known = {
            let mut state = lock(&self.state);
            let was_known = state.peers.remove(&id);
            if was_known && state.peers.is_empty() && state.bindings_installed {
                self.remove_bindings();
                state.bindings_installed = false;
            }
            was_known
        };
        if was_known {
            info!("controlled peer {id} detached");
            self.source.play_cue(SessionCue::PeerLeft);
        }
    }

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
        debug!("installing gesture capture");
        self.captures.register(self.source.captures());
        self.source.set_interception(Interception::InputGestures, true);
        self.source.set_interception(Interception::BrailleDisplay, true);
    }

    fn remove_bindings(&self) {
        debug!("removing gesture capture");
        self.source.set_interception(Interception::BrailleDisplay, false);
        self.source.set_interception(Interception::InputGestures, false);
        self.captures.unregister(self.source.captures());
    }

    // ── Index polling ─────────────────────────────────────────────────────────

    fn start_index_poll(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available; synthesizer index will not be sent");
            return;
        };
        let task = runtime.spawn(poll_index(
            Arc::clone(&self.link),
            Arc::clone(&self.source),
            self.poll_interval,
        ));
        if let Some(previous) = lock(&self.index_poll).replace(task) {
            previous.abort();
        }
    }

    fn stop_index_poll(&self) {
        if let Some(task) = lock(&self.index_poll).take() {
            task.abort();
        }
    }

    // ── Capture → wire ────────────────────────────────────────────────────────

    fn forward_gesture(&self, fields: &Fields) -> Result<(), CallbackError> {
        let mut gesture: GestureDescriptor = from_fields(fields)?;
        if gesture.script_path.is_none() {
            gesture.script_path = self.source.resolve_script_path(&gesture);
        }
        self.link.send_message(&gesture);
        Ok(())
    }

    fn send_braille_info(&self) {
        let info: SetBrailleInfo = self.source.braille_display().unwrap_or_default().into();
        self.link.send_message(&info);
    }

    // ── Wire → local ──────────────────────────────────────────────────────────

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn on_speak(&self, fields: &Fields) -> Result<(), CallbackError> {
        if self.is_muted() {
            return Ok(());
        }
        let Speak { sequence } = from_fields(fields)?;
        log_failure("speech", self.source.speak(&sequence));
        Ok(())
    }

    fn on_cancel(&self, _fields: &Fields) -> Result<(), CallbackError> {
        log_failure("speech cancel", self.source.cancel_speech());
        Ok(())
    }

    fn on_tone(&self, fields: &Fields) -> Result<(), CallbackError> {
        if self.is_muted() {
            return Ok(());
        }
        let tone: Tone = from_fields(fields)?;
        log_failure("tone", self.source.beep(&tone));
        Ok(())
    }

    fn on_wave(&self, fields: &Fields) -> Result<(), CallbackError> {
        if self.is_muted() {
            return Ok(());
        }
        let wave: Wave = from_fields(fields)?;
        if !Path::new(&wave.file_name).exists() {
            debug!("skipping wave '{}': no such local file", wave.file_name);
            return Ok(());
        }
        log_failure(
            "wave playback",
            self.source.play_wave(&wave.file_name, wave.asynchronous),
        );
        Ok(())
    }

    fn on_braille_write_cells(&self, fields: &Fields) -> Result<(), CallbackError> {
        if !self.receiving_braille.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(size) = self
            .source
            .braille_display()
            .map(|d| d.num_cells as usize)
            .filter(|n| *n > 0)
        else {
            return Ok(());
        };
        let BrailleWriteCells { mut cells } = from_fields(fields)?;
        if cells.len() > size {
            debug!("dropping {} braille cells for a {size}-cell display", cells.len());
            return Ok(());
        }
        cells.resize(size, 0);
        log_failure("braille output", self.source.write_braille_cells(&cells));
        Ok(())
    }

    fn on_set_clipboard_text(&self, fields: &Fields) -> Result<(), CallbackError> {
        let SetClipboardText { text } = from_fields(fields)?;
        log_failure("clipboard update", self.source.set_clipboard_text(&text));
        Ok(())
    }

    fn on_client_joined(&self, fields: &Fields) -> Result<(), CallbackError> {
        let ClientJoined(membership) = from_fields(fields)?;
        if membership.connection_type() == Some(ConnectionType::Controller) {
            return Ok(());
        }
        if let Some(id) = membership.peer_id() {
            self.peer_joined(id);
        }
        Ok(())
    }

    fn on_channel_joined(&self, fields: &Fields) -> Result<(), CallbackError> {
        let joined: ChannelJoined = from_fields(fields)?;
        let same_role: Vec<PeerId> = joined
            .clients
            .iter()
            .filter(|c| c.connection_type == Some(ConnectionType::Controller))
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

    fn on_nvda_not_connected(&self, _fields: &Fields) -> Result<(), CallbackError> {
        log_failure("speech cancel", self.source.cancel_speech());
        self.source.notify_user(NOT_CONNECTED_NOTICE);
        self.remove_bindings_and_peers();
        Ok(())
    }

    fn on_transport_disconnected(&self, _fields: &Fields) -> Result<(), CallbackError> {
        self.stop_index_poll();
        if self.remove_bindings_and_peers() {
            self.source.play_cue(SessionCue::Disconnected);
        }
        Ok(())
    }
}

/// Sends the local synthesizer's last spoken index whenever it changes,
/// including a change back to no index. Ends when the link disconnects.
async fn poll_index(
    link: Arc<dyn SessionLink>,
    source: Arc<dyn LocalEventSource>,
    period: Duration,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sent = None;

    loop {
        ticker.tick().await;
        if !link.is_connected() {
            debug!("index poll stopping: link disconnected");
            break;
        }
        let current = source.last_spoken_index();
        if current != last_sent {
            link.send_message(&Index { index: current });
            last_sent = current;
        }
    }
}
