//! In-memory event source for unit and integration testing.
//!
//! # Why a recording source?
//!
//! A real host drives a speech synthesizer, a braille display and the
//! keyboard.  None of these exist on a CI machine, and none of them can be
//! observed from test code.
//!
//! [`RecordingEventSource`] replaces every actuation with an entry in an
//! ordered `Mutex<Vec<LocalCall>>`, and lets a test play the host's part
//! through the `host_*` helpers: "the user pressed a key", "the synthesizer
//! was about to speak".  Those helpers publish on the capture callbacks only
//! while the matching [`Interception`] is switched on, the same way a real
//! host only diverts output while a session asked it to.
//!
//! # Usage in tests
//!
//! ```ignore
//! let source = Arc::new(RecordingEventSource::new());
//! let session = ControlledSession::new(link.clone(), source.clone());
//!
//! link.deliver("client_joined", json!({"user_id": 1}));
//! source.host_speak(&["Hello"]);
//!
//! assert_eq!(link.sent_of_type("speak").len(), 1);
//! ```
//!
//! # Simulated failures
//!
//! [`fail_actuation`](RecordingEventSource::fail_actuation) makes every
//! actuation return [`LocalEventError::Host`] without recording anything.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use remote_core::protocol::codec::to_fields;
use remote_core::protocol::messages::{
    BrailleWriteCells, GestureDescriptor, Key, Speak, SpeechItem, Tone, Wave,
};
use remote_core::{CallbackManager, Fields};
use serde_json::Value;

use crate::application::local_events::{
    capture, BrailleDisplayInfo, IndexProvider, Interception, LocalEventError, LocalEventSource,
    ScriptPath, SessionCue,
};

/// One call a session made into the host.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalCall {
    Speak(Vec<SpeechItem>),
    CancelSpeech,
    Beep(Tone),
    PlayWave { file_name: String, asynchronous: bool },
    WriteBrailleCells(Vec<u8>),
    InjectKey(Key),
    SetClipboardText(String),
    SendSecureAttentionSequence,
    ExecuteInputGesture(GestureDescriptor),
    SetBrailleDisplaySize(u32),
    Notify(String),
    Cue(SessionCue),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`LocalEventSource`] that records instead of actuating.
#[derive(Default)]
pub struct RecordingEventSource {
    captures: CallbackManager,
    calls: Mutex<Vec<LocalCall>>,
    interceptions: Mutex<HashSet<Interception>>,
    index_provider: Mutex<Option<IndexProvider>>,
    display: Mutex<Option<BrailleDisplayInfo>>,
    spoken_index: Mutex<Option<i64>>,
    /// Script paths by gesture `id`.
    script_paths: Mutex<HashMap<String, ScriptPath>>,
    should_fail: AtomicBool,
}

impl RecordingEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<LocalCall> {
        lock(&self.calls).clone()
    }

    pub fn take_calls(&self) -> Vec<LocalCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    pub fn is_intercepting(&self, kind: Interception) -> bool {
        lock(&self.interceptions).contains(&kind)
    }

    /// The index the host's synthesizer would report right now: the
    /// installed provider's answer if a session installed one, otherwise the
    /// host's own.
    pub fn reported_index(&self) -> Option<i64> {
        let provider = lock(&self.index_provider).clone();
        match provider {
            Some(provider) => provider(),
            None => *lock(&self.spoken_index),
        }
    }

    // ── Host state ────────────────────────────────────────────────────────────

    pub fn set_display(&self, display: Option<BrailleDisplayInfo>) {
        *lock(&self.display) = display;
    }

    pub fn set_spoken_index(&self, index: Option<i64>) {
        *lock(&self.spoken_index) = index;
    }

    pub fn set_script_path(&self, gesture_id: &str, path: ScriptPath) {
        lock(&self.script_paths).insert(gesture_id.to_string(), path);
    }

    pub fn fail_actuation(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    // ── Host activity ─────────────────────────────────────────────────────────
    //
    // Each returns how many capture handlers saw the event (zero when the
    // matching interception is off).

    pub fn host_speak(&self, text: &[&str]) -> usize {
        self.publish(Interception::SpeechOutput, capture::SPEAK, &Speak::text(text))
    }

    pub fn host_cancel_speech(&self) -> usize {
        self.publish_fields(Interception::SpeechOutput, capture::CANCEL_SPEECH, Fields::new())
    }

    pub fn host_beep(&self, tone: &Tone) -> usize {
        self.publish(Interception::SpeechOutput, capture::BEEP, tone)
    }

    pub fn host_wave(&self, file_name: &str) -> usize {
        let wave = Wave {
            file_name: file_name.to_string(),
            ..Wave::default()
        };
        self.publish(Interception::SpeechOutput, capture::WAVE, &wave)
    }

    pub fn host_braille(&self, cells: &[u8]) -> usize {
        let payload = BrailleWriteCells {
            cells: cells.to_vec(),
        };
        self.publish(Interception::BrailleOutput, capture::BRAILLE_CELLS, &payload)
    }

    /// A gesture typed on the host.  Returns `true` if it was captured, in
    /// which case a real host would not execute it locally.
    pub fn host_gesture(&self, attributes: Value) -> bool {
        let fields = match attributes {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        self.publish_fields(Interception::InputGestures, capture::EXECUTE_GESTURE, fields) > 0
    }

    pub fn host_display_changed(&self) -> usize {
        self.publish_fields(Interception::BrailleDisplay, capture::SET_DISPLAY, Fields::new())
    }

    fn publish<T: serde::Serialize>(&self, kind: Interception, event: &str, payload: &T) -> usize {
        match to_fields(payload) {
            Ok(fields) => self.publish_fields(kind, event, fields),
            Err(_) => 0,
        }
    }

    fn publish_fields(&self, kind: Interception, event: &str, fields: Fields) -> usize {
        if !self.is_intercepting(kind) {
            return 0;
        }
        self.captures.dispatch(event, &fields)
    }

    fn record(&self, call: LocalCall) -> Result<(), LocalEventError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(LocalEventError::Host("simulated failure".into()));
        }
        lock(&self.calls).push(call);
        Ok(())
    }
}

impl LocalEventSource for RecordingEventSource {
    fn speak(&self, sequence: &[SpeechItem]) -> Result<(), LocalEventError> {
        self.record(LocalCall::Speak(sequence.to_vec()))
    }

    fn cancel_speech(&self) -> Result<(), LocalEventError> {
        self.record(LocalCall::CancelSpeech)
    }

    fn beep(&self, tone: &Tone) -> Result<(), LocalEventError> {
        self.record(LocalCall::Beep(tone.clone()))
    }

    fn play_wave(&self, file_name: &str, asynchronous: bool) -> Result<(), LocalEventError> {
        self.record(LocalCall::PlayWave {
            file_name: file_name.to_string(),
            asynchronous,
        })
    }

    fn write_braille_cells(&self, cells: &[u8]) -> Result<(), LocalEventError> {
        self.record(LocalCall::WriteBrailleCells(cells.to_vec()))
    }

    fn inject_key(&self, key: &Key) -> Result<(), LocalEventError> {
        self.record(LocalCall::InjectKey(key.clone()))
    }

    fn set_clipboard_text(&self, text: &str) -> Result<(), LocalEventError> {
        self.record(LocalCall::SetClipboardText(text.to_string()))
    }

    fn send_secure_attention_sequence(&self) -> Result<(), LocalEventError> {
        self.record(LocalCall::SendSecureAttentionSequence)
    }

    fn execute_input_gesture(&self, gesture: &GestureDescriptor) -> Result<(), LocalEventError> {
        self.record(LocalCall::ExecuteInputGesture(gesture.clone()))
    }

    fn braille_display(&self) -> Option<BrailleDisplayInfo> {
        lock(&self.display).clone()
    }

    fn set_braille_display_size(&self, num_cells: u32) -> Result<(), LocalEventError> {
        self.record(LocalCall::SetBrailleDisplaySize(num_cells))
    }

    fn last_spoken_index(&self) -> Option<i64> {
        *lock(&self.spoken_index)
    }

    fn resolve_script_path(&self, gesture: &GestureDescriptor) -> Option<ScriptPath> {
        let id = gesture.attribute("id")?;
        lock(&self.script_paths).get(id).cloned()
    }

    fn notify_user(&self, message: &str) {
        lock(&self.calls).push(LocalCall::Notify(message.to_string()));
    }

    fn play_cue(&self, cue: SessionCue) {
        lock(&self.calls).push(LocalCall::Cue(cue));
    }

    fn captures(&self) -> &CallbackManager {
        &self.captures
    }

    fn set_interception(&self, kind: Interception, active: bool) {
        let mut interceptions = lock(&self.interceptions);
        if active {
            interceptions.insert(kind);
        } else {
            interceptions.remove(&kind);
        }
    }

    fn set_index_provider(&self, provider: Option<IndexProvider>) {
        *lock(&self.index_provider) = provider;
    }
}
