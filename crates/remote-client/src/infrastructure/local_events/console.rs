//! A headless host that logs what a session asks of it.
//!
//! `ConsoleEventSource` backs the `remote-client` binary when no assistive
//! technology is attached: every actuation becomes an `info!` line, and
//! nothing is ever captured because there is no local output to divert.
//! It is useful for watching a session's traffic end to end.

use remote_core::protocol::messages::{GestureDescriptor, Key, SpeechItem, Tone};
use remote_core::CallbackManager;
use tracing::{debug, info};

use crate::application::local_events::{
    BrailleDisplayInfo, IndexProvider, Interception, LocalEventError, LocalEventSource,
    ScriptPath, SessionCue,
};

#[derive(Default)]
pub struct ConsoleEventSource {
    captures: CallbackManager,
    display: Option<BrailleDisplayInfo>,
}

impl ConsoleEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends a braille display of `num_cells` cells is attached.
    pub fn with_braille_cells(mut self, num_cells: u32) -> Self {
        self.display = (num_cells > 0).then(|| BrailleDisplayInfo {
            name: "console".to_string(),
            description: "Console braille log".to_string(),
            num_cells,
        });
        self
    }
}

impl LocalEventSource for ConsoleEventSource {
    fn speak(&self, sequence: &[SpeechItem]) -> Result<(), LocalEventError> {
        let text: Vec<&str> = sequence.iter().filter_map(SpeechItem::text).collect();
        info!("speak: {}", text.join(" "));
        Ok(())
    }

    fn cancel_speech(&self) -> Result<(), LocalEventError> {
        info!("cancel speech");
        Ok(())
    }

    fn beep(&self, tone: &Tone) -> Result<(), LocalEventError> {
        info!("beep {} Hz for {} ms", tone.hz, tone.length);
        Ok(())
    }

    fn play_wave(&self, file_name: &str, asynchronous: bool) -> Result<(), LocalEventError> {
        info!("play wave {file_name} (async: {asynchronous})");
        Ok(())
    }

    fn write_braille_cells(&self, cells: &[u8]) -> Result<(), LocalEventError> {
        info!("braille cells: {cells:?}");
        Ok(())
    }

    fn inject_key(&self, key: &Key) -> Result<(), LocalEventError> {
        info!(
            "key vk={:?} scan={:?} extended={} pressed={}",
            key.vk_code, key.scan_code, key.extended, key.pressed
        );
        Ok(())
    }

    fn set_clipboard_text(&self, text: &str) -> Result<(), LocalEventError> {
        info!("clipboard set ({} chars)", text.chars().count());
        Ok(())
    }

    fn send_secure_attention_sequence(&self) -> Result<(), LocalEventError> {
        Err(LocalEventError::Unsupported("secure attention sequence"))
    }

    fn execute_input_gesture(&self, gesture: &GestureDescriptor) -> Result<(), LocalEventError> {
        info!(
            "execute gesture {} (script: {:?})",
            gesture.attribute("id").unwrap_or("<unnamed>"),
            gesture.script_path
        );
        Ok(())
    }

    fn braille_display(&self) -> Option<BrailleDisplayInfo> {
        self.display.clone()
    }

    fn set_braille_display_size(&self, num_cells: u32) -> Result<(), LocalEventError> {
        info!("remote braille display has {num_cells} cells");
        Ok(())
    }

    fn last_spoken_index(&self) -> Option<i64> {
        None
    }

    fn resolve_script_path(&self, _gesture: &GestureDescriptor) -> Option<ScriptPath> {
        None
    }

    fn notify_user(&self, message: &str) {
        info!("notice: {message}");
    }

    fn play_cue(&self, cue: SessionCue) {
        let tone = cue.tone();
        info!("cue {cue:?} ({} Hz)", tone.hz);
    }

    fn captures(&self) -> &CallbackManager {
        &self.captures
    }

    fn set_interception(&self, kind: Interception, active: bool) {
        debug!("interception {kind:?} -> {active}");
    }

    fn set_index_provider(&self, provider: Option<IndexProvider>) {
        debug!("index provider installed: {}", provider.is_some());
    }
}
