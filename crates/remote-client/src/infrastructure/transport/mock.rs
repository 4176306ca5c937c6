//! In-memory session link for tests.
//!
//! [`MockLink`] stands in for a real transport underneath a session.  It
//! records every record the session sends and lets the test inject records
//! and lifecycle events as if they had come off the wire.
//!
//! # Usage in tests
//!
//! ```ignore
//! let link = Arc::new(MockLink::connected());
//! let session = ControlledSession::new(link.clone(), source.clone());
//!
//! link.deliver("channel_joined", json!({"user_ids": [7]}));
//!
//! assert_eq!(link.sent_of_type("speak").len(), 0);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use remote_core::protocol::messages::message_event;
use remote_core::{events, CallbackManager, Fields};
use serde_json::Value;

use crate::application::session::SessionLink;

/// A [`SessionLink`] that records sends instead of writing them anywhere.
#[derive(Default)]
pub struct MockLink {
    callbacks: CallbackManager,
    connected: AtomicBool,
    /// Every `(type, fields)` passed to `send`, including those dropped
    /// because the link was disconnected.
    pub attempted: Mutex<Vec<(String, Fields)>>,
    /// Every `(type, fields)` that a real transport would have enqueued.
    pub sent: Mutex<Vec<(String, Fields)>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A link that starts out connected, without publishing any event.
    pub fn connected() -> Self {
        let link = Self::default();
        link.connected.store(true, Ordering::SeqCst);
        link
    }

    /// Flips to connected and publishes `transport_connected`.
    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.callbacks
            .dispatch(events::TRANSPORT_CONNECTED, &Fields::new());
    }

    /// Flips to disconnected and publishes `transport_disconnected`.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.callbacks
                .dispatch(events::TRANSPORT_DISCONNECTED, &Fields::new());
        }
    }

    /// Publishes `transport_closing` and disconnects.
    pub fn close(&self) {
        self.callbacks
            .dispatch(events::TRANSPORT_CLOSING, &Fields::new());
        self.disconnect();
    }

    /// Dispatches a received record of `msg_type`.  `fields` must be a JSON
    /// object or `null`.
    pub fn deliver(&self, msg_type: &str, fields: Value) -> usize {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        self.callbacks.dispatch(&message_event(msg_type), &fields)
    }

    /// Fields of every enqueued record of `msg_type`, in order.
    pub fn sent_of_type(&self, msg_type: &str) -> Vec<Fields> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| t == msg_type)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Removes and returns everything enqueued so far.
    pub fn take_sent(&self) -> Vec<(String, Fields)> {
        std::mem::take(
            &mut *self
                .sent
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

impl SessionLink for MockLink {
    fn callbacks(&self) -> &CallbackManager {
        &self.callbacks
    }

    fn send(&self, msg_type: &str, fields: &Fields) {
        let record = (msg_type.to_string(), fields.clone());
        self.attempted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record.clone());
        if self.is_connected() {
            self.sent
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(record);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
