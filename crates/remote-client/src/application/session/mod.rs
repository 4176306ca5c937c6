//! Session state machines for the two roles.
//!
//! A session ties one transport to one [`LocalEventSource`]:
//!
//! - [`ControlledSession`] mirrors local speech, tones, waves and braille to
//!   attached controllers and actuates the keys, gestures and clipboard
//!   changes they send.
//! - [`ControllerSession`] plays back what the controlled machine produces
//!   and forwards local gestures to it.
//!
//! Both install two tables of handlers.  The **wire table** is registered on
//! the transport's callbacks at construction and stays for the session's
//! lifetime.  The **capture table** is registered on the event source's
//! capture callbacks only while a remote peer is attached, together with the
//! matching [`Interception`](super::local_events::Interception) switches.
//!
//! Sessions depend only on [`SessionLink`], the slice of a transport they
//! actually use, so the application layer never reaches into
//! infrastructure.

pub mod controlled;
pub mod controller;

use std::sync::{Arc, Weak};

use remote_core::protocol::codec::to_fields;
use remote_core::{Callback, CallbackError, CallbackManager, Fields, WireMessage};
use tracing::warn;

pub use controlled::ControlledSession;
pub use controller::ControllerSession;

/// What a session needs from its transport.
pub trait SessionLink: Send + Sync {
    /// Where received records (`msg_<type>`) and lifecycle events are
    /// published.
    fn callbacks(&self) -> &CallbackManager;

    /// Serializes and enqueues a record.  Dropped when not connected.
    fn send(&self, msg_type: &str, fields: &Fields);

    fn is_connected(&self) -> bool;
}

/// Typed sending on top of [`SessionLink::send`].
pub trait SessionLinkExt: SessionLink {
    fn send_message<M: WireMessage>(&self, payload: &M) {
        match to_fields(payload) {
            Ok(fields) => self.send(M::TYPE.as_str(), &fields),
            Err(e) => warn!("failed to encode outbound '{}': {e}", M::TYPE.as_str()),
        }
    }
}

impl<L: SessionLink + ?Sized> SessionLinkExt for L {}

/// Builds a handler that forwards to `handler` while `target` is alive and
/// does nothing afterwards.
pub(crate) fn bind<T, F>(target: &Weak<T>, handler: F) -> Callback
where
    T: Send + Sync + 'static,
    F: Fn(&T, &Fields) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    let target = target.clone();
    Arc::new(move |fields: &Fields| match target.upgrade() {
        Some(target) => handler(&target, fields),
        None => Ok(()),
    })
}

/// A fixed table of `(event, handler)` pairs registered and removed as one.
#[derive(Default)]
pub(crate) struct BindingTable {
    entries: Vec<(String, Callback)>,
}

impl BindingTable {
    pub(crate) fn with(mut self, event: impl Into<String>, handler: Callback) -> Self {
        self.entries.push((event.into(), handler));
        self
    }

    pub(crate) fn register(&self, callbacks: &CallbackManager) {
        for (event, handler) in &self.entries {
            callbacks.register(event, Arc::clone(handler));
        }
    }

    pub(crate) fn unregister(&self, callbacks: &CallbackManager) {
        for (event, handler) in &self.entries {
            callbacks.unregister(event, handler);
        }
    }
}
