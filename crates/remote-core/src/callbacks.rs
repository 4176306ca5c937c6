//! Publish/subscribe callback registry.
//!
//! A [`CallbackManager`] maps an event name to an ordered list of handlers.
//! Transports use one to publish received records (`msg_<type>`) and their
//! lifecycle events; local event sources use another to publish the output
//! they captured while a remote peer is attached.
//!
//! # Contract
//!
//! - Handlers run synchronously on the dispatching thread, in registration
//!   order.
//! - A handler that returns `Err` or panics is logged and skipped; the next
//!   handler still runs and nothing propagates to the dispatcher.
//! - Handlers may register or unregister handlers (including themselves)
//!   while being dispatched.  The change applies to the next dispatch.
//!
//! Handlers are compared by `Arc` identity, so keep a clone of the handle you
//! registered in order to unregister it later.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{error, trace};

use crate::protocol::codec::Fields;

/// Lifecycle events published by every transport.
pub mod events {
    /// A connection was established.
    pub const TRANSPORT_CONNECTED: &str = "transport_connected";
    /// An established connection ended.
    pub const TRANSPORT_DISCONNECTED: &str = "transport_disconnected";
    /// `close()` was called; published before anything is torn down.
    pub const TRANSPORT_CLOSING: &str = "transport_closing";
    /// A connection attempt failed before being established.
    pub const TRANSPORT_CONNECTION_FAILED: &str = "transport_connection_failed";
}

/// Why a handler could not process an event.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// The event's fields did not match what the handler expects.
    #[error("invalid event fields: {0}")]
    InvalidFields(#[from] serde_json::Error),

    /// Any other handler failure.
    #[error("{0}")]
    Failed(String),
}

/// A registered handler.
pub type Callback = Arc<dyn Fn(&Fields) -> Result<(), CallbackError> + Send + Sync>;

/// Wraps a closure as a [`Callback`] handle.
pub fn callback<F>(handler: F) -> Callback
where
    F: Fn(&Fields) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(handler)
}

fn same_handler(a: &Callback, b: &Callback) -> bool {
    // Compare data pointers only; vtable addresses are not guaranteed unique.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Event name → ordered handler list.
#[derive(Default)]
pub struct CallbackManager {
    registry: RwLock<HashMap<String, Vec<Callback>>>,
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> = registry
            .iter()
            .map(|(event, handlers)| (event.as_str(), handlers.len()))
            .collect();
        f.debug_struct("CallbackManager")
            .field("handlers", &counts)
            .finish()
    }
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to `event`'s list.  Registering the same handle
    /// twice makes it run twice per dispatch.
    pub fn register(&self, event: &str, handler: Callback) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.entry(event.to_string()).or_default().push(handler);
    }

    /// Removes the first registration of `handler` for `event`.
    ///
    /// Returns `false` (and does nothing) when it was not registered.
    pub fn unregister(&self, event: &str, handler: &Callback) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = registry.get_mut(event) else {
            return false;
        };
        let Some(position) = handlers.iter().position(|h| same_handler(h, handler)) else {
            return false;
        };
        handlers.remove(position);
        if handlers.is_empty() {
            registry.remove(event);
        }
        true
    }

    /// Invokes every handler registered for `event` with `fields`.
    ///
    /// Returns the number of handlers that were invoked, whether or not they
    /// succeeded.
    pub fn dispatch(&self, event: &str, fields: &Fields) -> usize {
        let snapshot: Vec<Callback> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            match registry.get(event) {
                Some(handlers) => handlers.clone(),
                None => {
                    trace!("no handlers for event '{event}'");
                    return 0;
                }
            }
        };

        for handler in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(fields))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("handler for '{event}' failed: {e}"),
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("handler for '{event}' panicked: {reason}");
                }
            }
        }
        snapshot.len()
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(event).map_or(0, Vec::len)
    }

    /// Removes every handler for every event.
    pub fn clear(&self) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Callback {
        let log = Arc::clone(log);
        callback(move |_| {
            log.lock().unwrap().push(name);
            Ok(())
        })
    }

    #[test]
    fn test_dispatch_runs_handlers_in_registration_order() {
        // Arrange
        let manager = CallbackManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register("msg_speak", recorder(&log, "first"));
        manager.register("msg_speak", recorder(&log, "second"));
        manager.register("msg_cancel", recorder(&log, "other"));

        // Act
        let invoked = manager.dispatch("msg_speak", &Fields::new());

        // Assert
        assert_eq!(invoked, 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_failing_and_panicking_handlers_do_not_stop_later_ones() {
        let manager = CallbackManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register("e", callback(|_| Err(CallbackError::Failed("boom".into()))));
        manager.register("e", callback(|_| panic!("handler bug")));
        manager.register("e", recorder(&log, "survivor"));

        let invoked = manager.dispatch("e", &Fields::new());

        assert_eq!(invoked, 3);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_duplicate_registration_runs_twice_and_unregister_removes_one() {
        let manager = CallbackManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder(&log, "dup");
        manager.register("e", Arc::clone(&handler));
        manager.register("e", Arc::clone(&handler));

        manager.dispatch("e", &Fields::new());
        assert_eq!(log.lock().unwrap().len(), 2);

        assert!(manager.unregister("e", &handler));
        assert_eq!(manager.handler_count("e"), 1);
    }

    #[test]
    fn test_unregister_absent_handler_is_noop() {
        let manager = CallbackManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let registered = recorder(&log, "a");
        let stranger = recorder(&log, "b");
        manager.register("e", Arc::clone(&registered));

        assert!(!manager.unregister("e", &stranger));
        assert!(!manager.unregister("missing", &stranger));
        assert_eq!(manager.handler_count("e"), 1);
    }

    #[test]
    fn test_dispatch_without_handlers_returns_zero() {
        assert_eq!(CallbackManager::new().dispatch("nothing", &Fields::new()), 0);
    }

    #[test]
    fn test_handler_may_unregister_itself_during_dispatch() {
        // Arrange
        let manager = Arc::new(CallbackManager::new());
        let slot: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(None));
        let runs = Arc::new(Mutex::new(0));
        let handler = {
            let manager = Arc::downgrade(&manager);
            let slot = Arc::clone(&slot);
            let runs = Arc::clone(&runs);
            callback(move |_| {
                *runs.lock().unwrap() += 1;
                if let (Some(manager), Some(me)) = (manager.upgrade(), slot.lock().unwrap().clone()) {
                    manager.unregister("once", &me);
                }
                Ok(())
            })
        };
        *slot.lock().unwrap() = Some(Arc::clone(&handler));
        manager.register("once", handler);

        // Act
        manager.dispatch("once", &Fields::new());
        manager.dispatch("once", &Fields::new());

        // Assert
        assert_eq!(*runs.lock().unwrap(), 1);
        assert_eq!(manager.handler_count("once"), 0);
    }

    #[test]
    fn test_handlers_receive_fields() {
        let manager = CallbackManager::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        manager.register(
            "msg_index",
            callback(move |fields| {
                *sink.lock().unwrap() = fields.get("index").and_then(|v| v.as_i64());
                Ok(())
            }),
        );
        let mut fields = Fields::new();
        fields.insert("index".into(), 12.into());

        manager.dispatch("msg_index", &fields);

        assert_eq!(*seen.lock().unwrap(), Some(12));
    }
}
