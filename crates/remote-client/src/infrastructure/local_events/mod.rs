//! Implementations of [`LocalEventSource`](crate::application::local_events::LocalEventSource).
//!
//! - **`console`**: logs every actuation; used by the binary when no host is
//!   attached.
//! - **`recording`**: records every actuation and lets tests play the host.

pub mod console;
pub mod recording;
