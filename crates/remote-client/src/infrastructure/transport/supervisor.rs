//! Reconnect supervisor: calls `run()` forever, with a fixed delay between
//! attempts, until told to stop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Transport, TransportError};

struct Slot {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct Supervisor {
    delay: Duration,
    slot: Mutex<Slot>,
}

impl Supervisor {
    pub(crate) fn new(delay: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            delay,
            slot: Mutex::new(Slot { stop, handle: None }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the reconnect loop for `transport`.  Returns `false` when a
    /// loop is already running.
    pub(crate) fn arm<T: Transport + ?Sized>(&self, transport: Arc<T>) -> bool {
        let mut slot = self.slot();
        if slot.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        let (stop, stop_rx) = watch::channel(false);
        slot.stop = stop;
        slot.handle = Some(tokio::spawn(reconnect_loop(transport, self.delay, stop_rx)));
        true
    }

    /// Asks the loop to exit after the current attempt, without waiting.
    pub(crate) fn request_stop(&self) {
        self.slot().stop.send_replace(true);
    }

    /// Asks the loop to exit and hands back its task so the caller can await
    /// it.  The slot is left empty, ready for the next [`arm`](Self::arm).
    pub(crate) fn disarm(&self) -> Option<JoinHandle<()>> {
        let mut slot = self.slot();
        slot.stop.send_replace(true);
        slot.handle.take()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slot()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

async fn reconnect_loop<T: Transport + ?Sized>(
    transport: Arc<T>,
    delay: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut attempt: u64 = 0;
    loop {
        if *stop.borrow() {
            break;
        }

        attempt += 1;
        match transport.run().await {
            Ok(()) => debug!("connection attempt {attempt} ended"),
            Err(TransportError::Closing) => break,
            Err(e) => info!("connection attempt {attempt} failed: {e}"),
        }

        if *stop.borrow() {
            break;
        }
        debug!("reconnecting in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("reconnect supervisor stopped after {attempt} attempt(s)");
}
