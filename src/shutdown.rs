//! Cooperative shutdown.
//!
//! Nothing is ever sent on the channel: dropping the trigger's sender disconnects it, and
//! every clone of [`Shutdown`] sees the disconnect from then on. This makes the signal a
//! latch that any number of checkpoints can observe without consuming it.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::{Error, Result};

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = bounded(0);
    (ShutdownTrigger { tx: Some(tx) }, Shutdown { rx })
}

pub struct ShutdownTrigger {
    tx: Option<Sender<()>>,
}

impl ShutdownTrigger {
    pub fn trigger(&mut self) {
        self.tx.take();
    }
}

#[derive(Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn requested(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`, returning early (with `true`) if shutdown was requested
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.requested() {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }
}
