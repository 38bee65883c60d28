//! Device/network pause state shared with periodic tickers.
//!
//! Health-check tickers register here so a paused device suspends probing
//! without tearing the ticker down; `resume` wakes every registered waiter.

use tokio::sync::watch;

pub struct PauseManager {
    state: watch::Sender<bool>,
}

impl Default for PauseManager {
    fn default() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }
}

impl PauseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        let _ = self.state.send(true);
    }

    pub fn resume(&self) {
        let _ = self.state.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.state.borrow()
    }

    /// Register a ticker; the returned registration observes pause state until
    /// dropped (dropping unregisters).
    pub fn register(&self) -> PauseRegistration {
        PauseRegistration {
            state: self.state.subscribe(),
        }
    }
}

pub struct PauseRegistration {
    state: watch::Receiver<bool>,
}

impl PauseRegistration {
    /// Suspend until the manager is not paused.
    pub async fn wait_active(&mut self) {
        while *self.state.borrow() {
            if self.state.changed().await.is_err() {
                // Manager gone; treat as active so the ticker can wind down
                // through its own close path.
                return;
            }
        }
    }
}
