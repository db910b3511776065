//! Latched one-shot event that any number of tasks can await.

use tokio::sync::watch;

/// Event that stays set once set
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    /// Create an unset signal
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Set the signal and wake every waiter
    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has been set
    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is set; returns immediately if it already is
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
