//! Observable mutable cells.
//!
//! Every state object owns a [`Signal`]; each committed mutation bumps its
//! version. Consumers either poll [`Signal::version`] or await
//! [`Signal::changed_since`].

use tokio::sync::watch;

/// Version counter with async change notification.
#[derive(Debug)]
pub struct Signal {
    version: watch::Sender<u64>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    /// A signal at version 0.
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self { version }
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Record a mutation.
    pub fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// A receiver that observes every subsequent mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Wait until the version moves past `version`.
    pub async fn changed_since(&self, version: u64) -> u64 {
        let mut rx = self.subscribe();
        let version = match rx.wait_for(|v| *v > version).await {
            Ok(v) => *v,
            // The sender lives in `self`; this arm is unreachable while
            // `self` is borrowed.
            Err(_) => self.version(),
        };
        version
    }
}
