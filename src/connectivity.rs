//! Process-wide network and visibility signal.
//!
//! Hosts feed platform events into a [`Connectivity`] with
//! [`set_online`](Connectivity::set_online) and
//! [`set_hidden`](Connectivity::set_hidden); subscriptions listen through
//! [`watch`](Connectivity::watch). Environments without such signals simply
//! do not create one.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Snapshot of the environment's availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// The network is reachable.
    pub online: bool,
    /// The host surface is in the background.
    pub hidden: bool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            online: true,
            hidden: false,
        }
    }
}

impl NetworkStatus {
    /// Online and visible.
    pub fn is_available(&self) -> bool {
        self.online && !self.hidden
    }
}

/// Online/visibility state with change notification.
#[derive(Debug)]
pub struct Connectivity {
    status: watch::Sender<NetworkStatus>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(NetworkStatus::default())
    }
}

impl Connectivity {
    /// Start from `status`.
    pub fn new(status: NetworkStatus) -> Self {
        let (status, _) = watch::channel(status);
        Self { status }
    }

    /// Current status.
    pub fn snapshot(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// Record a network transition. No-op if unchanged.
    pub fn set_online(&self, online: bool) {
        self.update(|status| status.online = online);
    }

    /// Record a visibility transition. No-op if unchanged.
    pub fn set_hidden(&self, hidden: bool) {
        self.update(|status| status.hidden = hidden);
    }

    fn update(&self, f: impl FnOnce(&mut NetworkStatus)) {
        self.status.send_if_modified(|status| {
            let before = *status;
            f(status);
            if before == *status {
                return false;
            }
            debug!(online = status.online, hidden = status.hidden, "connectivity changed");
            true
        });
    }

    /// A receiver that observes every subsequent change.
    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_real_transitions_are_published() {
        let connectivity = Connectivity::default();
        let mut rx = connectivity.watch();

        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(false);
        rx.changed().await.unwrap();
        let status = *rx.borrow_and_update();
        assert!(!status.online);
        assert!(!status.is_available());

        connectivity.set_hidden(true);
        connectivity.set_online(true);
        assert_eq!(
            connectivity.snapshot(),
            NetworkStatus {
                online: true,
                hidden: true
            }
        );
    }
}
