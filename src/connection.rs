//! Network policy: which connection types downloads may use, and what is connected now.
//!
//! The [`ConnectionChecker`] holds the allowed [`ConnectionType`] and the currently
//! detected [`NetworkType`]. Both live in one `tokio::sync::watch` channel so that
//! waiters (recovery jobs) wake on every change instead of polling.

use tokio::sync::watch;

use crate::types::{ConnectionType, NetworkType};

/// Snapshot of the network policy and the detected network
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkState {
    /// Networks downloads may use
    pub allowed: ConnectionType,
    /// The network currently available
    pub network: NetworkType,
}

impl NetworkState {
    /// Whether downloading is permitted in this state
    pub fn is_allowed(&self) -> bool {
        self.allowed.permits(self.network)
    }
}

/// Gate deciding whether downloading may proceed on the current network
#[derive(Debug)]
pub struct ConnectionChecker {
    state: watch::Sender<NetworkState>,
}

impl ConnectionChecker {
    /// Create a checker with an allowed type and an initially detected network
    pub fn new(allowed: ConnectionType, network: NetworkType) -> Self {
        let (state, _rx) = watch::channel(NetworkState { allowed, network });
        Self { state }
    }

    /// Whether the current network satisfies the allowed connection type
    pub fn is_allowed_to_download(&self) -> bool {
        self.state.borrow().is_allowed()
    }

    /// The allowed connection type
    pub fn allowed_connection_type(&self) -> ConnectionType {
        self.state.borrow().allowed
    }

    /// The currently detected network
    pub fn network(&self) -> NetworkType {
        self.state.borrow().network
    }

    /// Change the allowed connection type
    pub fn update_allowed_connection_type(&self, allowed: ConnectionType) {
        self.state.send_if_modified(|state| {
            let changed = state.allowed != allowed;
            state.allowed = allowed;
            changed
        });
        tracing::debug!(?allowed, "Allowed connection type updated");
    }

    /// Record a change of the detected network
    pub fn set_network(&self, network: NetworkType) {
        self.state.send_if_modified(|state| {
            let changed = state.network != network;
            state.network = network;
            changed
        });
        tracing::debug!(?network, "Detected network updated");
    }

    /// Subscribe to policy/network changes
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    /// Wait until the detected network satisfies `constraint`
    ///
    /// The constraint is captured by the caller (e.g. when a recovery job is
    /// scheduled), so later policy changes do not affect an already waiting job.
    pub async fn wait_for_network(&self, constraint: ConnectionType) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only errs if the checker is dropped.
        let _ = rx.wait_for(|state| constraint.permits(state.network)).await;
    }
}

impl Default for ConnectionChecker {
    fn default() -> Self {
        Self::new(ConnectionType::All, NetworkType::Unmetered)
    }
}
