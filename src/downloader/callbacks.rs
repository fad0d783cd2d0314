//! Status callback registry and fan-out.

use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};

use crate::throttle::StatusCallback;
use crate::types::DownloadBatchStatus;

use super::{DownloadManager, Registry};

/// Handle of a registered status callback
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl DownloadManager {
    /// Register a callback receiving every batch status update
    ///
    /// Updates arrive throttled per the configured policy, in the order each
    /// batch produced them. Callbacks run on a dedicated task and may call
    /// back into the manager.
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&DownloadBatchStatus) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        let mut registry = self.lock_registry();
        let id = CallbackId(registry.next_callback_id);
        registry.next_callback_id += 1;
        registry.callbacks.push((id, callback));
        id
    }

    /// Remove a callback; returns whether it was registered
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut registry = self.lock_registry();
        let before = registry.callbacks.len();
        registry.callbacks.retain(|(registered, _)| *registered != id);
        registry.callbacks.len() != before
    }

    /// Subscribe to batch status updates
    ///
    /// Multiple subscribers are supported. Each subscriber receives the same
    /// stream as registered callbacks. A subscriber that falls more than 1000
    /// updates behind receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadBatchStatus> {
        self.event_tx.subscribe()
    }
}

/// Deliver statuses to callbacks and subscribers until every batch is gone
pub(super) async fn dispatch(
    mut statuses: mpsc::UnboundedReceiver<DownloadBatchStatus>,
    registry: Weak<Mutex<Registry>>,
    event_tx: broadcast::Sender<DownloadBatchStatus>,
) {
    while let Some(status) = statuses.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let callbacks: Vec<_> = registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        drop(registry);

        for callback in callbacks {
            callback(&status);
        }
        // No receivers is fine
        let _ = event_tx.send(status);
    }
    tracing::debug!("Status dispatcher stopped");
}
