//! Network policy and detected network changes.

use crate::error::Result;
use crate::types::{ConnectionType, NetworkType};

use super::DownloadManager;

impl DownloadManager {
    /// Change which networks downloads may use
    ///
    /// Every live batch is re-evaluated: pending work resumes if the current
    /// network is now permitted, otherwise running and queued batches wait
    /// for a permitted network.
    pub async fn update_allowed_connection_type(&self, allowed: ConnectionType) -> Result<()> {
        self.command_gate().await?;
        self.connection.update_allowed_connection_type(allowed);
        tracing::info!(?allowed, "Allowed connection type changed");
        self.reevaluate_network();
        Ok(())
    }

    /// Report a change of the detected network
    pub async fn network_changed(&self, network: NetworkType) -> Result<()> {
        self.command_gate().await?;
        self.connection.set_network(network);
        tracing::info!(?network, "Network changed");
        self.reevaluate_network();
        Ok(())
    }

    fn reevaluate_network(&self) {
        let batches = self.live_batches();
        if self.connection.is_allowed_to_download() {
            // Resumed directly; a pending recovery job has nothing left to do
            self.recovery.cancel(&self.config.recovery.tag);
            let resumed = batches
                .into_iter()
                .filter(|batch| self.resume_pending(batch))
                .count();
            tracing::debug!(resumed, "Network permitted");
        } else {
            let parked = batches
                .iter()
                .filter(|batch| batch.wait_for_network())
                .count();
            tracing::debug!(parked, "Network not permitted");
            if parked > 0 {
                self.schedule_recovery();
            }
        }
    }
}
