//! Recovery after network-caused failures
//!
//! A recovery job waits out an exponential backoff delay, then waits until
//! the network satisfies the connection constraint that was in force when the
//! job was scheduled, then runs. At most one job per tag is outstanding:
//! scheduling again cancels the previous job. The backoff grows once per job
//! that runs, so many failures reported before a job runs share one delay.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use batch_dl::config::RecoveryConfig;
//! use batch_dl::connection::ConnectionChecker;
//! use batch_dl::recovery::RecoveryScheduler;
//!
//! # async fn example() {
//! let connection = Arc::new(ConnectionChecker::default());
//! let scheduler = Arc::new(RecoveryScheduler::new(RecoveryConfig::default(), connection));
//! scheduler.schedule(|| async {
//!     // resubmit persisted batches
//! });
//! # }
//! ```

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RecoveryConfig;
use crate::connection::ConnectionChecker;

struct PendingJob {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Schedules deferred recovery jobs conditioned on the network
pub struct RecoveryScheduler {
    config: RecoveryConfig,
    connection: Arc<ConnectionChecker>,
    jobs: Mutex<HashMap<String, PendingJob>>,
    attempts: AtomicU32,
    next_id: AtomicU64,
}

impl RecoveryScheduler {
    /// Create a scheduler watching `connection`
    pub fn new(config: RecoveryConfig, connection: Arc<ConnectionChecker>) -> Self {
        Self {
            config,
            connection,
            jobs: Mutex::new(HashMap::new()),
            attempts: AtomicU32::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, PendingJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule `job` under the configured tag, replacing any outstanding one
    ///
    /// Must be called within a tokio runtime.
    pub fn schedule<F, Fut>(self: &Arc<Self>, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tag = self.config.tag.clone();
        let constraint = self.connection.allowed_connection_type();
        let delay = self.current_delay();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();

        let scheduler: Weak<Self> = Arc::downgrade(self);
        let connection = Arc::clone(&self.connection);
        let job_token = token.clone();
        let job_tag = tag.clone();

        let mut jobs = self.lock_jobs();
        if let Some(previous) = jobs.remove(&tag) {
            previous.token.cancel();
            tracing::debug!(tag = %tag, "Replaced pending recovery job");
        }

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = job_token.cancelled() => return,
                _ = async {
                    tokio::time::sleep(delay).await;
                    connection.wait_for_network(constraint).await;
                } => {}
            }
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.finish(&job_tag, id);
                scheduler.attempts.fetch_add(1, Ordering::SeqCst);
            }
            tracing::info!(tag = %job_tag, "Running recovery job");
            job().await;
        });

        tracing::info!(
            tag = %tag,
            delay_ms = delay.as_millis() as u64,
            constraint = ?constraint,
            "Scheduled recovery job"
        );
        jobs.insert(tag, PendingJob { id, token, handle });
    }

    fn finish(&self, tag: &str, id: u64) {
        let mut jobs = self.lock_jobs();
        if jobs.get(tag).is_some_and(|job| job.id == id) {
            jobs.remove(tag);
        }
    }

    /// Cancel the outstanding job for `tag`, if any
    pub fn cancel(&self, tag: &str) {
        if let Some(job) = self.lock_jobs().remove(tag) {
            job.token.cancel();
        }
    }

    /// Cancel every outstanding job and wait for the tasks to stop
    pub async fn cancel_all(&self) {
        let jobs: Vec<PendingJob> = self.lock_jobs().drain().map(|(_, job)| job).collect();
        for job in jobs {
            job.token.cancel();
            let _ = job.handle.await;
        }
    }

    /// Whether a job is waiting to run
    pub fn has_pending(&self) -> bool {
        !self.lock_jobs().is_empty()
    }

    /// Forget earlier failures; the next job uses the initial delay
    pub fn reset_backoff(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Delay the next scheduled job waits before running
    pub(crate) fn current_delay(&self) -> Duration {
        let attempt = self.attempts.load(Ordering::SeqCst);
        let factor = self.config.backoff_multiplier.powi(attempt.min(64) as i32);
        let delay = Duration::from_secs_f64(
            (self.config.initial_delay.as_secs_f64() * factor)
                .min(self.config.max_delay.as_secs_f64()),
        );
        if self.config.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
