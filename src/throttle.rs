//! Rate limiting of batch status callbacks.
//!
//! Every status a [`crate::batch::DownloadBatch`] produces passes through one
//! [`CallbackThrottle`]. Three policies exist:
//! - [`Unthrottled`] forwards every update.
//! - [`ThrottleByTime`] keeps only the latest status and emits it once per period.
//! - [`ThrottleByProgress`] drops updates whose status, percentage and error are
//!   unchanged since the last emission.
//!
//! All policies deliver the last status they held back on [`CallbackThrottle::stop_updates`],
//! so a terminal status is never swallowed by the throttle predicate.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::ThrottleMode;
use crate::types::{DownloadBatchStatus, DownloadError, Status};

/// Consumer of batch statuses
///
/// Called synchronously on the task that produced the status. Implementations
/// should hand work off quickly (e.g. to a channel) rather than block.
pub type StatusCallback = Arc<dyn Fn(&DownloadBatchStatus) + Send + Sync>;

/// Policy limiting how often statuses reach the callback
pub trait CallbackThrottle: Send + Sync {
    /// Offer a new status
    fn update(&self, status: &DownloadBatchStatus);

    /// Stop throttling and flush the last status if it was held back
    ///
    /// The throttle may be used again afterwards; a later `update` restarts it.
    fn stop_updates(&self);
}

/// Build the throttle selected by `mode`
pub fn create_throttle(mode: ThrottleMode, callback: StatusCallback) -> Arc<dyn CallbackThrottle> {
    match mode {
        ThrottleMode::Unthrottled => Arc::new(Unthrottled::new(callback)),
        ThrottleMode::ByTime { period_ms } => Arc::new(ThrottleByTime::new(
            Duration::from_millis(period_ms.max(1)),
            callback,
        )),
        ThrottleMode::ByProgress => Arc::new(ThrottleByProgress::new(callback)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Forwards every update
pub struct Unthrottled {
    callback: StatusCallback,
    // Serialises emission so concurrent file updates reach the callback in order
    emit: Mutex<()>,
}

impl Unthrottled {
    /// Create an unthrottled forwarder
    pub fn new(callback: StatusCallback) -> Self {
        Self {
            callback,
            emit: Mutex::new(()),
        }
    }
}

impl CallbackThrottle for Unthrottled {
    fn update(&self, status: &DownloadBatchStatus) {
        let _guard = lock(&self.emit);
        (self.callback)(status);
    }

    fn stop_updates(&self) {
        // Everything was forwarded already.
    }
}

#[derive(Default)]
struct TimeWindowState {
    latest: Option<DownloadBatchStatus>,
    pending: bool,
    ticker: Option<tokio::task::JoinHandle<()>>,
}

/// Coalesces updates to the latest status and emits it at a fixed period
pub struct ThrottleByTime {
    period: Duration,
    callback: StatusCallback,
    state: Arc<Mutex<TimeWindowState>>,
}

impl ThrottleByTime {
    /// Create a time-windowed throttle
    pub fn new(period: Duration, callback: StatusCallback) -> Self {
        Self {
            period,
            callback,
            state: Arc::new(Mutex::new(TimeWindowState::default())),
        }
    }

    fn spawn_ticker(&self, handle: &tokio::runtime::Handle) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let callback = Arc::clone(&self.callback);
        let period = self.period;
        handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let mut state = lock(&state);
                if state.pending
                    && let Some(status) = &state.latest
                {
                    callback(status);
                    state.pending = false;
                }
            }
        })
    }
}

impl CallbackThrottle for ThrottleByTime {
    fn update(&self, status: &DownloadBatchStatus) {
        let mut state = lock(&self.state);
        state.latest = Some(status.clone());
        state.pending = true;

        if state.ticker.is_none() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => state.ticker = Some(self.spawn_ticker(&handle)),
                Err(_) => {
                    // No runtime to tick on: behave unthrottled.
                    (self.callback)(status);
                    state.pending = false;
                }
            }
        }
    }

    fn stop_updates(&self) {
        let mut state = lock(&self.state);
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        if state.pending
            && let Some(status) = &state.latest
        {
            (self.callback)(status);
        }
        state.pending = false;
    }
}

impl Drop for ThrottleByTime {
    fn drop(&mut self) {
        if let Some(ticker) = lock(&self.state).ticker.take() {
            ticker.abort();
        }
    }
}

type ProgressKey = (Status, u8, Option<DownloadError>);

#[derive(Default)]
struct ProgressState {
    last_emitted: Option<ProgressKey>,
    // Latest status that was suppressed and not yet delivered
    pending: Option<DownloadBatchStatus>,
}

/// Suppresses updates that do not change status, percentage or error
pub struct ThrottleByProgress {
    callback: StatusCallback,
    state: Mutex<ProgressState>,
}

impl ThrottleByProgress {
    /// Create a progress-delta throttle
    pub fn new(callback: StatusCallback) -> Self {
        Self {
            callback,
            state: Mutex::new(ProgressState::default()),
        }
    }
}

impl CallbackThrottle for ThrottleByProgress {
    fn update(&self, status: &DownloadBatchStatus) {
        let key = (status.status, status.percentage, status.error.clone());
        let mut state = lock(&self.state);
        if state.last_emitted.as_ref() == Some(&key) {
            state.pending = Some(status.clone());
            return;
        }
        (self.callback)(status);
        state.last_emitted = Some(key);
        state.pending = None;
    }

    fn stop_updates(&self) {
        let mut state = lock(&self.state);
        if let Some(status) = state.pending.take() {
            (self.callback)(&status);
        }
        state.last_emitted = None;
    }
}
