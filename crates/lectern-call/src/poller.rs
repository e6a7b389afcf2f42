//! Owned, cancellable repeating tasks.
//!
//! Call lists refresh on a fixed period while a view is open. The view owns a
//! [`PollerHandle`]; cancelling or dropping it stops the task before its next
//! run.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::directory::{CallDirectory, CallListing, VideoCallRecord};
use crate::error::{CallError, Result};

/// Spawns repeating tasks.
#[derive(Debug, Clone, Copy)]
pub struct Poller;

impl Poller {
    /// Runs `task` now and then every `period` until the handle is cancelled.
    ///
    /// A run that overlaps the next tick delays the schedule rather than
    /// bursting. Must be called inside a tokio runtime.
    pub fn spawn<F, Fut>(period: Duration, mut task: F) -> Result<PollerHandle>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(CallError::InvalidInput(
                "poll period must be greater than zero".to_string(),
            ));
        }

        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                task().await;
                counter.fetch_add(1, Ordering::AcqRel);
            }
        });

        Ok(PollerHandle {
            task: Some(task),
            ticks,
        })
    }
}

/// Owner of a running poller. Dropping it cancels the task.
#[derive(Debug)]
pub struct PollerHandle {
    task: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl PollerHandle {
    /// Stops the task. Returns `false` if it was already cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                debug!(ticks = self.ticks(), "poller cancelled");
                true
            }
            None => false,
        }
    }

    /// Returns `true` until cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Completed runs.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Refreshes `listing` every `period`, publishing each successful fetch.
///
/// Failed fetches are logged and keep the last published list.
pub fn watch_listing(
    directory: CallDirectory,
    listing: CallListing,
    period: Duration,
) -> Result<(PollerHandle, watch::Receiver<Vec<VideoCallRecord>>)> {
    let (tx, rx) = watch::channel(Vec::new());
    let tx = Arc::new(tx);
    let handle = Poller::spawn(period, move || {
        let directory = directory.clone();
        let tx = Arc::clone(&tx);
        async move {
            match directory.list(listing).await {
                Ok(calls) => {
                    tx.send_replace(calls);
                }
                Err(e) => warn!(listing = listing.as_str(), error = %e, "call list refresh failed"),
            }
        }
    })?;
    Ok((handle, rx))
}

/// [`watch_listing`] for incoming calls.
pub fn watch_incoming(
    directory: CallDirectory,
    period: Duration,
) -> Result<(PollerHandle, watch::Receiver<Vec<VideoCallRecord>>)> {
    watch_listing(directory, CallListing::Incoming, period)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(runs: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let runs = Arc::clone(runs);
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_every_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = Poller::spawn(Duration::from_secs(10), counting(&runs)).unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(handle.ticks(), 3);
        assert!(handle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_future_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handle = Poller::spawn(Duration::from_secs(1), counting(&runs)).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!handle.is_active());

        let before = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = Poller::spawn(Duration::from_secs(1), counting(&runs)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_period_is_rejected() {
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            Poller::spawn(Duration::ZERO, counting(&runs)),
            Err(CallError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_list() {
        let directory = CallDirectory::new("http://127.0.0.1:1/api").unwrap();
        let (mut handle, mut rx) = watch_incoming(directory, Duration::from_secs(60)).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.ticks() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(rx.borrow_and_update().is_empty());
        assert!(handle.cancel());
    }
}
