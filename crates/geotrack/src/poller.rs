//! Periodic refresh of the aggregated view.
//!
//! A [`Poller`] runs an [`AggregationSource`] once immediately and then on a
//! fixed interval, publishing every result to subscribers. Runs never
//! overlap: the loop awaits each pass before waiting for the next tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregationSource, TrackedOrderView};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Default time between passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// One published aggregation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollUpdate {
    /// Latest view per tracked order.
    pub views: Vec<TrackedOrderView>,
    /// When the pass ran.
    pub refreshed_at: DateTime<Utc>,
}

/// Starts polling tasks.
#[derive(Debug, Clone, Copy)]
pub struct Poller;

impl Poller {
    /// Start polling `source` every `interval`, beginning immediately.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInterval`] if `interval` is zero.
    pub fn start(
        source: Arc<dyn AggregationSource>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Result<PollerHandle> {
        if interval.is_zero() {
            return Err(Error::InvalidInterval {
                millis: interval.as_millis(),
            });
        }

        let (updates, _) = watch::channel(None);
        let shared = Arc::new(PollerShared {
            updates,
            stopped: AtomicBool::new(false),
            refresh: Notify::new(),
            runs: AtomicU64::new(0),
        });

        info!("Polling every {} ms", interval.as_millis());
        let task = tokio::spawn(run(Arc::clone(&shared), source, clock, interval));

        Ok(PollerHandle { shared, task })
    }
}

#[derive(Debug)]
struct PollerShared {
    updates: watch::Sender<Option<PollUpdate>>,
    stopped: AtomicBool,
    refresh: Notify,
    runs: AtomicU64,
}

async fn run(
    shared: Arc<PollerShared>,
    source: Arc<dyn AggregationSource>,
    clock: Arc<dyn Clock>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shared.refresh.notified() => {
                debug!("Manual refresh requested");
            }
        }
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }

        shared.runs.fetch_add(1, Ordering::SeqCst);
        match source.latest() {
            Ok(views) => {
                debug!("Poll pass produced {} views", views.len());
                let update = PollUpdate {
                    views,
                    refreshed_at: clock.now(),
                };
                shared.updates.send_replace(Some(update));
            }
            Err(e) => warn!("Poll pass failed, skipping: {}", e),
        }
    }
}

/// Controls a running poller. Dropping the handle stops it.
#[derive(Debug)]
pub struct PollerHandle {
    shared: Arc<PollerShared>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop polling. No pass starts after this returns.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            self.task.abort();
            info!("Polling stopped");
        }
    }

    /// Whether [`PollerHandle::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Request an immediate out-of-schedule pass.
    pub fn refresh(&self) {
        self.shared.refresh.notify_one();
    }

    /// Subscribe to published results. The value is `None` until the first
    /// pass completes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<PollUpdate>> {
        self.shared.updates.subscribe()
    }

    /// The most recent result.
    #[must_use]
    pub fn latest(&self) -> Option<PollUpdate> {
        self.shared.updates.borrow().clone()
    }

    /// Number of passes run so far.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.shared.runs.load(Ordering::SeqCst)
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geo::Coordinates;
    use crate::orders::Order;
    use crate::store::PositionSample;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingSource {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl AggregationSource for CountingSource {
        fn latest(&self) -> Result<Vec<TrackedOrderView>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(call) {
                return Err(Error::internal("medium unavailable"));
            }
            let sample = PositionSample {
                id: format!("s{call}"),
                order_id: "ORD-A".to_string(),
                user_id: "officer-1".to_string(),
                location: Coordinates::new(1.0, 1.0),
                accuracy: None,
                timestamp: Utc::now(),
            };
            Ok(vec![TrackedOrderView {
                order_id: "ORD-A".to_string(),
                sample,
                order: Order::new("ORD-A", Coordinates::new(2.0, 2.0)),
            }])
        }
    }

    fn clock() -> Arc<ManualClock> {
        crate::logging::init_test_logging();
        Arc::new(ManualClock::new(
            DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ))
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let result = Poller::start(
            Arc::new(CountingSource::default()),
            clock(),
            Duration::ZERO,
        );
        assert!(matches!(result, Err(Error::InvalidInterval { millis: 0 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_and_stop() {
        let source = Arc::new(CountingSource::default());
        let handle = Poller::start(source.clone(), clock(), Duration::from_millis(1000)).unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        assert_eq!(handle.runs(), 4);

        handle.stop();
        assert!(handle.is_stopped());
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_with_refresh_stamp() {
        let clock = clock();
        let handle = Poller::start(
            Arc::new(CountingSource::default()),
            clock.clone(),
            Duration::from_millis(1000),
        )
        .unwrap();
        let mut rx = handle.subscribe();

        rx.changed().await.unwrap();
        let update = rx.borrow_and_update().clone().unwrap();
        assert_eq!(update.views.len(), 1);
        assert_eq!(update.refreshed_at, clock.now());

        clock.advance(chrono::Duration::seconds(1));
        rx.changed().await.unwrap();
        let update = handle.latest().unwrap();
        assert_eq!(update.views[0].sample.id, "s2");
        assert_eq!(update.refreshed_at, clock.now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_pass_is_skipped() {
        let source = Arc::new(CountingSource {
            fail_on: Some(2),
            ..CountingSource::default()
        });
        let handle = Poller::start(source.clone(), clock(), Duration::from_millis(1000)).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(handle.latest().unwrap().views[0].sample.id, "s1");

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(handle.runs(), 3);
        assert_eq!(handle.latest().unwrap().views[0].sample.id, "s3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_refresh() {
        let source = Arc::new(CountingSource::default());
        let handle = Poller::start(source.clone(), clock(), Duration::from_secs(60)).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.runs(), 1);

        handle.refresh();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let source = Arc::new(CountingSource::default());
        let handle = Poller::start(source.clone(), clock(), Duration::from_millis(1000)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
