//! Latest-location aggregation.
//!
//! Groups samples by order, keeps the newest per order (by stored timestamp,
//! later insertion winning ties), and joins each with its order record.
//! Samples whose order is unknown are dropped from the output.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::orders::{Order, OrderRegistry};
use crate::store::{LocationStore, PositionSample};

/// Newest known position of one order, with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedOrderView {
    /// The order id.
    pub order_id: String,
    /// The newest sample for the order.
    pub sample: PositionSample,
    /// The order record.
    pub order: Order,
}

impl TrackedOrderView {
    /// Whether the sample is younger than `threshold` at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.sample.timestamp < threshold
    }

    /// Great-circle distance from the latest position to the destination.
    #[must_use]
    pub fn distance_to_destination_km(&self) -> f64 {
        self.sample.location.distance_km(&self.order.destination)
    }
}

/// Pick the newest sample per order, keyed by order id.
///
/// Samples must be given in insertion order; on equal timestamps the later
/// one wins.
#[must_use]
pub fn latest_per_order(samples: &[PositionSample]) -> BTreeMap<&str, &PositionSample> {
    let mut latest: BTreeMap<&str, &PositionSample> = BTreeMap::new();
    for sample in samples {
        latest
            .entry(sample.order_id.as_str())
            .and_modify(|current| {
                if sample.timestamp >= current.timestamp {
                    *current = sample;
                }
            })
            .or_insert(sample);
    }
    latest
}

/// Join the newest sample per order with `orders`, sorted by order id.
#[must_use]
pub fn aggregate(samples: &[PositionSample], orders: &[Order]) -> Vec<TrackedOrderView> {
    let by_id: HashMap<&str, &Order> = orders.iter().map(|o| (o.id.as_str(), o)).collect();

    latest_per_order(samples)
        .into_iter()
        .filter_map(|(order_id, sample)| match by_id.get(order_id) {
            Some(order) => Some(TrackedOrderView {
                order_id: order_id.to_string(),
                sample: sample.clone(),
                order: (*order).clone(),
            }),
            None => {
                debug!("No order record for {}, leaving it out", order_id);
                None
            }
        })
        .collect()
}

/// Something the poller can ask for a fresh aggregation.
pub trait AggregationSource: Send + Sync {
    /// Compute the current set of views.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying data cannot be read.
    fn latest(&self) -> Result<Vec<TrackedOrderView>>;
}

/// The store and registry read together.
#[derive(Debug, Clone)]
pub struct LiveBoard {
    store: Arc<LocationStore>,
    registry: Arc<dyn OrderRegistry>,
}

impl LiveBoard {
    /// Combine a store and an order registry.
    #[must_use]
    pub fn new(store: Arc<LocationStore>, registry: Arc<dyn OrderRegistry>) -> Self {
        Self { store, registry }
    }
}

impl AggregationSource for LiveBoard {
    fn latest(&self) -> Result<Vec<TrackedOrderView>> {
        let samples = self.store.samples()?;
        let orders = self.registry.orders()?;
        Ok(aggregate(&samples, &orders))
    }
}
