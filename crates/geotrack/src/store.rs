//! Persisted location history.
//!
//! The store owns a single medium key holding every position sample as one
//! JSON array. Appends are read-modify-write under a lock; after each append
//! the sample's order is trimmed back to the retention cap, oldest first by
//! timestamp. Other orders are never touched by an append.
//!
//! Two record shapes are accepted on read: the current one with a nested
//! `location: {lat, lng}` object and a legacy one with flat `lat`/`lng`
//! fields. Both decode to the same [`PositionSample`]. Records that fail to
//! decode are skipped (with a warning) on read and kept verbatim on write.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::geo::Coordinates;
use crate::medium::Medium;

/// Maximum number of samples retained per order.
pub const DEFAULT_MAX_SAMPLES_PER_ORDER: usize = 100;

/// Medium key holding the sample collection.
pub const DEFAULT_SAMPLES_KEY: &str = "location_updates";

/// One GPS fix associated with an order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    /// Unique sample id.
    pub id: String,
    /// The order being tracked.
    pub order_id: String,
    /// The reporting user.
    pub user_id: String,
    /// Where the fix was taken.
    pub location: Coordinates,
    /// Reported accuracy radius in meters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// When the fix was taken.
    pub timestamp: DateTime<Utc>,
}

/// A sample waiting to be stored.
///
/// `id` and `timestamp` are filled in by [`LocationStore::append`] when unset.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDraft {
    /// The order being tracked.
    pub order_id: String,
    /// The reporting user.
    pub user_id: String,
    /// Where the fix was taken.
    pub location: Coordinates,
    /// Reported accuracy radius in meters.
    pub accuracy: Option<f64>,
    /// Preassigned id.
    pub id: Option<String>,
    /// Preassigned timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

impl SampleDraft {
    /// Create a draft with no accuracy, id or timestamp.
    #[must_use]
    pub fn new(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        location: Coordinates,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            user_id: user_id.into(),
            location,
            accuracy: None,
            id: None,
            timestamp: None,
        }
    }

    /// Set the accuracy radius.
    #[must_use]
    pub fn with_accuracy(mut self, accuracy: Option<f64>) -> Self {
        self.accuracy = accuracy;
        self
    }

    /// Set the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.order_id.trim().is_empty() {
            return Err(Error::invalid_sample("orderId is required"));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::invalid_sample("userId is required"));
        }
        self.location.validate()?;
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(Error::invalid_sample(format!(
                    "accuracy {accuracy} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

/// Time covered by a timestamp-ordered history, from its first sample to
/// its last. `None` for fewer than two samples.
#[must_use]
pub fn tracked_duration(history: &[PositionSample]) -> Option<chrono::Duration> {
    match history {
        [first, .., last] => Some(last.timestamp - first.timestamp),
        _ => None,
    }
}

/// Both persisted shapes of a sample.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Nested(NestedRecord),
    Flat(FlatRecord),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedRecord {
    #[serde(default)]
    id: String,
    order_id: String,
    #[serde(default)]
    user_id: String,
    location: Coordinates,
    #[serde(default)]
    accuracy: Option<f64>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatRecord {
    #[serde(default)]
    id: String,
    order_id: String,
    #[serde(default)]
    user_id: String,
    lat: f64,
    lng: f64,
    #[serde(default)]
    accuracy: Option<f64>,
    timestamp: DateTime<Utc>,
}

impl StoredRecord {
    fn into_sample(self) -> Result<PositionSample> {
        let sample = match self {
            Self::Nested(r) => PositionSample {
                id: r.id,
                order_id: r.order_id,
                user_id: r.user_id,
                location: r.location,
                accuracy: r.accuracy,
                timestamp: r.timestamp,
            },
            Self::Flat(r) => PositionSample {
                id: r.id,
                order_id: r.order_id,
                user_id: r.user_id,
                location: Coordinates::new(r.lat, r.lng),
                accuracy: r.accuracy,
                timestamp: r.timestamp,
            },
        };

        if sample.order_id.trim().is_empty() {
            return Err(Error::invalid_sample("orderId is empty"));
        }
        sample.location.validate()?;
        Ok(sample)
    }
}

fn decode_record(value: &serde_json::Value) -> Result<PositionSample> {
    StoredRecord::deserialize(value)?.into_sample()
}

/// Summary of the store's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of decodable samples.
    pub total_samples: usize,
    /// Number of distinct orders with at least one sample.
    pub orders: usize,
    /// Number of records that failed to decode.
    pub malformed_records: usize,
    /// Timestamp of the oldest sample.
    pub oldest_sample: Option<DateTime<Utc>>,
    /// Timestamp of the newest sample.
    pub newest_sample: Option<DateTime<Utc>>,
}

/// Append-only, per-order bounded log of position samples.
#[derive(Debug)]
pub struct LocationStore {
    medium: Arc<dyn Medium>,
    key: String,
    max_per_order: usize,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl LocationStore {
    /// Create a store with the default key and retention cap.
    #[must_use]
    pub fn new(medium: Arc<dyn Medium>, clock: Arc<dyn Clock>) -> Self {
        Self {
            medium,
            key: DEFAULT_SAMPLES_KEY.to_string(),
            max_per_order: DEFAULT_MAX_SAMPLES_PER_ORDER,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Use a different medium key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Use a different retention cap (at least 1).
    #[must_use]
    pub fn with_max_per_order(mut self, max_per_order: usize) -> Self {
        self.max_per_order = max_per_order.max(1);
        self
    }

    /// The retention cap.
    #[must_use]
    pub fn max_per_order(&self) -> usize {
        self.max_per_order
    }

    /// Validate and store a sample, then trim its order to the retention cap.
    ///
    /// The returned sample is the one that was written, even if it is older
    /// than everything retained for its order and was evicted straight away.
    /// Use [`LocationStore::append_retained`] to tell the two apart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSample`] for bad input, or an error if the medium fails.
    pub fn append(&self, draft: SampleDraft) -> Result<PositionSample> {
        self.insert(draft).map(|(sample, _)| sample)
    }

    /// Like [`LocationStore::append`], but returns `None` when the new sample
    /// fell outside the retention cap and is no longer stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSample`] for bad input, or an error if the medium fails.
    pub fn append_retained(&self, draft: SampleDraft) -> Result<Option<PositionSample>> {
        self.insert(draft)
            .map(|(sample, retained)| retained.then_some(sample))
    }

    fn insert(&self, draft: SampleDraft) -> Result<(PositionSample, bool)> {
        draft.validate()?;

        let sample = PositionSample {
            id: draft
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            order_id: draft.order_id,
            user_id: draft.user_id,
            location: draft.location,
            accuracy: draft.accuracy,
            timestamp: draft.timestamp.unwrap_or_else(|| self.clock.now()),
        };

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::internal("location store lock poisoned"))?;

        let mut records = self.load_records()?;
        records.push(serde_json::to_value(&sample)?);
        let appended_at = records.len() - 1;
        let doomed = self.excess_records(&records, &sample.order_id);
        let retained = !doomed.contains(&appended_at);
        if !doomed.is_empty() {
            let mut index = 0;
            records.retain(|_| {
                let keep = !doomed.contains(&index);
                index += 1;
                keep
            });
        }

        self.medium
            .set(&self.key, &serde_json::to_string(&records)?)?;

        debug!(
            "Stored sample {} for order {} at {}",
            sample.id, sample.order_id, sample.location
        );
        if !doomed.is_empty() {
            debug!(
                "Evicted {} old samples for order {}",
                doomed.len(),
                sample.order_id
            );
        }
        Ok((sample, retained))
    }

    /// All retained samples for `order_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails.
    pub fn history_for(&self, order_id: &str) -> Result<Vec<PositionSample>> {
        let mut history: Vec<PositionSample> = self
            .samples()?
            .into_iter()
            .filter(|s| s.order_id == order_id)
            .collect();
        history.sort_by_key(|s| s.timestamp);
        Ok(history)
    }

    /// Every decodable sample in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails.
    pub fn samples(&self) -> Result<Vec<PositionSample>> {
        Ok(self
            .load_records()?
            .iter()
            .enumerate()
            .filter_map(|(index, value)| match decode_record(value) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!("Skipping malformed location record #{}: {}", index, e);
                    None
                }
            })
            .collect())
    }

    /// Summarize the store's contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let records = self.load_records()?;
        let mut orders = BTreeSet::new();
        let mut total_samples = 0;
        let mut oldest_sample: Option<DateTime<Utc>> = None;
        let mut newest_sample: Option<DateTime<Utc>> = None;

        for sample in records.iter().filter_map(|v| decode_record(v).ok()) {
            total_samples += 1;
            oldest_sample = Some(oldest_sample.map_or(sample.timestamp, |t| t.min(sample.timestamp)));
            newest_sample = Some(newest_sample.map_or(sample.timestamp, |t| t.max(sample.timestamp)));
            orders.insert(sample.order_id);
        }

        Ok(StoreStats {
            total_samples,
            orders: orders.len(),
            malformed_records: records.len() - total_samples,
            oldest_sample,
            newest_sample,
        })
    }

    fn load_records(&self) -> Result<Vec<serde_json::Value>> {
        let Some(raw) = self.medium.get(&self.key)? else {
            return Ok(Vec::new());
        };

        match serde_json::from_str(&raw) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(
                    "Location collection under {} is unreadable, treating it as empty: {}",
                    self.key, e
                );
                Ok(Vec::new())
            }
        }
    }

    /// Indices of the oldest records of `order_id` beyond the cap.
    fn excess_records(&self, records: &[serde_json::Value], order_id: &str) -> HashSet<usize> {
        let mut owned: Vec<(DateTime<Utc>, usize)> = records
            .iter()
            .enumerate()
            .filter_map(|(index, value)| {
                decode_record(value)
                    .ok()
                    .filter(|s| s.order_id == order_id)
                    .map(|s| (s.timestamp, index))
            })
            .collect();

        if owned.len() <= self.max_per_order {
            return HashSet::new();
        }

        // Oldest by timestamp first; insertion order breaks ties.
        owned.sort_unstable();
        let excess = owned.len() - self.max_per_order;
        owned[..excess].iter().map(|(_, index)| *index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::medium::MemoryMedium;
    use chrono::Duration;

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn create_test_store() -> (Arc<MemoryMedium>, ManualClock, LocationStore) {
        let medium = Arc::new(MemoryMedium::new());
        let clock = ManualClock::new(base_time());
        let store = LocationStore::new(medium.clone(), Arc::new(clock.clone()));
        (medium, clock, store)
    }

    fn draft_at(order_id: &str, seconds: i64) -> SampleDraft {
        SampleDraft::new(order_id, "officer-1", Coordinates::new(25.2, 55.27))
            .with_timestamp(base_time() + Duration::seconds(seconds))
    }

    #[test]
    fn test_append_assigns_id_and_timestamp() {
        let (_, clock, store) = create_test_store();
        clock.advance(Duration::seconds(42));

        let sample = store
            .append(SampleDraft::new("ORD-1", "u1", Coordinates::new(1.0, 2.0)))
            .unwrap();

        assert!(!sample.id.is_empty());
        assert_eq!(sample.timestamp, base_time() + Duration::seconds(42));
        assert_eq!(store.history_for("ORD-1").unwrap(), vec![sample]);
    }

    #[test]
    fn test_append_keeps_preassigned_fields() {
        let (_, _, store) = create_test_store();
        let sample = store
            .append(draft_at("ORD-1", 5).with_id("fixed-id"))
            .unwrap();
        assert_eq!(sample.id, "fixed-id");
        assert_eq!(sample.timestamp, base_time() + Duration::seconds(5));
    }

    #[test]
    fn test_append_generates_unique_ids() {
        let (_, _, store) = create_test_store();
        let a = store.append(draft_at("ORD-1", 0)).unwrap();
        let b = store.append(draft_at("ORD-1", 0)).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_append_rejects_invalid_input() {
        let (medium, _, store) = create_test_store();

        let err = store.append(draft_at("", 0)).unwrap_err();
        assert!(err.to_string().contains("orderId"));

        let mut draft = draft_at("ORD-1", 0);
        draft.user_id = String::new();
        assert!(store.append(draft).unwrap_err().to_string().contains("userId"));

        let mut draft = draft_at("ORD-1", 0);
        draft.location = Coordinates::new(91.0, 0.0);
        assert!(store.append(draft).is_err());

        let draft = draft_at("ORD-1", 0).with_accuracy(Some(-1.0));
        assert!(store.append(draft).unwrap_err().to_string().contains("accuracy"));

        assert!(medium.get(DEFAULT_SAMPLES_KEY).unwrap().is_none());
    }

    #[test]
    fn test_accuracy_is_optional() {
        let (_, _, store) = create_test_store();
        let without = store.append(draft_at("ORD-1", 0)).unwrap();
        let with = store
            .append(draft_at("ORD-1", 1).with_accuracy(Some(12.5)))
            .unwrap();

        let history = store.history_for("ORD-1").unwrap();
        assert_eq!(history[0].accuracy, None);
        assert_eq!(history[1].accuracy, Some(12.5));
        assert_eq!(history, vec![without, with]);
    }

    #[test]
    fn test_history_for_unknown_order_is_empty() {
        let (_, _, store) = create_test_store();
        store.append(draft_at("ORD-1", 0)).unwrap();
        assert!(store.history_for("ORD-2").unwrap().is_empty());
    }

    #[test]
    fn test_history_is_sorted_by_timestamp() {
        let (_, _, store) = create_test_store();
        store.append(draft_at("ORD-1", 20)).unwrap();
        store.append(draft_at("ORD-1", 30)).unwrap();
        store.append(draft_at("ORD-1", 10)).unwrap();

        let seconds: Vec<i64> = store
            .history_for("ORD-1")
            .unwrap()
            .iter()
            .map(|s| (s.timestamp - base_time()).num_seconds())
            .collect();
        assert_eq!(seconds, vec![10, 20, 30]);
    }

    #[test]
    fn test_retention_keeps_most_recent() {
        let (_, _, store) = create_test_store();
        for i in 0..150 {
            store.append(draft_at("ORD-A", i)).unwrap();
        }

        let history = store.history_for("ORD-A").unwrap();
        assert_eq!(history.len(), DEFAULT_MAX_SAMPLES_PER_ORDER);
        assert_eq!(history[0].timestamp, base_time() + Duration::seconds(50));
        assert_eq!(history[99].timestamp, base_time() + Duration::seconds(149));
    }

    #[test]
    fn test_retention_evicts_by_timestamp_not_arrival() {
        let (_, _, store) = create_test_store();
        let store = store.with_max_per_order(3);

        // Newest-by-timestamp arrives first; the oldest timestamp is the one evicted.
        store.append(draft_at("ORD-A", 100)).unwrap();
        store.append(draft_at("ORD-A", 1)).unwrap();
        store.append(draft_at("ORD-A", 50)).unwrap();
        store.append(draft_at("ORD-A", 75)).unwrap();

        let seconds: Vec<i64> = store
            .history_for("ORD-A")
            .unwrap()
            .iter()
            .map(|s| (s.timestamp - base_time()).num_seconds())
            .collect();
        assert_eq!(seconds, vec![50, 75, 100]);
    }

    #[test]
    fn test_append_older_than_retained_is_evicted() {
        let (_, _, store) = create_test_store();
        let store = store.with_max_per_order(2);
        store.append(draft_at("ORD-A", 10)).unwrap();
        store.append(draft_at("ORD-A", 20)).unwrap();

        assert!(store.append_retained(draft_at("ORD-A", 0)).unwrap().is_none());
        let history = store.history_for("ORD-A").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp, base_time() + Duration::seconds(10));

        let newest = store.append_retained(draft_at("ORD-A", 30)).unwrap().unwrap();
        assert_eq!(store.history_for("ORD-A").unwrap()[1], newest);
    }

    #[test]
    fn test_eviction_is_isolated_per_order() {
        let (_, _, store) = create_test_store();
        for i in 0..10 {
            store.append(draft_at("ORD-B", i)).unwrap();
        }
        let before = store.history_for("ORD-B").unwrap();

        for i in 0..150 {
            store.append(draft_at("ORD-A", i)).unwrap();
        }

        assert_eq!(store.history_for("ORD-B").unwrap(), before);
        assert_eq!(store.history_for("ORD-A").unwrap().len(), 100);
    }

    #[test]
    fn test_legacy_flat_records_decode() {
        let (medium, _, store) = create_test_store();
        medium
            .set(
                DEFAULT_SAMPLES_KEY,
                r#"[{"id":"old-1","orderId":"ORD-1","userId":"u1","lat":25.1,"lng":55.2,"timestamp":"2024-05-01T07:00:00Z"}]"#,
            )
            .unwrap();

        let history = store.history_for("ORD-1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].location, Coordinates::new(25.1, 55.2));
        assert_eq!(history[0].accuracy, None);
    }

    #[test]
    fn test_reads_flat_records_under_configured_key() {
        let medium = Arc::new(MemoryMedium::new());
        medium
            .set(
                "golden_ocean_location_updates",
                r#"[{"id":"1700000000000","orderId":"ORD-7K2QX","userId":"u1","lat":25.1,"lng":55.2,"accuracy":15,"timestamp":"2024-05-01T07:00:00.000Z"}]"#,
            )
            .unwrap();
        let store = LocationStore::new(medium, Arc::new(ManualClock::new(base_time())))
            .with_key("golden_ocean_location_updates");

        let history = store.history_for("ORD-7K2QX").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].accuracy, Some(15.0));
    }

    #[test]
    fn test_malformed_records_skipped_and_preserved() {
        let (medium, _, store) = create_test_store();
        medium
            .set(
                DEFAULT_SAMPLES_KEY,
                r#"[{"garbage":true},{"orderId":"ORD-1","location":{"lat":500.0,"lng":0.0},"timestamp":"2024-05-01T07:00:00Z"}]"#,
            )
            .unwrap();

        assert!(store.samples().unwrap().is_empty());

        store.append(draft_at("ORD-1", 0)).unwrap();
        assert_eq!(store.samples().unwrap().len(), 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_samples, 1);
        assert_eq!(stats.malformed_records, 2);
    }

    #[test]
    fn test_unreadable_collection_is_replaced() {
        let (medium, _, store) = create_test_store();
        medium.set(DEFAULT_SAMPLES_KEY, "{not an array").unwrap();

        assert!(store.samples().unwrap().is_empty());
        store.append(draft_at("ORD-1", 0)).unwrap();
        assert_eq!(store.samples().unwrap().len(), 1);
    }

    #[test]
    fn test_written_records_use_nested_shape() {
        let (medium, _, store) = create_test_store();
        store
            .append(draft_at("ORD-1", 0).with_accuracy(Some(4.0)))
            .unwrap();

        let raw = medium.get(DEFAULT_SAMPLES_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let record = &value[0];
        assert_eq!(record["orderId"], "ORD-1");
        assert_eq!(record["userId"], "officer-1");
        assert!(record["location"]["lat"].is_number());
        assert!(record.get("lat").is_none());
        assert_eq!(record["accuracy"], 4.0);
    }

    #[test]
    fn test_tracked_duration() {
        let (_, _, store) = create_test_store();
        assert!(tracked_duration(&store.history_for("ORD-1").unwrap()).is_none());

        store.append(draft_at("ORD-1", 600)).unwrap();
        assert!(tracked_duration(&store.history_for("ORD-1").unwrap()).is_none());

        store.append(draft_at("ORD-1", 0)).unwrap();
        store.append(draft_at("ORD-1", 300)).unwrap();
        assert_eq!(
            tracked_duration(&store.history_for("ORD-1").unwrap()),
            Some(Duration::minutes(10))
        );
    }

    #[test]
    fn test_stats() {
        let (_, _, store) = create_test_store();
        assert_eq!(store.stats().unwrap().total_samples, 0);

        store.append(draft_at("ORD-1", 10)).unwrap();
        store.append(draft_at("ORD-2", 5)).unwrap();
        store.append(draft_at("ORD-1", 20)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_samples, 3);
        assert_eq!(stats.orders, 2);
        assert_eq!(stats.oldest_sample, Some(base_time() + Duration::seconds(5)));
        assert_eq!(stats.newest_sample, Some(base_time() + Duration::seconds(20)));
    }

    #[test]
    fn test_custom_key_and_cap() {
        let medium = Arc::new(MemoryMedium::new());
        let store = LocationStore::new(medium.clone(), Arc::new(ManualClock::new(base_time())))
            .with_key("custom")
            .with_max_per_order(0);
        assert_eq!(store.max_per_order(), 1);

        store.append(draft_at("ORD-1", 0)).unwrap();
        store.append(draft_at("ORD-1", 1)).unwrap();
        assert!(medium.get("custom").unwrap().is_some());
        assert_eq!(store.history_for("ORD-1").unwrap().len(), 1);
    }
}
