//! Scripted provider that replays recorded fixes and errors.
//!
//! Scripts are either built in code or read from a JSON Lines file where
//! each line is a fix or an error:
//!
//! ```text
//! {"lat": 25.2048, "lng": 55.2708, "accuracy": 8.0}
//! {"lat": 25.2051, "lng": 55.2712, "delayMs": 1000}
//! {"error": "timeout", "delayMs": 1000}
//! ```
//!
//! The first line answers the initial fix request; the rest are delivered
//! by every watch, each after its `delayMs`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Fix, FixOptions, LocationProvider, PositionError, WatchEvent, WatchSubscription};
use crate::error::{Error, Result};
use crate::geo::Coordinates;

/// A watch event and how long to wait before delivering it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEvent {
    /// Delay after the previous event (or after the watch started).
    pub delay: Duration,
    /// What to deliver.
    pub event: WatchEvent,
}

impl ReplayEvent {
    /// Deliver `fix` after `delay`.
    #[must_use]
    pub fn fix(delay: Duration, fix: Fix) -> Self {
        Self {
            delay,
            event: Ok(fix),
        }
    }

    /// Deliver `error` after `delay`.
    #[must_use]
    pub fn error(delay: Duration, error: PositionError) -> Self {
        Self {
            delay,
            event: Err(error),
        }
    }
}

/// Provider that replays a fixed script.
#[derive(Debug)]
pub struct ReplayProvider {
    available: bool,
    initial: Mutex<VecDeque<WatchEvent>>,
    initial_delay: Duration,
    events: Vec<ReplayEvent>,
    close_when_done: bool,
    watch_error: Option<PositionError>,
    next_watch_id: AtomicU64,
    active_watches: Arc<AtomicUsize>,
}

impl Default for ReplayProvider {
    fn default() -> Self {
        Self {
            available: true,
            initial: Mutex::new(VecDeque::new()),
            initial_delay: Duration::ZERO,
            events: Vec::new(),
            close_when_done: true,
            watch_error: None,
            next_watch_id: AtomicU64::new(0),
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ReplayProvider {
    /// An empty script: initial fixes fail with `PositionUnavailable`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider for a platform without any location capability.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    /// Queue the answer to the next initial fix request.
    ///
    /// Answers are consumed in order, one per request.
    #[must_use]
    pub fn with_initial(self, answer: WatchEvent) -> Self {
        if let Ok(mut initial) = self.initial.lock() {
            initial.push_back(answer);
        }
        self
    }

    /// Delay every initial fix answer by `delay`.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Events delivered by each watch.
    #[must_use]
    pub fn with_events(mut self, events: Vec<ReplayEvent>) -> Self {
        self.events = events;
        self
    }

    /// Keep watches open after the last event instead of closing them.
    #[must_use]
    pub fn hold_open(mut self) -> Self {
        self.close_when_done = false;
        self
    }

    /// Refuse every watch registration with `error`.
    #[must_use]
    pub fn with_watch_error(mut self, error: PositionError) -> Self {
        self.watch_error = Some(error);
        self
    }

    /// Load a script from a JSON Lines file.
    ///
    /// Blank lines and lines starting with `#` are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a line is malformed,
    /// or the script is empty.
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse_jsonl(&text)
    }

    /// Parse a JSON Lines script.
    ///
    /// # Errors
    ///
    /// Returns an error if a line is malformed or the script is empty.
    pub fn parse_jsonl(text: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            steps.push(parse_line(index + 1, line)?);
        }

        let mut steps = steps.into_iter();
        let Some(first) = steps.next() else {
            return Err(Error::ReplayParse {
                line: 0,
                message: "script contains no fixes".to_string(),
            });
        };

        Ok(Self::new()
            .with_initial_delay(first.delay)
            .with_initial(first.event)
            .with_events(steps.collect()))
    }

    /// Number of watches whose subscription is still alive.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }

    /// Total number of watches ever registered.
    #[must_use]
    pub fn watches_started(&self) -> u64 {
        self.next_watch_id.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LocationProvider for ReplayProvider {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn current_fix(&self, _options: &FixOptions) -> std::result::Result<Fix, PositionError> {
        if !self.initial_delay.is_zero() {
            tokio::time::sleep(self.initial_delay).await;
        }
        let answer = self
            .initial
            .lock()
            .map_err(|_| PositionError::Unknown("replay script lock poisoned".to_string()))?
            .pop_front();
        answer.unwrap_or(Err(PositionError::PositionUnavailable))
    }

    fn watch(&self, _options: &FixOptions) -> std::result::Result<WatchSubscription, PositionError> {
        if let Some(error) = &self.watch_error {
            return Err(error.clone());
        }
        let id = self.next_watch_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(32);
        let events = self.events.clone();
        let close_when_done = self.close_when_done;
        let guard = ActiveWatch::register(Arc::clone(&self.active_watches));

        tokio::spawn(async move {
            for step in events {
                tokio::select! {
                    () = tx.closed() => {
                        debug!("Replay watch {} cancelled", id);
                        return;
                    }
                    () = tokio::time::sleep(step.delay) => {}
                }
                if tx.send(step.event).await.is_err() {
                    return;
                }
            }
            if !close_when_done {
                tx.closed().await;
            }
            debug!("Replay watch {} finished", id);
            // Release the watch before the receiver observes the close.
            drop(guard);
            drop(tx);
        });

        Ok(WatchSubscription::new(id, rx))
    }
}

/// Counts a watch as active for as long as it lives.
struct ActiveWatch(Arc<AtomicUsize>);

impl ActiveWatch {
    fn register(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Error codes accepted in replay scripts.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScriptErrorCode {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ScriptLineRecord {
    lat: Option<f64>,
    lng: Option<f64>,
    accuracy: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    delay_ms: u64,
    error: Option<ScriptErrorCode>,
}

fn parse_line(line: usize, text: &str) -> Result<ReplayEvent> {
    let record: ScriptLineRecord =
        serde_json::from_str(text).map_err(|e| Error::ReplayParse {
            line,
            message: e.to_string(),
        })?;
    let delay = Duration::from_millis(record.delay_ms);

    if let Some(code) = record.error {
        let error = match code {
            ScriptErrorCode::PermissionDenied => PositionError::PermissionDenied,
            ScriptErrorCode::PositionUnavailable => PositionError::PositionUnavailable,
            ScriptErrorCode::Timeout => PositionError::Timeout,
            ScriptErrorCode::Unknown => PositionError::Unknown("replayed error".to_string()),
        };
        return Ok(ReplayEvent::error(delay, error));
    }

    let (Some(lat), Some(lng)) = (record.lat, record.lng) else {
        return Err(Error::ReplayParse {
            line,
            message: "lat and lng are required".to_string(),
        });
    };

    Ok(ReplayEvent::fix(
        delay,
        Fix {
            location: Coordinates::new(lat, lng),
            accuracy: record.accuracy,
            timestamp: record.timestamp,
        },
    ))
}
