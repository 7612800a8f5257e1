//! Platform location capability.
//!
//! A [`LocationProvider`] answers one-shot fix requests and opens continuous
//! watches. A watch is an explicit [`WatchSubscription`]: events arrive over a
//! channel and dropping the subscription cancels the watch on the provider
//! side.

mod replay;
mod simulated;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::geo::Coordinates;

pub use replay::{ReplayEvent, ReplayProvider};
pub use simulated::{SimulatedProvider, DEFAULT_START};

/// Errors a provider can report for a fix request or watch event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    /// The user or platform refused location access.
    #[error("permission denied")]
    PermissionDenied,

    /// No position could be determined.
    #[error("position unavailable")]
    PositionUnavailable,

    /// No position arrived within the requested timeout.
    #[error("timed out")]
    Timeout,

    /// Anything the provider could not classify.
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Options passed along with a fix or watch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixOptions {
    /// Ask for the most precise fix available.
    pub high_accuracy: bool,
    /// How long the caller is willing to wait for a fix.
    pub timeout: Duration,
    /// How old a cached fix may be and still be returned.
    pub maximum_age: Duration,
}

impl FixOptions {
    /// Options for the initial one-shot fix: fresh, high accuracy, 10 s timeout.
    #[must_use]
    pub const fn initial() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
            maximum_age: Duration::ZERO,
        }
    }

    /// Options for continuous watching: 10 s timeout, cached fixes up to 5 s old.
    #[must_use]
    pub const fn watch() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
            maximum_age: Duration::from_secs(5),
        }
    }
}

/// A single position fix as reported by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    /// Where the device is.
    pub location: Coordinates,
    /// Accuracy radius in meters, when known.
    pub accuracy: Option<f64>,
    /// Provider-side time of the fix, when known.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Fix {
    /// A fix with no accuracy or timestamp.
    #[must_use]
    pub const fn at(location: Coordinates) -> Self {
        Self {
            location,
            accuracy: None,
            timestamp: None,
        }
    }

    /// Set the accuracy radius.
    #[must_use]
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }
}

/// One event delivered by a watch.
pub type WatchEvent = Result<Fix, PositionError>;

/// An active watch registration.
///
/// Dropping the subscription cancels the watch.
#[derive(Debug)]
pub struct WatchSubscription {
    id: u64,
    events: mpsc::Receiver<WatchEvent>,
}

impl WatchSubscription {
    /// Wrap the receiving half of a provider's event channel.
    #[must_use]
    pub fn new(id: u64, events: mpsc::Receiver<WatchEvent>) -> Self {
        Self { id, events }
    }

    /// Provider-assigned watch id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` means the provider closed the watch.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

/// A source of device positions.
#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync + std::fmt::Debug {
    /// Name of this provider (for logging).
    fn name(&self) -> &'static str;

    /// Whether the platform has a location capability at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Request a single fix.
    ///
    /// # Errors
    ///
    /// Returns a [`PositionError`] if no fix can be produced.
    async fn current_fix(&self, options: &FixOptions) -> Result<Fix, PositionError>;

    /// Start watching position. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`PositionError`] if the watch cannot be registered.
    fn watch(&self, options: &FixOptions) -> Result<WatchSubscription, PositionError>;
}
