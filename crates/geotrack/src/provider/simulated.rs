//! Random-walk provider for demos and manual testing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::{Fix, FixOptions, LocationProvider, PositionError, WatchSubscription};
use crate::geo::Coordinates;

/// Where a simulated walk starts unless told otherwise.
pub const DEFAULT_START: Coordinates = Coordinates::new(25.2048, 55.2708);

/// Largest per-axis move per step, in degrees.
const MAX_STEP_DEGREES: f64 = 0.002;

/// Provider that wanders around a start point.
///
/// Every fix moves the shared position by a small random offset, so
/// initial fixes and watch events form one continuous walk.
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    position: Arc<Mutex<Coordinates>>,
    step_interval: Duration,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(DEFAULT_START)
    }
}

impl SimulatedProvider {
    /// Start a walk at `start`, stepping once per second.
    #[must_use]
    pub fn new(start: Coordinates) -> Self {
        Self {
            position: Arc::new(Mutex::new(start)),
            step_interval: Duration::from_secs(1),
        }
    }

    /// Change how often watches emit a fix.
    #[must_use]
    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }

    /// Current simulated position.
    #[must_use]
    pub fn position(&self) -> Coordinates {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn step(&self) -> Fix {
        step(&self.position)
    }
}

fn step(position: &Mutex<Coordinates>) -> Fix {
    let mut current = position.lock().unwrap_or_else(PoisonError::into_inner);
    let bits = uuid::Uuid::new_v4().as_u128();
    current.lat = round6((current.lat + offset(bits) * MAX_STEP_DEGREES).clamp(-90.0, 90.0));
    current.lng = round6((current.lng + offset(bits >> 32) * MAX_STEP_DEGREES).clamp(-180.0, 180.0));
    let accuracy = 5.0 + unit(bits >> 64) * 20.0;
    Fix::at(*current).with_accuracy(accuracy.round())
}

/// Uniform value in `[0, 1)` from the low 32 bits.
#[allow(clippy::cast_precision_loss)]
fn unit(bits: u128) -> f64 {
    (bits & 0xFFFF_FFFF) as f64 / 4_294_967_296.0
}

/// Uniform value in `[-0.5, 0.5)`.
fn offset(bits: u128) -> f64 {
    unit(bits) - 0.5
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[async_trait::async_trait]
impl LocationProvider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn current_fix(&self, _options: &FixOptions) -> Result<Fix, PositionError> {
        Ok(self.step())
    }

    fn watch(&self, _options: &FixOptions) -> Result<WatchSubscription, PositionError> {
        let (tx, rx) = mpsc::channel(8);
        let position = Arc::clone(&self.position);
        let step_interval = self.step_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(step_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = ticker.tick() => {
                        if tx.send(Ok(step(&position))).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Simulated watch stopped");
        });

        Ok(WatchSubscription::new(0, rx))
    }
}
