//! Geolocation sampling sessions.
//!
//! A [`Sampler`] turns a [`LocationProvider`] into a stream of stored
//! [`PositionSample`]s for one order at a time. Starting a session asks for a
//! one-shot fix, then keeps a continuous watch open until the session is
//! stopped, replaced, or closed by the provider.
//!
//! Every session carries a generation number. Stopping or restarting bumps
//! it, and any result that arrives for an older generation is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::provider::{Fix, FixOptions, LocationProvider, PositionError, WatchSubscription};
use crate::store::{LocationStore, PositionSample, SampleDraft};

/// Location permission as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Not asked yet, or released by a stop.
    #[default]
    Prompt,
    /// The last start obtained a fix.
    Granted,
    /// The last start failed.
    Denied,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prompt => write!(f, "prompt"),
            Self::Granted => write!(f, "granted"),
            Self::Denied => write!(f, "denied"),
        }
    }
}

/// Classification of a tracking failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingErrorKind {
    /// Missing order or user id.
    InvalidRequest,
    /// The platform has no location capability.
    CapabilityUnavailable,
    /// Location access was refused.
    PermissionDenied,
    /// No position could be determined.
    PositionUnavailable,
    /// No fix arrived in time.
    Timeout,
    /// Anything else.
    Unknown,
    /// The start was superseded by a stop or another start.
    Cancelled,
}

impl TrackingErrorKind {
    /// The user-facing message for this kind.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::InvalidRequest => "Order ID and User ID are required",
            Self::CapabilityUnavailable => "Geolocation is not supported by your browser",
            Self::PermissionDenied => {
                "Location permission denied. Please enable location access in your browser settings."
            }
            Self::PositionUnavailable => {
                "Location information is unavailable. Please check your GPS settings."
            }
            Self::Timeout => "Location request timed out. Please try again.",
            Self::Unknown => "An unknown error occurred while accessing your location.",
            Self::Cancelled => "Tracking was stopped before a location was obtained.",
        }
    }
}

/// A tracking failure as exposed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct TrackingError {
    /// What went wrong.
    pub kind: TrackingErrorKind,
    /// Fixed message for the kind.
    pub message: String,
}

impl TrackingError {
    /// Create an error with the standard message for `kind`.
    #[must_use]
    pub fn new(kind: TrackingErrorKind) -> Self {
        Self {
            kind,
            message: kind.message().to_string(),
        }
    }
}

impl From<PositionError> for TrackingError {
    fn from(err: PositionError) -> Self {
        let kind = match err {
            PositionError::PermissionDenied => TrackingErrorKind::PermissionDenied,
            PositionError::PositionUnavailable => TrackingErrorKind::PositionUnavailable,
            PositionError::Timeout => TrackingErrorKind::Timeout,
            PositionError::Unknown(detail) => {
                debug!("Unclassified provider error: {}", detail);
                TrackingErrorKind::Unknown
            }
        };
        Self::new(kind)
    }
}

/// Observable state of a sampler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    /// Most recent sample of the current session.
    pub location: Option<PositionSample>,
    /// Last recorded error.
    pub error: Option<TrackingError>,
    /// Whether a watch is running.
    pub is_tracking: bool,
    /// Last observed permission.
    pub permission: Permission,
}

/// Fix options for the two phases of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    /// Options for the one-shot fix; its timeout also bounds the wait.
    pub initial: FixOptions,
    /// Options for the continuous watch; its timeout is the per-event gap.
    pub watch: FixOptions,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            initial: FixOptions::initial(),
            watch: FixOptions::watch(),
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    status: watch::Sender<TrackingStatus>,
    session: Mutex<Session>,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut TrackingStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }

    /// Apply `f` only while `generation` is still the active session.
    fn update_if_current(&self, generation: u64, f: impl FnOnce(&mut TrackingStatus)) -> bool {
        let session = self.lock_session();
        if session.generation != generation {
            return false;
        }
        self.update(f);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_session().generation == generation
    }

    /// End the active session, or only `generation` when given.
    fn stop(&self, only: Option<u64>) -> bool {
        let mut session = self.lock_session();
        if only.is_some_and(|g| g != session.generation) {
            return false;
        }
        session.generation += 1;
        if let Some(task) = session.task.take() {
            task.abort();
        }
        self.update(|status| {
            status.location = None;
            status.is_tracking = false;
            if status.permission == Permission::Granted {
                status.permission = Permission::Prompt;
            }
        });
        true
    }

    /// Replace any running session with a fresh generation.
    fn begin(&self) -> u64 {
        let mut session = self.lock_session();
        session.generation += 1;
        if let Some(task) = session.task.take() {
            task.abort();
            debug!("Stopped previous watch");
        }
        self.update(|status| {
            status.location = None;
            status.is_tracking = false;
        });
        session.generation
    }
}

/// Drives tracking sessions against a provider and a store.
#[derive(Debug)]
pub struct Sampler {
    provider: Arc<dyn LocationProvider>,
    store: Arc<LocationStore>,
    config: SamplerConfig,
    shared: Arc<Shared>,
}

impl Sampler {
    /// Create an idle sampler.
    #[must_use]
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        store: Arc<LocationStore>,
        config: SamplerConfig,
    ) -> Self {
        let (status, _) = watch::channel(TrackingStatus::default());
        Self {
            provider,
            store,
            config,
            shared: Arc::new(Shared {
                status,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Start tracking `order_id` on behalf of `user_id`.
    ///
    /// Any running session is stopped first. Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackingError`] if the request is invalid, the provider
    /// cannot produce an initial fix, or the start was superseded before the
    /// fix arrived. The same error is recorded in [`Sampler::status`] unless
    /// it is [`TrackingErrorKind::Cancelled`].
    pub async fn start_tracking(
        &self,
        order_id: &str,
        user_id: &str,
    ) -> Result<TrackingHandle, TrackingError> {
        if order_id.trim().is_empty() || user_id.trim().is_empty() {
            let err = TrackingError::new(TrackingErrorKind::InvalidRequest);
            self.shared.update(|status| status.error = Some(err.clone()));
            return Err(err);
        }

        if !self.provider.is_available() {
            let err = TrackingError::new(TrackingErrorKind::CapabilityUnavailable);
            warn!("Provider {} has no location capability", self.provider.name());
            self.shared.update(|status| {
                status.permission = Permission::Denied;
                status.error = Some(err.clone());
            });
            return Err(err);
        }

        let generation = self.shared.begin();
        info!(
            "Starting tracking for order {} (user {}, provider {})",
            order_id,
            user_id,
            self.provider.name()
        );

        let initial = self.config.initial;
        let fix = match tokio::time::timeout(initial.timeout, self.provider.current_fix(&initial))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PositionError::Timeout),
        };

        match fix {
            Ok(fix) => self.commit_start(generation, order_id, user_id, &fix),
            Err(err) => {
                let err = TrackingError::from(err);
                let current = self.shared.update_if_current(generation, |status| {
                    status.permission = Permission::Denied;
                    status.is_tracking = false;
                    status.error = Some(err.clone());
                });
                if !current {
                    return Err(TrackingError::new(TrackingErrorKind::Cancelled));
                }
                warn!("Initial fix for order {} failed: {}", order_id, err.message);
                Err(err)
            }
        }
    }

    fn commit_start(
        &self,
        generation: u64,
        order_id: &str,
        user_id: &str,
        fix: &Fix,
    ) -> Result<TrackingHandle, TrackingError> {
        if !self.shared.is_current(generation) {
            debug!("Discarding initial fix for superseded session {}", generation);
            return Err(TrackingError::new(TrackingErrorKind::Cancelled));
        }

        let sample = record(&self.store, order_id, user_id, fix);

        let subscription = match self.provider.watch(&self.config.watch) {
            Ok(subscription) => subscription,
            Err(err) => {
                let err = TrackingError::from(err);
                let current = self.shared.update_if_current(generation, |status| {
                    status.permission = Permission::Denied;
                    status.is_tracking = false;
                    status.error = Some(err.clone());
                });
                if !current {
                    return Err(TrackingError::new(TrackingErrorKind::Cancelled));
                }
                warn!("Could not start watch for order {}: {}", order_id, err.message);
                return Err(err);
            }
        };

        let mut session = self.shared.lock_session();
        if session.generation != generation {
            debug!("Session {} was superseded while registering its watch", generation);
            return Err(TrackingError::new(TrackingErrorKind::Cancelled));
        }

        session.task = Some(tokio::spawn(run_watch(WatchSession {
            shared: Arc::clone(&self.shared),
            store: Arc::clone(&self.store),
            generation,
            order_id: order_id.to_string(),
            user_id: user_id.to_string(),
            subscription,
            gap: self.config.watch.timeout,
        })));

        self.shared.update(|status| {
            status.permission = Permission::Granted;
            status.error = None;
            status.is_tracking = true;
            if sample.is_some() {
                status.location = sample;
            }
        });

        Ok(TrackingHandle {
            generation,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stop the active session, if any. Calling it again has no effect.
    pub fn stop_tracking(&self) {
        if self.shared.stop(None) {
            info!("Tracking stopped");
        }
    }

    /// A snapshot of the current state.
    #[must_use]
    pub fn status(&self) -> TrackingStatus {
        self.shared.status.borrow().clone()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TrackingStatus> {
        self.shared.status.subscribe()
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shared.stop(None);
    }
}

/// Handle to one tracking session.
#[derive(Debug, Clone)]
pub struct TrackingHandle {
    generation: u64,
    shared: Arc<Shared>,
}

impl TrackingHandle {
    /// Stop tracking if this handle's session is still the active one.
    ///
    /// Returns `true` if the session was stopped by this call.
    pub fn stop(&self) -> bool {
        let stopped = self.shared.stop(Some(self.generation));
        if stopped {
            info!("Tracking session {} stopped", self.generation);
        }
        stopped
    }

    /// Whether this handle's session is active and watching.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let session = self.shared.lock_session();
        session.generation == self.generation && self.shared.status.borrow().is_tracking
    }
}

struct WatchSession {
    shared: Arc<Shared>,
    store: Arc<LocationStore>,
    generation: u64,
    order_id: String,
    user_id: String,
    subscription: WatchSubscription,
    gap: Duration,
}

async fn run_watch(mut watch: WatchSession) {
    loop {
        let event = match tokio::time::timeout(watch.gap, watch.subscription.next()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                if watch
                    .shared
                    .update_if_current(watch.generation, |status| status.is_tracking = false)
                {
                    info!("Provider closed the watch for order {}", watch.order_id);
                }
                return;
            }
            Err(_) => Err(PositionError::Timeout),
        };

        let current = match event {
            Ok(fix) => {
                if !watch.shared.is_current(watch.generation) {
                    return;
                }
                match record(&watch.store, &watch.order_id, &watch.user_id, &fix) {
                    Some(sample) => watch
                        .shared
                        .update_if_current(watch.generation, |status| {
                            status.location = Some(sample);
                        }),
                    None => true,
                }
            }
            Err(err) => {
                let err = TrackingError::from(err);
                warn!(
                    "Watch error for order {}: {}",
                    watch.order_id, err.message
                );
                watch
                    .shared
                    .update_if_current(watch.generation, |status| status.error = Some(err))
            }
        };
        if !current {
            return;
        }
    }
}

fn record(store: &LocationStore, order_id: &str, user_id: &str, fix: &Fix) -> Option<PositionSample> {
    let mut draft =
        SampleDraft::new(order_id, user_id, fix.location).with_accuracy(fix.accuracy);
    if let Some(timestamp) = fix.timestamp {
        draft = draft.with_timestamp(timestamp);
    }
    match store.append_retained(draft) {
        Ok(Some(sample)) => Some(sample),
        Ok(None) => {
            debug!("Fix for order {} is older than its retained history", order_id);
            None
        }
        Err(e) => {
            warn!("Dropping fix for order {}: {}", order_id, e);
            None
        }
    }
}
