//! `geotrack` - Location tracking for delivery orders
//!
//! This library samples device positions for an order, keeps a bounded
//! per-order history in a key-value medium, and derives the latest known
//! position of every tracked order for periodic display.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod aggregate;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod logging;
pub mod medium;
pub mod orders;
pub mod poller;
pub mod provider;
pub mod sampler;
pub mod store;

pub use aggregate::{aggregate, AggregationSource, LiveBoard, TrackedOrderView};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use geo::Coordinates;
pub use logging::init_logging;
pub use medium::{Medium, MemoryMedium, SqliteMedium};
pub use orders::{Order, OrderBook, OrderRegistry, OrderStatus};
pub use poller::{PollUpdate, Poller, PollerHandle};
pub use provider::{LocationProvider, ReplayProvider, SimulatedProvider};
pub use sampler::{Permission, Sampler, TrackingError, TrackingErrorKind, TrackingHandle, TrackingStatus};
pub use store::{LocationStore, PositionSample, SampleDraft, StoreStats};
