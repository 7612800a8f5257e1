//! Orders and the order registry.
//!
//! The aggregator only ever reads orders through [`OrderRegistry`]. The
//! [`OrderBook`] is the persisted registry the CLI manages: every order lives
//! in one JSON array under a single medium key.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::geo::Coordinates;
use crate::medium::Medium;

/// Medium key holding the order registry.
pub const DEFAULT_ORDERS_KEY: &str = "assigned_orders";

/// Characters used in generated order ids.
const ORDER_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Number of random characters after the `ORD-` prefix.
const ORDER_ID_SUFFIX_LEN: usize = 5;

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    /// Created but not yet handed to an officer.
    #[default]
    Pending,
    /// Assigned to a navigation officer.
    Assigned,
    /// Underway.
    InTransit,
    /// Delivered.
    Delivered,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Assigned => write!(f, "Assigned"),
            Self::InTransit => write!(f, "In Transit"),
            Self::Delivered => write!(f, "Delivered"),
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['_', ' '], "-").as_str() {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "in-transit" => Ok(Self::InTransit),
            "delivered" => Ok(Self::Delivered),
            other => Err(format!(
                "unknown order status '{other}' (expected pending, assigned, in-transit or delivered)"
            )),
        }
    }
}

/// A delivery task with a destination and an assignable officer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order identifier, e.g. `ORD-7K2QX`.
    pub id: String,
    /// Where the order is headed.
    pub destination: Coordinates,
    /// User id of the assigned officer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    /// Current status.
    #[serde(default)]
    pub status: OrderStatus,
    /// When the order was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Create a pending, unassigned order.
    #[must_use]
    pub fn new(id: impl Into<String>, destination: Coordinates) -> Self {
        Self {
            id: id.into(),
            destination,
            assigned_to: None,
            status: OrderStatus::Pending,
            created_at: None,
        }
    }

    /// Assign the order to `user_id`, moving it to [`OrderStatus::Assigned`].
    #[must_use]
    pub fn assign(mut self, user_id: impl Into<String>) -> Self {
        self.assigned_to = Some(user_id.into());
        self.status = OrderStatus::Assigned;
        self
    }

    /// Check the order's fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOrder`] if the id is blank or the destination is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_order("order id is required"));
        }
        self.destination
            .validate()
            .map_err(|e| Error::invalid_order(format!("destination: {e}")))
    }
}

/// Generate a random order id of the form `ORD-XXXXX`.
#[must_use]
pub fn generate_order_id() -> String {
    let random = uuid::Uuid::new_v4();
    let suffix: String = random
        .as_bytes()
        .iter()
        .take(ORDER_ID_SUFFIX_LEN)
        .map(|b| char::from(ORDER_ID_CHARSET[usize::from(*b) % ORDER_ID_CHARSET.len()]))
        .collect();
    format!("ORD-{suffix}")
}

/// Read-only source of order metadata.
pub trait OrderRegistry: Send + Sync + std::fmt::Debug {
    /// Snapshot of every known order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn orders(&self) -> Result<Vec<Order>>;

    /// Find a single order by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn lookup(&self, order_id: &str) -> Result<Option<Order>> {
        Ok(self.orders()?.into_iter().find(|o| o.id == order_id))
    }
}

impl OrderRegistry for Vec<Order> {
    fn orders(&self) -> Result<Vec<Order>> {
        Ok(self.clone())
    }
}

/// The persisted order registry.
#[derive(Debug)]
pub struct OrderBook {
    medium: Arc<dyn Medium>,
    key: String,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl OrderBook {
    /// Create a registry that keeps its orders under `key` in `medium`.
    #[must_use]
    pub fn new(medium: Arc<dyn Medium>, key: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            medium,
            key: key.into(),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Add an order. Missing `created_at` is stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the order is invalid, its id is taken, or the medium fails.
    pub fn create(&self, mut order: Order) -> Result<Order> {
        order.validate()?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::internal("order book lock poisoned"))?;

        let mut orders = self.load()?;
        if orders.iter().any(|o| o.id == order.id) {
            return Err(Error::DuplicateOrder { id: order.id });
        }

        if order.created_at.is_none() {
            order.created_at = Some(self.clock.now());
        }
        orders.push(order.clone());
        self.save(&orders)?;

        info!("Created order {} ({})", order.id, order.status);
        Ok(order)
    }

    /// Update an existing order's status.
    ///
    /// Returns the updated order, or `None` if no order has that id.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails.
    pub fn set_status(&self, order_id: &str, status: OrderStatus) -> Result<Option<Order>> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::internal("order book lock poisoned"))?;

        let mut orders = self.load()?;
        let Some(order) = orders.iter_mut().find(|o| o.id == order_id) else {
            return Ok(None);
        };
        order.status = status;
        let updated = order.clone();
        self.save(&orders)?;
        Ok(Some(updated))
    }

    fn load(&self) -> Result<Vec<Order>> {
        let Some(raw) = self.medium.get(&self.key)? else {
            return Ok(Vec::new());
        };

        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(e) => {
                warn!("Order collection under {} is unreadable, ignoring it: {}", self.key, e);
                return Ok(Vec::new());
            }
        };

        Ok(values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<Order>(value) {
                Ok(order) => Some(order),
                Err(e) => {
                    warn!("Skipping malformed order record: {}", e);
                    None
                }
            })
            .collect())
    }

    fn save(&self, orders: &[Order]) -> Result<()> {
        let raw = serde_json::to_string(orders)?;
        self.medium.set(&self.key, &raw)
    }
}

impl OrderRegistry for OrderBook {
    fn orders(&self) -> Result<Vec<Order>> {
        self.load()
    }
}
