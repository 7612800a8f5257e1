//! Coordinates and great-circle helpers.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude, in `[-90, 90]`.
    pub lat: f64,
    /// Longitude, in `[-180, 180]`.
    pub lng: f64,
}

impl Coordinates {
    /// Create a coordinate pair without validation.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Check that both components are finite and within range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSample`] naming the offending component.
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::invalid_sample(format!(
                "latitude {} is outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(Error::invalid_sample(format!(
                "longitude {} is outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }

    /// Haversine distance to `other`, in kilometres, rounded to two decimals.
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();

        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        (EARTH_RADIUS_KM * c * 100.0).round() / 100.0
    }
}

impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, {}",
            format_coordinate(self.lat, Axis::Latitude),
            format_coordinate(self.lng, Axis::Longitude)
        )
    }
}

/// Which axis a coordinate component belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// North/south.
    Latitude,
    /// East/west.
    Longitude,
}

/// Format a single component with six decimals and a hemisphere letter.
#[must_use]
pub fn format_coordinate(value: f64, axis: Axis) -> String {
    let direction = match axis {
        Axis::Latitude if value >= 0.0 => 'N',
        Axis::Latitude => 'S',
        Axis::Longitude if value >= 0.0 => 'E',
        Axis::Longitude => 'W',
    };
    format!("{:.6}° {direction}", value.abs())
}
