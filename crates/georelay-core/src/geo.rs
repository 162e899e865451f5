//! Geographic positions and great-circle distance.
//!
//! Distances use the haversine formula on a spherical Earth. That is
//! accurate to well under a centimetre at the metre scale the grouper
//! works at, and cheap enough to run for every recipient of a broadcast.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude on the haversine sphere.
const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

// ============================================================================
// Position
// ============================================================================

/// A (latitude, longitude) pair in decimal degrees.
///
/// Constructed through [`Position::new`], which rejects non-finite and
/// out-of-range values so that everything past the protocol boundary can
/// assume a valid coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    /// Creates a validated position.
    ///
    /// # Errors
    ///
    /// - `DomainError::InvalidLatitude` if `lat` is not within -90..=90
    /// - `DomainError::InvalidLongitude` if `lng` is not within -180..=180
    pub fn new(lat: f64, lng: f64) -> DomainResult<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(DomainError::InvalidLatitude(lat));
        }
        if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
            return Err(DomainError::InvalidLongitude(lng));
        }
        Ok(Self { lat, lng })
    }

    /// Great-circle distance to another position in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        distance_meters(*self, *other)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

/// Haversine great-circle distance between two positions in meters.
///
/// Symmetric in its arguments and exactly zero for identical inputs.
pub fn distance_meters(a: Position, b: Position) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    EARTH_RADIUS_M * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

// ============================================================================
// Bounding Box
// ============================================================================

/// Axis-aligned latitude/longitude box.
///
/// Used by group stores to pre-filter candidate groups before an exact
/// distance check. The box always contains the circle it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoBounds {
    /// Builds the smallest box containing a circle of `radius_m` around `center`.
    ///
    /// Near the poles the longitude span degenerates, so it is widened to
    /// the full range rather than dividing by a vanishing cosine.
    pub fn around(center: Position, radius_m: f64) -> Self {
        let radius_m = radius_m.max(0.0);
        let d_lat = radius_m / METERS_PER_DEGREE;
        let cos_lat = center.lat.to_radians().cos();

        let (min_lng, max_lng) = if cos_lat < 1e-9 {
            (-180.0, 180.0)
        } else {
            let d_lng = d_lat / cos_lat;
            (
                (center.lng - d_lng).max(-180.0),
                (center.lng + d_lng).min(180.0),
            )
        };

        Self {
            min_lat: (center.lat - d_lat).max(-90.0),
            max_lat: (center.lat + d_lat).min(90.0),
            min_lng,
            max_lng,
        }
    }

    /// Returns true if the position lies inside the box (edges inclusive).
    pub fn contains(&self, position: &Position) -> bool {
        (self.min_lat..=self.max_lat).contains(&position.lat)
            && (self.min_lng..=self.max_lng).contains(&position.lng)
    }
}
