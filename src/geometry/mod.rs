//! Positions, distances and track simplification.

mod simplify;

pub use simplify::{douglas_peucker, simplify_track, GeometrySimplifier, SimplifyReport};

use serde::{Deserialize, Serialize};

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Two positions this close are the same place.
pub const DEDUP_DISTANCE_M: f64 = 10.0;

/// Douglas-Peucker tolerance in degrees.
pub const DEFAULT_TOLERANCE: f64 = 0.0001;

/// A geographic position with optional altitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level.
    pub altitude: Option<i32>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, altitude: Option<i32>) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    /// Great-circle distance in metres, ignoring altitude.
    pub fn horizontal_distance(&self, other: &Self) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// Distance in metres. Includes the altitude difference only when both
    /// positions have one.
    pub fn distance(&self, other: &Self) -> f64 {
        let horizontal = self.horizontal_distance(other);
        match (self.altitude, other.altitude) {
            (Some(a), Some(b)) => {
                let vertical = f64::from(a) - f64::from(b);
                horizontal.hypot(vertical)
            }
            _ => horizontal,
        }
    }

    /// Whether `other` is within `tolerance_m` metres, inclusive.
    pub fn equals_within(&self, other: &Self, tolerance_m: f64) -> bool {
        self.distance(other) <= tolerance_m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Degrees of latitude spanning `metres` along a meridian.
    fn lat_offset(metres: f64) -> f64 {
        (metres / EARTH_RADIUS_M).to_degrees()
    }

    #[test]
    fn test_horizontal_distance_along_meridian() {
        let a = Position::new(55.0, 37.0, None);
        let b = Position::new(55.0 + lat_offset(100.0), 37.0, None);
        assert!((a.horizontal_distance(&b) - 100.0).abs() < 1e-6);
        assert_eq!(a.horizontal_distance(&a), 0.0);
    }

    #[test]
    fn test_dedup_boundary() {
        let a = Position::new(55.0, 37.0, Some(150));
        let near = Position::new(55.0 + lat_offset(9.9), 37.0, Some(150));
        let far = Position::new(55.0 + lat_offset(10.1), 37.0, Some(150));
        assert!(a.equals_within(&near, DEDUP_DISTANCE_M));
        assert!(!a.equals_within(&far, DEDUP_DISTANCE_M));
    }

    #[test]
    fn test_altitude_counts_only_when_both_present() {
        let a = Position::new(55.0, 37.0, Some(0));
        let above = Position::new(55.0, 37.0, Some(50));
        let unknown = Position::new(55.0, 37.0, None);
        assert!((a.distance(&above) - 50.0).abs() < 1e-9);
        assert!(!a.equals_within(&above, DEDUP_DISTANCE_M));
        assert!(a.equals_within(&unknown, DEDUP_DISTANCE_M));
        assert!(unknown.equals_within(&above, DEDUP_DISTANCE_M));
    }

    #[test]
    fn test_three_dimensional_distance() {
        let a = Position::new(55.0, 37.0, Some(100));
        let b = Position::new(55.0 + lat_offset(6.0), 37.0, Some(108));
        assert!((a.distance(&b) - 10.0).abs() < 1e-6);
    }
}
