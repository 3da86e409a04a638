//! Last-known-position cache used to drop readings that did not move.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::geometry::{Position, DEDUP_DISTANCE_M};
use crate::store::{TrackStore, VehicleStore};
use crate::types::VehicleId;

/// Shared `vehicle -> last stored position` map.
///
/// The check and the update happen under one lock so two readings for the
/// same vehicle on different connections cannot both pass.
pub struct PositionCache {
    positions: Mutex<HashMap<VehicleId, Position>>,
    tolerance_m: f64,
}

impl Default for PositionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionCache {
    pub fn new() -> Self {
        Self::with_tolerance(DEDUP_DISTANCE_M)
    }

    pub fn with_tolerance(tolerance_m: f64) -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            tolerance_m,
        }
    }

    /// Record `position` for `vehicle` unless it is within the dedup
    /// distance of the cached one. Returns `true` when the reading moved and
    /// should be stored.
    pub fn check_and_update(&self, vehicle: VehicleId, position: Position) -> bool {
        let mut positions = self.positions.lock();
        if let Some(last) = positions.get(&vehicle) {
            if last.equals_within(&position, self.tolerance_m) {
                return false;
            }
        }
        positions.insert(vehicle, position);
        true
    }

    pub fn get(&self, vehicle: VehicleId) -> Option<Position> {
        self.positions.lock().get(&vehicle).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.lock().is_empty()
    }

    /// Replace the whole cache with the latest stored position of every
    /// known vehicle. A vehicle whose lookup fails keeps no entry.
    pub async fn refresh(
        &self,
        vehicles: &dyn VehicleStore,
        tracks: &dyn TrackStore,
    ) -> Result<usize, StoreError> {
        let mut fresh = HashMap::new();
        for vehicle in vehicles.list_vehicles().await? {
            match tracks.last_position(vehicle.id).await {
                Ok(Some(position)) => {
                    fresh.insert(vehicle.id, position);
                }
                Ok(None) => {}
                Err(e) => warn!(vehicle = %vehicle.id, error = %e, "Failed to load last position"),
            }
        }

        let loaded = fresh.len();
        *self.positions.lock() = fresh;
        info!(vehicles = loaded, "Position cache refreshed");
        Ok(loaded)
    }

    pub fn clear(&self) {
        self.positions.lock().clear();
        debug!("Position cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::EARTH_RADIUS_M;
    use crate::store::MemoryStore;
    use crate::types::{ModerationStatus, ProviderId, Vehicle};
    use chrono::Utc;

    fn north_of(p: Position, metres: f64) -> Position {
        Position::new(p.latitude + (metres / EARTH_RADIUS_M).to_degrees(), p.longitude, p.altitude)
    }

    #[test]
    fn test_first_reading_always_passes() {
        let cache = PositionCache::new();
        assert!(cache.check_and_update(VehicleId(1), Position::new(55.0, 37.0, None)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_boundary() {
        let cache = PositionCache::new();
        let start = Position::new(55.0, 37.0, Some(100));
        assert!(cache.check_and_update(VehicleId(1), start));

        // too close: rejected, cache keeps the original position
        assert!(!cache.check_and_update(VehicleId(1), north_of(start, 9.9)));
        assert_eq!(cache.get(VehicleId(1)), Some(start));

        assert!(cache.check_and_update(VehicleId(1), north_of(start, 10.1)));
        assert_eq!(cache.get(VehicleId(1)), Some(north_of(start, 10.1)));
    }

    #[test]
    fn test_missing_altitude_is_horizontal_only() {
        let cache = PositionCache::new();
        assert!(cache.check_and_update(VehicleId(1), Position::new(55.0, 37.0, Some(0))));
        assert!(!cache.check_and_update(VehicleId(1), Position::new(55.0, 37.0, None)));
    }

    #[test]
    fn test_vehicles_are_independent() {
        let cache = PositionCache::new();
        let p = Position::new(55.0, 37.0, None);
        assert!(cache.check_and_update(VehicleId(1), p));
        assert!(cache.check_and_update(VehicleId(2), p));
    }

    #[tokio::test]
    async fn test_refresh_replaces_contents() {
        let store = MemoryStore::new();
        for id in 1..=2 {
            store.put_vehicle(Vehicle {
                id: VehicleId(id),
                imei: id.to_string(),
                oid: None,
                name: None,
                provider_id: ProviderId(1),
                moderation_status: ModerationStatus::Approved,
            });
        }
        let now = Utc::now();
        store.insert_point(VehicleId(1), Position::new(55.0, 37.0, None), now, now);

        let cache = PositionCache::new();
        cache.check_and_update(VehicleId(9), Position::new(1.0, 1.0, None));

        let loaded = cache.refresh(&store, &store).await.unwrap();
        assert_eq!(loaded, 1);
        assert!(cache.get(VehicleId(9)).is_none());
        assert_eq!(cache.get(VehicleId(1)), Some(Position::new(55.0, 37.0, None)));
    }
}
