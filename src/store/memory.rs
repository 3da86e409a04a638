//! In-memory store implementing every collaborator trait.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{PersistenceSink, ProviderStore, TrackStore, VehicleStore};
use crate::error::StoreError;
use crate::geometry::Position;
use crate::types::{
    NavigationReading, NewVehicle, PointId, Provider, ProviderId, Track, TrackPoint, Vehicle,
    VehicleId,
};

/// Initial contents, usually loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub vehicles: Vec<Vehicle>,
    #[serde(default)]
    pub points: Vec<TrackPoint>,
}

impl Seed {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    providers: Vec<Provider>,
    vehicles: BTreeMap<VehicleId, Vehicle>,
    points: BTreeMap<PointId, TrackPoint>,
    next_vehicle: i64,
    next_point: i64,
}

/// Process-local store. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        store.add_providers(seed.providers);
        {
            let mut inner = store.inner.write();
            for vehicle in seed.vehicles {
                inner.next_vehicle = inner.next_vehicle.max(vehicle.id.0);
                inner.vehicles.insert(vehicle.id, vehicle);
            }
            for point in seed.points {
                inner.next_point = inner.next_point.max(point.id.0);
                inner.points.insert(point.id, point);
            }
        }
        store
    }

    /// Add providers, replacing any with the same id.
    pub fn add_providers(&self, providers: impl IntoIterator<Item = Provider>) {
        let mut inner = self.inner.write();
        for provider in providers {
            inner.providers.retain(|p| p.id != provider.id);
            inner.providers.push(provider);
        }
    }

    /// Insert a fully specified vehicle, replacing one with the same id.
    pub fn put_vehicle(&self, vehicle: Vehicle) {
        let mut inner = self.inner.write();
        inner.next_vehicle = inner.next_vehicle.max(vehicle.id.0);
        inner.vehicles.insert(vehicle.id, vehicle);
    }

    /// Current contents in seed form.
    pub fn snapshot(&self) -> Seed {
        let inner = self.inner.read();
        Seed {
            providers: inner.providers.clone(),
            vehicles: inner.vehicles.values().cloned().collect(),
            points: inner.points.values().cloned().collect(),
        }
    }

    /// All stored points, in id order.
    pub fn points(&self) -> Vec<TrackPoint> {
        self.inner.read().points.values().cloned().collect()
    }

    pub fn point_count(&self) -> usize {
        self.inner.read().points.len()
    }

    /// Store a point directly, as a backfill would. Returns its id.
    pub fn insert_point(
        &self,
        vehicle_id: VehicleId,
        position: Position,
        sent_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> PointId {
        let mut inner = self.inner.write();
        inner.next_point += 1;
        let id = PointId(inner.next_point);
        inner.points.insert(
            id,
            TrackPoint {
                id,
                vehicle_id,
                latitude: position.latitude,
                longitude: position.longitude,
                altitude: position.altitude,
                sent_at,
                received_at,
            },
        );
        id
    }
}

#[async_trait]
impl VehicleStore for MemoryStore {
    async fn find_vehicle(&self, id: VehicleId) -> Result<Option<Vehicle>, StoreError> {
        Ok(self.inner.read().vehicles.get(&id).cloned())
    }

    async fn find_vehicles_by_oid(
        &self,
        oid: u32,
        provider: ProviderId,
    ) -> Result<Vec<Vehicle>, StoreError> {
        Ok(self
            .inner
            .read()
            .vehicles
            .values()
            .filter(|v| v.provider_id == provider && v.oid == Some(oid))
            .cloned()
            .collect())
    }

    async fn find_vehicles_by_provider(
        &self,
        provider: ProviderId,
    ) -> Result<Vec<Vehicle>, StoreError> {
        Ok(self
            .inner
            .read()
            .vehicles
            .values()
            .filter(|v| v.provider_id == provider)
            .cloned()
            .collect())
    }

    async fn insert_vehicle(&self, vehicle: NewVehicle) -> Result<VehicleId, StoreError> {
        let mut inner = self.inner.write();
        inner.next_vehicle += 1;
        let id = VehicleId(inner.next_vehicle);
        inner.vehicles.insert(
            id,
            Vehicle {
                id,
                imei: vehicle.imei,
                oid: vehicle.oid,
                name: vehicle.name,
                provider_id: vehicle.provider_id,
                moderation_status: vehicle.moderation_status,
            },
        );
        Ok(id)
    }

    async fn update_vehicle_oid(&self, id: VehicleId, oid: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let vehicle = inner
            .vehicles
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        vehicle.oid = Some(oid);
        Ok(())
    }

    async fn list_vehicles(&self) -> Result<Vec<Vehicle>, StoreError> {
        Ok(self.inner.read().vehicles.values().cloned().collect())
    }
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn list_providers(&self) -> Result<Vec<Provider>, StoreError> {
        Ok(self.inner.read().providers.clone())
    }
}

#[async_trait]
impl TrackStore for MemoryStore {
    async fn last_position(&self, vehicle: VehicleId) -> Result<Option<Position>, StoreError> {
        Ok(self
            .inner
            .read()
            .points
            .values()
            .filter(|p| p.vehicle_id == vehicle)
            .max_by_key(|p| (p.sent_at, p.id))
            .map(|p| Position::new(p.latitude, p.longitude, p.altitude)))
    }

    async fn list_tracks_in_window(
        &self,
        vehicle: Option<VehicleId>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Track>, StoreError> {
        let inner = self.inner.read();
        let mut tracks: BTreeMap<VehicleId, Vec<TrackPoint>> = BTreeMap::new();
        for point in inner.points.values() {
            if vehicle.is_some_and(|v| v != point.vehicle_id) {
                continue;
            }
            if point.received_at < start || point.received_at >= end {
                continue;
            }
            tracks.entry(point.vehicle_id).or_default().push(point.clone());
        }

        Ok(tracks
            .into_iter()
            .map(|(vehicle_id, mut points)| {
                points.sort_by_key(|p| (p.sent_at, p.id));
                Track { vehicle_id, points }
            })
            .collect())
    }

    async fn delete_point(&self, id: PointId) -> Result<(), StoreError> {
        self.inner
            .write()
            .points
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl PersistenceSink for MemoryStore {
    async fn save(
        &self,
        reading: &NavigationReading,
        vehicle: VehicleId,
    ) -> Result<(), StoreError> {
        self.insert_point(vehicle, reading.position(), reading.sent_at, reading.received_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModerationStatus;
    use chrono::Duration;

    fn vehicle(id: i64, imei: &str, oid: Option<u32>, provider: i64) -> Vehicle {
        Vehicle {
            id: VehicleId(id),
            imei: imei.into(),
            oid,
            name: None,
            provider_id: ProviderId(provider),
            moderation_status: ModerationStatus::Approved,
        }
    }

    #[tokio::test]
    async fn test_vehicle_queries() {
        let store = MemoryStore::from_seed(Seed {
            vehicles: vec![
                vehicle(1, "111", Some(11), 1),
                vehicle(2, "222", None, 1),
                vehicle(5, "555", Some(11), 2),
            ],
            ..Default::default()
        });

        assert_eq!(store.find_vehicles_by_oid(11, ProviderId(1)).await.unwrap().len(), 1);
        assert_eq!(store.find_vehicles_by_provider(ProviderId(1)).await.unwrap().len(), 2);

        // ids continue after the highest seeded id
        let id = store
            .insert_vehicle(NewVehicle::placeholder(99, ProviderId(1)))
            .await
            .unwrap();
        assert_eq!(id, VehicleId(6));

        store.update_vehicle_oid(VehicleId(2), 22).await.unwrap();
        assert_eq!(store.find_vehicle(VehicleId(2)).await.unwrap().unwrap().oid, Some(22));
        assert!(store.update_vehicle_oid(VehicleId(42), 1).await.is_err());
    }

    #[tokio::test]
    async fn test_tracks_grouped_and_ordered() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let later = now + Duration::seconds(10);
        let p2 = store.insert_point(VehicleId(1), Position::new(1.0, 1.0, None), later, later);
        let p1 = store.insert_point(VehicleId(1), Position::new(2.0, 2.0, None), now, now);
        store.insert_point(VehicleId(2), Position::new(3.0, 3.0, None), now, now);
        store.insert_point(
            VehicleId(1),
            Position::new(4.0, 4.0, None),
            now - Duration::days(3),
            now - Duration::days(3),
        );

        let tracks = store
            .list_tracks_in_window(None, now - Duration::hours(1), later + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(tracks.len(), 2);
        let ids: Vec<_> = tracks[0].points.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![p1, p2]);

        let only_two = store
            .list_tracks_in_window(Some(VehicleId(2)), now - Duration::hours(1), later)
            .await
            .unwrap();
        assert_eq!(only_two.len(), 1);

        let last = store.last_position(VehicleId(1)).await.unwrap().unwrap();
        assert_eq!(last.latitude, 1.0);

        store.delete_point(p2).await.unwrap();
        assert!(store.delete_point(p2).await.is_err());
    }

    #[test]
    fn test_seed_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(
            &path,
            r#"{
                "providers": [{"id": 1, "name": "a", "ip_patterns": ["10.*"]}],
                "vehicles": [{"id": 3, "imei": "123", "provider_id": 1, "moderation_status": "rejected"}]
            }"#,
        )
        .unwrap();
        let seed = Seed::load(&path).unwrap();
        assert_eq!(seed.vehicles[0].moderation_status, ModerationStatus::Rejected);
        assert!(seed.points.is_empty());
    }

    #[test]
    fn test_snapshot_saved_and_reloaded() {
        let store = MemoryStore::from_seed(Seed {
            vehicles: vec![vehicle(4, "444", Some(4), 1)],
            ..Default::default()
        });
        let now = Utc::now();
        store.insert_point(VehicleId(4), Position::new(5.0, 6.0, Some(7)), now, now);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        store.snapshot().save(&path).unwrap();

        let reloaded = MemoryStore::from_seed(Seed::load(&path).unwrap());
        assert_eq!(reloaded.point_count(), 1);
        assert_eq!(reloaded.points()[0].altitude, Some(7));
    }
}
