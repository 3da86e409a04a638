//! Storage collaborators.
//!
//! The receiver core only talks to these traits. [`MemoryStore`] implements
//! all of them so the binary runs without a database; [`JsonlSink`] appends
//! stored readings to a file for downstream loaders.

mod jsonl;
mod memory;

pub use jsonl::{JsonlSink, StoredReading};
pub use memory::{MemoryStore, Seed};

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::geometry::Position;
use crate::pipeline::provider_for_ip;
use crate::types::{
    NavigationReading, NewVehicle, PointId, Provider, ProviderId, Track, Vehicle, VehicleId,
};

/// Vehicle lookups and updates used by identity resolution.
#[async_trait]
pub trait VehicleStore: Send + Sync {
    async fn find_vehicle(&self, id: VehicleId) -> Result<Option<Vehicle>, StoreError>;

    /// Vehicles of a provider whose cached object id equals `oid`.
    async fn find_vehicles_by_oid(
        &self,
        oid: u32,
        provider: ProviderId,
    ) -> Result<Vec<Vehicle>, StoreError>;

    async fn find_vehicles_by_provider(
        &self,
        provider: ProviderId,
    ) -> Result<Vec<Vehicle>, StoreError>;

    async fn insert_vehicle(&self, vehicle: NewVehicle) -> Result<VehicleId, StoreError>;

    async fn update_vehicle_oid(&self, id: VehicleId, oid: u32) -> Result<(), StoreError>;

    async fn list_vehicles(&self) -> Result<Vec<Vehicle>, StoreError>;
}

/// Provider lookups used for admission and identity resolution.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn list_providers(&self) -> Result<Vec<Provider>, StoreError>;

    /// Provider whose IP patterns match `ip`. Exact patterns win over wildcards.
    async fn find_provider_by_ip(&self, ip: IpAddr) -> Result<Option<Provider>, StoreError> {
        let providers = self.list_providers().await?;
        Ok(provider_for_ip(&providers, ip).cloned())
    }
}

/// Stored track access used by the position cache and simplification.
#[async_trait]
pub trait TrackStore: Send + Sync {
    /// Most recent stored position of a vehicle.
    async fn last_position(&self, vehicle: VehicleId) -> Result<Option<Position>, StoreError>;

    /// Points received in `[start, end)`, grouped per vehicle and ordered by
    /// fix time.
    async fn list_tracks_in_window(
        &self,
        vehicle: Option<VehicleId>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Track>, StoreError>;

    async fn delete_point(&self, id: PointId) -> Result<(), StoreError>;
}

/// Destination of accepted readings. Called concurrently from all workers.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save(&self, reading: &NavigationReading, vehicle: VehicleId)
        -> Result<(), StoreError>;
}

/// Sends every reading to several sinks in order. Stops at the first failure.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn PersistenceSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn PersistenceSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl PersistenceSink for FanoutSink {
    async fn save(
        &self,
        reading: &NavigationReading,
        vehicle: VehicleId,
    ) -> Result<(), StoreError> {
        for sink in &self.sinks {
            sink.save(reading, vehicle).await?;
        }
        Ok(())
    }
}
