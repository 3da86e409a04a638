//! Reading pipeline: from a decoded position report to a stored point.
//!
//! ```text
//!  ConnectionHandler ──submit──▶ [bounded queue] ──▶ worker 1..N
//!                                                     │
//!      plausibility ─▶ recording window ─▶ provider ─▶ vehicle ─▶ moderation ─▶ dedup ─▶ sink
//! ```

mod dedup;
mod queue;
mod resolver;

pub use dedup::PositionCache;
pub use queue::{QueueStats, QueueStatsSnapshot, ReadingSender, WorkerPool};
pub use resolver::{is_part_of, provider_for_ip, IpPattern, Resolution, VehicleResolver};

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use tracing::{debug, warn};

use crate::error::{ResolveError, Result};
use crate::store::{PersistenceSink, ProviderStore, VehicleStore};
use crate::types::{ModerationStatus, NavigationReading, VehicleId};

const DEFAULT_MONTH_START: u32 = 5;
const DEFAULT_MONTH_END: u32 = 9;

/// Inclusive range of months during which readings are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingWindow {
    start: u32,
    end: u32,
}

impl Default for RecordingWindow {
    fn default() -> Self {
        Self {
            start: DEFAULT_MONTH_START,
            end: DEFAULT_MONTH_END,
        }
    }
}

impl RecordingWindow {
    /// Months outside 1-12 fall back to May and September.
    pub fn new(start: u32, end: u32) -> Self {
        let valid = |m: u32| (1..=12).contains(&m);
        let start = if valid(start) {
            start
        } else {
            warn!(month = start, fallback = DEFAULT_MONTH_START, "Invalid recording start month");
            DEFAULT_MONTH_START
        };
        let end = if valid(end) {
            end
        } else {
            warn!(month = end, fallback = DEFAULT_MONTH_END, "Invalid recording end month");
            DEFAULT_MONTH_END
        };
        Self { start, end }
    }

    /// Every month of the year.
    pub fn always() -> Self {
        Self { start: 1, end: 12 }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Whether the window crosses the new year, e.g. November to February.
    pub fn wraps(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, month: u32) -> bool {
        if self.wraps() {
            month >= self.start || month <= self.end
        } else {
            (self.start..=self.end).contains(&month)
        }
    }
}

/// A reading waiting in the queue, with the address it came from.
#[derive(Debug, Clone)]
pub struct ReadingJob {
    pub reading: NavigationReading,
    pub peer: IpAddr,
}

impl ReadingJob {
    pub fn new(reading: NavigationReading, peer: IpAddr) -> Self {
        Self { reading, peer }
    }
}

/// Why a reading was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Zero coordinates or zero object id.
    Implausible,
    OutsideRecordingWindow,
    VehicleRejected,
    /// Within the dedup distance of the last stored position.
    NotMoved,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Implausible => "implausible reading",
            SkipReason::OutsideRecordingWindow => "outside recording window",
            SkipReason::VehicleRejected => "vehicle rejected by moderation",
            SkipReason::NotMoved => "position unchanged",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(VehicleId),
    Skipped(SkipReason),
}

/// Shared collaborators and policy applied to every reading.
pub struct ReadingPipeline {
    providers: Arc<dyn ProviderStore>,
    vehicles: Arc<dyn VehicleStore>,
    resolver: VehicleResolver,
    cache: Arc<PositionCache>,
    sink: Arc<dyn PersistenceSink>,
    window: RecordingWindow,
}

impl ReadingPipeline {
    pub fn new(
        providers: Arc<dyn ProviderStore>,
        vehicles: Arc<dyn VehicleStore>,
        cache: Arc<PositionCache>,
        sink: Arc<dyn PersistenceSink>,
        window: RecordingWindow,
    ) -> Self {
        Self {
            providers,
            resolver: VehicleResolver::new(Arc::clone(&vehicles)),
            vehicles,
            cache,
            sink,
            window,
        }
    }

    pub fn cache(&self) -> &Arc<PositionCache> {
        &self.cache
    }

    /// Run one reading through every check and store it if it passes.
    pub async fn process(&self, job: ReadingJob) -> Result<SaveOutcome> {
        self.process_in_month(job, Utc::now().month()).await
    }

    async fn process_in_month(&self, job: ReadingJob, month: u32) -> Result<SaveOutcome> {
        let ReadingJob { reading, peer } = job;

        if reading.latitude == 0.0 || reading.longitude == 0.0 || reading.oid == 0 {
            return Ok(SaveOutcome::Skipped(SkipReason::Implausible));
        }
        if !self.window.contains(month) {
            return Ok(SaveOutcome::Skipped(SkipReason::OutsideRecordingWindow));
        }

        let provider = self
            .providers
            .find_provider_by_ip(peer)
            .await?
            .ok_or(ResolveError::UnknownProvider(peer))?;
        let vehicle_id = self.resolver.resolve(reading.oid, provider.id).await?.vehicle_id();

        let status = self
            .vehicles
            .find_vehicle(vehicle_id)
            .await?
            .map_or(ModerationStatus::Pending, |v| v.moderation_status);
        if status == ModerationStatus::Rejected {
            debug!(vehicle = %vehicle_id, "Vehicle rejected by moderation, reading dropped");
            return Ok(SaveOutcome::Skipped(SkipReason::VehicleRejected));
        }

        if !self.cache.check_and_update(vehicle_id, reading.position()) {
            return Ok(SaveOutcome::Skipped(SkipReason::NotMoved));
        }

        self.sink.save(&reading, vehicle_id).await?;
        Ok(SaveOutcome::Saved(vehicle_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use crate::types::{Provider, ProviderId, Vehicle};

    const PEER: &str = "10.0.0.5";

    fn reading(oid: u32, latitude: f64, longitude: f64) -> NavigationReading {
        NavigationReading {
            oid,
            packet_id: 1,
            sent_at: Utc::now(),
            received_at: Utc::now(),
            latitude,
            longitude,
            altitude: None,
            speed: 0.0,
            course: 0,
            satellites: None,
            pdop: None,
            hdop: None,
            vdop: None,
            navigation_system: None,
            analog_sensors: Vec::new(),
            liquid_sensors: Vec::new(),
        }
    }

    fn job(oid: u32, latitude: f64, longitude: f64) -> ReadingJob {
        ReadingJob::new(reading(oid, latitude, longitude), PEER.parse().unwrap())
    }

    fn setup(status: ModerationStatus, window: RecordingWindow) -> (Arc<MemoryStore>, ReadingPipeline) {
        let store = Arc::new(MemoryStore::new());
        store.add_providers([Provider {
            id: ProviderId(1),
            name: "test".into(),
            ip_patterns: vec!["10.0.*".into()],
        }]);
        store.put_vehicle(Vehicle {
            id: VehicleId(1),
            imei: "356307042441013".into(),
            oid: Some(1013),
            name: None,
            provider_id: ProviderId(1),
            moderation_status: status,
        });
        let pipeline = ReadingPipeline::new(
            store.clone(),
            store.clone(),
            Arc::new(PositionCache::new()),
            store.clone(),
            window,
        );
        (store, pipeline)
    }

    #[test]
    fn test_window_contains() {
        let summer = RecordingWindow::new(5, 9);
        assert!(summer.contains(5) && summer.contains(9));
        assert!(!summer.contains(4) && !summer.contains(10));

        let winter = RecordingWindow::new(11, 2);
        assert!(winter.wraps());
        for m in [11, 12, 1, 2] {
            assert!(winter.contains(m), "month {m}");
        }
        assert!(!winter.contains(3) && !winter.contains(10));

        assert!(RecordingWindow::new(7, 7).contains(7));
        assert!(!RecordingWindow::new(7, 7).contains(8));
    }

    #[test]
    fn test_window_invalid_falls_back() {
        assert_eq!(RecordingWindow::new(0, 13), RecordingWindow::default());
        assert_eq!(RecordingWindow::new(2, 99), RecordingWindow::new(2, 9));
    }

    #[tokio::test]
    async fn test_saves_and_deduplicates() {
        let (store, pipeline) = setup(ModerationStatus::Approved, RecordingWindow::always());

        let first = pipeline.process(job(1013, 55.0, 37.0)).await.unwrap();
        assert_eq!(first, SaveOutcome::Saved(VehicleId(1)));
        let again = pipeline.process(job(1013, 55.0, 37.0)).await.unwrap();
        assert_eq!(again, SaveOutcome::Skipped(SkipReason::NotMoved));
        let moved = pipeline.process(job(1013, 55.001, 37.0)).await.unwrap();
        assert_eq!(moved, SaveOutcome::Saved(VehicleId(1)));

        assert_eq!(store.point_count(), 2);
    }

    #[tokio::test]
    async fn test_implausible_readings_never_create_vehicles() {
        let (store, pipeline) = setup(ModerationStatus::Approved, RecordingWindow::always());
        for j in [job(1013, 0.0, 37.0), job(1013, 55.0, 0.0), job(0, 55.0, 37.0)] {
            assert_eq!(
                pipeline.process(j).await.unwrap(),
                SaveOutcome::Skipped(SkipReason::Implausible)
            );
        }
        assert_eq!(store.list_vehicles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_outside_window() {
        let (store, pipeline) = setup(ModerationStatus::Approved, RecordingWindow::new(5, 9));
        let outcome = pipeline.process_in_month(job(1013, 55.0, 37.0), 12).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Skipped(SkipReason::OutsideRecordingWindow));
        let outcome = pipeline.process_in_month(job(1013, 55.0, 37.0), 6).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Saved(VehicleId(1)));
        assert_eq!(store.point_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_vehicle() {
        let (store, pipeline) = setup(ModerationStatus::Rejected, RecordingWindow::always());
        let outcome = pipeline.process(job(1013, 55.0, 37.0)).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Skipped(SkipReason::VehicleRejected));
        assert_eq!(store.point_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let (_store, pipeline) = setup(ModerationStatus::Approved, RecordingWindow::always());
        let j = ReadingJob::new(reading(1013, 55.0, 37.0), "192.168.0.1".parse().unwrap());
        let err = pipeline.process(j).await.unwrap_err();
        assert!(matches!(err, Error::Resolve(ResolveError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn test_worker_pool_drains_on_shutdown() {
        let (store, pipeline) = setup(ModerationStatus::Approved, RecordingWindow::always());
        let pool = WorkerPool::start(Arc::new(pipeline), 2, 3);
        let sender = pool.sender().unwrap();
        for i in 0..20 {
            sender
                .submit(job(1013, 55.0 + f64::from(i) * 0.01, 37.0))
                .await
                .unwrap();
        }
        drop(sender);

        let stats = pool.shutdown().await.unwrap();
        assert_eq!(stats.submitted, 20);
        assert_eq!(stats.saved + stats.skipped, 20);
        assert_eq!(stats.failed, 0);
        // ~1.1 km apart: every reading moved regardless of worker order
        assert_eq!(store.point_count(), 20);
    }
}
