//! Receiver assembly: stores, reading pipeline, TCP server and scheduled
//! jobs started and stopped together.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, StorageConfig};
use crate::error::{Error, Result};
use crate::geometry::GeometrySimplifier;
use crate::pipeline::{PositionCache, QueueStatsSnapshot, ReadingPipeline, WorkerPool};
use crate::scheduler::{spawn_periodic, CronTrigger};
use crate::server::{Server, ServerStats, SignalHandler};
use crate::store::{
    FanoutSink, JsonlSink, MemoryStore, PersistenceSink, ProviderStore, Seed, TrackStore,
    VehicleStore,
};

/// The collaborators the receiver talks to.
#[derive(Clone)]
pub struct Stores {
    pub vehicles: Arc<dyn VehicleStore>,
    pub providers: Arc<dyn ProviderStore>,
    pub tracks: Arc<dyn TrackStore>,
    pub sink: Arc<dyn PersistenceSink>,
}

impl Stores {
    /// Every collaborator backed by one in-memory store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            vehicles: store.clone(),
            providers: store.clone(),
            tracks: store.clone(),
            sink: store,
        }
    }

    /// Build the configured stores: an in-memory store loaded from the seed
    /// file plus inline providers, and an optional JSON-lines sink.
    pub async fn open(config: &Config) -> Result<(Arc<MemoryStore>, Self)> {
        let store = Arc::new(open_memory_store(&config.storage)?);
        store.add_providers(config.providers.iter().cloned());

        let mut stores = Self::memory(Arc::clone(&store));
        if let Some(path) = &config.storage.readings_file {
            let jsonl: Arc<dyn PersistenceSink> = Arc::new(JsonlSink::open(path).await?);
            info!(path = %path.display(), "Appending readings to file");
            stores.sink = Arc::new(FanoutSink::new(vec![stores.sink, jsonl]));
        }
        Ok((store, stores))
    }
}

fn open_memory_store(config: &StorageConfig) -> Result<MemoryStore> {
    match &config.seed_file {
        Some(path) => {
            let seed = Seed::load(path).map_err(|e| {
                Error::Config(format!("Failed to load seed file {}: {e}", path.display()))
            })?;
            info!(
                providers = seed.providers.len(),
                vehicles = seed.vehicles.len(),
                points = seed.points.len(),
                "Seed loaded"
            );
            Ok(MemoryStore::from_seed(seed))
        }
        None => Ok(MemoryStore::new()),
    }
}

/// A configured but not yet started receiver.
pub struct Receiver {
    config: Config,
    stores: Stores,
    signals: SignalHandler,
}

impl Receiver {
    pub fn new(config: Config, stores: Stores) -> Self {
        Self {
            config,
            stores,
            signals: SignalHandler::new(),
        }
    }

    /// Handle used to request shutdown, from a signal listener or a test.
    pub fn signals(&self) -> &SignalHandler {
        &self.signals
    }

    /// Seed the position cache, bind the listeners and start all tasks.
    pub async fn start(self) -> Result<RunningReceiver> {
        let Self {
            config,
            stores,
            signals,
        } = self;
        let tz = config.schedule.timezone()?;
        let refresh_trigger = Arc::new(CronTrigger::parse(&config.schedule.cache_refresh, tz)?);
        let simplify_trigger = Arc::new(CronTrigger::parse(&config.schedule.simplify, tz)?);

        let cache = Arc::new(PositionCache::new());
        cache
            .refresh(stores.vehicles.as_ref(), stores.tracks.as_ref())
            .await?;

        let pipeline = Arc::new(ReadingPipeline::new(
            Arc::clone(&stores.providers),
            Arc::clone(&stores.vehicles),
            Arc::clone(&cache),
            Arc::clone(&stores.sink),
            config.recording.window(),
        ));
        let pool = WorkerPool::start(
            pipeline,
            config.pipeline.queue_capacity,
            config.pipeline.workers,
        );
        let sender = pool
            .sender()
            .ok_or_else(|| Error::Internal("reading queue closed at startup".into()))?;

        let server = Server::bind(&config.server, Arc::clone(&stores.providers), sender).await?;
        let local_addrs = server.local_addrs();
        let server_stats = server.stats();
        let server_task = tokio::spawn(server.run(signals.shutdown_signal()));

        let refresh = {
            let cache = Arc::clone(&cache);
            let stores = stores.clone();
            spawn_periodic("cache-refresh", refresh_trigger, signals.shutdown_signal(), move || {
                let cache = Arc::clone(&cache);
                let stores = stores.clone();
                async move {
                    if let Err(e) = cache
                        .refresh(stores.vehicles.as_ref(), stores.tracks.as_ref())
                        .await
                    {
                        error!(error = %e, "Position cache refresh failed");
                    }
                }
            })
        };

        let simplifier = Arc::new(GeometrySimplifier::new(
            Arc::clone(&stores.tracks),
            config.schedule.tolerance,
            config.schedule.lookback,
        ));
        let simplify = spawn_periodic(
            "simplify",
            simplify_trigger,
            signals.shutdown_signal(),
            move || {
                let simplifier = Arc::clone(&simplifier);
                async move {
                    if let Err(e) = simplifier.run().await {
                        error!(error = %e, "Track simplification failed");
                    }
                }
            },
        );

        info!(addrs = ?local_addrs, "Receiver started");
        Ok(RunningReceiver {
            local_addrs,
            signals,
            server_task,
            jobs: vec![refresh, simplify],
            pool,
            server_stats,
        })
    }
}

/// Handles of a started receiver.
pub struct RunningReceiver {
    local_addrs: Vec<SocketAddr>,
    signals: SignalHandler,
    server_task: JoinHandle<Result<()>>,
    jobs: Vec<JoinHandle<()>>,
    pool: WorkerPool,
    server_stats: Arc<ServerStats>,
}

impl RunningReceiver {
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn signals(&self) -> &SignalHandler {
        &self.signals
    }

    pub fn server_stats(&self) -> &ServerStats {
        &self.server_stats
    }

    pub fn queue_stats(&self) -> QueueStatsSnapshot {
        self.pool.stats()
    }

    /// Wait until shutdown is requested and every task has stopped. Readings
    /// already queued are stored before this returns.
    pub async fn wait(self) -> Result<QueueStatsSnapshot> {
        let server_result = match self.server_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("server task failed: {e}"))),
        };
        for job in self.jobs {
            if let Err(e) = job.await {
                warn!(error = %e, "Scheduled job did not stop cleanly");
            }
        }
        let stats = self.pool.shutdown().await?;
        server_result?;
        info!("Receiver stopped");
        Ok(stats)
    }

    /// Request shutdown and wait for it to complete.
    pub async fn shutdown(self) -> Result<QueueStatsSnapshot> {
        self.signals.request_shutdown();
        self.wait().await
    }
}
