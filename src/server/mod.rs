//! TCP receiver for EGTS terminals.
//!
//! This module contains:
//! - The accept loop with provider address admission
//! - Per-connection packet handling
//! - Signal handling

mod connection;
mod signals;

pub use connection::{build_reading, ConnectionHandler, ConnectionState, Dispatched};
pub use signals::{ShutdownSignal, Signal, SignalHandler};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::pipeline::ReadingSender;
use crate::store::ProviderStore;
use crate::types::ConnectionId;

/// Connection counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
}

impl ServerStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections refused by admission or the connection limit.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Accepts terminal connections and runs a [`ConnectionHandler`] for each.
pub struct Server {
    listeners: Vec<TcpListener>,
    providers: Arc<dyn ProviderStore>,
    readings: ReadingSender,
    read_timeout: Option<Duration>,
    limit: Arc<Semaphore>,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Bind every configured listen address.
    pub async fn bind(
        config: &ServerConfig,
        providers: Arc<dyn ProviderStore>,
        readings: ReadingSender,
    ) -> Result<Self> {
        let mut listeners = Vec::with_capacity(config.listen_addrs.len());
        for addr in &config.listen_addrs {
            let listener = TcpListener::bind(addr).await.map_err(|e| Error::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
            info!("Listening on {}", listener.local_addr().unwrap_or(*addr));
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            providers,
            readings,
            read_timeout: config.read_timeout(),
            limit: Arc::new(Semaphore::new(config.max_connections)),
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Bound addresses, with the actual port when `0` was requested.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` fires, then close the open ones.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let Self {
            listeners,
            providers,
            readings,
            read_timeout,
            limit,
            stats,
        } = self;
        let ctx = Arc::new(AcceptContext {
            providers,
            readings,
            read_timeout,
            limit,
            stats,
        });

        let mut accept_loops = JoinSet::new();
        for listener in listeners {
            accept_loops.spawn(accept_loop(listener, Arc::clone(&ctx), shutdown.clone()));
        }
        drop(ctx);

        while let Some(joined) = accept_loops.join_next().await {
            if let Err(e) = joined {
                error!("Accept loop failed: {}", e);
            }
        }
        info!("Server stopped");
        Ok(())
    }
}

struct AcceptContext {
    providers: Arc<dyn ProviderStore>,
    readings: ReadingSender,
    read_timeout: Option<Duration>,
    limit: Arc<Semaphore>,
    stats: Arc<ServerStats>,
}

async fn accept_loop(listener: TcpListener, ctx: Arc<AcceptContext>, mut shutdown: ShutdownSignal) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Some(task) = admit(stream, peer, &ctx).await {
                        connections.spawn(task);
                    }
                }
                Err(e) => error!("Accept error: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            () = shutdown.wait() => break,
        }
    }

    debug!(open = connections.len(), "Waiting for open connections");
    // Terminals keep connections open indefinitely
    connections.shutdown().await;
}

/// Admission check. Returns the connection task if the peer is allowed in.
async fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &AcceptContext,
) -> Option<impl std::future::Future<Output = ()> + Send + 'static> {
    let provider = match ctx.providers.find_provider_by_ip(peer.ip()).await {
        Ok(Some(provider)) => provider,
        Ok(None) => {
            ctx.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(%peer, "Connection from unknown address rejected");
            return None;
        }
        Err(e) => {
            ctx.stats.rejected.fetch_add(1, Ordering::Relaxed);
            error!(%peer, error = %e, "Provider lookup failed, connection rejected");
            return None;
        }
    };

    let Ok(permit) = Arc::clone(&ctx.limit).try_acquire_owned() else {
        ctx.stats.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(%peer, "Max connections reached, rejecting");
        return None;
    };

    ctx.stats.accepted.fetch_add(1, Ordering::Relaxed);
    let id = ConnectionId::new();
    let span = info_span!("connection", %id, %peer, provider = %provider.id);
    let handler = ConnectionHandler::new(id, peer, stream, ctx.read_timeout, ctx.readings.clone());
    let stats = Arc::clone(&ctx.stats);

    Some(
        async move {
            stats.active.fetch_add(1, Ordering::Relaxed);
            let _ = handler.run().await;
            stats.active.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        }
        .instrument(span),
    )
}
