//! Relay lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use hub_store::{OutboxBackend, RecordBackend};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RelaySettings;
use crate::directory::PeerDirectory;
use crate::dispatcher::Dispatcher;
use crate::error::RelayError;
use crate::pool::{PoolStats, WorkerPool};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::task::{Shared, WorkerContext};

/// A running relay: listening sockets, dispatcher and worker pool.
///
/// Dropping a `Relay` without calling [`Relay::stop`] also stops the
/// dispatcher, but nothing waits for the workers to drain.
#[derive(Debug)]
pub struct Relay {
    local_addrs: Vec<SocketAddr>,
    stats: Arc<RelayStats>,
    pool_stats: Arc<PoolStats>,
    shutdown: watch::Sender<bool>,
    dispatcher: Option<JoinHandle<Result<(), RelayError>>>,
}

impl Relay {
    /// Binds one socket per distinct configured port, starts the worker pool
    /// and spawns the dispatcher.
    ///
    /// The relay runs in failover mode iff `outbox` is given.
    ///
    /// # Errors
    ///
    /// Fails if a socket cannot be bound, the pool configuration is invalid or
    /// a worker's store handle or outbound socket cannot be opened.
    pub async fn start(
        settings: RelaySettings,
        directory: PeerDirectory,
        records: Arc<dyn RecordBackend>,
        outbox: Option<Arc<dyn OutboxBackend>>,
    ) -> Result<Self, RelayError> {
        if directory.is_empty() {
            warn!("no peers configured, relay will drop all traffic");
        }

        let mut sockets = Vec::new();
        for port in directory.listen_ports() {
            let addr = format!("{}:{port}", settings.host);
            let socket = UdpSocket::bind(&addr)
                .await
                .map_err(|source| RelayError::Bind { addr, source })?;
            info!(addr = %socket.local_addr()?, "listening");
            sockets.push(socket);
        }
        let local_addrs = sockets
            .iter()
            .map(UdpSocket::local_addr)
            .collect::<Result<Vec<_>, _>>()?;

        let failover = outbox.is_some();
        let flush_interval = failover.then_some(settings.flush_interval);
        let pool_config = settings.pool;
        let stats = Arc::new(RelayStats::default());
        let shared = Arc::new(Shared::new(settings, directory, Arc::clone(&stats)));

        let pool = WorkerPool::start(&pool_config, |worker| {
            let records = records.open_records()?;
            let outbox = outbox.as_ref().map(|backend| backend.open_outbox()).transpose()?;
            WorkerContext::new(worker, Arc::clone(&shared), records, outbox)
        })?;
        let pool_stats = pool.stats();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(sockets, shared, pool, flush_interval);
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        info!(
            mode = if failover { "failover" } else { "gossip" },
            addrs = ?local_addrs,
            workers = pool_config.workers,
            "relay started"
        );

        Ok(Self {
            local_addrs,
            stats,
            pool_stats,
            shutdown,
            dispatcher: Some(handle),
        })
    }

    /// Addresses of the listening sockets, ordered by configured port.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            task_failures: self.pool_stats.failed() + self.pool_stats.panicked(),
            ..self.stats.snapshot()
        }
    }

    /// Resolves when the dispatcher exits, with its terminal error if it
    /// failed. Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's error, or [`RelayError::Dispatcher`] if it
    /// panicked.
    pub async fn wait(&mut self) -> Result<(), RelayError> {
        let Some(handle) = self.dispatcher.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.dispatcher = None;
        joined.map_err(|e| RelayError::Dispatcher(e.to_string()))?
    }

    /// Signals the dispatcher to stop, waits for it and for the workers to
    /// drain.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's terminal error if it had already failed.
    pub async fn stop(mut self) -> Result<(), RelayError> {
        // Fails only if the dispatcher is already gone.
        let _ = self.shutdown.send(true);
        let result = self.wait().await;
        info!("relay stopped");
        result
    }
}
