//! Readiness loop over the listening sockets.
//!
//! The dispatcher never touches the codec or the store. It reads one datagram
//! per ready socket, drops traffic from unconfigured addresses and hands the
//! rest to the worker pool. In failover mode it also schedules outbox flushes.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::pool::WorkerPool;
use crate::task::{RelayTask, Shared};

pub(crate) struct Dispatcher {
    sockets: Vec<UdpSocket>,
    shared: Arc<Shared>,
    pool: WorkerPool<RelayTask>,
    flush_interval: Option<Duration>,
}

impl Dispatcher {
    pub(crate) fn new(
        sockets: Vec<UdpSocket>,
        shared: Arc<Shared>,
        pool: WorkerPool<RelayTask>,
        flush_interval: Option<Duration>,
    ) -> Self {
        Self {
            sockets,
            shared,
            pool,
            flush_interval,
        }
    }

    /// Runs until shutdown is signalled or a fatal error occurs, then shuts the
    /// pool down.
    pub(crate) async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        let result = self.serve(&mut shutdown).await;
        if let Err(e) = &result {
            error!(error = %e, "dispatcher terminated");
        }
        self.pool.shutdown().await;
        result
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), RelayError> {
        let mut buf = vec![0u8; self.shared.settings.max_datagram];
        let mut last_flush = Instant::now();

        info!(
            sockets = self.sockets.len(),
            flush_interval = ?self.flush_interval,
            "dispatcher running"
        );

        loop {
            let wait = self
                .flush_interval
                .map(|interval| interval.saturating_sub(last_flush.elapsed()));

            let ready = tokio::select! {
                ready = wait_readable(&self.sockets, wait) => ready?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        return Ok(());
                    }
                    continue;
                }
            };

            if ready {
                self.drain_ready(&mut buf).await?;
            }

            if let Some(interval) = self.flush_interval {
                if last_flush.elapsed() >= interval {
                    debug!("scheduling outbox flush");
                    self.pool.submit(RelayTask::Flush).await?;
                    last_flush = Instant::now();
                }
            }
        }
    }

    /// Reads at most one datagram from each socket.
    async fn drain_ready(&self, buf: &mut [u8]) -> Result<(), RelayError> {
        for socket in &self.sockets {
            let (len, from) = match socket.try_recv_from(buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!(socket = ?socket.local_addr().ok(), error = %e, "receive failed");
                    continue;
                }
            };
            self.shared.stats.record_received();

            let address = from.ip().to_canonical().to_string();
            if !self.shared.directory.is_known(&address) {
                debug!(%from, len, "datagram from unknown sender, dropping");
                self.shared.stats.record_unknown_sender();
                continue;
            }

            self.pool
                .submit(RelayTask::Datagram {
                    payload: buf[..len].to_vec(),
                    from,
                })
                .await?;
        }
        Ok(())
    }
}

/// Waits until any socket is readable, for at most `wait` if given.
///
/// Returns false on timeout.
async fn wait_readable(sockets: &[UdpSocket], wait: Option<Duration>) -> io::Result<bool> {
    let readable = async {
        if sockets.is_empty() {
            return std::future::pending().await;
        }
        let readable = sockets.iter().map(|socket| Box::pin(socket.readable()));
        let (result, _, _) = select_all(readable).await;
        result
    };

    match wait {
        Some(wait) => match tokio::time::timeout(wait, readable).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        },
        None => readable.await.map(|()| true),
    }
}
