//! Bounded worker pool.
//!
//! A fixed set of workers drains one bounded queue. Each worker owns a context
//! built before any worker starts, so a pool either comes up whole or not at
//! all. Submission blocks while the queue is full, up to a timeout.

use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{PoolError, RelayError};

/// Worker pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of workers.
    pub workers: usize,
    /// Queue capacity.
    pub max_tasks: usize,
    /// How long [`WorkerPool::submit`] waits for queue space.
    pub submit_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_tasks: 16,
            submit_timeout: Duration::from_secs(32),
        }
    }
}

impl PoolConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if any value is zero.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.workers == 0 {
            return Err(PoolError::InvalidConfig("workers must be greater than 0".to_string()));
        }
        if self.max_tasks == 0 {
            return Err(PoolError::InvalidConfig("max_tasks must be greater than 0".to_string()));
        }
        if self.submit_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "submit_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A unit of work executed against a worker's context.
pub trait Task<C>: Debug + Send + 'static {
    /// Runs the task.
    fn run<'a>(self, ctx: &'a mut C) -> BoxFuture<'a, Result<(), RelayError>>;
}

/// Counters maintained by the workers.
#[derive(Debug, Default)]
pub struct PoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

impl PoolStats {
    /// Tasks that returned `Ok`.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Tasks that returned an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Tasks that panicked.
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Tasks finished in any way.
    pub fn finished(&self) -> u64 {
        self.completed() + self.failed() + self.panicked()
    }
}

/// A pool of workers executing tasks of type `T`.
pub struct WorkerPool<T> {
    sender: Option<mpsc::Sender<T>>,
    workers: Vec<JoinHandle<()>>,
    submit_timeout: Duration,
    stats: Arc<PoolStats>,
}

impl<T> Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("open", &self.sender.is_some())
            .field("submit_timeout", &self.submit_timeout)
            .finish_non_exhaustive()
    }
}

impl<T> WorkerPool<T> {
    /// Starts the pool, calling `factory` once per worker index to build its
    /// context.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any context fails
    /// to build; no worker is started in that case.
    pub fn start<C, F>(config: &PoolConfig, mut factory: F) -> Result<Self, RelayError>
    where
        T: Task<C>,
        C: Send + 'static,
        F: FnMut(usize) -> Result<C, RelayError>,
    {
        config.validate()?;

        let contexts = (0..config.workers)
            .map(&mut factory)
            .collect::<Result<Vec<_>, _>>()?;

        let (sender, receiver) = mpsc::channel(config.max_tasks);
        let queue = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(PoolStats::default());

        let workers = contexts
            .into_iter()
            .enumerate()
            .map(|(index, ctx)| {
                tokio::spawn(worker_loop(index, ctx, Arc::clone(&queue), Arc::clone(&stats)))
            })
            .collect();

        debug!(workers = config.workers, max_tasks = config.max_tasks, "worker pool started");

        Ok(Self {
            sender: Some(sender),
            workers,
            submit_timeout: config.submit_timeout,
            stats,
        })
    }

    /// Queues a task, waiting up to the submit timeout for space.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Saturated`] if the queue stayed full, or
    /// [`PoolError::Closed`] if the pool is shut down.
    pub async fn submit(&self, task: T) -> Result<(), PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        sender
            .send_timeout(task, self.submit_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => PoolError::Saturated {
                    timeout: self.submit_timeout,
                },
                mpsc::error::SendTimeoutError::Closed(_) => PoolError::Closed,
            })
    }

    /// Worker counters.
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting tasks, lets the workers drain the queue and waits for
    /// them to exit.
    pub async fn shutdown(&mut self) {
        self.sender = None;
        for (index, handle) in self.workers.drain(..).enumerate() {
            if let Err(e) = handle.await {
                error!(worker = index, error = %e, "worker did not exit cleanly");
            }
        }
        debug!("worker pool stopped");
    }
}

async fn worker_loop<T, C>(
    index: usize,
    mut ctx: C,
    queue: Arc<Mutex<mpsc::Receiver<T>>>,
    stats: Arc<PoolStats>,
) where
    T: Task<C>,
{
    loop {
        let next = queue.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };

        let label = format!("{task:?}");
        match AssertUnwindSafe(task.run(&mut ctx)).catch_unwind().await {
            Ok(Ok(())) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker = index, task = %label, error = %e, "task failed");
            }
            Err(_) => {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                error!(worker = index, task = %label, "task panicked");
            }
        }
    }
    debug!(worker = index, "worker exiting");
}
