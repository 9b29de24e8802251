//! # hub-relay
//!
//! The alphahub relay: receives authenticated userinfo from game servers,
//! records sightings and gossips them to peer hubs, either once (gossip mode)
//! or through a durable outbox replayed until acknowledged (failover mode).
//!
//! ## Core Types
//!
//! - [`HubConfig`]: The configuration file, validated once at startup.
//! - [`PeerDirectory`]: Configured counterparties by role, resolved to addresses.
//! - [`WorkerPool`]: Bounded pool of workers, each with its own [`Task`] context.
//! - [`RelayTask`]: Datagram handling and outbox flushes, run by the workers.
//! - [`Relay`]: Listening sockets, dispatcher loop and pool, started and stopped together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod directory;
mod dispatcher;
pub mod error;
pub mod pool;
pub mod relay;
pub mod stats;
pub mod task;

pub use config::{
    HubConfig, PeerEntry, PeerSection, PeerTable, PoolSection, RelayMode, RelaySettings,
};
pub use directory::{Peer, PeerDirectory};
pub use error::{PoolError, RelayError};
pub use pool::{PoolConfig, PoolStats, Task, WorkerPool};
pub use relay::Relay;
pub use stats::{RelayStats, StatsSnapshot};
pub use task::{RelayTask, WorkerContext};
