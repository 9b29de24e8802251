//! # hub-store
//!
//! Storage for the alphahub relay.
//!
//! - Sightings reported by game servers and gossip records relayed by peer
//!   hubs, both upserted by natural key and never deleted.
//! - The failover outbox: pending gossip kept until a peer acknowledges it.
//!
//! The relay talks to storage through the [`RecordStore`] and [`Outbox`]
//! traits, one handle per worker, obtained from a [`RecordBackend`] or
//! [`OutboxBackend`]. [`Store`] implements all four over one shared,
//! optionally durable, state: a JSON snapshot plus an append-only journal.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod persist;
pub mod shared;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use persist::{Journal, JsonStore};
pub use shared::{DEFAULT_COMPACT_AFTER, Store, StoreHandle};
pub use store::{Outbox, OutboxBackend, RecordBackend, RecordStore};
pub use types::{EntryId, GossipRecord, OutboxEntry, Sighting, StoredRecord, Upserted};
