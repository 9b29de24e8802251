//! Storage traits consumed by the relay.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{EntryId, GossipRecord, OutboxEntry, Sighting, StoredRecord, Upserted};

/// Upsert-and-read access to sightings and gossip records.
///
/// Each call is atomic: concurrent upserts of the same natural key through
/// different handles never produce two rows.
pub trait RecordStore: Send {
    /// Records a sighting observed at `seen_at`.
    ///
    /// An existing row is refreshed (`last_seen` moves forward, `seen_count`
    /// grows); otherwise a row is inserted with `first_seen == last_seen`.
    fn upsert_sighting(&mut self, sighting: &Sighting, seen_at: DateTime<Utc>) -> Result<Upserted>;

    /// Records a gossip record observed at `seen_at`, with the same semantics
    /// as [`RecordStore::upsert_sighting`].
    fn upsert_gossip(&mut self, record: &GossipRecord, seen_at: DateTime<Utc>) -> Result<Upserted>;

    /// All sightings, ordered by id.
    fn sightings(&self) -> Result<Vec<StoredRecord<Sighting>>>;

    /// All gossip records, ordered by id.
    fn gossip_records(&self) -> Result<Vec<StoredRecord<GossipRecord>>>;

    /// Number of sighting rows.
    fn sighting_count(&self) -> Result<usize>;

    /// Number of gossip rows.
    fn gossip_count(&self) -> Result<usize>;
}

/// Durable queue of gossip awaiting acknowledgment.
pub trait Outbox: Send {
    /// Appends an entry and returns its id. Ids are strictly increasing.
    fn enqueue(
        &mut self,
        server: &str,
        port: u16,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<EntryId>;

    /// All pending entries, ordered by id.
    fn pending(&self) -> Result<Vec<OutboxEntry>>;

    /// Removes the entry with `id`. Returns false if it was not pending.
    fn acknowledge(&mut self, id: EntryId) -> Result<bool>;

    /// Number of pending entries.
    fn pending_count(&self) -> Result<usize>;
}

/// Hands out one [`RecordStore`] handle per caller.
pub trait RecordBackend: Send + Sync {
    /// Opens a new handle.
    fn open_records(&self) -> Result<Box<dyn RecordStore>>;
}

/// Hands out one [`Outbox`] handle per caller.
pub trait OutboxBackend: Send + Sync {
    /// Opens a new handle.
    fn open_outbox(&self) -> Result<Box<dyn Outbox>>;
}
