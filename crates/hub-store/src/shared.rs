//! Shared store backend handing out per-worker handles.
//!
//! A durable store keeps a JSON snapshot plus an append-only journal of the
//! changes made since. Each mutation is journaled before it is applied in
//! memory, so a failed write leaves both unchanged. Once the journal holds
//! enough entries the state is folded into a new snapshot and a fresh journal
//! generation starts.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::persist::{Journal, JsonStore, remove_file};
use crate::store::{Outbox, OutboxBackend, RecordBackend, RecordStore};
use crate::types::{EntryId, GossipRecord, OutboxEntry, Sighting, StoredRecord, Upserted};

const SNAPSHOT_NAME: &str = "hub-state";

/// Journal entries after which a durable store writes a new snapshot.
pub const DEFAULT_COMPACT_AFTER: usize = 1024;

/// On-disk form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    /// First journal generation not folded into this snapshot.
    #[serde(default)]
    generation: u64,
    #[serde(default)]
    sightings: Vec<StoredRecord<Sighting>>,
    #[serde(default)]
    gossip: Vec<StoredRecord<GossipRecord>>,
    #[serde(default)]
    outbox: Vec<OutboxEntry>,
    #[serde(default)]
    next_entry_id: u64,
}

/// One journaled mutation. Replaying changes in order rebuilds the state,
/// ids included.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Change {
    Sighting {
        record: Sighting,
        seen_at: DateTime<Utc>,
    },
    Gossip {
        record: GossipRecord,
        seen_at: DateTime<Utc>,
    },
    Enqueue {
        server: String,
        port: u16,
        payload: String,
        created_at: DateTime<Utc>,
    },
    Acknowledge {
        id: EntryId,
    },
}

#[derive(Debug, Clone, Copy)]
struct Row {
    id: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    seen_count: u64,
}

/// Rows keyed by their natural key.
#[derive(Debug)]
struct Table<R> {
    rows: HashMap<R, Row>,
    next_id: u64,
}

impl<R: Clone + Eq + Hash> Table<R> {
    fn from_rows(stored: Vec<StoredRecord<R>>) -> Self {
        let next_id = stored.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let rows = stored
            .into_iter()
            .map(|r| {
                let row = Row {
                    id: r.id,
                    first_seen: r.first_seen,
                    last_seen: r.last_seen.max(r.first_seen),
                    seen_count: r.seen_count,
                };
                (r.record, row)
            })
            .collect();
        Self { rows, next_id }
    }

    fn upsert(&mut self, record: &R, seen_at: DateTime<Utc>) -> Upserted {
        if let Some(row) = self.rows.get_mut(record) {
            row.last_seen = row.last_seen.max(seen_at);
            row.seen_count += 1;
            return Upserted::Updated(row.id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.rows.insert(
            record.clone(),
            Row {
                id,
                first_seen: seen_at,
                last_seen: seen_at,
                seen_count: 1,
            },
        );
        Upserted::Inserted(id)
    }

    fn stored(&self) -> Vec<StoredRecord<R>> {
        let mut stored: Vec<_> = self
            .rows
            .iter()
            .map(|(record, row)| StoredRecord {
                id: row.id,
                record: record.clone(),
                first_seen: row.first_seen,
                last_seen: row.last_seen,
                seen_count: row.seen_count,
            })
            .collect();
        stored.sort_by_key(|r| r.id);
        stored
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug)]
struct State {
    sightings: Table<Sighting>,
    gossip: Table<GossipRecord>,
    outbox: BTreeMap<EntryId, OutboxEntry>,
    next_entry_id: u64,
    journal: Option<Journal>,
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let outbox: BTreeMap<_, _> = snapshot.outbox.into_iter().map(|e| (e.id, e)).collect();
        let after_pending = outbox.keys().next_back().map_or(1, |id| id.0 + 1);
        Self {
            sightings: Table::from_rows(snapshot.sightings),
            gossip: Table::from_rows(snapshot.gossip),
            outbox,
            next_entry_id: snapshot.next_entry_id.max(after_pending),
            journal: None,
        }
    }

    fn snapshot(&self, generation: u64) -> Snapshot {
        Snapshot {
            generation,
            sightings: self.sightings.stored(),
            gossip: self.gossip.stored(),
            outbox: self.outbox.values().cloned().collect(),
            next_entry_id: self.next_entry_id,
        }
    }

    fn apply(&mut self, change: Change) {
        match change {
            Change::Sighting { record, seen_at } => {
                self.sightings.upsert(&record, seen_at);
            }
            Change::Gossip { record, seen_at } => {
                self.gossip.upsert(&record, seen_at);
            }
            Change::Enqueue {
                server,
                port,
                payload,
                created_at,
            } => {
                self.enqueue(&server, port, &payload, created_at);
            }
            Change::Acknowledge { id } => {
                self.outbox.remove(&id);
            }
        }
    }

    fn enqueue(
        &mut self,
        server: &str,
        port: u16,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> EntryId {
        let id = EntryId(self.next_entry_id);
        self.next_entry_id += 1;
        self.outbox.insert(
            id,
            OutboxEntry {
                id,
                server: server.to_string(),
                port,
                payload: payload.to_string(),
                created_at,
            },
        );
        id
    }

    /// Journals a serialized change. Must succeed before the change is
    /// applied in memory.
    fn record(&mut self, line: Option<&[u8]>) -> Result<()> {
        match (self.journal.as_mut(), line) {
            (Some(journal), Some(line)) => journal.append(line),
            _ => Ok(()),
        }
    }
}

/// Where a durable store keeps its files.
#[derive(Debug)]
struct Disk {
    dir: PathBuf,
    snapshots: JsonStore,
    compact_after: usize,
    compacting: AtomicBool,
}

/// Clears the compaction flag however compaction ends.
struct CompactGuard<'a>(&'a AtomicBool);

impl Drop for CompactGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Disk {
    /// Starts a new journal generation and writes the state as of the switch
    /// as its snapshot. Only the switch happens under the state lock.
    fn compact_if_due(&self, state: &Mutex<State>) -> Result<()> {
        if self.compacting.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = CompactGuard(&self.compacting);

        let (snapshot, retired) = {
            let mut state = state.lock();
            let Some(current) = state.journal.as_ref() else {
                return Ok(());
            };
            if current.entries() < self.compact_after {
                return Ok(());
            }
            let generation = current.generation() + 1;
            let next = Journal::open(&self.dir, SNAPSHOT_NAME, generation)?;
            let retired = state.journal.replace(next);
            (state.snapshot(generation), retired)
        };

        self.snapshots.save(&snapshot)?;
        if let Some(retired) = retired {
            retired.remove()?;
        }
        debug!(generation = snapshot.generation, "compacted store");
        Ok(())
    }
}

/// Shared storage for sightings, gossip and the outbox.
///
/// Cloning a `Store` or opening handles from it shares the same state; a
/// single mutex serializes all writers.
#[derive(Debug, Clone)]
pub struct Store {
    state: Arc<Mutex<State>>,
    disk: Option<Arc<Disk>>,
}

impl Store {
    /// Creates a store that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::from_snapshot(Snapshot::default()))),
            disk: None,
        }
    }

    /// Opens (or creates) a durable store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot or a journal cannot be read, or the
    /// recovered state cannot be written back.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_compaction(dir, DEFAULT_COMPACT_AFTER)
    }

    /// Like [`Store::open`], compacting after `compact_after` journal entries.
    ///
    /// # Errors
    ///
    /// See [`Store::open`].
    pub fn open_with_compaction(dir: &Path, compact_after: usize) -> Result<Self> {
        let snapshots = JsonStore::new(dir, SNAPSHOT_NAME);
        let snapshot: Snapshot = snapshots.load()?;
        let base = snapshot.generation;
        let mut state = State::from_snapshot(snapshot);

        let mut replayed = 0usize;
        let mut live = Vec::new();
        for generation in Journal::generations(dir, SNAPSHOT_NAME)? {
            let path = Journal::path_for(dir, SNAPSHOT_NAME, generation);
            if generation < base {
                // Already part of the snapshot.
                remove_file(&path)?;
                continue;
            }
            for change in Journal::read::<Change>(&path)? {
                state.apply(change);
                replayed += 1;
            }
            live.push((generation, path));
        }

        let generation = match live.last() {
            Some((last, _)) => {
                let generation = last + 1;
                snapshots.save(&state.snapshot(generation))?;
                for (_, path) in &live {
                    remove_file(path)?;
                }
                generation
            }
            None => base,
        };
        state.journal = Some(Journal::open(dir, SNAPSHOT_NAME, generation)?);

        info!(
            path = %snapshots.path().display(),
            sightings = state.sightings.len(),
            gossip = state.gossip.len(),
            pending = state.outbox.len(),
            replayed,
            generation,
            "opened store"
        );
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            disk: Some(Arc::new(Disk {
                dir: dir.to_path_buf(),
                snapshots,
                compact_after: compact_after.max(1),
                compacting: AtomicBool::new(false),
            })),
        })
    }

    /// Returns a new handle onto this store.
    #[must_use]
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            state: Arc::clone(&self.state),
            disk: self.disk.clone(),
        }
    }
}

impl RecordBackend for Store {
    fn open_records(&self) -> Result<Box<dyn RecordStore>> {
        Ok(Box::new(self.handle()))
    }
}

impl OutboxBackend for Store {
    fn open_outbox(&self) -> Result<Box<dyn Outbox>> {
        Ok(Box::new(self.handle()))
    }
}

/// A handle onto a [`Store`], implementing both storage traits.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    state: Arc<Mutex<State>>,
    disk: Option<Arc<Disk>>,
}

impl StoreHandle {
    /// Serializes a change for the journal, outside the state lock. In-memory
    /// stores journal nothing.
    fn encode(&self, change: impl FnOnce() -> Change) -> Result<Option<Vec<u8>>> {
        if self.disk.is_none() {
            return Ok(None);
        }
        serde_json::to_vec(&change()).map(Some).map_err(StoreError::Encode)
    }

    fn compact_if_due(&self) {
        let Some(disk) = &self.disk else {
            return;
        };
        if let Err(e) = disk.compact_if_due(&self.state) {
            warn!(error = %e, "store compaction failed, journal keeps growing");
        }
    }
}

impl RecordStore for StoreHandle {
    fn upsert_sighting(&mut self, sighting: &Sighting, seen_at: DateTime<Utc>) -> Result<Upserted> {
        let line = self.encode(|| Change::Sighting {
            record: sighting.clone(),
            seen_at,
        })?;
        let upserted = {
            let mut state = self.state.lock();
            state.record(line.as_deref())?;
            state.sightings.upsert(sighting, seen_at)
        };
        debug!(
            id = upserted.id(),
            inserted = upserted.is_insert(),
            name = %sighting.name,
            "upserted sighting"
        );
        self.compact_if_due();
        Ok(upserted)
    }

    fn upsert_gossip(&mut self, record: &GossipRecord, seen_at: DateTime<Utc>) -> Result<Upserted> {
        let line = self.encode(|| Change::Gossip {
            record: record.clone(),
            seen_at,
        })?;
        let upserted = {
            let mut state = self.state.lock();
            state.record(line.as_deref())?;
            state.gossip.upsert(record, seen_at)
        };
        debug!(
            id = upserted.id(),
            inserted = upserted.is_insert(),
            origin = %record.origin,
            "upserted gossip"
        );
        self.compact_if_due();
        Ok(upserted)
    }

    fn sightings(&self) -> Result<Vec<StoredRecord<Sighting>>> {
        Ok(self.state.lock().sightings.stored())
    }

    fn gossip_records(&self) -> Result<Vec<StoredRecord<GossipRecord>>> {
        Ok(self.state.lock().gossip.stored())
    }

    fn sighting_count(&self) -> Result<usize> {
        Ok(self.state.lock().sightings.len())
    }

    fn gossip_count(&self) -> Result<usize> {
        Ok(self.state.lock().gossip.len())
    }
}

impl Outbox for StoreHandle {
    fn enqueue(
        &mut self,
        server: &str,
        port: u16,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<EntryId> {
        let line = self.encode(|| Change::Enqueue {
            server: server.to_string(),
            port,
            payload: payload.to_string(),
            created_at,
        })?;
        let id = {
            let mut state = self.state.lock();
            state.record(line.as_deref())?;
            state.enqueue(server, port, payload, created_at)
        };
        debug!(%id, server, port, "enqueued outbox entry");
        self.compact_if_due();
        Ok(id)
    }

    fn pending(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self.state.lock().outbox.values().cloned().collect())
    }

    fn acknowledge(&mut self, id: EntryId) -> Result<bool> {
        let line = self.encode(|| Change::Acknowledge { id })?;
        {
            let mut state = self.state.lock();
            if !state.outbox.contains_key(&id) {
                return Ok(false);
            }
            state.record(line.as_deref())?;
            state.outbox.remove(&id);
        }
        debug!(%id, "acknowledged outbox entry");
        self.compact_if_due();
        Ok(true)
    }

    fn pending_count(&self) -> Result<usize> {
        Ok(self.state.lock().outbox.len())
    }
}
