//! Stored record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A player seen on a game server that reports to this hub.
///
/// Every field is part of the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sighting {
    /// Player name.
    pub name: String,
    /// Player address.
    pub address: String,
    /// Client guid.
    pub guid: String,
    /// Game server address.
    pub server: String,
    /// Game server port.
    pub port: u16,
}

/// A sighting relayed to this hub by a peer.
///
/// The natural key is the sighting plus the relaying peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GossipRecord {
    /// The relayed sighting.
    #[serde(flatten)]
    pub sighting: Sighting,
    /// `address:port` of the peer that relayed it.
    pub origin: String,
}

/// A record as held by the store, with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord<R> {
    /// Store-assigned row id.
    pub id: u64,
    /// The record itself.
    #[serde(flatten)]
    pub record: R,
    /// When the record was first stored.
    pub first_seen: DateTime<Utc>,
    /// When the record was last observed. Never earlier than `first_seen`.
    pub last_seen: DateTime<Utc>,
    /// How many times the record has been observed.
    pub seen_count: u64,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    /// A new row was created with this id.
    Inserted(u64),
    /// The existing row with this id was refreshed.
    Updated(u64),
}

impl Upserted {
    /// Returns the row id.
    #[must_use]
    pub const fn id(self) -> u64 {
        match self {
            Self::Inserted(id) | Self::Updated(id) => id,
        }
    }

    /// Returns true if a new row was created.
    #[must_use]
    pub const fn is_insert(self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Monotonic identifier of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gossip waiting for acknowledgment by a peer hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Store-assigned id, echoed back in the acknowledgment.
    pub id: EntryId,
    /// Game server the sighting came from.
    pub server: String,
    /// Port of that game server.
    pub port: u16,
    /// Encoded sighting payload.
    pub payload: String,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}
