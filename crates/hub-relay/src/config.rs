//! Hub configuration.
//!
//! The configuration file is parsed once at startup into an immutable
//! [`HubConfig`]. The relay itself only sees the derived [`RelaySettings`] and
//! the resolved peer directory; it never reads configuration on its own.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hub_proto::{ChecksumAlgorithm, Codec, Framing, Secret};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::pool::PoolConfig;

/// Whether the hub relays immediately or through its outbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Gossip each sighting to downstream peers once, as it arrives.
    #[default]
    Gossip,
    /// Keep each sighting in the outbox and replay it until acknowledged.
    Failover,
}

/// One configured counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Local port we listen on for this counterparty.
    pub port: u16,
    /// Secret shared with this counterparty.
    pub secret: Secret,
    /// Remote port datagrams to this counterparty go to; defaults to `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_port: Option<u16>,
}

/// Host identifier to peer entry, for one role.
pub type PeerSection = BTreeMap<String, PeerEntry>;

/// Configured counterparties by role, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTable {
    /// Game servers reporting userinfo.
    #[serde(default)]
    pub sources: PeerSection,
    /// Hubs that gossip to us.
    #[serde(default)]
    pub upstream: PeerSection,
    /// Hubs we gossip to.
    #[serde(default)]
    pub downstream: PeerSection,
}

/// Worker pool section of the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSection {
    /// Number of workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queue depth before submission blocks.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// Seconds a submission may block before failing.
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_tasks: default_max_tasks(),
            submit_timeout_secs: default_submit_timeout_secs(),
        }
    }
}

const fn default_workers() -> usize {
    4
}

const fn default_max_tasks() -> usize {
    16
}

const fn default_submit_timeout_secs() -> u64 {
    32
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_source_framing() -> Framing {
    Framing::Connectionless
}

const fn default_peer_framing() -> Framing {
    Framing::Bare
}

const fn default_flush_interval_secs() -> u64 {
    5
}

const fn default_max_datagram() -> usize {
    4096
}

/// Complete hub configuration as loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Address to bind listening sockets on.
    #[serde(default = "default_host")]
    pub host: String,
    /// Relay mode.
    #[serde(default)]
    pub mode: RelayMode,
    /// Directory for the durable store; `None` keeps state in memory, which
    /// only gossip mode allows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Checksum algorithm spoken on all sockets.
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,
    /// Framing used by game servers.
    #[serde(default = "default_source_framing")]
    pub source_framing: Framing,
    /// Framing used between hubs.
    #[serde(default = "default_peer_framing")]
    pub peer_framing: Framing,
    /// Seconds between outbox flushes in failover mode.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Receive buffer size; longer datagrams are truncated.
    #[serde(default = "default_max_datagram")]
    pub max_datagram: usize,
    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolSection,
    /// Configured counterparties.
    #[serde(flatten)]
    pub peers: PeerTable,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            mode: RelayMode::default(),
            state_dir: None,
            checksum: ChecksumAlgorithm::default(),
            source_framing: default_source_framing(),
            peer_framing: default_peer_framing(),
            flush_interval_secs: default_flush_interval_secs(),
            max_datagram: default_max_datagram(),
            pool: PoolSection::default(),
            peers: PeerTable::default(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, RelayError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RelayError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be represented in TOML.
    pub fn to_toml(&self) -> Result<String, RelayError> {
        toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("failed to render TOML: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.host.is_empty() {
            return Err(RelayError::Config("host cannot be empty".to_string()));
        }

        if !(512..=65_535).contains(&self.max_datagram) {
            return Err(RelayError::Config(
                "max_datagram must be between 512 and 65535".to_string(),
            ));
        }

        self.pool_config()
            .validate()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        if self.mode == RelayMode::Failover {
            if self.flush_interval_secs == 0 {
                return Err(RelayError::Config(
                    "flush_interval_secs must be greater than 0 in failover mode".to_string(),
                ));
            }
            if self.peers.downstream.is_empty() {
                return Err(RelayError::Config(
                    "failover mode needs at least one downstream hub".to_string(),
                ));
            }
            if self.state_dir.is_none() {
                return Err(RelayError::Config(
                    "failover mode needs a state_dir for its outbox".to_string(),
                ));
            }
        }

        let sections = [
            ("sources", &self.peers.sources),
            ("upstream", &self.peers.upstream),
            ("downstream", &self.peers.downstream),
        ];
        for (section, entries) in sections {
            for (host, entry) in entries {
                if host.is_empty() {
                    return Err(RelayError::Config(format!(
                        "{section} has an entry with an empty host"
                    )));
                }
                if entry.port == 0 || entry.send_port == Some(0) {
                    return Err(RelayError::Config(format!(
                        "{section}.{host}: ports must be greater than 0"
                    )));
                }
                if entry.secret.is_empty() {
                    return Err(RelayError::Config(format!(
                        "{section}.{host}: secret cannot be empty"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Configured counterparties, before resolution.
    #[must_use]
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Worker pool configuration.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.pool.workers,
            max_tasks: self.pool.max_tasks,
            submit_timeout: Duration::from_secs(self.pool.submit_timeout_secs),
        }
    }

    /// Settings handed to the relay at startup.
    #[must_use]
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            host: self.host.clone(),
            codec: Codec::new(self.checksum),
            source_framing: self.source_framing,
            peer_framing: self.peer_framing,
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            max_datagram: self.max_datagram,
            pool: self.pool_config(),
        }
    }

    /// A sample configuration for `hubd init-config`.
    #[must_use]
    pub fn sample() -> Self {
        let mut config = Self {
            state_dir: Some(PathBuf::from("/var/lib/alphahub")),
            ..Self::default()
        };
        config.peers.sources.insert(
            "game.example.org".to_string(),
            PeerEntry {
                port: 27967,
                secret: Secret::from("somesecret"),
                send_port: None,
            },
        );
        config.peers.upstream.insert(
            "hub.example.net".to_string(),
            PeerEntry {
                port: 9534,
                secret: Secret::from("anothersecret"),
                send_port: None,
            },
        );
        config.peers.downstream.insert(
            "hub.example.net".to_string(),
            PeerEntry {
                port: 9535,
                secret: Secret::from("anothersecret"),
                send_port: Some(9534),
            },
        );
        config
    }
}

/// Runtime settings of a relay, derived from [`HubConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Address listening sockets and outbound worker sockets bind to.
    pub host: String,
    /// Codec used for every datagram.
    pub codec: Codec,
    /// Framing expected from game servers.
    pub source_framing: Framing,
    /// Framing used between hubs, in both directions.
    pub peer_framing: Framing,
    /// Idle time after which the outbox is flushed (failover mode only).
    pub flush_interval: Duration,
    /// Receive buffer size.
    pub max_datagram: usize,
    /// Worker pool configuration.
    pub pool: PoolConfig,
}

impl Default for RelaySettings {
    fn default() -> Self {
        HubConfig::default().settings()
    }
}
