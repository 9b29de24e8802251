//! # hub-proto
//!
//! Wire protocol for alphahub: the datagrams exchanged between game servers
//! and hubs, and between hubs.
//!
//! A datagram looks like
//!
//! ```text
//! [FF FF FF FF] <checksum>\n<kind>\n\key\value\key\value...
//! ```
//!
//! The optional 4-byte marker identifies connectionless game server
//! traffic. The checksum is a keyed digest over everything after the
//! checksum line, keyed with the secret shared between sender and hub.
//!
//! ## Core Types
//!
//! - [`Frame`]: A datagram split into marker, checksum token and body.
//! - [`ChecksumAlgorithm`]: The keyed digest used to authenticate bodies.
//! - [`Kind`]: The message kind discriminator on the first body line.
//! - [`Message`]: Typed userinfo, gossip, failover and acknowledgment messages.
//! - [`Codec`]: Seals messages into datagrams and opens received frames.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checksum;
pub mod codec;
pub mod error;
pub mod frame;
pub mod kind;
pub mod message;
pub mod pairs;
pub mod secret;

pub use checksum::ChecksumAlgorithm;
pub use codec::Codec;
pub use error::CodecError;
pub use frame::{Frame, Framing, MARKER};
pub use kind::{Kind, PeerRole};
pub use message::{FailoverAck, FailoverPlayer, Message, PlayerReport, Userinfo};
pub use pairs::{Pairs, PairsWriter, decode_pairs};
pub use secret::Secret;
