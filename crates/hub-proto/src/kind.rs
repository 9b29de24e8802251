//! Message kinds and the counterparties allowed to send them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;

/// Role of a counterparty in the peer directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// A trusted game server reporting userinfo.
    Source,
    /// A hub that relays gossip to us.
    Upstream,
    /// A hub we relay gossip to.
    Downstream,
}

impl PeerRole {
    /// All roles, in lookup order.
    pub const ALL: [Self; 3] = [Self::Source, Self::Upstream, Self::Downstream];

    /// Returns the lowercase name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The discriminator on the first line of a datagram body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Player userinfo reported by a game server.
    Userinfo,
    /// A sighting relayed by another hub.
    GossipPlayer,
    /// A sighting replayed from another hub's outbox, to be acknowledged.
    FailoverPlayer,
    /// Acknowledgment of a failover player message.
    GotFailoverPlayer,
}

impl Kind {
    /// Returns the wire token for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Userinfo => "userinfo",
            Self::GossipPlayer => "gossip player",
            Self::FailoverPlayer => "failover player",
            Self::GotFailoverPlayer => "got failover player",
        }
    }

    /// The role a sender must hold for a message of this kind to be accepted.
    #[must_use]
    pub const fn sender_role(self) -> PeerRole {
        match self {
            Self::Userinfo => PeerRole::Source,
            Self::GossipPlayer | Self::FailoverPlayer => PeerRole::Upstream,
            Self::GotFailoverPlayer => PeerRole::Downstream,
        }
    }

    /// Splits a body into its kind and the remaining payload.
    ///
    /// A body without a newline is all kind and no payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKind`] if the first line is not a known kind.
    pub fn classify(body: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (line, rest) = match body.iter().position(|&b| b == b'\n') {
            Some(at) => (&body[..at], &body[at + 1..]),
            None => (body, &body[body.len()..]),
        };
        let line = String::from_utf8_lossy(line);
        let kind = line.parse()?;
        Ok((kind, rest))
    }
}

impl FromStr for Kind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "userinfo" => Ok(Self::Userinfo),
            "gossip player" => Ok(Self::GossipPlayer),
            "failover player" => Ok(Self::FailoverPlayer),
            "got failover player" => Ok(Self::GotFailoverPlayer),
            other => Err(CodecError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(b"userinfo\n\\name\\x", Kind::Userinfo, b"\\name\\x" ; "userinfo")]
    #[test_case(b"gossip player\n\\a\\b", Kind::GossipPlayer, b"\\a\\b" ; "gossip")]
    #[test_case(b"failover player\n", Kind::FailoverPlayer, b"" ; "failover empty payload")]
    #[test_case(b"got failover player\n\\id\\7", Kind::GotFailoverPlayer, b"\\id\\7" ; "ack")]
    #[test_case(b"got failover player", Kind::GotFailoverPlayer, b"" ; "no newline")]
    fn test_classify_known(body: &[u8], kind: Kind, rest: &[u8]) {
        let (parsed, remaining) = Kind::classify(body).expect("known kind");
        assert_eq!(parsed, kind);
        assert_eq!(remaining, rest);
    }

    #[test_case(b"" ; "empty")]
    #[test_case(b"getstatus\n" ; "other kind")]
    #[test_case(b"Userinfo\n\\a\\b" ; "case sensitive")]
    #[test_case(b"gossip  player\n" ; "extra space")]
    fn test_classify_unknown(body: &[u8]) {
        assert!(matches!(Kind::classify(body), Err(CodecError::UnknownKind(_))));
    }

    #[test]
    fn test_sender_roles() {
        assert_eq!(Kind::Userinfo.sender_role(), PeerRole::Source);
        assert_eq!(Kind::GossipPlayer.sender_role(), PeerRole::Upstream);
        assert_eq!(Kind::FailoverPlayer.sender_role(), PeerRole::Upstream);
        assert_eq!(Kind::GotFailoverPlayer.sender_role(), PeerRole::Downstream);
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for kind in [
            Kind::Userinfo,
            Kind::GossipPlayer,
            Kind::FailoverPlayer,
            Kind::GotFailoverPlayer,
        ] {
            assert_eq!(kind.to_string().parse::<Kind>().expect("parse"), kind);
        }
    }
}
