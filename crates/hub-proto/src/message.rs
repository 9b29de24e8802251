//! Typed messages carried in datagram bodies.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::CodecError;
use crate::kind::Kind;
use crate::pairs::{Pairs, PairsWriter, decode_pairs};

/// Player userinfo reported by a game server.
///
/// Game servers send their full userinfo string; only the keys the hub records
/// are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Userinfo {
    /// Player name.
    pub name: String,
    /// Player address as reported by the game server.
    pub ip: String,
    /// Client guid (`cl_guid` on the wire).
    pub guid: String,
}

impl Userinfo {
    /// Extracts the recorded keys from a userinfo payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingKey`] if `name`, `ip` or `cl_guid` is absent.
    pub fn from_pairs(pairs: &Pairs) -> Result<Self, CodecError> {
        Ok(Self {
            name: pairs.require("name")?.to_string(),
            ip: pairs.require("ip")?.to_string(),
            guid: pairs.require("cl_guid")?.to_string(),
        })
    }

    fn write(&self, writer: PairsWriter) -> Result<PairsWriter, CodecError> {
        writer
            .push("name", &self.name)?
            .push("ip", &self.ip)?
            .push("cl_guid", &self.guid)
    }
}

/// A sighting as relayed between hubs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerReport {
    /// Address of the game server the player was seen on.
    pub server: String,
    /// Port of that game server.
    pub port: u16,
    /// Player name.
    pub name: String,
    /// Player address.
    pub ip: String,
    /// Client guid.
    pub guid: String,
}

impl PlayerReport {
    /// Reads a report from `server` (`host:port`), `name`, `ip` and `guid`.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is missing or `server` is not `host:port`.
    pub fn from_pairs(pairs: &Pairs) -> Result<Self, CodecError> {
        let (server, port) = split_server(pairs.require("server")?)?;
        Ok(Self {
            server,
            port,
            name: pairs.require("name")?.to_string(),
            ip: pairs.require("ip")?.to_string(),
            guid: pairs.require("guid")?.to_string(),
        })
    }

    /// Encodes the report as a `\key\value` payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidValue`] if a field cannot be carried on the wire.
    pub fn to_pairs(&self) -> Result<String, CodecError> {
        Ok(self.write(PairsWriter::new())?.finish())
    }

    fn write(&self, writer: PairsWriter) -> Result<PairsWriter, CodecError> {
        writer
            .push("server", format!("{}:{}", self.server, self.port))?
            .push("name", &self.name)?
            .push("ip", &self.ip)?
            .push("guid", &self.guid)
    }
}

fn split_server(value: &str) -> Result<(String, u16), CodecError> {
    let (host, port) = value.rsplit_once(':').ok_or_else(|| CodecError::InvalidValue {
        key: "server",
        reason: format!("expected host:port, got {value:?}"),
    })?;
    let port = port.parse().map_err(|_| CodecError::InvalidValue {
        key: "server",
        reason: format!("invalid port in {value:?}"),
    })?;
    if host.is_empty() {
        return Err(CodecError::InvalidValue {
            key: "server",
            reason: "empty host".to_string(),
        });
    }
    Ok((host.to_string(), port))
}

fn parse_id(value: &str) -> Result<u64, CodecError> {
    value.trim().parse().map_err(|_| CodecError::InvalidValue {
        key: "id",
        reason: format!("not an entry id: {value:?}"),
    })
}

/// A sighting replayed from a hub's outbox, to be acknowledged by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverPlayer {
    /// Outbox entry id on the sending hub.
    pub id: u64,
    /// The sighting.
    pub report: PlayerReport,
    /// When the sending hub recorded the sighting.
    pub time: Option<DateTime<Utc>>,
}

impl FailoverPlayer {
    /// Reads a failover message: a [`PlayerReport`] plus `id` and optional `time`.
    ///
    /// # Errors
    ///
    /// Returns an error if the report is invalid, `id` is missing or malformed,
    /// or `time` is not RFC 3339.
    pub fn from_pairs(pairs: &Pairs) -> Result<Self, CodecError> {
        let id = parse_id(pairs.require("id")?)?;
        let report = PlayerReport::from_pairs(pairs)?;
        let time = pairs
            .get("time")
            .map(|value| {
                DateTime::parse_from_rfc3339(value)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| CodecError::InvalidValue {
                        key: "time",
                        reason: e.to_string(),
                    })
            })
            .transpose()?;
        Ok(Self { id, report, time })
    }

    fn write(&self, writer: PairsWriter) -> Result<PairsWriter, CodecError> {
        let writer = self.report.write(writer.push("id", self.id.to_string())?)?;
        match self.time {
            Some(time) => writer.push("time", time.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => Ok(writer),
        }
    }
}

/// Acknowledgment that a failover player message was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverAck {
    /// The acknowledged outbox entry id.
    pub id: u64,
}

impl FailoverAck {
    /// Reads an acknowledgment, either `\id\<n>` or a bare decimal id.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid id is present.
    pub fn decode(payload: &str) -> Result<Self, CodecError> {
        let trimmed = payload.trim();
        if trimmed.starts_with('\\') {
            let pairs = decode_pairs(trimmed)?;
            Ok(Self {
                id: parse_id(pairs.require("id")?)?,
            })
        } else {
            Ok(Self {
                id: parse_id(trimmed)?,
            })
        }
    }
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Userinfo from a game server.
    Userinfo(Userinfo),
    /// Gossip from another hub.
    GossipPlayer(PlayerReport),
    /// Replayed gossip that must be acknowledged.
    FailoverPlayer(FailoverPlayer),
    /// Acknowledgment of replayed gossip.
    FailoverAck(FailoverAck),
}

impl Message {
    /// Returns the kind of this message.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Userinfo(_) => Kind::Userinfo,
            Self::GossipPlayer(_) => Kind::GossipPlayer,
            Self::FailoverPlayer(_) => Kind::FailoverPlayer,
            Self::FailoverAck(_) => Kind::GotFailoverPlayer,
        }
    }

    /// Decodes the payload of a message of the given kind.
    ///
    /// Non-UTF-8 bytes are replaced; player names from game servers are not
    /// guaranteed to be valid UTF-8.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed or lacks required keys.
    pub fn decode(kind: Kind, payload: &[u8]) -> Result<Self, CodecError> {
        let payload = String::from_utf8_lossy(payload);
        match kind {
            Kind::Userinfo => Ok(Self::Userinfo(Userinfo::from_pairs(&decode_pairs(&payload)?)?)),
            Kind::GossipPlayer => Ok(Self::GossipPlayer(PlayerReport::from_pairs(
                &decode_pairs(&payload)?,
            )?)),
            Kind::FailoverPlayer => Ok(Self::FailoverPlayer(FailoverPlayer::from_pairs(
                &decode_pairs(&payload)?,
            )?)),
            Kind::GotFailoverPlayer => Ok(Self::FailoverAck(FailoverAck::decode(&payload)?)),
        }
    }

    /// Encodes the `\key\value` payload of this message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidValue`] if a field cannot be carried on the wire.
    pub fn encode_payload(&self) -> Result<String, CodecError> {
        let writer = PairsWriter::new();
        let writer = match self {
            Self::Userinfo(userinfo) => userinfo.write(writer)?,
            Self::GossipPlayer(report) => report.write(writer)?,
            Self::FailoverPlayer(failover) => failover.write(writer)?,
            Self::FailoverAck(ack) => writer.push("id", ack.id.to_string())?,
        };
        Ok(writer.finish())
    }

    /// Encodes the checksummed body: kind line followed by the payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidValue`] if a field cannot be carried on the wire.
    pub fn encode_body(&self) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload()?;
        let mut body = Vec::with_capacity(self.kind().as_str().len() + 1 + payload.len());
        body.extend_from_slice(self.kind().as_str().as_bytes());
        body.push(b'\n');
        body.extend_from_slice(payload.as_bytes());
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    fn report() -> PlayerReport {
        PlayerReport {
            server: "3.4.5.6".to_string(),
            port: 27964,
            name: "|ALPHA| CCCP".to_string(),
            ip: "1.2.3.4".to_string(),
            guid: "CCCPCCCPCCCPCCCPCCCPCCCPCCCPCCCP".to_string(),
        }
    }

    #[test]
    fn test_userinfo_ignores_unrecorded_keys() {
        let payload = b"\\name\\Foo\\rate\\25000\\ip\\1.2.3.4\\cl_guid\\ABCD\\model\\sarge";
        let message = Message::decode(Kind::Userinfo, payload).expect("decode");
        assert_eq!(
            message,
            Message::Userinfo(Userinfo {
                name: "Foo".to_string(),
                ip: "1.2.3.4".to_string(),
                guid: "ABCD".to_string(),
            })
        );
    }

    #[test_case(b"\\ip\\1.2.3.4\\cl_guid\\ABCD", "name" ; "no name")]
    #[test_case(b"\\name\\Foo\\cl_guid\\ABCD", "ip" ; "no ip")]
    #[test_case(b"\\name\\Foo\\ip\\1.2.3.4\\guid\\ABCD", "cl_guid" ; "guid under wrong key")]
    fn test_userinfo_requires_keys(payload: &[u8], key: &'static str) {
        assert_eq!(
            Message::decode(Kind::Userinfo, payload),
            Err(CodecError::MissingKey(key))
        );
    }

    #[test]
    fn test_userinfo_name_with_line_break_is_refused() {
        // Such a name could never be relayed as a gossip player body.
        assert_eq!(
            Message::decode(Kind::Userinfo, b"\\name\\Fo\no\\ip\\1.2.3.4\\cl_guid\\ABCD"),
            Err(CodecError::LineBreak)
        );
    }

    #[test]
    fn test_userinfo_with_odd_pairs_is_invalid() {
        assert_eq!(
            Message::decode(Kind::Userinfo, b"\\name\\Foo\\ip"),
            Err(CodecError::OddPairs(3))
        );
    }

    #[test]
    fn test_gossip_player_splits_server() {
        let payload = report().to_pairs().expect("encode");
        assert_eq!(
            payload,
            concat!(
                "\\server\\3.4.5.6:27964\\name\\|ALPHA| CCCP\\ip\\1.2.3.4",
                "\\guid\\CCCPCCCPCCCPCCCPCCCPCCCPCCCPCCCP",
            )
        );
        let message = Message::decode(Kind::GossipPlayer, payload.as_bytes()).expect("decode");
        assert_eq!(message, Message::GossipPlayer(report()));
    }

    #[test_case("3.4.5.6" ; "no port")]
    #[test_case("3.4.5.6:port" ; "non numeric port")]
    #[test_case("3.4.5.6:70000" ; "port out of range")]
    #[test_case(":27960" ; "empty host")]
    fn test_gossip_player_rejects_bad_server(server: &str) {
        let payload = format!("\\server\\{server}\\name\\a\\ip\\b\\guid\\c");
        assert!(matches!(
            Message::decode(Kind::GossipPlayer, payload.as_bytes()),
            Err(CodecError::InvalidValue { key: "server", .. })
        ));
    }

    #[test]
    fn test_failover_player_carries_id_and_time() {
        let time = Utc.with_ymd_and_hms(2026, 10, 14, 12, 30, 0).single();
        let message = Message::FailoverPlayer(FailoverPlayer {
            id: 42,
            report: report(),
            time,
        });
        let body = message.encode_body().expect("encode");
        let (kind, payload) = Kind::classify(&body).expect("classify");
        assert_eq!(kind, Kind::FailoverPlayer);
        let text = String::from_utf8_lossy(payload);
        assert!(text.starts_with("\\id\\42\\server\\3.4.5.6:27964"));
        assert!(text.ends_with("\\time\\2026-10-14T12:30:00Z"));
        assert_eq!(Message::decode(kind, payload).expect("decode"), message);
    }

    #[test]
    fn test_failover_player_requires_id() {
        let payload = report().to_pairs().expect("encode");
        assert_eq!(
            Message::decode(Kind::FailoverPlayer, payload.as_bytes()),
            Err(CodecError::MissingKey("id"))
        );
    }

    #[test_case(b"\\id\\7" ; "pairs")]
    #[test_case(b"7" ; "bare id")]
    #[test_case(b" 7\n" ; "bare id with whitespace")]
    fn test_ack_decodes(payload: &[u8]) {
        assert_eq!(
            Message::decode(Kind::GotFailoverPlayer, payload),
            Ok(Message::FailoverAck(FailoverAck { id: 7 }))
        );
    }

    #[test_case(b"" ; "empty")]
    #[test_case(b"seven" ; "not a number")]
    #[test_case(b"\\id\\-1" ; "negative")]
    fn test_ack_rejects_bad_id(payload: &[u8]) {
        assert!(Message::decode(Kind::GotFailoverPlayer, payload).is_err());
    }

    #[test]
    fn test_ack_body_format() {
        let body = Message::FailoverAck(FailoverAck { id: 9 })
            .encode_body()
            .expect("encode");
        assert_eq!(body, b"got failover player\n\\id\\9");
    }

    #[test]
    fn test_lossy_names_still_decode() {
        let payload = b"\\name\\Fo\xffo\\ip\\1.2.3.4\\cl_guid\\ABCD";
        let Message::Userinfo(userinfo) = Message::decode(Kind::Userinfo, payload).expect("decode")
        else {
            panic!("expected userinfo");
        };
        assert!(userinfo.name.starts_with("Fo"));
    }
}
