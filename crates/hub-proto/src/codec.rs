//! Sealing messages into datagrams and opening received frames.

use crate::checksum::ChecksumAlgorithm;
use crate::error::CodecError;
use crate::frame::{Frame, Framing, MARKER};
use crate::message::Message;

/// Encodes and decodes authenticated datagrams with a fixed checksum algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Codec {
    algorithm: ChecksumAlgorithm,
}

impl Codec {
    /// Creates a codec using `algorithm` for all checksums.
    #[must_use]
    pub const fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Returns the checksum algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Encodes `message` as a datagram authenticated with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidValue`] if a field cannot be carried on the wire.
    pub fn seal(
        &self,
        framing: Framing,
        secret: &[u8],
        message: &Message,
    ) -> Result<Vec<u8>, CodecError> {
        let body = message.encode_body()?;
        let token = self.algorithm.authenticate(secret, &body);
        let mut datagram = Vec::with_capacity(MARKER.len() + token.len() + 1 + body.len());
        if framing.is_marked() {
            datagram.extend_from_slice(&MARKER);
        }
        datagram.extend_from_slice(token.as_bytes());
        datagram.push(b'\n');
        datagram.extend_from_slice(&body);
        Ok(datagram)
    }

    /// Checks framing, verifies the checksum and decodes the message of a frame.
    ///
    /// Verification happens before any payload parsing.
    ///
    /// # Errors
    ///
    /// Returns the first framing, authentication or decoding failure.
    pub fn open(
        &self,
        frame: &Frame<'_>,
        framing: Framing,
        secret: &[u8],
    ) -> Result<Message, CodecError> {
        frame.expect_framing(framing)?;
        frame.verify(self.algorithm, secret)?;
        let (kind, payload) = frame.classify()?;
        Message::decode(kind, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FailoverAck, PlayerReport, Userinfo};

    fn userinfo() -> Message {
        Message::Userinfo(Userinfo {
            name: "Foo".to_string(),
            ip: "1.2.3.4".to_string(),
            guid: "ABCD".to_string(),
        })
    }

    #[test]
    fn test_seal_then_open_connectionless() {
        let codec = Codec::default();
        let datagram = codec
            .seal(Framing::Connectionless, b"somesecret", &userinfo())
            .expect("seal");
        assert!(datagram.starts_with(&MARKER));

        let frame = Frame::split(&datagram).expect("split");
        assert_eq!(frame.token.len(), 32);
        let message = codec.open(&frame, Framing::Connectionless, b"somesecret").expect("open");
        assert_eq!(message, userinfo());
    }

    #[test]
    fn test_seal_bare_has_no_marker() {
        let codec = Codec::new(ChecksumAlgorithm::Blake3);
        let message = Message::FailoverAck(FailoverAck { id: 3 });
        let datagram = codec.seal(Framing::Bare, b"k", &message).expect("seal");
        assert!(!datagram.starts_with(&MARKER));
        let frame = Frame::split(&datagram).expect("split");
        assert_eq!(frame.token.len(), 64);
        assert_eq!(codec.open(&frame, Framing::Bare, b"k").expect("open"), message);
    }

    #[test]
    fn test_open_rejects_wrong_secret() {
        let codec = Codec::default();
        let message = Message::GossipPlayer(PlayerReport {
            server: "3.4.5.6".to_string(),
            port: 27960,
            name: "Foo".to_string(),
            ip: "1.2.3.4".to_string(),
            guid: "ABCD".to_string(),
        });
        let datagram = codec.seal(Framing::Bare, b"anothersecret", &message).expect("seal");
        let frame = Frame::split(&datagram).expect("split");
        assert_eq!(
            codec.open(&frame, Framing::Bare, b"youcantknow"),
            Err(CodecError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_open_checks_framing_first() {
        let codec = Codec::default();
        let datagram = codec.seal(Framing::Bare, b"s", &userinfo()).expect("seal");
        let frame = Frame::split(&datagram).expect("split");
        assert_eq!(
            codec.open(&frame, Framing::Connectionless, b"s"),
            Err(CodecError::UnexpectedFraming { marked: false })
        );
    }

    #[test]
    fn test_tampered_body_fails_authentication() {
        let codec = Codec::default();
        let mut datagram = codec.seal(Framing::Bare, b"s", &userinfo()).expect("seal");
        let last = datagram.len() - 1;
        datagram[last] = b'E';
        let frame = Frame::split(&datagram).expect("split");
        assert_eq!(
            codec.open(&frame, Framing::Bare, b"s"),
            Err(CodecError::AuthenticationFailed)
        );
    }
}
