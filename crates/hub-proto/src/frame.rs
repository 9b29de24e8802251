//! Datagram framing: the optional connectionless marker and the checksum line.

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::error::CodecError;
use crate::kind::Kind;

/// Out-of-band marker prefixed to connectionless game server datagrams.
pub const MARKER: [u8; 4] = [0xff; 4];

/// Whether datagrams from a class of counterparties carry the [`MARKER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// The marker is present.
    Connectionless,
    /// No marker; the datagram starts with the checksum token.
    Bare,
}

impl Framing {
    /// Returns true if this framing carries the marker.
    #[must_use]
    pub const fn is_marked(self) -> bool {
        matches!(self, Self::Connectionless)
    }
}

/// A received datagram split into its framing parts.
///
/// Nothing in a frame is trusted until [`Frame::verify`] succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Whether the datagram began with the marker.
    pub marked: bool,
    /// The checksum token line.
    pub token: &'a [u8],
    /// Everything after the checksum line; this is what the token covers.
    pub body: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Splits a datagram into marker, token and body.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if there is no checksum line.
    pub fn split(datagram: &'a [u8]) -> Result<Self, CodecError> {
        let (marked, rest) = match datagram.strip_prefix(&MARKER[..]) {
            Some(rest) => (true, rest),
            None => (false, datagram),
        };
        let newline = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(CodecError::Truncated)?;
        Ok(Self {
            marked,
            token: &rest[..newline],
            body: &rest[newline + 1..],
        })
    }

    /// Checks the marker against the framing expected from the sender.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedFraming`] on mismatch.
    pub fn expect_framing(&self, framing: Framing) -> Result<(), CodecError> {
        if self.marked == framing.is_marked() {
            Ok(())
        } else {
            Err(CodecError::UnexpectedFraming {
                marked: self.marked,
            })
        }
    }

    /// Verifies the token against the body under `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BadTokenLength`] for a structurally wrong token
    /// and [`CodecError::AuthenticationFailed`] for a mismatch.
    pub fn verify(&self, algorithm: ChecksumAlgorithm, secret: &[u8]) -> Result<(), CodecError> {
        if self.token.len() != algorithm.token_len() {
            return Err(CodecError::BadTokenLength {
                actual: self.token.len(),
                expected: algorithm.token_len(),
            });
        }
        if algorithm.verify(secret, self.token, self.body) {
            Ok(())
        } else {
            Err(CodecError::AuthenticationFailed)
        }
    }

    /// Reads the message kind from the first body line.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKind`] if the kind is not recognised.
    pub fn classify(&self) -> Result<(Kind, &'a [u8]), CodecError> {
        Kind::classify(self.body)
    }
}
