//! Error types for hub-proto.

use thiserror::Error;

/// Errors that can occur while framing, authenticating or decoding a datagram.
///
/// None of these are surfaced to the sender; the relay logs them at debug
/// level and drops the datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The datagram ended before the checksum line.
    #[error("datagram truncated before checksum line")]
    Truncated,

    /// The checksum token does not have the algorithm's fixed length.
    #[error("checksum token has length {actual}, expected {expected}")]
    BadTokenLength {
        /// Length of the received token.
        actual: usize,
        /// Length required by the configured algorithm.
        expected: usize,
    },

    /// The checksum did not match the body under the sender's secret.
    #[error("checksum mismatch")]
    AuthenticationFailed,

    /// The connectionless marker was present when it should not be, or absent
    /// when it is required.
    #[error("unexpected framing: marker {}", if *.marked { "present" } else { "missing" })]
    UnexpectedFraming {
        /// Whether the received datagram carried the marker.
        marked: bool,
    },

    /// The first body line is not a recognised message kind.
    #[error("unknown message kind: {0:?}")]
    UnknownKind(String),

    /// The key/value payload does not start with the delimiter.
    #[error("payload does not start with the pair delimiter")]
    MissingDelimiter,

    /// The key/value payload has a dangling key.
    #[error("payload has an odd number of elements ({0})")]
    OddPairs(usize),

    /// A key or value spans more than one line.
    #[error("payload contains a line break")]
    LineBreak,

    /// A required key is absent from the payload.
    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    /// A value could not be interpreted.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// The key whose value was invalid.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
