//! Backslash-delimited key/value payloads (`\key\value\key\value`).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::CodecError;

/// The pair delimiter.
pub const DELIMITER: char = '\\';

/// Decoded key/value pairs. A repeated key keeps its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pairs {
    entries: BTreeMap<String, String>,
}

impl Pairs {
    /// Returns the value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns the value for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingKey`] if the key is absent.
    pub fn require(&self, key: &'static str) -> Result<&str, CodecError> {
        self.get(key).ok_or(CodecError::MissingKey(key))
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no pairs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Decodes a `\key\value...` payload.
///
/// An empty payload decodes to no pairs. Trailing newlines are ignored.
///
/// # Errors
///
/// Returns [`CodecError::MissingDelimiter`] if a non-empty payload does not
/// start with `\`, [`CodecError::LineBreak`] if a key or value contains a
/// newline, and [`CodecError::OddPairs`] if a key has no value.
pub fn decode_pairs(payload: &str) -> Result<Pairs, CodecError> {
    let payload = payload.trim_end_matches(['\n', '\r', '\0']);
    if payload.is_empty() {
        return Ok(Pairs::default());
    }
    let rest = payload
        .strip_prefix(DELIMITER)
        .ok_or(CodecError::MissingDelimiter)?;
    // Must stay re-encodable by PairsWriter.
    if rest.contains('\n') {
        return Err(CodecError::LineBreak);
    }
    let parts: Vec<&str> = rest.split(DELIMITER).collect();
    if parts.len() % 2 != 0 {
        return Err(CodecError::OddPairs(parts.len()));
    }
    let entries = parts
        .chunks_exact(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect();
    Ok(Pairs { entries })
}

/// Builds a `\key\value...` payload in insertion order.
#[derive(Debug, Clone, Default)]
pub struct PairsWriter {
    buf: String,
}

impl PairsWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one pair.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidValue`] if the value contains the delimiter
    /// or a line break, either of which would corrupt the payload.
    pub fn push(mut self, key: &'static str, value: impl AsRef<str>) -> Result<Self, CodecError> {
        let value = value.as_ref();
        if value.contains([DELIMITER, '\n']) {
            return Err(CodecError::InvalidValue {
                key,
                reason: "value contains a delimiter or newline".to_string(),
            });
        }
        // Writing to a String cannot fail.
        let _ = write!(self.buf, "{DELIMITER}{key}{DELIMITER}{value}");
        Ok(self)
    }

    /// Returns the encoded payload.
    #[must_use]
    pub fn finish(self) -> String {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_decode_userinfo_string() {
        let pairs =
            decode_pairs("\\name\\|ALPHA| CCCP\\ip\\1.2.3.4\\cl_guid\\ABCD").expect("decode");
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs.get("name"), Some("|ALPHA| CCCP"));
        assert_eq!(pairs.get("ip"), Some("1.2.3.4"));
        assert_eq!(pairs.get("cl_guid"), Some("ABCD"));
        assert_eq!(pairs.get("missing"), None);
    }

    #[test_case("" ; "empty")]
    #[test_case("\n" ; "newline only")]
    fn test_decode_empty(payload: &str) {
        assert!(decode_pairs(payload).expect("decode").is_empty());
    }

    #[test_case("\\name" , 1 ; "dangling key")]
    #[test_case("\\a\\b\\c", 3 ; "three elements")]
    #[test_case("\\", 1 ; "lone delimiter")]
    fn test_decode_odd(payload: &str, count: usize) {
        assert_eq!(decode_pairs(payload), Err(CodecError::OddPairs(count)));
    }

    #[test]
    fn test_decode_requires_leading_delimiter() {
        assert_eq!(decode_pairs("name\\x"), Err(CodecError::MissingDelimiter));
    }

    #[test]
    fn test_decode_allows_empty_values_and_trailing_newline() {
        let pairs = decode_pairs("\\name\\\\ip\\1.2.3.4\n").expect("decode");
        assert_eq!(pairs.get("name"), Some(""));
        assert_eq!(pairs.get("ip"), Some("1.2.3.4"));
    }

    #[test_case("\\name\\a\nb\\ip\\1.2.3.4" ; "inside a value")]
    #[test_case("\\na\nme\\a" ; "inside a key")]
    fn test_decode_refuses_embedded_newline(payload: &str) {
        assert_eq!(decode_pairs(payload), Err(CodecError::LineBreak));
    }

    #[test]
    fn test_repeated_key_keeps_last_value() {
        let pairs = decode_pairs("\\name\\a\\name\\b").expect("decode");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs.get("name"), Some("b"));
    }

    #[test]
    fn test_require_reports_key() {
        let pairs = decode_pairs("\\a\\b").expect("decode");
        assert_eq!(pairs.require("a"), Ok("b"));
        assert_eq!(pairs.require("guid"), Err(CodecError::MissingKey("guid")));
    }

    #[test]
    fn test_writer_encodes_in_order() {
        let encoded = PairsWriter::new()
            .push("server", "3.4.5.6:27960")
            .and_then(|w| w.push("name", "Foo"))
            .expect("push")
            .finish();
        assert_eq!(encoded, "\\server\\3.4.5.6:27960\\name\\Foo");
        let pairs = decode_pairs(&encoded).expect("decode");
        assert_eq!(pairs.get("server"), Some("3.4.5.6:27960"));
    }

    #[test_case("a\\b" ; "delimiter")]
    #[test_case("a\nb" ; "newline")]
    fn test_writer_refuses_unsafe_values(value: &str) {
        assert!(matches!(
            PairsWriter::new().push("name", value),
            Err(CodecError::InvalidValue { key: "name", .. })
        ));
    }
}
