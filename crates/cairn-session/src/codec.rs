//! Encoding and decoding of the externally visible session token.
//!
//! A token has the shape `[vvvv]<base id>[<sep><clone>[<sep><clone>...]]`:
//! an optional four digit zero-padded version (omitted for version 0), the
//! fixed-length base id, then the clone chain. The functions here are pure;
//! clone-chain maintenance lives in [`crate::affinity`].

use serde::{Deserialize, Serialize};

use crate::config::SessionManagerConfig;

/// Width of the version prefix.
pub const VERSION_PREFIX_LEN: usize = 4;

/// Largest version that fits the prefix.
pub const MAX_VERSION: u32 = 9999;

/// Characters that must never be echoed back to a transport.
pub const UNSAFE_CHARS: [char; 8] = ['<', '>', '&', '!', '\'', '(', ')', '"'];

/// Returns `true` when `value` contains none of [`UNSAFE_CHARS`].
pub fn is_safe(value: &str) -> bool {
    !value.contains(UNSAFE_CHARS)
}

/// The version that follows `version`, wrapping past [`MAX_VERSION`] to 1.
pub fn next_version(version: u32) -> u32 {
    if version >= MAX_VERSION { 1 } else { version + 1 }
}

/// A decoded incoming token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedId {
    pub version: u32,
    pub base_id: String,
    /// Clone tokens joined by the separator, `None` when absent or empty.
    pub clone_chain: Option<String>,
}

impl ParsedId {
    pub fn new(version: u32, base_id: impl Into<String>, clone_chain: Option<String>) -> Self {
        Self {
            version,
            base_id: base_id.into(),
            clone_chain: clone_chain.filter(|c| !c.is_empty()),
        }
    }
}

/// Token codec bound to one manager's id length and separator.
#[derive(Debug, Clone)]
pub struct IdCodec {
    id_length: usize,
    separator: char,
    max_length: usize,
}

impl IdCodec {
    pub fn new(id_length: usize, separator: char, max_length: usize) -> Self {
        Self {
            id_length,
            separator,
            max_length,
        }
    }

    pub fn from_config(config: &SessionManagerConfig) -> Self {
        Self::new(
            config.id_length,
            config.clone_separator,
            config.max_id_length,
        )
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn id_length(&self) -> usize {
        self.id_length
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Build the token for `(version, base_id, clone_chain)`.
    ///
    /// No safety or length checks; see [`IdCodec::encode_checked`].
    pub fn encode(&self, version: u32, base_id: &str, clone_chain: Option<&str>) -> String {
        let mut out = String::with_capacity(
            VERSION_PREFIX_LEN + base_id.len() + clone_chain.map_or(0, |c| c.len() + 1),
        );
        if version > 0 {
            out.push_str(&format!("{:04}", version.min(MAX_VERSION)));
        }
        out.push_str(base_id);
        if let Some(chain) = clone_chain.filter(|c| !c.is_empty()) {
            out.push(self.separator);
            out.push_str(chain);
        }
        out
    }

    /// Build the token, refusing values that are unsafe to echo or longer
    /// than the configured maximum.
    pub fn encode_checked(
        &self,
        version: u32,
        base_id: &str,
        clone_chain: Option<&str>,
    ) -> Option<String> {
        if !is_safe(base_id) || !clone_chain.is_none_or(is_safe) {
            return None;
        }
        let token = self.encode(version, base_id, clone_chain);
        (token.len() <= self.max_length).then_some(token)
    }

    /// Parse an incoming raw token. Returns `None` for malformed input.
    pub fn decode(&self, raw: &str) -> Option<ParsedId> {
        if raw.is_empty() {
            return None;
        }

        let (head, chain) = match raw.find(self.separator) {
            Some(idx) if idx < VERSION_PREFIX_LEN => return None,
            Some(idx) => (&raw[..idx], Some(&raw[idx + self.separator.len_utf8()..])),
            None => (raw, None),
        };

        let (version, base_id) = if head.len() > self.id_length {
            let prefix = head.get(..VERSION_PREFIX_LEN)?;
            if !prefix.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let base = &head[VERSION_PREFIX_LEN..];
            if base.len() > self.id_length {
                return None;
            }
            (prefix.parse::<u32>().ok()?, base)
        } else {
            (0, head)
        };

        if base_id.is_empty() {
            return None;
        }

        Some(ParsedId::new(version, base_id, chain.map(str::to_string)))
    }

    /// Split a clone chain into its non-empty tokens.
    pub fn split_chain<'a>(&self, chain: &'a str) -> Vec<&'a str> {
        chain
            .split(self.separator)
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Join clone tokens with the separator.
    pub fn join_chain<S: AsRef<str>>(&self, tokens: &[S]) -> String {
        let mut buf = [0u8; 4];
        let sep: &str = self.separator.encode_utf8(&mut buf);
        tokens
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(sep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: &str = "AbCdEfGhIjKlMnOpQrStUvW";

    fn codec() -> IdCodec {
        IdCodec::new(23, ':', 1024)
    }

    #[test]
    fn test_encode_omits_zero_version() {
        assert_eq!(codec().encode(0, BASE, None), BASE);
        assert_eq!(codec().encode(3, BASE, Some("A:B")), format!("0003{BASE}:A:B"));
    }

    #[test]
    fn test_decode_with_version_and_chain() {
        let parsed = codec().decode(&format!("0012{BASE}:A:B")).unwrap();
        assert_eq!(parsed.version, 12);
        assert_eq!(parsed.base_id, BASE);
        assert_eq!(parsed.clone_chain.as_deref(), Some("A:B"));
    }

    #[test]
    fn test_decode_without_version() {
        let parsed = codec().decode(BASE).unwrap();
        assert_eq!(parsed, ParsedId::new(0, BASE, None));
    }

    #[test]
    fn test_decode_empty_chain_is_none() {
        let parsed = codec().decode(&format!("{BASE}:")).unwrap();
        assert!(parsed.clone_chain.is_none());
    }

    #[test]
    fn test_decode_rejects_separator_in_prefix() {
        assert!(codec().decode(":abc").is_none());
        assert!(codec().decode("ab:cdefg").is_none());
    }

    #[test]
    fn test_decode_rejects_overlong_base() {
        let long = format!("0001{BASE}XYZ");
        assert!(codec().decode(&long).is_none());
    }

    #[test]
    fn test_decode_rejects_non_numeric_prefix() {
        let raw = format!("abcd{BASE}");
        assert!(codec().decode(&raw).is_none());
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(codec().decode("").is_none());
    }

    #[test]
    fn test_encode_checked_refuses_unsafe() {
        assert!(codec().encode_checked(0, BASE, Some("A<script>")).is_none());
        assert!(codec().encode_checked(0, "bad\"id", None).is_none());
        assert!(codec().encode_checked(0, BASE, Some("A")).is_some());
    }

    #[test]
    fn test_encode_checked_refuses_overlong() {
        let small = IdCodec::new(23, ':', 30);
        assert!(small.encode_checked(0, BASE, Some("CLONE1:CLONE2")).is_none());
        assert!(small.encode_checked(0, BASE, Some("C1")).is_some());
    }

    #[test]
    fn test_next_version_wraps() {
        assert_eq!(next_version(0), 1);
        assert_eq!(next_version(41), 42);
        assert_eq!(next_version(MAX_VERSION), 1);
    }

    #[test]
    fn test_split_and_join_chain() {
        let c = codec();
        assert_eq!(c.split_chain("A::B:"), vec!["A", "B"]);
        assert_eq!(c.join_chain(&["A", "B", "C"]), "A:B:C");
        assert_eq!(c.join_chain::<&str>(&[]), "");
    }

    fn clone_token() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_-]{1,8}"
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            version in 0u32..=MAX_VERSION,
            base in "[A-Za-z0-9_-]{23}",
            clones in proptest::collection::vec(clone_token(), 0..4),
        ) {
            let c = codec();
            let chain = (!clones.is_empty()).then(|| c.join_chain(&clones));
            let token = c.encode(version, &base, chain.as_deref());
            let parsed = c.decode(&token).unwrap();
            prop_assert_eq!(parsed, ParsedId::new(version, base, chain));
        }

        #[test]
        fn unsafe_values_are_never_encoded(
            base in "[A-Za-z0-9]{23}",
            prefix in "[A-Za-z0-9]{0,4}",
            bad in proptest::sample::select(UNSAFE_CHARS.to_vec()),
        ) {
            let chain = format!("{prefix}{bad}");
            prop_assert!(codec().encode_checked(0, &base, Some(&chain)).is_none());
            prop_assert!(!is_safe(&chain));
        }
    }
}
