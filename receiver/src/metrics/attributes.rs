//! Packed resource attribute strings written by the agent.
//!
//! Format: `key:value,key:value`, NUL padded to the map value width.

use tracing::warn;

use crate::proto::common::KeyValue;
use crate::proto::string_attribute;

/// Result of parsing one packed string
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedAttributes {
    pub pairs: Vec<(String, String)>,
    /// Parts that had no `:` separator
    pub malformed: usize,
}

impl ParsedAttributes {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_key_values(&self) -> Vec<KeyValue> {
        self.pairs
            .iter()
            .map(|(k, v)| string_attribute(k.as_str(), v.as_str()))
            .collect()
    }
}

/// Strip the NUL padding the kernel side leaves after a string.
pub fn trim_padding(raw: &[u8]) -> &[u8] {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &raw[..end]
}

/// Parse a packed attribute string. Malformed parts are skipped with a
/// warning.
pub fn parse_packed_attributes(packed: &str) -> ParsedAttributes {
    let mut parsed = ParsedAttributes::default();

    for part in packed.trim_end_matches('\0').split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let Some((key, value)) = part.split_once(':') else {
            warn!("Skipping malformed resource attribute {:?}", part);
            parsed.malformed += 1;
            continue;
        };

        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        parsed.pairs.push((key.to_string(), value.to_string()));
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let parsed = parse_packed_attributes("service.name:checkout,k8s.ns:prod");
        assert_eq!(parsed.get("service.name"), Some("checkout"));
        assert_eq!(parsed.get("k8s.ns"), Some("prod"));
        assert_eq!(parsed.pairs.len(), 2);
        assert_eq!(parsed.malformed, 0);
    }

    #[test]
    fn test_bad_pair_is_skipped() {
        let parsed = parse_packed_attributes("bad-pair,");
        assert!(parsed.is_empty());
        assert_eq!(parsed.malformed, 1);

        let parsed = parse_packed_attributes("bad-pair,host.name:node-1");
        assert_eq!(parsed.pairs, vec![("host.name".to_string(), "node-1".to_string())]);
    }

    #[test]
    fn test_whitespace_and_empty_sides() {
        let parsed = parse_packed_attributes(" a : 1 , :2, b:, c:x:y ");
        assert_eq!(
            parsed.pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("c".to_string(), "x:y".to_string()),
            ]
        );
        assert_eq!(parsed.malformed, 0);
    }

    #[test]
    fn test_trailing_nuls() {
        let parsed = parse_packed_attributes("k:v\0\0\0");
        assert_eq!(parsed.get("k"), Some("v"));
        assert_eq!(trim_padding(b"abc\0\0"), b"abc");
        assert_eq!(trim_padding(b"\0\0"), b"");
        assert_eq!(trim_padding(b"a\0b\0"), b"a\0b");
    }
}
