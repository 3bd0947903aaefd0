//! Process identity
//!
//! A `ProcessId` is the globally unique, opaque address of one hosted
//! process. It encodes a partition byte and a temporally-ordered
//! `(high, low)` pair, but the 24-character string form cannot be reverse
//! engineered into network topology: resolving an id to a host goes
//! through the process server's private tables, never through the string.

use crate::encoding::{decode_i64, encode_i64, ENCODED_I64_LEN};
use crate::error::FormatError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Fixed length of the string form: 2 hex chars + two 11-char values.
pub const PROCESS_ID_STR_LEN: usize = 2 + ENCODED_I64_LEN * 2;

/// Globally unique address of a process.
///
/// Created once when a process is instantiated, immutable thereafter, and
/// never reused after the process is closed. Within one partition the
/// `(high, low)` pair is monotonically increasing, so ordering ids orders
/// them by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId {
    partition: u8,
    high: i64,
    low: i64,
}

impl ProcessId {
    /// Builds an id from its raw parts. `partition` selects the logical
    /// shard the process record lives in; `(high, low)` is the temporally
    /// ordered value allocated by that partition.
    pub fn new(partition: u8, high: i64, low: i64) -> Self {
        Self {
            partition,
            high,
            low,
        }
    }

    pub fn partition(&self) -> u8 {
        self.partition
    }

    pub fn high(&self) -> i64 {
        self.high
    }

    pub fn low(&self) -> i64 {
        self.low
    }

    /// Name of the storage path this id is managed in, e.g. `sysprocess1a`.
    pub fn partition_path(&self) -> String {
        format!("sysprocess{:02x}", self.partition)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(PROCESS_ID_STR_LEN);
        s.push_str(&format!("{:02x}", self.partition));
        encode_i64(self.high, &mut s);
        encode_i64(self.low, &mut s);
        f.write_str(&s)
    }
}

impl FromStr for ProcessId {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PROCESS_ID_STR_LEN {
            return Err(FormatError::WrongLength {
                expected: PROCESS_ID_STR_LEN,
                got: s.len(),
            });
        }
        let partition = parse_partition(&s[..2])?;
        let high = decode_i64(&s[2..], 2)?;
        let low = decode_i64(&s[2 + ENCODED_I64_LEN..], 2 + ENCODED_I64_LEN)?;
        Ok(Self {
            partition,
            high,
            low,
        })
    }
}

fn parse_partition(s: &str) -> Result<u8, FormatError> {
    for (i, ch) in s.chars().enumerate() {
        if !ch.is_ascii_hexdigit() {
            return Err(FormatError::InvalidCharacter { ch, offset: i });
        }
    }
    u8::from_str_radix(s, 16).map_err(|_| FormatError::InvalidNumber {
        field: "partition",
        value: s.to_string(),
    })
}

impl Ord for ProcessId {
    fn cmp(&self, other: &Self) -> Ordering {
        // Matches lexicographic order of the string form: the encoding is
        // order preserving over the unsigned bit pattern of each value.
        self.partition
            .cmp(&other.partition)
            .then((self.high as u64).cmp(&(other.high as u64)))
            .then((self.low as u64).cmp(&(other.low as u64)))
    }
}

impl PartialOrd for ProcessId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ProcessId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProcessId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_string_form_is_24_chars() {
        let id = ProcessId::new(0x1a, 0x1234_5678_9abc_def0, -42);
        assert_eq!(id.to_string().len(), 24);
    }

    #[test]
    fn test_round_trip() {
        let id = ProcessId::new(7, 1_000_000, 999);
        let parsed: ProcessId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_partition_path() {
        assert_eq!(ProcessId::new(0x03, 0, 0).partition_path(), "sysprocess03");
        assert_eq!(ProcessId::new(0xff, 0, 0).partition_path(), "sysprocessff");
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(matches!(
            "0a".parse::<ProcessId>(),
            Err(FormatError::WrongLength { expected: 24, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_partition() {
        let mut s = ProcessId::new(0, 1, 2).to_string();
        s.replace_range(0..2, "zz");
        assert!(matches!(
            s.parse::<ProcessId>(),
            Err(FormatError::InvalidCharacter { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_body_character() {
        let mut s = ProcessId::new(0, 1, 2).to_string();
        s.replace_range(5..6, "!");
        assert!(matches!(
            s.parse::<ProcessId>(),
            Err(FormatError::InvalidCharacter { ch: '!', offset: 5 })
        ));
    }

    #[test]
    fn test_ordering_follows_creation_order_in_partition() {
        let a = ProcessId::new(1, 5, 100);
        let b = ProcessId::new(1, 5, 101);
        let c = ProcessId::new(1, 6, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let id = ProcessId::new(2, 33, 44);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: ProcessId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn prop_round_trip(partition: u8, high: i64, low: i64) {
            let id = ProcessId::new(partition, high, low);
            let parsed: ProcessId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }

        #[test]
        fn prop_cmp_matches_string_cmp(p1: u8, h1: i64, l1: i64, p2: u8, h2: i64, l2: i64) {
            let a = ProcessId::new(p1, h1, l1);
            let b = ProcessId::new(p2, h2, l2);
            prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }
    }
}
