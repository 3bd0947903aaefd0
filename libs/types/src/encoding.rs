//! Lexicographic base-64 encoding for 64-bit values
//!
//! Encodes an `i64` as exactly 11 symbols from an alphabet whose ASCII
//! order matches the numeric order of the underlying bit pattern. A
//! lexicographic comparison of two encoded strings therefore agrees with
//! an unsigned comparison of the source values, which is what keeps
//! `ProcessId` ordering consistent with creation order inside a partition.

use crate::error::FormatError;

/// Symbols in ASCII order so encoded strings sort like the source bits.
const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Number of symbols produced for one 64-bit value (64 bits / 6 = 10 2/3).
pub const ENCODED_I64_LEN: usize = 11;

/// Appends the 11-symbol encoding of `val` to `out`.
pub fn encode_i64(val: i64, out: &mut String) {
    // Most significant group first: 4 bits, then ten full 6-bit groups.
    let mut shift = 60i32;
    for _ in 0..ENCODED_I64_LEN {
        let group = ((val >> shift) & 0x3f) as usize;
        out.push(ALPHABET[group] as char);
        shift -= 6;
    }
}

/// Returns the alphabet index of `symbol`, or `None` if it is not part of
/// the encoding alphabet.
fn symbol_value(symbol: u8) -> Option<i64> {
    match symbol {
        b'-' => Some(0),
        b'0'..=b'9' => Some(1 + (symbol - b'0') as i64),
        b'A'..=b'Z' => Some(11 + (symbol - b'A') as i64),
        b'_' => Some(37),
        b'a'..=b'z' => Some(38 + (symbol - b'a') as i64),
        _ => None,
    }
}

/// Decodes the first 11 symbols of `s` back into an `i64`.
///
/// `base_offset` is only used to report the absolute position of a bad
/// character inside a larger identifier string.
pub fn decode_i64(s: &str, base_offset: usize) -> Result<i64, FormatError> {
    let bytes = s.as_bytes();
    if bytes.len() < ENCODED_I64_LEN {
        return Err(FormatError::WrongLength {
            expected: base_offset + ENCODED_I64_LEN,
            got: base_offset + bytes.len(),
        });
    }
    let mut val: i64 = 0;
    let mut shift = 60i32;
    for (i, &b) in bytes.iter().take(ENCODED_I64_LEN).enumerate() {
        let group = symbol_value(b).ok_or(FormatError::InvalidCharacter {
            ch: b as char,
            offset: base_offset + i,
        })?;
        val |= group << shift;
        shift -= 6;
    }
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(val: i64) -> String {
        let mut s = String::new();
        encode_i64(val, &mut s);
        s
    }

    #[test]
    fn test_encoded_length() {
        assert_eq!(encoded(0).len(), ENCODED_I64_LEN);
        assert_eq!(encoded(i64::MAX).len(), ENCODED_I64_LEN);
        assert_eq!(encoded(i64::MIN).len(), ENCODED_I64_LEN);
    }

    #[test]
    fn test_zero_is_all_dashes() {
        assert_eq!(encoded(0), "-----------");
    }

    #[test]
    fn test_round_trip_known_values() {
        for val in [0, 1, -1, 63, 64, i64::MAX, i64::MIN, 0x0123_4567_89ab_cdef] {
            assert_eq!(decode_i64(&encoded(val), 0).unwrap(), val);
        }
    }

    #[test]
    fn test_invalid_character_rejected() {
        let err = decode_i64("----------!", 2).unwrap_err();
        match err {
            FormatError::InvalidCharacter { ch, offset } => {
                assert_eq!(ch, '!');
                assert_eq!(offset, 12);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_short_input_rejected() {
        assert!(decode_i64("abc", 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip(val: i64) {
            prop_assert_eq!(decode_i64(&encoded(val), 0).unwrap(), val);
        }

        #[test]
        fn prop_order_matches_unsigned_order(a: i64, b: i64) {
            // String order must agree with unsigned order of the bit pattern.
            let cmp_str = encoded(a).cmp(&encoded(b));
            let cmp_val = (a as u64).cmp(&(b as u64));
            prop_assert_eq!(cmp_str, cmp_val);
        }
    }
}
