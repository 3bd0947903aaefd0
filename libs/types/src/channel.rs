//! Broadcast channel identifiers and resumable cursors
//!
//! A `ProcessChannel` names one numbered broadcast stream of a process. A
//! `ChannelSessionState` is the serializable cursor a consumer carries
//! through that stream: process id, channel number, and the sequence value
//! of the last message consumed. The string grammar is
//! `<24-char id><hex channel>:<hex sequence>` and is stable enough to live
//! in a cookie or an external store across process restarts.

use crate::error::FormatError;
use crate::identity::{ProcessId, PROCESS_ID_STR_LEN};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// One broadcast stream belonging to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessChannel {
    process_id: ProcessId,
    number: i32,
}

impl ProcessChannel {
    pub fn new(process_id: ProcessId, number: i32) -> Self {
        Self { process_id, number }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    /// Builds the session state for this channel at the given sequence.
    pub fn session_state(&self, sequence: i64) -> ChannelSessionState {
        ChannelSessionState::new(*self, sequence)
    }
}

impl fmt::Display for ProcessChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Signed hex, so `from_str_radix` reads back exactly what was
        // written: -1 prints as "-1", not as its two's-complement digits.
        if self.number < 0 {
            write!(f, "{}-{:x}", self.process_id, self.number.unsigned_abs())
        } else {
            write!(f, "{}{:x}", self.process_id, self.number)
        }
    }
}

impl FromStr for ProcessChannel {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() <= PROCESS_ID_STR_LEN {
            return Err(FormatError::WrongLength {
                expected: PROCESS_ID_STR_LEN + 1,
                got: s.len(),
            });
        }
        let process_id: ProcessId = s[..PROCESS_ID_STR_LEN].parse()?;
        let channel_str = &s[PROCESS_ID_STR_LEN..];
        let number =
            i32::from_str_radix(channel_str, 16).map_err(|_| FormatError::InvalidNumber {
                field: "channel",
                value: channel_str.to_string(),
            })?;
        Ok(Self { process_id, number })
    }
}

/// Serializable cursor into one broadcast channel.
///
/// Two states naming the same channel compare by sequence value, so a
/// cursor captured after consuming messages always compares greater than
/// one captured before. States naming different channels order by the
/// channel prefix string alone, never by sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelSessionState {
    channel: ProcessChannel,
    sequence: i64,
}

impl ChannelSessionState {
    pub fn new(channel: ProcessChannel, sequence: i64) -> Self {
        Self { channel, sequence }
    }

    pub fn channel(&self) -> ProcessChannel {
        self.channel
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }
}

impl fmt::Display for ChannelSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sequence < 0 {
            write!(f, "{}:-{:x}", self.channel, self.sequence.unsigned_abs())
        } else {
            write!(f, "{}:{:x}", self.channel, self.sequence)
        }
    }
}

impl FromStr for ChannelSessionState {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The delimiter can only appear after the fixed-width id.
        let delim = s
            .get(PROCESS_ID_STR_LEN..)
            .and_then(|rest| rest.find(':'))
            .map(|i| i + PROCESS_ID_STR_LEN)
            .ok_or(FormatError::MissingDelimiter)?;
        let channel: ProcessChannel = s[..delim].parse()?;
        let seq_str = &s[delim + 1..];
        let sequence =
            i64::from_str_radix(seq_str, 16).map_err(|_| FormatError::InvalidNumber {
                field: "sequence",
                value: seq_str.to_string(),
            })?;
        Ok(Self { channel, sequence })
    }
}

impl Ord for ChannelSessionState {
    fn cmp(&self, other: &Self) -> Ordering {
        // Compare the channel prefix as strings first so this agrees with
        // lexicographic order of the serialized form, then numerically by
        // sequence so a newer cursor on the same channel compares greater.
        let prefix = self
            .channel
            .to_string()
            .cmp(&other.channel.to_string());
        prefix.then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for ChannelSessionState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ChannelSessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelSessionState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> ProcessId {
        ProcessId::new(0x2b, 77_001, 3)
    }

    #[test]
    fn test_channel_round_trip() {
        let ch = ProcessChannel::new(pid(), 0x3f);
        let parsed: ProcessChannel = ch.to_string().parse().unwrap();
        assert_eq!(parsed, ch);
    }

    #[test]
    fn test_channel_string_is_id_plus_hex() {
        let ch = ProcessChannel::new(pid(), 10);
        let s = ch.to_string();
        assert_eq!(&s[..24], pid().to_string().as_str());
        assert_eq!(&s[24..], "a");
    }

    #[test]
    fn test_negative_channel_round_trip() {
        let ch = ProcessChannel::new(pid(), -1);
        let s = ch.to_string();
        assert!(s.ends_with("-1"), "{s}");
        assert_eq!(s.parse::<ProcessChannel>().unwrap(), ch);

        let extreme = ProcessChannel::new(pid(), i32::MIN);
        assert_eq!(
            extreme.to_string().parse::<ProcessChannel>().unwrap(),
            extreme
        );
    }

    #[test]
    fn test_negative_sequence_round_trip() {
        let state = ProcessChannel::new(pid(), -2).session_state(-10);
        let s = state.to_string();
        assert!(s.ends_with(":-a"), "{s}");
        assert_eq!(s.parse::<ChannelSessionState>().unwrap(), state);

        let extreme = ProcessChannel::new(pid(), 3).session_state(i64::MIN);
        assert_eq!(
            extreme.to_string().parse::<ChannelSessionState>().unwrap(),
            extreme
        );
    }

    #[test]
    fn test_session_state_round_trip() {
        let state = ProcessChannel::new(pid(), 3).session_state(0x1234);
        let parsed: ChannelSessionState = state.to_string().parse().unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_session_state_grammar() {
        let state = ProcessChannel::new(pid(), 3).session_state(255);
        let s = state.to_string();
        assert!(s.ends_with(":ff"));
        assert_eq!(&s[24..25], "3");
    }

    #[test]
    fn test_missing_delimiter_rejected() {
        let s = ProcessChannel::new(pid(), 3).to_string();
        assert!(matches!(
            s.parse::<ChannelSessionState>(),
            Err(FormatError::MissingDelimiter)
        ));
    }

    #[test]
    fn test_newer_state_compares_greater() {
        let ch = ProcessChannel::new(pid(), 3);
        let older = ch.session_state(16);
        let newer = ch.session_state(17);
        assert!(newer > older);
    }

    #[test]
    fn test_sequence_comparison_is_numeric_not_lexicographic() {
        let ch = ProcessChannel::new(pid(), 3);
        // Hex "10" (16) is lexicographically before "f" (15), but the
        // numeric sequence must win.
        assert!(ch.session_state(16) > ch.session_state(15));
    }

    #[test]
    fn test_different_channels_never_compare_by_sequence() {
        let a = ProcessChannel::new(pid(), 1).session_state(1_000_000);
        let b = ProcessChannel::new(pid(), 2).session_state(1);
        assert!(a < b);
    }

    #[test]
    fn test_monotonic_across_consumption() {
        let ch = ProcessChannel::new(pid(), 9);
        let mut prev = ch.session_state(16);
        for k in 17..40 {
            let next = ch.session_state(k);
            assert!(next > prev);
            prev = next;
        }
    }
}
