//! Log entry encoding.
//!
//! The store never interprets entry bytes itself; it hands them to the codec
//! pair supplied at init. The shipped codec is a version byte followed by a
//! bincode body. Entries that carry a checksum are verified on decode, so a
//! torn or bit-flipped record surfaces as a codec error instead of garbage
//! reaching the state machine.

use crate::error::{RaftError, Result};
use crate::types::LogEntry;

/// Format version of the shipped codec.
const CODEC_VERSION: u8 = 1;

/// Encoder/decoder pair for log entries.
///
/// Version negotiation is the codec's responsibility: the decoder must
/// reject bytes it does not understand rather than guessing.
pub trait LogEntryCodec: Send + Sync {
    fn encode(&self, entry: &LogEntry) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<LogEntry>;
}

/// The default codec: `[version u8][bincode body]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct V1Codec;

impl LogEntryCodec for V1Codec {
    fn encode(&self, entry: &LogEntry) -> Result<Vec<u8>> {
        let body =
            bincode::serialize(entry).map_err(|e| RaftError::Codec(e.to_string()))?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(CODEC_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<LogEntry> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| RaftError::Codec("empty entry bytes".to_string()))?;
        if version != CODEC_VERSION {
            return Err(RaftError::Codec(format!(
                "unsupported entry version {version}"
            )));
        }
        let entry: LogEntry =
            bincode::deserialize(body).map_err(|e| RaftError::Codec(e.to_string()))?;
        if !entry.is_checksum_valid() {
            return Err(RaftError::Codec(format!(
                "checksum mismatch for entry {}",
                entry.id
            )));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogEntry, LogId};
    use bytes::Bytes;

    #[test]
    fn test_round_trip() {
        let codec = V1Codec;
        let entry = LogEntry::data(LogId::new(42, 3), Bytes::from("put k v"));
        let bytes = codec.encode(&entry).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let codec = V1Codec;
        let entry = LogEntry::no_op(LogId::new(1, 1));
        let mut bytes = codec.encode(&entry).unwrap();
        bytes[0] = 9;
        assert!(matches!(codec.decode(&bytes), Err(RaftError::Codec(_))));
    }

    #[test]
    fn test_rejects_corrupted_payload() {
        let codec = V1Codec;
        let entry = LogEntry::data(LogId::new(5, 2), Bytes::from("payload-bytes"));
        let mut bytes = codec.encode(&entry).unwrap();
        // Flip a bit somewhere inside the command payload.
        let n = bytes.len();
        bytes[n - 3] ^= 0x01;
        let decoded = codec.decode(&bytes);
        assert!(decoded.is_err());
    }
}
