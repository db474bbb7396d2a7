//! Durable wire frame for one log entry.
//!
//! Frame integrity (CRC plus payload digest) and entry decodability are
//! separate failure classes: a bad CRC at the log tail is a torn write and
//! is truncated away, while a CRC-valid frame whose entry payload does not
//! decode is a replay-integrity fault and must halt replay.

use crate::oplog::entry::OplogEntry;
use crate::record::LogTimestamp;
use crc32fast::Hasher as Crc32Hasher;
use sha2::{Digest, Sha256};
use thiserror::Error;

const FLAG_ANNOTATED: u8 = 0b0000_0001;
// ts + wall_time + flags + payload_len
const HEADER_LEN: usize = 8 + 8 + 1 + 4;
const CRC_LEN: usize = 4;
const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub ts: u64,
    pub wall_time_ms: u64,
    pub flags: u8,
    pub payload: Vec<u8>,
    pub crc32: u32,
    pub digest: [u8; 32],
}

impl LogFrame {
    pub fn for_entry(entry: &OplogEntry) -> Result<Self, EntryDecodeError> {
        let payload = serde_json::to_vec(entry)?;
        let flags = if entry.is_annotated() { FLAG_ANNOTATED } else { 0 };
        let mut crc = Crc32Hasher::new();
        crc.update(&payload);
        let mut sha = Sha256::new();
        sha.update(&payload);
        Ok(Self {
            ts: entry.ts.0,
            wall_time_ms: entry.wall_time_ms,
            flags,
            crc32: crc.finalize(),
            digest: sha.finalize().into(),
            payload,
        })
    }

    pub fn is_annotated(&self) -> bool {
        self.flags & FLAG_ANNOTATED != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN + DIGEST_LEN);
        bytes.extend_from_slice(&self.ts.to_le_bytes());
        bytes.extend_from_slice(&self.wall_time_ms.to_le_bytes());
        bytes.push(self.flags);
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
        bytes.extend_from_slice(&self.digest);
        bytes
    }

    /// Decodes one frame starting at `bytes[0]` and returns it with the
    /// number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < HEADER_LEN + CRC_LEN + DIGEST_LEN {
            return Err(FrameError::TooShort);
        }
        let ts = u64::from_le_bytes(bytes[0..8].try_into().map_err(|_| FrameError::Corrupt)?);
        let wall_time_ms =
            u64::from_le_bytes(bytes[8..16].try_into().map_err(|_| FrameError::Corrupt)?);
        let flags = bytes[16];
        let payload_len =
            u32::from_le_bytes(bytes[17..21].try_into().map_err(|_| FrameError::Corrupt)?) as usize;
        let total = HEADER_LEN + payload_len + CRC_LEN + DIGEST_LEN;
        if bytes.len() < total {
            return Err(FrameError::Corrupt);
        }
        let payload = bytes[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
        let mut cursor = HEADER_LEN + payload_len;
        let crc32 = u32::from_le_bytes(
            bytes[cursor..cursor + CRC_LEN]
                .try_into()
                .map_err(|_| FrameError::Corrupt)?,
        );
        cursor += CRC_LEN;
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[cursor..cursor + DIGEST_LEN]);
        let frame = Self {
            ts,
            wall_time_ms,
            flags,
            payload,
            crc32,
            digest,
        };
        frame.validate()?;
        Ok((frame, total))
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        let mut crc = Crc32Hasher::new();
        crc.update(&self.payload);
        if crc.finalize() != self.crc32 {
            return Err(FrameError::CrcMismatch);
        }
        let mut sha = Sha256::new();
        sha.update(&self.payload);
        let computed: [u8; 32] = sha.finalize().into();
        if computed != self.digest {
            return Err(FrameError::DigestMismatch);
        }
        Ok(())
    }

    /// Parses the entry payload and cross-checks it against the frame
    /// header. Any failure here is fatal to replay.
    pub fn decode_entry(&self) -> Result<OplogEntry, EntryDecodeError> {
        let entry: OplogEntry = serde_json::from_slice(&self.payload)?;
        if entry.ts != LogTimestamp(self.ts) {
            return Err(EntryDecodeError::TimestampMismatch {
                frame_ts: self.ts,
                entry_ts: entry.ts.0,
            });
        }
        if entry.is_annotated() != self.is_annotated() {
            return Err(EntryDecodeError::AnnotationFlagMismatch { ts: self.ts });
        }
        Ok(entry)
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum FrameError {
    #[error("frame too short")]
    TooShort,
    #[error("corrupt frame data")]
    Corrupt,
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("payload digest mismatch")]
    DigestMismatch,
}

#[derive(Debug, Error)]
pub enum EntryDecodeError {
    #[error("entry payload does not decode: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame timestamp {frame_ts} does not match entry timestamp {entry_ts}")]
    TimestampMismatch { frame_ts: u64, entry_ts: u64 },
    #[error("annotation flag disagrees with entry payload at ts {ts}")]
    AnnotationFlagMismatch { ts: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::annotation::LogEntryAnnotator;
    use crate::oplog::entry::WriteOp;
    use crate::record::{CollectionId, DocumentId};
    use serde_json::json;

    fn annotated_entry(ts: u64) -> OplogEntry {
        LogEntryAnnotator::annotate_write(
            LogTimestamp(ts),
            500,
            WriteOp::Delete {
                collection: CollectionId(3),
                document_id: DocumentId::new("a"),
            },
            Some(json!({"_id": "a", "v": 1})),
        )
    }

    #[test]
    fn frame_round_trips_an_annotated_entry() {
        let entry = annotated_entry(12);
        let frame = LogFrame::for_entry(&entry).unwrap();
        assert!(frame.is_annotated());
        let bytes = frame.encode();
        let (decoded, consumed) = LogFrame::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.decode_entry().unwrap(), entry);
    }

    #[test]
    fn flipped_payload_byte_fails_crc() {
        let frame = LogFrame::for_entry(&annotated_entry(12)).unwrap();
        let mut bytes = frame.encode();
        bytes[HEADER_LEN + 1] ^= 0xFF;
        assert!(matches!(
            LogFrame::decode(&bytes),
            Err(FrameError::CrcMismatch)
        ));
    }

    #[test]
    fn crc_valid_frame_with_garbage_payload_is_a_decode_error() {
        let entry = annotated_entry(12);
        let mut frame = LogFrame::for_entry(&entry).unwrap();
        // Re-seal a frame around a payload that is valid JSON but not an
        // entry, simulating an undecodable annotated entry during replay.
        frame.payload = b"{\"not\":\"an entry\"}".to_vec();
        let mut crc = Crc32Hasher::new();
        crc.update(&frame.payload);
        frame.crc32 = crc.finalize();
        let mut sha = Sha256::new();
        sha.update(&frame.payload);
        frame.digest = sha.finalize().into();
        let bytes = frame.encode();
        let (decoded, _) = LogFrame::decode(&bytes).unwrap();
        assert!(matches!(
            decoded.decode_entry(),
            Err(EntryDecodeError::Json(_))
        ));
    }

    #[test]
    fn annotation_flag_mismatch_is_fatal() {
        let entry = annotated_entry(12);
        let mut frame = LogFrame::for_entry(&entry).unwrap();
        frame.flags = 0;
        assert!(matches!(
            frame.decode_entry(),
            Err(EntryDecodeError::AnnotationFlagMismatch { ts: 12 })
        ));
    }
}
