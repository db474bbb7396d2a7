//! File-backed durable log.
//!
//! The log service proper (quorum, checkpoints, distribution) is an external
//! collaborator. This module implements the contract surface the pre-image
//! store depends on: slot reservation, append with `write` then `sync_data`
//! ordering, and gap-free in-order replay from a position.

use crate::oplog::entry::OplogEntry;
use crate::oplog::frame::{EntryDecodeError, FrameError, LogFrame};
use crate::record::LogTimestamp;
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug)]
pub struct DurableOplog {
    path: PathBuf,
    file: File,
    next_ts: LogTimestamp,
    last_appended: Option<LogTimestamp>,
}

/// Replay output: decoded entries plus an optional torn-tail report. A torn
/// tail is expected after a crash mid-append and is safe to truncate; any
/// deeper decode failure surfaces as an error instead.
#[derive(Debug)]
pub struct WalReplay {
    pub entries: Vec<OplogEntry>,
    pub truncation: Option<TailTruncation>,
}

#[derive(Debug, Clone)]
pub struct TailTruncation {
    pub offset: u64,
    pub truncated_bytes: u64,
    pub error: FrameError,
}

impl DurableOplog {
    /// Opens or creates the log file and recovers the timestamp cursor from
    /// the durable frames, tolerating a torn tail.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.seek(SeekFrom::End(0))?;
        let mut oplog = Self {
            path,
            file,
            next_ts: LogTimestamp(1),
            last_appended: None,
        };
        let replay = oplog.replay_from(LogTimestamp(0))?;
        if let Some(last) = replay.entries.last() {
            oplog.last_appended = Some(last.ts);
            oplog.next_ts = last.ts.next();
        }
        Ok(oplog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_appended(&self) -> Option<LogTimestamp> {
        self.last_appended
    }

    /// Hands out the next `count` log positions. Positions are assigned in
    /// reservation order; an aborted unit wastes its position, which is
    /// harmless because replay only requires monotonicity.
    pub fn reserve_slots(&mut self, count: usize) -> Vec<LogTimestamp> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(self.next_ts);
            self.next_ts = self.next_ts.next();
        }
        slots
    }

    /// Appends one entry and syncs it. This is the durability point of the
    /// atomic unit that staged the entry.
    pub fn append(&mut self, entry: &OplogEntry) -> Result<(), WalError> {
        if let Some(last) = self.last_appended {
            if entry.ts <= last {
                return Err(WalError::NonMonotonicAppend {
                    last: last.0,
                    got: entry.ts.0,
                });
            }
        }
        let frame = LogFrame::for_entry(entry).map_err(WalError::Entry)?;
        let bytes = frame.encode();
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        self.last_appended = Some(entry.ts);
        if entry.ts >= self.next_ts {
            self.next_ts = entry.ts.next();
        }
        Ok(())
    }

    /// Decodes every durable entry with ts strictly greater than `from`, in
    /// commit order. Entries must be monotone; a torn tail is reported, not
    /// fatal; an undecodable entry inside the durable prefix is fatal.
    pub fn replay_from(&mut self, from: LogTimestamp) -> Result<WalReplay, WalError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        self.file.seek(SeekFrom::End(0))?;

        let mut entries = Vec::new();
        let mut cursor = 0usize;
        let mut last_ts: Option<LogTimestamp> = None;
        while cursor < buf.len() {
            let (frame, consumed) = match LogFrame::decode(&buf[cursor..]) {
                Ok(decoded) => decoded,
                Err(error) => {
                    let truncated_bytes = (buf.len() - cursor) as u64;
                    warn!(
                        "event=wal_tail_truncated offset={} truncated_bytes={} error={}",
                        cursor, truncated_bytes, error
                    );
                    return Ok(WalReplay {
                        entries,
                        truncation: Some(TailTruncation {
                            offset: cursor as u64,
                            truncated_bytes,
                            error,
                        }),
                    });
                }
            };
            let entry = frame.decode_entry().map_err(WalError::Entry)?;
            if let Some(last) = last_ts {
                if entry.ts <= last {
                    return Err(WalError::OutOfOrder {
                        last: last.0,
                        got: entry.ts.0,
                    });
                }
            }
            last_ts = Some(entry.ts);
            if entry.ts > from {
                entries.push(entry);
            }
            cursor += consumed;
        }
        Ok(WalReplay {
            entries,
            truncation: None,
        })
    }

    /// Discards a torn tail reported by [`Self::replay_from`].
    pub fn enforce_truncation(&mut self, truncation: &TailTruncation) -> Result<(), WalError> {
        info!(
            "event=wal_truncation_enforced offset={} truncated_bytes={}",
            truncation.offset, truncation.truncated_bytes
        );
        self.file.set_len(truncation.offset)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("log entry error: {0}")]
    Entry(#[source] EntryDecodeError),
    #[error("append at ts {got} not after last appended ts {last}")]
    NonMonotonicAppend { last: u64, got: u64 },
    #[error("durable log out of order: ts {got} after ts {last}")]
    OutOfOrder { last: u64, got: u64 },
}
