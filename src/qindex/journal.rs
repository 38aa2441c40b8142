//! Queue index journal.
//!
//! Recent publish/deliver/ack records are appended here before they are
//! folded into their segment files. The journal is the durability
//! frontier: `sync` fsyncs it, and replay at startup reapplies anything
//! that never reached a segment. Records are self-checksummed; a
//! truncated or corrupt tail ends replay and the remainder is treated as
//! absent.
//!
//! Record layout (little-endian):
//!
//! ```text
//! PUBLISH: kind=1 seq(8) guid(16) flags(1) crc32(4)
//! DELIVER: kind=2 seq(8) crc32(4)
//! ACK:     kind=3 seq(8) crc32(4)
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::guid::{Guid, GUID_LEN};
use crate::Result;

pub const JOURNAL_FILE: &str = "journal.jnl";

pub const KIND_PUBLISH: u8 = 1;
pub const KIND_DELIVER: u8 = 2;
pub const KIND_ACK: u8 = 3;

pub const FLAG_PERSISTENT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalRecord {
    Publish {
        seq: u64,
        guid: Guid,
        persistent: bool,
    },
    Deliver {
        seq: u64,
    },
    Ack {
        seq: u64,
    },
}

impl JournalRecord {
    pub fn seq(&self) -> u64 {
        match *self {
            JournalRecord::Publish { seq, .. }
            | JournalRecord::Deliver { seq }
            | JournalRecord::Ack { seq } => seq,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        match *self {
            JournalRecord::Publish {
                seq,
                guid,
                persistent,
            } => {
                buf.push(KIND_PUBLISH);
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(guid.as_bytes());
                buf.push(if persistent { FLAG_PERSISTENT } else { 0 });
            }
            JournalRecord::Deliver { seq } => {
                buf.push(KIND_DELIVER);
                buf.extend_from_slice(&seq.to_le_bytes());
            }
            JournalRecord::Ack { seq } => {
                buf.push(KIND_ACK);
                buf.extend_from_slice(&seq.to_le_bytes());
            }
        }
        let crc = crc32fast::hash(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
    }
}

/// Decode one record at `data[at..]`. Returns the record and its total
/// length, or None when the tail is truncated, malformed or fails its
/// checksum.
fn decode_at(data: &[u8], at: usize) -> Option<(JournalRecord, usize)> {
    let kind = *data.get(at)?;
    let body_len = match kind {
        KIND_PUBLISH => 1 + 8 + GUID_LEN + 1,
        KIND_DELIVER | KIND_ACK => 1 + 8,
        _ => return None,
    };
    let record_end = at + body_len + 4;
    if record_end > data.len() {
        return None;
    }
    let body = &data[at..at + body_len];
    let stored_crc = u32::from_le_bytes(
        data[at + body_len..record_end].try_into().expect("slice length"),
    );
    if crc32fast::hash(body) != stored_crc {
        return None;
    }

    let seq = u64::from_le_bytes(body[1..9].try_into().expect("slice length"));
    let record = match kind {
        KIND_PUBLISH => {
            let mut guid_bytes = [0u8; GUID_LEN];
            guid_bytes.copy_from_slice(&body[9..9 + GUID_LEN]);
            let flags = body[9 + GUID_LEN];
            JournalRecord::Publish {
                seq,
                guid: Guid::from_bytes(guid_bytes),
                persistent: flags & FLAG_PERSISTENT != 0,
            }
        }
        KIND_DELIVER => JournalRecord::Deliver { seq },
        _ => JournalRecord::Ack { seq },
    };
    Some((record, body_len + 4))
}

/// Append-side handle on the journal file.
pub struct Journal {
    path: PathBuf,
    file: File,
    /// Unsynced appends since the last fsync.
    dirty: bool,
}

impl Journal {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            dirty: false,
        })
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut buf = Vec::with_capacity(32);
        record.encode(&mut buf);
        self.file.write_all(&buf)?;
        self.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force appended records to durable storage. No-ops when nothing was
    /// appended since the previous sync.
    pub fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.file.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    /// Drop the journal contents after they have been folded into segment
    /// files.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        self.dirty = false;
        Ok(())
    }

    /// Replay a journal file in append order. Missing file is an empty
    /// journal.
    pub fn replay(dir: &Path) -> Result<Vec<JournalRecord>> {
        let path = dir.join(JOURNAL_FILE);
        let mut data = Vec::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }

        let mut records = Vec::new();
        let mut at = 0usize;
        while let Some((record, len)) = decode_at(&data, at) {
            records.push(record);
            at += len;
        }
        Ok(records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
