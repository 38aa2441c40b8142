//! In-memory guid index and its clean-shutdown snapshot.
//!
//! The index is the authoritative locator for every stored body: readers
//! follow it to a `{segment, offset}` pair, GC consults the ref-counts.
//! On clean shutdown it is persisted verbatim; on unclean shutdown it is
//! rebuilt by scanning the segment files.
//!
//! Snapshot format (little-endian):
//!
//! ```text
//! magic(4)="SQIX" version(4) count(8)
//! {guid(16) segment(8) offset(8) total_len(4) ref_count(4)}*
//! crc32(4)     ← over everything after the magic
//! ```

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::guid::{Guid, GUID_LEN};
use crate::{Error, Result};

pub const SNAPSHOT_FILE: &str = "index.snapshot";

const SNAPSHOT_MAGIC: [u8; 4] = *b"SQIX";
const SNAPSHOT_VERSION: u32 = 1;
const ENTRY_LEN: usize = GUID_LEN + 8 + 8 + 4 + 4;

/// Where a body currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Still in the write-behind buffer, not yet on disk.
    Buffered,
    /// At `offset` inside segment file `segment`.
    OnDisk {
        segment: u64,
        offset: u64,
        total_len: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    pub ref_count: u32,
    pub slot: Slot,
}

pub type GuidIndex = HashMap<Guid, IndexEntry>;

/// Persist the index. Buffered entries must have been flushed first.
///
/// # Errors
///
/// - `Error::InvariantViolated`: a buffered entry remained
pub fn save_snapshot(path: &Path, index: &GuidIndex) -> Result<()> {
    let mut body = Vec::with_capacity(12 + index.len() * ENTRY_LEN);
    body.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    body.extend_from_slice(&(index.len() as u64).to_le_bytes());
    for (guid, entry) in index {
        let Slot::OnDisk {
            segment,
            offset,
            total_len,
        } = entry.slot
        else {
            return Err(Error::InvariantViolated(
                "buffered store entry at snapshot time",
            ));
        };
        body.extend_from_slice(guid.as_bytes());
        body.extend_from_slice(&segment.to_le_bytes());
        body.extend_from_slice(&offset.to_le_bytes());
        body.extend_from_slice(&total_len.to_le_bytes());
        body.extend_from_slice(&entry.ref_count.to_le_bytes());
    }

    let tmp = path.with_extension("snapshot.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&SNAPSHOT_MAGIC)?;
    file.write_all(&body)?;
    file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
    file.sync_all()?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load a snapshot written by [`save_snapshot`].
///
/// # Errors
///
/// - `Error::CorruptMetadata`: malformed or checksum-failing snapshot
pub fn load_snapshot(path: &Path) -> Result<GuidIndex> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    if data.len() < 4 + 12 + 4 || data[..4] != SNAPSHOT_MAGIC {
        return Err(Error::CorruptMetadata("store snapshot header"));
    }
    let body = &data[4..data.len() - 4];
    let stored_crc = u32::from_le_bytes(
        data[data.len() - 4..].try_into().expect("slice length"),
    );
    if crc32fast::hash(body) != stored_crc {
        return Err(Error::CorruptMetadata("store snapshot checksum"));
    }

    let version = u32::from_le_bytes(body[..4].try_into().expect("slice length"));
    if version != SNAPSHOT_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let count = u64::from_le_bytes(body[4..12].try_into().expect("slice length")) as usize;
    let records = &body[12..];
    if records.len() != count * ENTRY_LEN {
        return Err(Error::CorruptMetadata("store snapshot length"));
    }

    let mut index = GuidIndex::with_capacity(count);
    for record in records.chunks_exact(ENTRY_LEN) {
        let mut guid_bytes = [0u8; GUID_LEN];
        guid_bytes.copy_from_slice(&record[..GUID_LEN]);
        let segment =
            u64::from_le_bytes(record[GUID_LEN..GUID_LEN + 8].try_into().expect("slice length"));
        let offset = u64::from_le_bytes(
            record[GUID_LEN + 8..GUID_LEN + 16].try_into().expect("slice length"),
        );
        let total_len = u32::from_le_bytes(
            record[GUID_LEN + 16..GUID_LEN + 20].try_into().expect("slice length"),
        );
        let ref_count = u32::from_le_bytes(
            record[GUID_LEN + 20..GUID_LEN + 24].try_into().expect("slice length"),
        );
        index.insert(
            Guid::from_bytes(guid_bytes),
            IndexEntry {
                ref_count,
                slot: Slot::OnDisk {
                    segment,
                    offset,
                    total_len,
                },
            },
        );
    }
    Ok(index)
}
