//! Store segment files.
//!
//! A store segment is an append-only file of variable-length records:
//!
//! ```text
//! {guid(16) body_len(4) body(body_len) crc32(4)}*
//! ```
//!
//! Segments are written only through the store's write-behind buffer and
//! never rewritten in place; compaction produces a replacement file and
//! renames it over the original. All functions here are stateless file
//! operations, composable by the store and its GC.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::guid::{Guid, GUID_LEN};
use crate::{Error, Result};

/// Default upper bound for a segment file before the writer rolls.
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 4 * 1024 * 1024;

pub const RECORD_HEADER_LEN: u64 = GUID_LEN as u64 + 4;
pub const RECORD_TRAILER_LEN: u64 = 4;

/// Generate segment filename from ID (e.g., "000000042.rdq").
pub fn segment_filename(id: u64) -> String {
    format!("{id:09}.rdq")
}

/// Get path to a segment file.
pub fn segment_path(root: &Path, id: u64) -> PathBuf {
    root.join(segment_filename(id))
}

/// Validate segment filename format.
///
/// Returns the segment ID if valid, None otherwise.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let base = name.strip_suffix(".rdq")?;
    if base.len() != 9 || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    base.parse::<u64>().ok()
}

/// Discover all segment IDs in a directory, sorted.
pub fn discover_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some(id) = parse_segment_filename(file_name) {
            segments.push(id);
        }
    }

    segments.sort_unstable();
    Ok(segments)
}

/// Total on-disk footprint of a record with the given body length.
pub fn record_len(body_len: usize) -> u64 {
    RECORD_HEADER_LEN + body_len as u64 + RECORD_TRAILER_LEN
}

/// Append one record at the writer's current position.
pub fn append_record(file: &mut File, guid: &Guid, body: &[u8]) -> std::io::Result<()> {
    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    header[..GUID_LEN].copy_from_slice(guid.as_bytes());
    header[GUID_LEN..].copy_from_slice(&(body.len() as u32).to_le_bytes());
    file.write_all(&header)?;
    file.write_all(body)?;
    file.write_all(&crc32fast::hash(body).to_le_bytes())?;
    Ok(())
}

/// Read the record at `offset` and verify its guid and checksum.
///
/// # Errors
///
/// - `Error::PayloadMissing`: the record is absent, truncated, belongs to
///   a different guid, or fails its checksum
pub fn read_record_at(root: &Path, segment: u64, offset: u64, guid: &Guid) -> Result<Vec<u8>> {
    let path = segment_path(root, segment);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::PayloadMissing(*guid))
        }
        Err(err) => return Err(err.into()),
    };
    file.seek(SeekFrom::Start(offset))?;

    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    if file.read_exact(&mut header).is_err() {
        return Err(Error::PayloadMissing(*guid));
    }
    if &header[..GUID_LEN] != guid.as_bytes() {
        return Err(Error::PayloadMissing(*guid));
    }
    let body_len =
        u32::from_le_bytes(header[GUID_LEN..].try_into().expect("slice length")) as usize;

    let mut body = vec![0u8; body_len];
    let mut trailer = [0u8; RECORD_TRAILER_LEN as usize];
    if file.read_exact(&mut body).is_err() || file.read_exact(&mut trailer).is_err() {
        return Err(Error::PayloadMissing(*guid));
    }
    if crc32fast::hash(&body) != u32::from_le_bytes(trailer) {
        return Err(Error::PayloadMissing(*guid));
    }
    Ok(body)
}

/// A record yielded by [`scan_segment`].
pub struct ScannedRecord<'a> {
    pub guid: Guid,
    pub offset: u64,
    pub body: &'a [u8],
}

/// Walk every intact record in a segment file in offset order.
///
/// Returns the number of valid bytes consumed. A truncated or
/// checksum-failing record ends the scan; everything before it is kept,
/// the broken tail is treated as absent.
pub fn scan_segment(path: &Path, mut visit: impl FnMut(ScannedRecord<'_>)) -> Result<u64> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut at: usize = 0;
    loop {
        let header_end = at + RECORD_HEADER_LEN as usize;
        if header_end > data.len() {
            break;
        }
        let mut guid_bytes = [0u8; GUID_LEN];
        guid_bytes.copy_from_slice(&data[at..at + GUID_LEN]);
        let body_len =
            u32::from_le_bytes(data[at + GUID_LEN..header_end].try_into().expect("slice length"))
                as usize;
        let body_end = header_end + body_len;
        let record_end = body_end + RECORD_TRAILER_LEN as usize;
        if record_end > data.len() {
            break;
        }
        let body = &data[header_end..body_end];
        let stored_crc =
            u32::from_le_bytes(data[body_end..record_end].try_into().expect("slice length"));
        if crc32fast::hash(body) != stored_crc {
            break;
        }
        visit(ScannedRecord {
            guid: Guid::from_bytes(guid_bytes),
            offset: at as u64,
            body,
        });
        at = record_end;
    }
    Ok(at as u64)
}
