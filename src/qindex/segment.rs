//! Queue index segment files.
//!
//! Each segment file covers a fixed-width range of seq-ids (the
//! configured segment entry count) and holds publish/deliver/ack records
//! for that range, appended when the journal is flushed. Seq-ids are
//! stored relative to the segment base. Once every publish in a segment
//! has a matching ack the file is deleted.
//!
//! Record layout (little-endian):
//!
//! ```text
//! PUBLISH: kind=1 rel_seq(4) guid(16) flags(1) crc32(4)
//! DELIVER: kind=2 rel_seq(4) crc32(4)
//! ACK:     kind=3 rel_seq(4) crc32(4)
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::guid::{Guid, GUID_LEN};
use crate::qindex::journal::{FLAG_PERSISTENT, KIND_ACK, KIND_DELIVER, KIND_PUBLISH};
use crate::Result;

/// Generate segment filename from ID (e.g., "000000042.qi").
pub fn segment_filename(id: u64) -> String {
    format!("{id:09}.qi")
}

pub fn segment_path(root: &Path, id: u64) -> PathBuf {
    root.join(segment_filename(id))
}

/// Validate segment filename format. Returns the segment ID if valid.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let base = name.strip_suffix(".qi")?;
    if base.len() != 9 || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    base.parse::<u64>().ok()
}

/// Discover all segment IDs in a queue directory, sorted.
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRecord {
    Publish {
        rel: u32,
        guid: Guid,
        persistent: bool,
    },
    Deliver {
        rel: u32,
    },
    Ack {
        rel: u32,
    },
}

impl SegmentRecord {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        match *self {
            SegmentRecord::Publish {
                rel,
                guid,
                persistent,
            } => {
                buf.push(KIND_PUBLISH);
                buf.extend_from_slice(&rel.to_le_bytes());
                buf.extend_from_slice(guid.as_bytes());
                buf.push(if persistent { FLAG_PERSISTENT } else { 0 });
            }
            SegmentRecord::Deliver { rel } => {
                buf.push(KIND_DELIVER);
                buf.extend_from_slice(&rel.to_le_bytes());
            }
            SegmentRecord::Ack { rel } => {
                buf.push(KIND_ACK);
                buf.extend_from_slice(&rel.to_le_bytes());
            }
        }
        let crc = crc32fast::hash(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
    }
}

fn decode_at(data: &[u8], at: usize) -> Option<(SegmentRecord, usize)> {
    let kind = *data.get(at)?;
    let body_len = match kind {
        KIND_PUBLISH => 1 + 4 + GUID_LEN + 1,
        KIND_DELIVER | KIND_ACK => 1 + 4,
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

    let rel = u32::from_le_bytes(body[1..5].try_into().expect("slice length"));
    let record = match kind {
        KIND_PUBLISH => {
            let mut guid_bytes = [0u8; GUID_LEN];
            guid_bytes.copy_from_slice(&body[5..5 + GUID_LEN]);
            SegmentRecord::Publish {
                rel,
                guid: Guid::from_bytes(guid_bytes),
                persistent: body[5 + GUID_LEN] & FLAG_PERSISTENT != 0,
            }
        }
        KIND_DELIVER => SegmentRecord::Deliver { rel },
        _ => SegmentRecord::Ack { rel },
    };
    Some((record, body_len + 4))
}

/// Folded per-seq state of a segment after applying all its records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryState {
    pub publish: Option<(Guid, bool)>,
    pub delivered: bool,
    pub acked: bool,
}

/// Load a segment file and fold its records. A missing file is an empty
/// segment; a corrupt tail ends the fold.
pub fn load_segment(path: &Path) -> Result<BTreeMap<u32, EntryState>> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut data)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(err.into()),
    }

    let mut entries: BTreeMap<u32, EntryState> = BTreeMap::new();
    let mut at = 0usize;
    while let Some((record, len)) = decode_at(&data, at) {
        match record {
            SegmentRecord::Publish {
                rel,
                guid,
                persistent,
            } => {
                entries.entry(rel).or_default().publish = Some((guid, persistent));
            }
            SegmentRecord::Deliver { rel } => {
                entries.entry(rel).or_default().delivered = true;
            }
            SegmentRecord::Ack { rel } => {
                entries.entry(rel).or_default().acked = true;
            }
        }
        at += len;
    }
    Ok(entries)
}

/// Append records to a segment file and fsync it.
pub fn append_records(path: &Path, records: &[SegmentRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::with_capacity(records.len() * 32);
    for record in records {
        record.encode(&mut buf);
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_segment_naming() {
        assert_eq!(segment_filename(0), "000000000.qi");
        assert_eq!(parse_segment_filename("000000007.qi"), Some(7));
        assert_eq!(parse_segment_filename("000000007.rdq"), None);
        assert_eq!(parse_segment_filename("7.qi"), None);
    }

    #[test]
    fn append_load_fold() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(dir.path(), 0);
        let guid = Guid::of(b"m");

        append_records(
            &path,
            &[
                SegmentRecord::Publish {
                    rel: 4,
                    guid,
                    persistent: true,
                },
                SegmentRecord::Deliver { rel: 4 },
                SegmentRecord::Publish {
                    rel: 5,
                    guid: Guid::of(b"n"),
                    persistent: false,
                },
            ],
        )
        .unwrap();
        append_records(&path, &[SegmentRecord::Ack { rel: 5 }]).unwrap();

        let entries = load_segment(&path).unwrap();
        assert_eq!(entries.len(), 2);
        let four = entries.get(&4).unwrap();
        assert_eq!(four.publish, Some((guid, true)));
        assert!(four.delivered);
        assert!(!four.acked);
        let five = entries.get(&5).unwrap();
        assert!(five.acked);
    }

    #[test]
    fn corrupt_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = segment_path(dir.path(), 0);
        append_records(
            &path,
            &[
                SegmentRecord::Publish {
                    rel: 0,
                    guid: Guid::of(b"a"),
                    persistent: false,
                },
                SegmentRecord::Publish {
                    rel: 1,
                    guid: Guid::of(b"b"),
                    persistent: false,
                },
            ],
        )
        .unwrap();

        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data.truncate(len - 3);
        std::fs::write(&path, data).unwrap();

        let entries = load_segment(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&0));
    }

    #[test]
    fn missing_segment_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_segment(&segment_path(dir.path(), 3)).unwrap().is_empty());
    }
}
