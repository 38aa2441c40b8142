//! Compacting garbage collection for store segments.
//!
//! A segment becomes a candidate once its live-byte ratio drops below the
//! configured threshold. Compaction rewrites the file without dead
//! records (temp file, fsync, atomic rename over the original) and
//! repoints the guid index, so concurrent readers simply follow the
//! index to the new offsets. The current write segment is never
//! compacted, and callers run at most one compaction at a time.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;

use log::debug;

use crate::store::index::{GuidIndex, Slot};
use crate::store::segment::{append_record, record_len, scan_segment, segment_path};
use crate::store::FileInfo;
use crate::Result;

/// Pick the next segment worth collecting, oldest first.
pub(super) fn candidate(
    files: &BTreeMap<u64, FileInfo>,
    current: u64,
    live_ratio: f64,
) -> Option<u64> {
    files.iter().find_map(|(&id, info)| {
        if id == current || info.total_bytes == 0 {
            return None;
        }
        let ratio = info.live_bytes as f64 / info.total_bytes as f64;
        (ratio < live_ratio).then_some(id)
    })
}

/// Rewrite segment `id` keeping only records the index still references.
///
/// Unlinks the file outright when nothing in it is live.
pub(super) fn compact_segment(
    dir: &Path,
    id: u64,
    index: &mut GuidIndex,
    files: &mut BTreeMap<u64, FileInfo>,
) -> Result<()> {
    let path = segment_path(dir, id);

    let mut live = Vec::new();
    scan_segment(&path, |rec| {
        let expected = Slot::OnDisk {
            segment: id,
            offset: rec.offset,
            total_len: record_len(rec.body.len()) as u32,
        };
        let keep = index
            .get(&rec.guid)
            .is_some_and(|entry| entry.ref_count > 0 && entry.slot == expected);
        if keep {
            live.push((rec.guid, rec.body.to_vec()));
        }
    })?;

    if live.is_empty() {
        std::fs::remove_file(&path)?;
        files.remove(&id);
        debug!("store gc: removed empty segment {id}");
        return Ok(());
    }

    let tmp = path.with_extension("rdq.tmp");
    let _ = std::fs::remove_file(&tmp);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;

    let mut offset = 0u64;
    let mut moved = Vec::with_capacity(live.len());
    for (guid, body) in &live {
        append_record(&mut file, guid, body)?;
        moved.push((*guid, offset, record_len(body.len()) as u32));
        offset += record_len(body.len());
    }
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, &path)?;

    for (guid, new_offset, total_len) in moved {
        if let Some(entry) = index.get_mut(&guid) {
            entry.slot = Slot::OnDisk {
                segment: id,
                offset: new_offset,
                total_len,
            };
        }
    }
    files.insert(
        id,
        FileInfo {
            total_bytes: offset,
            live_bytes: offset,
        },
    );
    debug!("store gc: compacted segment {id} down to {offset} bytes");
    Ok(())
}
