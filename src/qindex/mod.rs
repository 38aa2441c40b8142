//! Per-queue index: a journal plus segmented publish/deliver/ack log.
//!
//! Every record lands in the journal first (RAM overlay + append-only
//! file) and is folded into its seq-addressed segment file once the
//! overlay grows past the configured bound. `sync` fsyncs the journal;
//! a flush fsyncs the segment files *before* truncating the journal, so
//! a synced record is never lost and an unsynced one is lost whole,
//! never observed partially.
//!
//! ```text
//! {queue_dir}/
//!   000000000.qi     ← records for seq-ids [0, S)
//!   000000001.qi     ← records for seq-ids [S, 2S)
//!   journal.jnl
//! ```
//!
//! Publish/ack pairs that never reached a segment annihilate during the
//! fold, and a segment whose publishes are all acked is deleted outright.

pub mod journal;
pub mod segment;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use log::info;

use crate::guid::Guid;
use crate::qindex::journal::{Journal, JournalRecord};
use crate::qindex::segment::{
    append_records, discover_segments, load_segment, segment_path, SegmentRecord,
};
use crate::Result;

pub const DEFAULT_SEGMENT_ENTRIES: u64 = 16384;
pub const DEFAULT_MAX_JOURNAL_ENTRIES: usize = 16384;

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Seq-ids per segment file. Must be a power of two.
    pub segment_entries: u64,
    /// Fold the journal into segments past this many overlay entries.
    pub max_journal_entries: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            segment_entries: DEFAULT_SEGMENT_ENTRIES,
            max_journal_entries: DEFAULT_MAX_JOURNAL_ENTRIES,
        }
    }
}

/// Ceiling of `seq` to the next segment boundary: the first seq-id of the
/// segment after the one containing `seq`.
pub fn next_segment_boundary(seq: u64, segment_entries: u64) -> u64 {
    (seq / segment_entries + 1) * segment_entries
}

/// One live entry as returned by [`QueueIndex::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub seq: u64,
    pub guid: Guid,
    pub persistent: bool,
    pub delivered: bool,
}

/// Journal overlay state for one seq-id.
#[derive(Debug, Clone, Copy, Default)]
struct Overlay {
    publish: Option<(Guid, bool)>,
    /// The publish record already lives in the segment file; only newer
    /// deliver/ack records need folding.
    pub_flushed: bool,
    delivered: bool,
    acked: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct SegmentMeta {
    pub_count: u64,
    ack_count: u64,
}

/// The result of [`QueueIndex::init`].
pub struct RecoveredIndex {
    pub index: QueueIndex,
    /// Unacked messages on disk.
    pub count: u64,
    /// How many of those are persistent.
    pub persistent_count: u64,
    /// Lowest unacked seq-id, when any.
    pub low_seq: Option<u64>,
    /// Next seq-id to issue.
    pub next_seq: u64,
}

pub struct QueueIndex {
    dir: PathBuf,
    config: IndexConfig,
    journal: Journal,
    overlay: BTreeMap<u64, Overlay>,
    segments: BTreeMap<u64, SegmentMeta>,
}

impl QueueIndex {
    /// Open a queue index, replaying the journal over the segment files.
    ///
    /// When `store_recovered` is false a recovery walk runs: every
    /// unacked transient entry, and every unacked persistent entry whose
    /// guid `recover_ref` cannot find in the persistent store, is acked
    /// here so the queue never tries to read a body that is gone.
    /// `recover_ref` must bump the store ref-count for each hit.
    pub fn init(
        dir: impl Into<PathBuf>,
        config: IndexConfig,
        store_recovered: bool,
        mut recover_ref: impl FnMut(&Guid) -> Result<bool>,
    ) -> Result<RecoveredIndex> {
        debug_assert!(config.segment_entries.is_power_of_two());
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut overlay: BTreeMap<u64, Overlay> = BTreeMap::new();
        for record in Journal::replay(&dir)? {
            let entry = overlay.entry(record.seq()).or_default();
            match record {
                JournalRecord::Publish {
                    guid, persistent, ..
                } => entry.publish = Some((guid, persistent)),
                JournalRecord::Deliver { .. } => entry.delivered = true,
                JournalRecord::Ack { .. } => entry.acked = true,
            }
        }

        let seg_size = config.segment_entries;
        let mut segments: BTreeMap<u64, SegmentMeta> = BTreeMap::new();
        let mut unacked: Vec<IndexEntry> = Vec::new();
        let mut next_seq = 0u64;
        let mut seen_in_files: HashSet<u64> = HashSet::new();

        for id in discover_segments(&dir)? {
            let entries = load_segment(&segment_path(&dir, id))?;
            let mut meta = SegmentMeta::default();
            for (rel, state) in entries {
                let seq = id * seg_size + u64::from(rel);
                seen_in_files.insert(seq);

                let mut publish = state.publish;
                let mut delivered = state.delivered;
                let mut acked = state.acked;
                if let Some(ov) = overlay.get_mut(&seq) {
                    if state.publish.is_some() {
                        ov.pub_flushed = true;
                    }
                    publish = publish.or(ov.publish);
                    delivered |= ov.delivered;
                    acked |= ov.acked;
                    let covered = (ov.publish.is_none() || state.publish.is_some())
                        && (!ov.delivered || state.delivered)
                        && (!ov.acked || state.acked);
                    if covered {
                        overlay.remove(&seq);
                    }
                }

                next_seq = next_seq.max(seq + 1);
                if publish.is_some() {
                    meta.pub_count += 1;
                    if acked {
                        meta.ack_count += 1;
                    } else {
                        let (guid, persistent) = publish.expect("publish present");
                        unacked.push(IndexEntry {
                            seq,
                            guid,
                            persistent,
                            delivered,
                        });
                    }
                }
            }
            segments.insert(id, meta);
        }

        for (&seq, ov) in &overlay {
            next_seq = next_seq.max(seq + 1);
            if seen_in_files.contains(&seq) {
                continue;
            }
            let meta = segments.entry(seq / seg_size).or_default();
            if let Some((guid, persistent)) = ov.publish {
                meta.pub_count += 1;
                if ov.acked {
                    meta.ack_count += 1;
                } else {
                    unacked.push(IndexEntry {
                        seq,
                        guid,
                        persistent,
                        delivered: ov.delivered,
                    });
                }
            }
        }
        unacked.sort_unstable_by_key(|entry| entry.seq);

        let journal = Journal::open(&dir)?;
        let mut index = Self {
            dir,
            config,
            journal,
            overlay,
            segments,
        };

        // Recovery walk: filter out what the stores no longer hold.
        let mut survivors = Vec::with_capacity(unacked.len());
        let mut dropped = 0u64;
        for entry in unacked {
            let keep = store_recovered || (entry.persistent && recover_ref(&entry.guid)?);
            if keep {
                survivors.push(entry);
            } else {
                index.ack_one(entry.seq)?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!(
                "queue index {}: dropped {dropped} unrecoverable entries",
                index.dir.display()
            );
            index.flush()?;
        }

        let count = survivors.len() as u64;
        let persistent_count = survivors.iter().filter(|e| e.persistent).count() as u64;
        let low_seq = survivors.first().map(|e| e.seq);
        Ok(RecoveredIndex {
            index,
            count,
            persistent_count,
            low_seq,
            next_seq,
        })
    }

    pub fn segment_entries(&self) -> u64 {
        self.config.segment_entries
    }

    /// First seq-id of the segment after the one containing `seq`.
    pub fn next_segment_boundary(&self, seq: u64) -> u64 {
        next_segment_boundary(seq, self.config.segment_entries)
    }

    pub fn publish(&mut self, guid: Guid, seq: u64, persistent: bool) -> Result<()> {
        self.journal.append(&JournalRecord::Publish {
            seq,
            guid,
            persistent,
        })?;
        let entry = self.overlay.entry(seq).or_default();
        debug_assert!(entry.publish.is_none(), "seq-id published twice");
        entry.publish = Some((guid, persistent));
        self.segments
            .entry(seq / self.config.segment_entries)
            .or_default()
            .pub_count += 1;
        self.maybe_flush()
    }

    pub fn deliver(&mut self, seq: u64) -> Result<()> {
        self.journal.append(&JournalRecord::Deliver { seq })?;
        self.overlay.entry(seq).or_default().delivered = true;
        self.maybe_flush()
    }

    pub fn ack_one(&mut self, seq: u64) -> Result<()> {
        self.journal.append(&JournalRecord::Ack { seq })?;
        let entry = self.overlay.entry(seq).or_default();
        debug_assert!(!entry.acked, "seq-id acked twice");
        entry.acked = true;
        self.segments
            .entry(seq / self.config.segment_entries)
            .or_default()
            .ack_count += 1;
        self.maybe_flush()
    }

    pub fn ack(&mut self, seqs: &[u64]) -> Result<()> {
        for &seq in seqs {
            self.ack_one(seq)?;
        }
        Ok(())
    }

    /// Read live entries one segment at a time.
    ///
    /// Returns entries with `start ≤ seq < min(end, boundary)` in seq
    /// order, plus the next start to continue from (`None` when `end`
    /// was reached).
    pub fn read(&self, start: u64, end: u64) -> Result<(Vec<IndexEntry>, Option<u64>)> {
        if start >= end {
            return Ok((Vec::new(), None));
        }
        let seg_size = self.config.segment_entries;
        let seg = start / seg_size;
        let boundary = (seg + 1) * seg_size;
        let cap = end.min(boundary);

        let mut merged: BTreeMap<u64, (Option<(Guid, bool)>, bool, bool)> = BTreeMap::new();
        for (rel, state) in load_segment(&segment_path(&self.dir, seg))? {
            let seq = seg * seg_size + u64::from(rel);
            if seq < start || seq >= cap {
                continue;
            }
            merged.insert(seq, (state.publish, state.delivered, state.acked));
        }
        for (&seq, ov) in self.overlay.range(start..cap) {
            let entry = merged.entry(seq).or_insert((None, false, false));
            entry.0 = entry.0.or(ov.publish);
            entry.1 |= ov.delivered;
            entry.2 |= ov.acked;
        }

        let entries = merged
            .into_iter()
            .filter_map(|(seq, (publish, delivered, acked))| {
                let (guid, persistent) = publish?;
                (!acked).then_some(IndexEntry {
                    seq,
                    guid,
                    persistent,
                    delivered,
                })
            })
            .collect();
        let next = (cap < end).then_some(boundary);
        Ok((entries, next))
    }

    /// True when the journal holds records not yet fsynced.
    pub fn needs_sync(&self) -> bool {
        self.journal.is_dirty()
    }

    /// Make journalled records durable.
    pub fn sync(&mut self) -> Result<()> {
        self.journal.sync()
    }

    /// Fold the journal overlay into the segment files and truncate the
    /// journal. Deletes segments that became fully acked.
    pub fn flush(&mut self) -> Result<()> {
        if self.overlay.is_empty() {
            self.journal.truncate()?;
            return self.sweep_segments();
        }

        let seg_size = self.config.segment_entries;
        let mut by_segment: BTreeMap<u64, Vec<SegmentRecord>> = BTreeMap::new();
        for (&seq, ov) in &self.overlay {
            let rel = (seq % seg_size) as u32;
            let records = by_segment.entry(seq / seg_size).or_default();
            match ov.publish {
                Some((guid, persistent)) if !ov.pub_flushed => {
                    if ov.acked {
                        // Publish and ack annihilate before touching disk.
                        continue;
                    }
                    records.push(SegmentRecord::Publish {
                        rel,
                        guid,
                        persistent,
                    });
                    if ov.delivered {
                        records.push(SegmentRecord::Deliver { rel });
                    }
                }
                _ => {
                    if ov.delivered && !ov.acked {
                        records.push(SegmentRecord::Deliver { rel });
                    }
                    if ov.acked {
                        records.push(SegmentRecord::Ack { rel });
                    }
                }
            }
        }

        for (&id, records) in &by_segment {
            append_records(&segment_path(&self.dir, id), records)?;
        }
        self.overlay.clear();
        self.journal.truncate()?;
        self.sweep_segments()
    }

    fn sweep_segments(&mut self) -> Result<()> {
        let seg_size = self.config.segment_entries;
        let mut done = Vec::new();
        for (&id, meta) in &self.segments {
            if meta.pub_count == 0 || meta.pub_count != meta.ack_count {
                continue;
            }
            let base = id * seg_size;
            if self.overlay.range(base..base + seg_size).next().is_some() {
                continue;
            }
            done.push(id);
        }
        for id in done {
            let path = segment_path(&self.dir, id);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            self.segments.remove(&id);
        }
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.overlay.len() > self.config.max_journal_entries {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush and sync everything ahead of a clean shutdown.
    pub fn terminate(&mut self) -> Result<()> {
        self.flush()?;
        self.sync()
    }

    /// Destroy the index: the queue is gone for good.
    pub fn delete_and_terminate(self) -> Result<()> {
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn small_config() -> IndexConfig {
        IndexConfig {
            segment_entries: 8,
            max_journal_entries: 4,
        }
    }

    fn fresh(dir: &Path) -> QueueIndex {
        let recovered = QueueIndex::init(dir, small_config(), true, |_| Ok(true)).unwrap();
        assert_eq!(recovered.count, 0);
        recovered.index
    }

    fn entry_seqs(index: &QueueIndex, start: u64, end: u64) -> Vec<u64> {
        let mut seqs = Vec::new();
        let mut at = Some(start);
        while let Some(from) = at {
            let (entries, next) = index.read(from, end).unwrap();
            seqs.extend(entries.iter().map(|e| e.seq));
            at = next;
        }
        seqs
    }

    #[test]
    fn publish_read_ack_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut index = fresh(dir.path());

        for seq in 0..3 {
            index
                .publish(Guid::of(&[seq as u8]), seq, seq % 2 == 0)
                .unwrap();
        }
        index.deliver(0).unwrap();
        assert_eq!(entry_seqs(&index, 0, 3), vec![0, 1, 2]);

        let (entries, _) = index.read(0, 3).unwrap();
        assert!(entries[0].delivered);
        assert!(!entries[1].delivered);

        index.ack(&[0, 1]).unwrap();
        assert_eq!(entry_seqs(&index, 0, 3), vec![2]);
    }

    #[test]
    fn read_serves_one_segment_at_a_time() {
        let dir = TempDir::new().unwrap();
        let mut index = fresh(dir.path());
        for seq in 0..20 {
            index.publish(Guid::of(&[seq as u8]), seq, false).unwrap();
        }
        let (entries, next) = index.read(0, 20).unwrap();
        assert_eq!(entries.len(), 8);
        assert_eq!(next, Some(8));
        let (entries, next) = index.read(8, 20).unwrap();
        assert_eq!(entries.len(), 8);
        assert_eq!(next, Some(16));
        let (entries, next) = index.read(16, 20).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(next, None);
    }

    #[test]
    fn restart_recovers_journal_and_segments() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = fresh(dir.path());
            for seq in 0..10 {
                index
                    .publish(Guid::of(&[seq as u8]), seq, true)
                    .unwrap();
            }
            index.ack(&[0, 3]).unwrap();
            index.sync().unwrap();
            // No flush/terminate: the journal carries part of the state.
        }
        let recovered =
            QueueIndex::init(dir.path(), small_config(), true, |_| Ok(true)).unwrap();
        assert_eq!(recovered.count, 8);
        assert_eq!(recovered.persistent_count, 8);
        assert_eq!(recovered.low_seq, Some(1));
        assert_eq!(recovered.next_seq, 10);
        assert_eq!(entry_seqs(&recovered.index, 1, 10), vec![1, 2, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn recovery_walk_drops_transient_and_missing() {
        let dir = TempDir::new().unwrap();
        let present = Guid::of(b"present");
        {
            let mut index = fresh(dir.path());
            index.publish(Guid::of(b"transient"), 0, false).unwrap();
            index.publish(present, 1, true).unwrap();
            index.publish(Guid::of(b"lost"), 2, true).unwrap();
            index.terminate().unwrap();
        }
        let recovered = QueueIndex::init(dir.path(), small_config(), false, |guid| {
            Ok(*guid == present)
        })
        .unwrap();
        assert_eq!(recovered.count, 1);
        assert_eq!(recovered.persistent_count, 1);
        assert_eq!(recovered.low_seq, Some(1));
        assert_eq!(entry_seqs(&recovered.index, 0, 3), vec![1]);
    }

    #[test]
    fn fully_acked_segment_files_are_deleted() {
        let dir = TempDir::new().unwrap();
        let mut index = fresh(dir.path());
        for seq in 0..8 {
            index.publish(Guid::of(&[seq as u8]), seq, true).unwrap();
        }
        index.flush().unwrap();
        assert!(segment_path(dir.path(), 0).exists());

        index.ack(&(0..8).collect::<Vec<_>>()).unwrap();
        index.flush().unwrap();
        assert!(!segment_path(dir.path(), 0).exists());
    }

    #[test]
    fn unflushed_publish_ack_pairs_annihilate() {
        let dir = TempDir::new().unwrap();
        let mut index = fresh(dir.path());
        index.publish(Guid::of(b"gone"), 0, true).unwrap();
        index.ack(&[0]).unwrap();
        index.flush().unwrap();
        // Nothing survived: no segment file was ever created.
        assert!(!segment_path(dir.path(), 0).exists());
        assert_eq!(entry_seqs(&index, 0, 1), Vec::<u64>::new());
    }

    #[test]
    fn boundary_math() {
        assert_eq!(next_segment_boundary(0, 8), 8);
        assert_eq!(next_segment_boundary(7, 8), 8);
        assert_eq!(next_segment_boundary(8, 8), 16);
        assert_eq!(next_segment_boundary(17, 8), 24);
    }
}
