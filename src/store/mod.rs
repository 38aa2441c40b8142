//! Shared, content-addressed message store.
//!
//! One store instance holds the bodies of messages for every queue in the
//! process: one *persistent* instance (fsync-backed, survives restart)
//! and one *transient* instance (wiped on every start). Bodies are keyed
//! by guid and ref-counted, so the same content published to several
//! queues is stored once.
//!
//! # Layout
//!
//! ```text
//! {store_dir}/
//!   000000000.rdq    ← append-only record segments
//!   000000001.rdq
//!   index.snapshot   ← guid index, written at clean shutdown only
//!   clean.meta       ← client refs, written at clean shutdown only
//! ```
//!
//! # Write path
//!
//! `write` lands in a write-behind buffer and is O(1); the buffer drains
//! to the current segment when its byte budget fills, on `flush`, and on
//! `sync_with`. `sync_with` additionally fsyncs every file appended since
//! the previous sync, so back-to-back syncs with no interleaved writes
//! coalesce into a single fsync.
//!
//! # Recovery
//!
//! Startup is *clean* iff the snapshot and the clean marker both load and
//! every ref the marker lists is also held by a recovered queue.
//! Otherwise the segment files are scanned to rebuild the guid index with
//! zero ref-counts, queue-index recovery re-counts references via
//! [`MessageStore::recover_ref`], and [`MessageStore::finish_recovery`]
//! drops whatever stayed unreferenced.

pub mod cache;
mod gc;
pub mod index;
pub mod segment;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::guid::Guid;
use crate::meta;
use crate::store::cache::{PayloadCache, DEFAULT_CACHE_MAX_BYTES};
use crate::store::index::{GuidIndex, IndexEntry, Slot};
use crate::store::segment::{
    append_record, discover_segments, record_len, scan_segment, segment_path,
    DEFAULT_SEGMENT_MAX_BYTES,
};
use crate::{Error, Result};

pub const CLEAN_META_FILE: &str = "clean.meta";

/// Random token identifying one queue's logical client of a store across
/// restarts. Refs outlive client handles: they are persisted in the
/// queue's recovery terms and in the store's clean marker, and comparing
/// the two sets is how an unclean shutdown is detected.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientRef([u8; 16]);

impl ClientRef {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        Guid::from_hex(hex).map(|guid| Self(*guid.as_bytes()))
    }
}

impl fmt::Display for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientRef({})", self.to_hex())
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Roll to a new segment once the current one reaches this size.
    pub segment_max_bytes: u64,
    /// Drain the write-behind buffer past this many buffered bytes.
    pub write_buffer_max_bytes: usize,
    /// Budget for the shared payload cache.
    pub cache_max_bytes: usize,
    /// Compact a segment once its live/total ratio falls below this.
    pub gc_live_ratio: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            write_buffer_max_bytes: 2 * 1024 * 1024,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            gc_live_ratio: 0.5,
        }
    }
}

/// Per-segment byte accounting, drives GC candidate selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileInfo {
    pub total_bytes: u64,
    pub live_bytes: u64,
}

#[derive(Serialize, Deserialize)]
struct CleanMeta {
    refs: Vec<String>,
}

struct Inner {
    index: GuidIndex,
    files: BTreeMap<u64, FileInfo>,
    current: u64,
    current_file: Option<File>,
    current_len: u64,
    pending: HashMap<Guid, Arc<Vec<u8>>>,
    pending_order: VecDeque<Guid>,
    pending_bytes: usize,
    cache: PayloadCache,
    known_refs: HashSet<ClientRef>,
    dirty_files: HashSet<u64>,
    poisoned: bool,
}

/// One instance of the shared message store.
pub struct MessageStore {
    dir: PathBuf,
    config: StoreConfig,
    inner: Mutex<Inner>,
}

/// A queue's handle onto a store, tagged with its persistent ref.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<MessageStore>,
    client_ref: ClientRef,
}

/// Point-in-time store statistics for tooling.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub files: Vec<(u64, FileInfo)>,
    pub entries: usize,
    pub buffered: usize,
    pub refs: usize,
}

impl MessageStore {
    /// Open the persistent store instance.
    ///
    /// `expected_refs` are the refs recovered from queue terms; the store
    /// only trusts its snapshot when every ref it saved is still claimed
    /// by a queue. Returns the store and whether recovery was clean.
    pub fn open(
        dir: impl Into<PathBuf>,
        config: StoreConfig,
        expected_refs: &[ClientRef],
    ) -> Result<(Arc<Self>, bool)> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let snapshot_path = dir.join(index::SNAPSHOT_FILE);
        let clean_path = dir.join(CLEAN_META_FILE);
        let saved_refs = meta::take_json::<CleanMeta>(&clean_path).unwrap_or_default();
        let snapshot = match index::load_snapshot(&snapshot_path) {
            Ok(index) => {
                std::fs::remove_file(&snapshot_path)?;
                Some(index)
            }
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!("store snapshot unreadable, forcing rescan: {err}");
                let _ = std::fs::remove_file(&snapshot_path);
                None
            }
        };

        let expected: HashSet<ClientRef> = expected_refs.iter().copied().collect();
        let clean = match (&snapshot, &saved_refs) {
            (Some(_), Some(meta)) => meta
                .refs
                .iter()
                .all(|hex| ClientRef::from_hex(hex).is_some_and(|r| expected.contains(&r))),
            _ => false,
        };

        let segments = discover_segments(&dir)?;
        let current = segments.last().map_or(0, |&id| id + 1);

        let (guid_index, files, recovered) = if clean {
            let guid_index = snapshot.expect("snapshot present when clean");
            let files = summarize_files(&dir, &segments, &guid_index)?;
            (guid_index, files, true)
        } else {
            let (guid_index, files) = rescan(&dir, &segments)?;
            info!(
                "store {}: unclean shutdown, rebuilt {} entries from {} segments",
                dir.display(),
                guid_index.len(),
                segments.len()
            );
            (guid_index, files, false)
        };

        let known_refs = saved_refs
            .map(|meta| {
                meta.refs
                    .iter()
                    .filter_map(|hex| ClientRef::from_hex(hex))
                    .filter(|r| expected.contains(r))
                    .collect()
            })
            .unwrap_or_default();

        let cache = PayloadCache::new(config.cache_max_bytes);
        let store = Arc::new(Self {
            dir,
            config,
            inner: Mutex::new(Inner {
                index: guid_index,
                files,
                current,
                current_file: None,
                current_len: 0,
                pending: HashMap::new(),
                pending_order: VecDeque::new(),
                pending_bytes: 0,
                cache,
                known_refs,
                dirty_files: HashSet::new(),
                poisoned: false,
            }),
        });
        Ok((store, recovered))
    }

    /// Open the transient store instance: previous contents are removed.
    pub fn open_transient(dir: impl Into<PathBuf>, config: StoreConfig) -> Result<Arc<Self>> {
        let dir = dir.into();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        let (store, _) = Self::open(dir, config, &[])?;
        Ok(store)
    }

    /// Register a client handle for `client_ref`.
    pub fn client_init(self: &Arc<Self>, client_ref: ClientRef) -> Result<StoreClient> {
        let mut inner = self.lock()?;
        inner.known_refs.insert(client_ref);
        Ok(StoreClient {
            store: Arc::clone(self),
            client_ref,
        })
    }

    /// Detach a client that intends to come back after a restart; its ref
    /// stays in the clean marker.
    pub fn client_terminate(&self, _client_ref: ClientRef) -> Result<()> {
        Ok(())
    }

    /// Forget a client whose queue is being deleted; its ref will not be
    /// expected at the next startup.
    pub fn delete_client(&self, client_ref: ClientRef) -> Result<()> {
        let mut inner = self.lock()?;
        inner.known_refs.remove(&client_ref);
        Ok(())
    }

    pub fn contains(&self, guid: &Guid) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner.index.contains_key(guid))
    }

    /// Bump the ref-count of a guid during post-crash recovery.
    ///
    /// Returns false when the store has no such body, in which case the
    /// caller must treat the message as lost.
    pub fn recover_ref(&self, guid: &Guid) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.index.get_mut(guid) {
            Some(entry) => {
                entry.ref_count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every index entry recovery left unreferenced, then compact.
    pub fn finish_recovery(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let orphans: Vec<Guid> = inner
            .index
            .iter()
            .filter(|(_, entry)| entry.ref_count == 0)
            .map(|(guid, _)| *guid)
            .collect();
        if !orphans.is_empty() {
            info!(
                "store {}: dropping {} unreferenced bodies after recovery",
                self.dir.display(),
                orphans.len()
            );
        }
        for guid in orphans {
            inner.drop_entry(&guid);
        }
        while let Some(id) = gc::candidate(&inner.files, inner.current, self.config.gc_live_ratio)
        {
            let Inner {
                ref mut index,
                ref mut files,
                ref mut dirty_files,
                ..
            } = *inner;
            gc::compact_segment(&self.dir, id, index, files)?;
            dirty_files.remove(&id);
        }
        Ok(())
    }

    /// Persist the snapshot and clean marker. Call once at shutdown after
    /// every queue has terminated.
    pub fn terminate(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.flush_pending(&mut inner)?;
        self.fsync_dirty(&mut inner)?;
        index::save_snapshot(&self.dir.join(index::SNAPSHOT_FILE), &inner.index)?;
        let refs = inner.known_refs.iter().map(ClientRef::to_hex).collect();
        meta::write_json(&self.dir.join(CLEAN_META_FILE), &CleanMeta { refs })?;
        Ok(())
    }

    /// Drain the write-behind buffer without forcing durability.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.flush_pending(&mut inner)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock()?;
        Ok(StoreStats {
            files: inner.files.iter().map(|(&id, &info)| (id, info)).collect(),
            entries: inner.index.len(),
            buffered: inner.pending.len(),
            refs: inner.known_refs.len(),
        })
    }

    fn write(&self, guid: Guid, body: Vec<u8>) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.poisoned {
            return Err(Error::StorePoisoned);
        }
        if let Some(entry) = inner.index.get_mut(&guid) {
            entry.ref_count += 1;
            return Ok(());
        }
        let body = Arc::new(body);
        inner.index.insert(
            guid,
            IndexEntry {
                ref_count: 1,
                slot: Slot::Buffered,
            },
        );
        inner.pending_bytes += body.len();
        inner.cache.insert(guid, Arc::clone(&body));
        inner.pending.insert(guid, body);
        inner.pending_order.push_back(guid);
        if inner.pending_bytes > self.config.write_buffer_max_bytes {
            self.flush_pending(&mut inner)?;
        }
        Ok(())
    }

    fn read(&self, guid: &Guid) -> Result<Arc<Vec<u8>>> {
        let mut inner = self.lock()?;
        let entry = *inner.index.get(guid).ok_or(Error::PayloadMissing(*guid))?;
        match entry.slot {
            Slot::Buffered => inner
                .pending
                .get(guid)
                .cloned()
                .ok_or(Error::InvariantViolated("buffered body not in write buffer")),
            Slot::OnDisk {
                segment, offset, ..
            } => {
                if let Some(body) = inner.cache.get(guid) {
                    return Ok(body);
                }
                let body = Arc::new(segment::read_record_at(&self.dir, segment, offset, guid)?);
                inner.cache.insert(*guid, Arc::clone(&body));
                Ok(body)
            }
        }
    }

    fn remove(&self, guids: &[Guid]) -> Result<()> {
        if guids.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock()?;
        for guid in guids {
            let unreferenced = match inner.index.get_mut(guid) {
                Some(entry) if entry.ref_count > 1 => {
                    entry.ref_count -= 1;
                    false
                }
                Some(_) => true,
                None => {
                    warn!("store remove of unknown guid {guid}");
                    false
                }
            };
            if unreferenced {
                inner.drop_entry(guid);
            }
        }
        if let Some(id) = gc::candidate(&inner.files, inner.current, self.config.gc_live_ratio) {
            let Inner {
                ref mut index,
                ref mut files,
                ref mut dirty_files,
                ..
            } = *inner;
            gc::compact_segment(&self.dir, id, index, files)?;
            dirty_files.remove(&id);
        }
        Ok(())
    }

    fn sync_with(&self, guids: &[Guid], on_durable: impl FnOnce()) -> Result<()> {
        {
            let mut inner = self.lock()?;
            if inner.poisoned {
                return Err(Error::StorePoisoned);
            }
            debug_assert!(guids.iter().all(|g| inner.index.contains_key(g)));
            self.flush_pending(&mut inner)?;
            self.fsync_dirty(&mut inner)?;
        }
        on_durable();
        Ok(())
    }

    fn flush_pending(&self, inner: &mut Inner) -> Result<()> {
        if inner.pending.is_empty() {
            inner.pending_order.clear();
            return Ok(());
        }
        while let Some(guid) = inner.pending_order.pop_front() {
            let Some(body) = inner.pending.remove(&guid) else {
                continue; // removed before it ever hit disk
            };
            let footprint = record_len(body.len());
            if inner.current_file.is_some()
                && inner.current_len + footprint > self.config.segment_max_bytes
            {
                inner.current_file = None;
                inner.current += 1;
                inner.current_len = 0;
            }
            if inner.current_file.is_none() {
                let path = segment_path(&self.dir, inner.current);
                inner.current_file = Some(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)?,
                );
            }
            let segment = inner.current;
            let offset = inner.current_len;
            let file = inner.current_file.as_mut().expect("current file open");
            if let Err(first) = append_record(file, &guid, &body) {
                // One retry from a clean offset; a second failure is fatal
                // to the caller.
                file.set_len(offset)?;
                use std::io::Seek;
                file.seek(std::io::SeekFrom::Start(offset))?;
                if append_record(file, &guid, &body).is_err() {
                    return Err(Error::WriteFailed(first));
                }
            }
            inner.current_len += footprint;
            if let Some(entry) = inner.index.get_mut(&guid) {
                entry.slot = Slot::OnDisk {
                    segment,
                    offset,
                    total_len: footprint as u32,
                };
            }
            let info = inner.files.entry(segment).or_default();
            info.total_bytes += footprint;
            info.live_bytes += footprint;
            inner.dirty_files.insert(segment);
            inner.pending_bytes -= body.len();
        }
        Ok(())
    }

    fn fsync_dirty(&self, inner: &mut Inner) -> Result<()> {
        if inner.dirty_files.is_empty() {
            return Ok(());
        }
        let dirty: Vec<u64> = inner.dirty_files.drain().collect();
        for id in dirty {
            let result = if id == inner.current {
                match inner.current_file.as_ref() {
                    Some(file) => file.sync_all(),
                    None => sync_path(&segment_path(&self.dir, id)),
                }
            } else {
                sync_path(&segment_path(&self.dir, id))
            };
            if let Err(err) = result {
                inner.poisoned = true;
                warn!("store {}: fsync failed, poisoning: {err}", self.dir.display());
                return Err(Error::Io(err));
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::InvariantViolated("store lock poisoned"))
    }
}

impl Inner {
    fn drop_entry(&mut self, guid: &Guid) {
        let Some(entry) = self.index.remove(guid) else {
            return;
        };
        match entry.slot {
            Slot::Buffered => {
                if let Some(body) = self.pending.remove(guid) {
                    self.pending_bytes -= body.len();
                }
            }
            Slot::OnDisk {
                segment, total_len, ..
            } => {
                if let Some(info) = self.files.get_mut(&segment) {
                    info.live_bytes = info.live_bytes.saturating_sub(u64::from(total_len));
                }
            }
        }
        self.cache.remove(guid);
    }
}

impl StoreClient {
    pub fn client_ref(&self) -> ClientRef {
        self.client_ref
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Write a body. Idempotent by guid: a duplicate write only bumps the
    /// shared ref-count.
    pub fn write(&self, guid: Guid, body: Vec<u8>) -> Result<()> {
        self.store.write(guid, body)
    }

    pub fn read(&self, guid: &Guid) -> Result<Arc<Vec<u8>>> {
        self.store.read(guid)
    }

    pub fn contains(&self, guid: &Guid) -> Result<bool> {
        self.store.contains(guid)
    }

    /// Release one reference per guid; unreferenced bodies become GC food.
    pub fn remove(&self, guids: &[Guid]) -> Result<()> {
        self.store.remove(guids)
    }

    /// Make the named guids durable, then run `on_durable`. Syncs with
    /// nothing new to write coalesce into no fsync at all.
    pub fn sync_with(&self, guids: &[Guid], on_durable: impl FnOnce()) -> Result<()> {
        self.store.sync_with(guids, on_durable)
    }

    pub fn terminate(&self) -> Result<()> {
        self.store.client_terminate(self.client_ref)
    }

    pub fn delete(&self) -> Result<()> {
        self.store.delete_client(self.client_ref)
    }
}

fn sync_path(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

fn summarize_files(
    dir: &Path,
    segments: &[u64],
    index: &GuidIndex,
) -> Result<BTreeMap<u64, FileInfo>> {
    let mut files = BTreeMap::new();
    for &id in segments {
        let total = std::fs::metadata(segment_path(dir, id))?.len();
        files.insert(
            id,
            FileInfo {
                total_bytes: total,
                live_bytes: 0,
            },
        );
    }
    for entry in index.values() {
        if let Slot::OnDisk {
            segment, total_len, ..
        } = entry.slot
        {
            if let Some(info) = files.get_mut(&segment) {
                info.live_bytes += u64::from(total_len);
            }
        }
    }
    Ok(files)
}

fn rescan(dir: &Path, segments: &[u64]) -> Result<(GuidIndex, BTreeMap<u64, FileInfo>)> {
    let mut index = GuidIndex::new();
    let mut files = BTreeMap::new();
    for &id in segments {
        let path = segment_path(dir, id);
        let mut live = 0u64;
        let valid = scan_segment(&path, |rec| {
            let footprint = record_len(rec.body.len());
            live += footprint;
            index.insert(
                rec.guid,
                IndexEntry {
                    ref_count: 0,
                    slot: Slot::OnDisk {
                        segment: id,
                        offset: rec.offset,
                        total_len: footprint as u32,
                    },
                },
            );
        })?;
        files.insert(
            id,
            FileInfo {
                total_bytes: valid,
                live_bytes: live,
            },
        );
    }
    Ok((index, files))
}
