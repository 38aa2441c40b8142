//! The tiered queue: publish/fetch/ack fast paths over five structures.
//!
//! Messages live in one of five places, ordered oldest (next to deliver)
//! to youngest:
//!
//! ```text
//! q4 ──── q3 ──── Δ ──── q2 ──── q1
//! alphas  β/γ    disk    β/γ    alphas
//! ```
//!
//! `fetch` pops the front of q4 and refills it from q3; q3 refills from
//! Δ one index segment at a time. Publishes enter as alphas while the
//! RAM-message target allows it and sink towards Δ as it tightens; the
//! transitions live in [`paging`]. The queue owns its index, two store
//! clients (persistent + transient bodies), the pending-ack table and
//! the rate estimator driving the controller.
//!
//! A queue instance expects a single owner: every operation takes
//! `&mut self` and completes before the next begins, which is what the
//! tier invariants are stated against.

pub mod entry;
mod paging;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::guid::Guid;
use crate::message::Message;
use crate::meta;
use crate::qindex::{IndexConfig, QueueIndex};
use crate::queue::entry::{Delta, MsgStatus, PendingAck};
use crate::rates::RateEstimator;
use crate::store::{ClientRef, MessageStore, StoreClient};
use crate::txn::{TxnBuffer, TxnId};
use crate::{Error, Result};

pub const TERMS_FILE: &str = "recovery.json";

pub const DEFAULT_RAM_INDEX_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Batch size for index-record demotion in `limit_ram_index`.
    pub ram_index_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ram_index_batch: DEFAULT_RAM_INDEX_BATCH,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueSettings {
    pub queue: QueueConfig,
    pub index: IndexConfig,
}

/// Clean-shutdown terms. Present at startup iff the previous shutdown
/// was clean; consumed (deleted) as they are read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueTerms {
    pub persistent_ref: String,
    pub transient_ref: String,
    pub persistent_count: u64,
}

/// One delivered message as returned by [`TieredQueue::fetch`].
#[derive(Debug, Clone)]
pub struct Fetched {
    pub message: Message,
    /// The message had been delivered before (a redelivery).
    pub is_delivered: bool,
    /// Present when the consumer must ack; pass back to `ack`/`requeue`.
    pub ack_tag: Option<u64>,
    /// Queue length after this fetch.
    pub remaining: u64,
}

/// Point-in-time queue introspection snapshot.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub q1: usize,
    pub q2: usize,
    pub delta: Delta,
    pub q3: usize,
    pub q4: usize,
    pub len: u64,
    pub pending_acks: usize,
    pub persistent_count: u64,
    pub ram_msg_count: u64,
    pub ram_index_count: u64,
    pub target_ram_msg_count: Option<u64>,
    pub next_seq: u64,
    pub avg_ingress: f64,
    pub avg_egress: f64,
}

/// Where a freshly published message's bytes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageKind {
    /// Body stays in RAM (alpha).
    Msg,
    /// Body to the store, position in RAM (beta/gamma).
    Index,
    /// Body and position both to disk (delta).
    Neither,
}

/// The backing-queue contract consumed by the channel layer.
///
/// Implementations provide their own constructor (for [`TieredQueue`]
/// see [`TieredQueue::init`]); everything after construction is
/// polymorphic so that alternative backings can slot in.
pub trait BackingQueue {
    fn publish(&mut self, msg: Message) -> Result<u64>;
    fn publish_delivered(&mut self, ack_required: bool, msg: Message) -> Result<Option<u64>>;
    fn fetch(&mut self, ack_required: bool) -> Result<Option<Fetched>>;
    fn ack(&mut self, tags: &[u64]) -> Result<()>;
    fn requeue(&mut self, tags: &[u64]) -> Result<()>;
    fn tx_publish(&mut self, txn: TxnId, msg: Message) -> Result<()>;
    fn tx_ack(&mut self, txn: TxnId, tags: &[u64]) -> Result<()>;
    fn tx_rollback(&mut self, txn: TxnId) -> Result<Vec<u64>>;
    fn tx_commit(&mut self, txn: TxnId, on_persisted: Box<dyn FnOnce() + '_>)
        -> Result<Vec<u64>>;
    fn set_ram_duration_target(&mut self, duration: Option<f64>) -> Result<()>;
    fn ram_duration(&mut self) -> Result<Option<f64>>;
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn status(&self) -> QueueStatus;
    fn needs_sync(&self) -> bool;
    fn sync(&mut self) -> Result<()>;
    fn handle_pre_hibernate(&mut self) -> Result<()>;
    fn purge(&mut self) -> Result<u64>;
    fn terminate(self: Box<Self>) -> Result<()>;
    fn delete_and_terminate(self: Box<Self>) -> Result<()>;
}

pub struct TieredQueue {
    name: String,
    dir: PathBuf,
    durable: bool,

    pub(crate) q1: VecDeque<MsgStatus>,
    pub(crate) q2: VecDeque<MsgStatus>,
    pub(crate) delta: Delta,
    pub(crate) q3: VecDeque<MsgStatus>,
    pub(crate) q4: VecDeque<MsgStatus>,

    pub(crate) next_seq: u64,
    /// Transient records below this seq-id are stale from a prior run.
    transient_threshold: u64,
    pending_acks: HashMap<u64, PendingAck>,

    pub(crate) index: QueueIndex,
    store_p: StoreClient,
    store_t: StoreClient,

    pub(crate) len: u64,
    persistent_count: u64,
    pub(crate) ram_msg_count: u64,
    ram_msg_count_prev: u64,
    pub(crate) ram_index_count: u64,

    duration_target: Option<f64>,
    pub(crate) target_ram_msg_count: Option<u64>,
    rates: RateEstimator,

    txns: TxnBuffer,
    pub(crate) config: QueueConfig,
}

impl TieredQueue {
    /// Construct a queue, recovering durable contents when asked.
    ///
    /// `store_recovered` reports whether the persistent store came back
    /// cleanly; when it did not, index recovery re-counts store
    /// references and discards entries whose bodies are gone.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        durable: bool,
        recover: bool,
        persistent_store: &Arc<MessageStore>,
        transient_store: &Arc<MessageStore>,
        store_recovered: bool,
        clock: Arc<dyn Clock>,
        settings: QueueSettings,
    ) -> Result<Self> {
        let name = name.into();
        let dir = dir.into();
        let effective_recover = durable && recover;
        if !effective_recover && dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        let terms: Option<QueueTerms> = if effective_recover {
            meta::take_json(&dir.join(TERMS_FILE)).unwrap_or_else(|err| {
                warn!("queue {name}: unreadable terms, treating as unclean: {err}");
                None
            })
        } else {
            None
        };
        let persistent_ref = terms
            .as_ref()
            .and_then(|t| ClientRef::from_hex(&t.persistent_ref))
            .unwrap_or_else(ClientRef::random);
        let transient_ref = terms
            .as_ref()
            .and_then(|t| ClientRef::from_hex(&t.transient_ref))
            .unwrap_or_else(ClientRef::random);

        let store_p = persistent_store.client_init(persistent_ref)?;
        let store_t = transient_store.client_init(transient_ref)?;

        let recovered = QueueIndex::init(&dir, settings.index, store_recovered, |guid| {
            persistent_store.recover_ref(guid)
        })?;

        if let Some(terms) = &terms {
            if terms.persistent_count != recovered.persistent_count {
                warn!(
                    "queue {name}: terms claim {} persistent messages, index has {}",
                    terms.persistent_count, recovered.persistent_count
                );
            }
        }

        let delta = match recovered.low_seq {
            Some(low) if recovered.count > 0 => {
                Delta::new(low, recovered.count, recovered.next_seq)
            }
            _ => Delta::BLANK,
        };

        let mut queue = Self {
            name,
            dir,
            durable,
            q1: VecDeque::new(),
            q2: VecDeque::new(),
            delta,
            q3: VecDeque::new(),
            q4: VecDeque::new(),
            next_seq: recovered.next_seq,
            transient_threshold: recovered.next_seq,
            pending_acks: HashMap::new(),
            index: recovered.index,
            store_p,
            store_t,
            len: recovered.count,
            persistent_count: recovered.persistent_count,
            ram_msg_count: 0,
            ram_msg_count_prev: 0,
            ram_index_count: 0,
            duration_target: None,
            target_ram_msg_count: None,
            rates: RateEstimator::new(clock),
            txns: TxnBuffer::new(),
            config: settings.queue,
        };
        // Keep q3 primed: the queue is never wholly inside delta.
        if !queue.delta.is_blank() {
            queue.maybe_deltas_to_betas()?;
        }
        queue.check();
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            q1: self.q1.len(),
            q2: self.q2.len(),
            delta: self.delta,
            q3: self.q3.len(),
            q4: self.q4.len(),
            len: self.len,
            pending_acks: self.pending_acks.len(),
            persistent_count: self.persistent_count,
            ram_msg_count: self.ram_msg_count,
            ram_index_count: self.ram_index_count,
            target_ram_msg_count: self.target_ram_msg_count,
            next_seq: self.next_seq,
            avg_ingress: self.rates.avg_ingress(),
            avg_egress: self.rates.avg_egress(),
        }
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    /// Append a message, assigning it the next seq-id.
    pub fn publish(&mut self, msg: Message) -> Result<u64> {
        self.publish_inner(msg, false, false)
    }

    fn publish_inner(&mut self, msg: Message, delivered: bool, msg_on_disk: bool) -> Result<u64> {
        self.limit_ram_index()?;

        let seq = self.next_seq;
        self.next_seq += 1;
        let persistent = self.durable && msg.is_persistent();
        let mut status = MsgStatus::new(seq, msg, persistent);
        status.delivered = delivered;
        status.msg_on_disk = msg_on_disk;

        // Persistent messages are durable on disk whatever their tier.
        if persistent {
            self.write_body_to_store(&mut status)?;
            self.index.publish(status.guid, seq, true)?;
            status.index_on_disk = true;
        }

        match self.storage_kind(seq) {
            StorageKind::Msg => {
                self.ram_msg_count += 1;
                if self.q1.is_empty()
                    && self.q2.is_empty()
                    && self.delta.is_blank()
                    && self.q3.is_empty()
                {
                    self.q4.push_back(status);
                } else {
                    self.q1.push_back(status);
                    self.maybe_push_q1_to_betas()?;
                }
            }
            StorageKind::Index => {
                self.write_body_to_store(&mut status)?;
                if !status.index_on_disk && self.ram_index_exhausted() {
                    self.index.publish(status.guid, seq, status.persistent)?;
                    status.index_on_disk = true;
                }
                status.msg = None;
                if !status.index_on_disk {
                    self.ram_index_count += 1;
                }
                self.store_beta_entry(status);
            }
            StorageKind::Neither => {
                self.write_body_to_store(&mut status)?;
                if !status.index_on_disk {
                    self.index.publish(status.guid, seq, status.persistent)?;
                }
                if !self.q1.is_empty() || !self.q2.is_empty() {
                    error!(
                        "queue {}: direct-to-disk publish with q1/q2 occupied",
                        self.name
                    );
                    return Err(Error::InvariantViolated(
                        "direct-to-disk publish with q1/q2 occupied",
                    ));
                }
                self.delta = self.delta.fold(Delta::new(seq, 1, seq + 1));
            }
        }

        self.len += 1;
        if persistent {
            self.persistent_count += 1;
        }
        self.rates.note_publish();
        self.check();
        Ok(seq)
    }

    /// Fast path for a message consumed at publish time: it never enters
    /// the queue structures.
    pub fn publish_delivered(&mut self, ack_required: bool, msg: Message) -> Result<Option<u64>> {
        debug_assert_eq!(self.len, 0, "publish_delivered on a non-empty queue");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rates.note_publish();
        self.rates.note_fetch();

        if !ack_required {
            // Consumed and forgotten in one step: nothing to record.
            return Ok(None);
        }

        let persistent = self.durable && msg.is_persistent();
        let mut status = MsgStatus::new(seq, msg, persistent);
        status.delivered = true;
        if persistent {
            self.write_body_to_store(&mut status)?;
            self.index.publish(status.guid, seq, true)?;
            status.index_on_disk = true;
            self.index.deliver(seq)?;
        }
        self.pending_acks.insert(seq, PendingAck::of(status));
        Ok(Some(seq))
    }

    fn storage_kind(&self, seq: u64) -> StorageKind {
        match self.target_ram_msg_count {
            None => StorageKind::Msg,
            Some(target) if target > self.ram_msg_count => StorageKind::Msg,
            Some(0) => match self.q3.front() {
                // The first message must stay in q3 so the queue is
                // never wholly inside delta.
                None => StorageKind::Index,
                Some(head) if seq >= self.index.next_segment_boundary(head.seq) => {
                    StorageKind::Neither
                }
                Some(_) => StorageKind::Index,
            },
            // A non-zero target we are at: page this one out, alphas in
            // q1 can follow later.
            Some(_) => {
                if self.q1.is_empty() {
                    StorageKind::Index
                } else {
                    StorageKind::Msg
                }
            }
        }
    }

    /// Betas and gammas go to q3 while delta is blank, q2 otherwise.
    pub(crate) fn store_beta_entry(&mut self, status: MsgStatus) {
        debug_assert!(status.msg.is_none() && status.msg_on_disk);
        if self.delta.is_blank() {
            self.q3.push_back(status);
        } else {
            self.q2.push_back(status);
        }
    }

    pub(crate) fn write_body_to_store(&mut self, status: &mut MsgStatus) -> Result<()> {
        if status.msg_on_disk {
            return Ok(());
        }
        let body = status
            .msg
            .as_ref()
            .ok_or(Error::InvariantViolated("paging out an evicted body"))?
            .encode();
        self.store_for(status.persistent).write(status.guid, body)?;
        status.msg_on_disk = true;
        Ok(())
    }

    fn store_for(&self, persistent: bool) -> &StoreClient {
        if persistent {
            &self.store_p
        } else {
            &self.store_t
        }
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    /// Pop the next message in seq order, `None` when the queue is empty.
    pub fn fetch(&mut self, ack_required: bool) -> Result<Option<Fetched>> {
        if self.q4.is_empty() && !self.fetch_from_q3_or_delta()? {
            return Ok(None);
        }
        let mut status = self.q4.pop_front().expect("q4 refilled");
        let was_delivered = status.delivered;
        if status.index_on_disk && !status.delivered {
            self.index.deliver(status.seq)?;
        }
        status.delivered = true;

        let message = status
            .msg
            .clone()
            .ok_or(Error::InvariantViolated("alpha without a body"))?;
        self.ram_msg_count -= 1;
        self.len -= 1;
        if status.persistent {
            self.persistent_count -= 1;
        }
        self.rates.note_fetch();

        let ack_tag = if ack_required {
            let seq = status.seq;
            self.pending_acks.insert(seq, PendingAck::of(status));
            Some(seq)
        } else {
            if status.msg_on_disk {
                self.store_for(status.persistent).remove(&[status.guid])?;
            }
            if status.index_on_disk {
                self.index.ack_one(status.seq)?;
            }
            None
        };

        self.check();
        Ok(Some(Fetched {
            message,
            is_delivered: was_delivered,
            ack_tag,
            remaining: self.len,
        }))
    }

    /// Promote one entry from q3 into q4, refilling q3 from delta (and
    /// joining q1 home) as those drain. False when the queue is empty.
    fn fetch_from_q3_or_delta(&mut self) -> Result<bool> {
        let Some(mut status) = self.q3.pop_front() else {
            debug_assert!(self.q2.is_empty(), "q2 occupied while q3 empty");
            debug_assert!(self.delta.is_blank(), "delta occupied while q3 empty");
            debug_assert!(self.q1.is_empty(), "q1 occupied while q3 empty");
            return Ok(false);
        };

        if !status.index_on_disk {
            self.ram_index_count -= 1;
        }
        let body = self.store_for(status.persistent).read(&status.guid)?;
        status.msg = Some(Message::decode(&body)?);
        self.ram_msg_count += 1;
        self.q4.push_back(status);

        if self.q3.is_empty() {
            if !self.delta.is_blank() {
                self.maybe_deltas_to_betas()?;
            }
            if self.q3.is_empty() && self.delta.is_blank() {
                // q1's alphas are now contiguous with q4.
                while let Some(alpha) = self.q1.pop_front() {
                    self.q4.push_back(alpha);
                }
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Ack / requeue
    // ------------------------------------------------------------------

    /// Drop pending-ack entries. Unknown tags are ignored, so acking an
    /// empty or already-acked batch is a no-op.
    pub fn ack(&mut self, tags: &[u64]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut index_acks = Vec::new();
        let mut persistent_guids = Vec::new();
        let mut transient_guids = Vec::new();
        for &tag in tags {
            let Some(pending) = self.pending_acks.remove(&tag) else {
                continue;
            };
            if pending.index_on_disk() {
                index_acks.push(tag);
            }
            if pending.msg_on_disk() {
                if pending.is_persistent() {
                    persistent_guids.push(pending.guid());
                } else {
                    transient_guids.push(pending.guid());
                }
            }
        }
        self.index.ack(&index_acks)?;
        self.store_p.remove(&persistent_guids)?;
        self.store_t.remove(&transient_guids)?;
        Ok(())
    }

    /// Put delivered-but-unacked messages back at the delivery head.
    ///
    /// Tags are processed in received order and entries keep their
    /// original seq-ids, so the next fetches see the original publish
    /// order: the requeued messages first, then whatever was behind
    /// them.
    pub fn requeue(&mut self, tags: &[u64]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut restored = Vec::with_capacity(tags.len());
        for &tag in tags {
            let Some(pending) = self.pending_acks.remove(&tag) else {
                continue;
            };
            let status = match pending {
                PendingAck::InRam(status) => status,
                PendingAck::OnDisk {
                    guid,
                    persistent,
                    index_on_disk,
                } => {
                    let body = self.store_for(persistent).read(&guid)?;
                    MsgStatus {
                        seq: tag,
                        guid,
                        msg: Some(Message::decode(&body)?),
                        persistent,
                        delivered: true,
                        msg_on_disk: true,
                        index_on_disk,
                    }
                }
            };
            restored.push(status);
        }
        for status in restored.into_iter().rev() {
            self.len += 1;
            self.ram_msg_count += 1;
            if status.persistent {
                self.persistent_count += 1;
            }
            self.q4.push_front(status);
        }
        self.reduce_memory_use()?;
        self.check();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Stage a publish. Durable persistent bodies go to the store right
    /// away so commit only has to fsync.
    pub fn tx_publish(&mut self, txn: TxnId, msg: Message) -> Result<()> {
        if self.durable && msg.is_persistent() {
            self.store_p.write(msg.guid(), msg.encode())?;
        }
        self.txns.record_publish(txn, msg);
        Ok(())
    }

    pub fn tx_ack(&mut self, txn: TxnId, tags: &[u64]) -> Result<()> {
        self.txns.record_acks(txn, tags);
        Ok(())
    }

    /// Undo a transaction. Returns the staged ack tags for the channel
    /// to restore; idempotent for unknown handles.
    pub fn tx_rollback(&mut self, txn: TxnId) -> Result<Vec<u64>> {
        let record = self.txns.erase(txn);
        let guids: Vec<Guid> = record
            .pending_publishes
            .iter()
            .filter(|msg| self.durable && msg.is_persistent())
            .map(Message::guid)
            .collect();
        self.store_p.remove(&guids)?;
        Ok(record.pending_acks.into_iter().flatten().collect())
    }

    /// Commit: sync staged persistent bodies, run the staged publishes
    /// and acks through the normal paths, sync the index, then invoke
    /// `on_persisted`. Returns the committed ack tags.
    pub fn tx_commit(&mut self, txn: TxnId, on_persisted: impl FnOnce()) -> Result<Vec<u64>> {
        let record = self.txns.erase(txn);
        let persistent_guids: Vec<Guid> = record
            .pending_publishes
            .iter()
            .filter(|msg| self.durable && msg.is_persistent())
            .map(Message::guid)
            .collect();
        if !persistent_guids.is_empty() {
            self.store_p.sync_with(&persistent_guids, || ())?;
        }

        let acks: Vec<u64> = record.pending_acks.into_iter().flatten().collect();
        for msg in record.pending_publishes {
            let on_disk = self.durable && msg.is_persistent();
            self.publish_inner(msg, false, on_disk)?;
        }
        self.ack(&acks)?;
        self.index.sync()?;
        on_persisted();
        Ok(acks)
    }

    // ------------------------------------------------------------------
    // Controller entry points
    // ------------------------------------------------------------------

    /// Set the desired seconds-to-drain. `None` or a non-finite value
    /// lifts all paging pressure; a strictly lower RAM target than
    /// before triggers an immediate demotion pass.
    pub fn set_ram_duration_target(&mut self, duration: Option<f64>) -> Result<()> {
        let duration = duration.filter(|d| d.is_finite());
        let new_target = self.rates.target_ram_msg_count(duration);
        let shrinking = match (new_target, self.target_ram_msg_count) {
            (Some(new), Some(old)) => new < old,
            (Some(_), None) => true,
            _ => false,
        };
        self.duration_target = duration;
        self.target_ram_msg_count = new_target;
        if shrinking {
            self.reduce_memory_use()?;
        }
        self.check();
        Ok(())
    }

    /// Update the smoothed rates and estimate the drain duration
    /// (`None` = infinite). Re-derives the RAM target from the fresh
    /// rates when a duration target is in force.
    pub fn ram_duration(&mut self) -> Result<Option<f64>> {
        self.rates.update();
        let estimate = self
            .rates
            .drain_estimate(self.ram_msg_count, self.ram_msg_count_prev);
        self.ram_msg_count_prev = self.ram_msg_count;

        if self.duration_target.is_some() {
            let new_target = self.rates.target_ram_msg_count(self.duration_target);
            let shrinking = match (new_target, self.target_ram_msg_count) {
                (Some(new), Some(old)) => new < old,
                (Some(_), None) => true,
                _ => false,
            };
            self.target_ram_msg_count = new_target;
            if shrinking {
                self.reduce_memory_use()?;
            }
        }
        Ok(estimate)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// True when the index journal holds records not yet fsynced.
    pub fn needs_sync(&self) -> bool {
        self.index.needs_sync()
    }

    /// Force journalled index records durable.
    pub fn sync(&mut self) -> Result<()> {
        self.index.sync()
    }

    /// Flush everything volatile ahead of an idle period.
    pub fn handle_pre_hibernate(&mut self) -> Result<()> {
        self.index.flush()?;
        self.index.sync()?;
        self.rates.reset();
        Ok(())
    }

    /// Drop every message in the queue (pending acks survive). Returns
    /// how many were dropped.
    pub fn purge(&mut self) -> Result<u64> {
        let purged = self.len;
        let mut index_acks = Vec::new();
        let mut persistent_guids = Vec::new();
        let mut transient_guids = Vec::new();

        let drained: Vec<MsgStatus> = self
            .q4
            .drain(..)
            .chain(self.q3.drain(..))
            .chain(self.q2.drain(..))
            .chain(self.q1.drain(..))
            .collect();
        for status in drained {
            if status.index_on_disk {
                index_acks.push(status.seq);
            }
            if status.msg_on_disk {
                if status.persistent {
                    persistent_guids.push(status.guid);
                } else {
                    transient_guids.push(status.guid);
                }
            }
        }

        // Walk delta through the index without loading any bodies.
        while !self.delta.is_blank() {
            let start = self.delta.start;
            let cap = self
                .index
                .next_segment_boundary(start)
                .min(self.delta.end);
            let (entries, _) = self.index.read(start, cap)?;
            let loaded = entries.len() as u64;
            for entry in entries {
                index_acks.push(entry.seq);
                if entry.persistent {
                    persistent_guids.push(entry.guid);
                } else if entry.seq >= self.transient_threshold {
                    transient_guids.push(entry.guid);
                }
            }
            let remaining = self.delta.count - loaded;
            self.delta = if remaining == 0 {
                Delta::BLANK
            } else {
                Delta::new(cap, remaining, self.delta.end)
            };
        }

        self.index.ack(&index_acks)?;
        self.store_p.remove(&persistent_guids)?;
        self.store_t.remove(&transient_guids)?;

        self.len = 0;
        self.persistent_count = 0;
        self.ram_msg_count = 0;
        self.ram_index_count = 0;
        self.check();
        Ok(purged)
    }

    /// Clean shutdown: flush + sync the index, detach store clients and
    /// write the recovery terms.
    pub fn terminate(mut self) -> Result<()> {
        self.index.terminate()?;
        self.store_p.terminate()?;
        self.store_t.terminate()?;
        if self.durable {
            let pending_persistent = self
                .pending_acks
                .values()
                .filter(|p| p.is_persistent())
                .count() as u64;
            let terms = QueueTerms {
                persistent_ref: self.store_p.client_ref().to_hex(),
                transient_ref: self.store_t.client_ref().to_hex(),
                persistent_count: self.persistent_count + pending_persistent,
            };
            meta::write_json(&self.dir.join(TERMS_FILE), &terms)?;
        }
        Ok(())
    }

    /// Destroy the queue and everything it owns, pending acks included.
    pub fn delete_and_terminate(mut self) -> Result<()> {
        self.purge()?;
        let tags: Vec<u64> = self.pending_acks.keys().copied().collect();
        self.ack(&tags)?;
        self.index.flush()?;
        self.index.delete_and_terminate()?;
        self.store_p.delete()?;
        self.store_t.delete()?;
        Ok(())
    }

    /// Cheap structural invariants, checked at operation exits.
    pub(crate) fn check(&self) {
        debug_assert_eq!(
            self.len,
            self.q1.len() as u64
                + self.q2.len() as u64
                + self.delta.count
                + self.q3.len() as u64
                + self.q4.len() as u64,
            "queue length accounting"
        );
        debug_assert!(self.persistent_count <= self.len);
        debug_assert!(
            !(self.delta.is_blank() && self.q3.is_empty()) || self.q2.is_empty(),
            "q2 occupied while q3 and delta are empty"
        );
        if let Some(target) = self.target_ram_msg_count {
            debug_assert!(
                self.ram_msg_count <= target,
                "ram message count above target"
            );
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BackingQueue for TieredQueue {
    fn publish(&mut self, msg: Message) -> Result<u64> {
        TieredQueue::publish(self, msg)
    }

    fn publish_delivered(&mut self, ack_required: bool, msg: Message) -> Result<Option<u64>> {
        TieredQueue::publish_delivered(self, ack_required, msg)
    }

    fn fetch(&mut self, ack_required: bool) -> Result<Option<Fetched>> {
        TieredQueue::fetch(self, ack_required)
    }

    fn ack(&mut self, tags: &[u64]) -> Result<()> {
        TieredQueue::ack(self, tags)
    }

    fn requeue(&mut self, tags: &[u64]) -> Result<()> {
        TieredQueue::requeue(self, tags)
    }

    fn tx_publish(&mut self, txn: TxnId, msg: Message) -> Result<()> {
        TieredQueue::tx_publish(self, txn, msg)
    }

    fn tx_ack(&mut self, txn: TxnId, tags: &[u64]) -> Result<()> {
        TieredQueue::tx_ack(self, txn, tags)
    }

    fn tx_rollback(&mut self, txn: TxnId) -> Result<Vec<u64>> {
        TieredQueue::tx_rollback(self, txn)
    }

    fn tx_commit(
        &mut self,
        txn: TxnId,
        on_persisted: Box<dyn FnOnce() + '_>,
    ) -> Result<Vec<u64>> {
        TieredQueue::tx_commit(self, txn, on_persisted)
    }

    fn set_ram_duration_target(&mut self, duration: Option<f64>) -> Result<()> {
        TieredQueue::set_ram_duration_target(self, duration)
    }

    fn ram_duration(&mut self) -> Result<Option<f64>> {
        TieredQueue::ram_duration(self)
    }

    fn len(&self) -> u64 {
        TieredQueue::len(self)
    }

    fn status(&self) -> QueueStatus {
        TieredQueue::status(self)
    }

    fn needs_sync(&self) -> bool {
        TieredQueue::needs_sync(self)
    }

    fn sync(&mut self) -> Result<()> {
        TieredQueue::sync(self)
    }

    fn handle_pre_hibernate(&mut self) -> Result<()> {
        TieredQueue::handle_pre_hibernate(self)
    }

    fn purge(&mut self) -> Result<u64> {
        TieredQueue::purge(self)
    }

    fn terminate(self: Box<Self>) -> Result<()> {
        TieredQueue::terminate(*self)
    }

    fn delete_and_terminate(self: Box<Self>) -> Result<()> {
        TieredQueue::delete_and_terminate(*self)
    }
}
