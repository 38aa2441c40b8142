//! Tier transitions.
//!
//! Demotions walk away from the delivery head: q1 is drained
//! front-to-back and q4 back-to-front, so the next-to-deliver alphas are
//! the last to lose their bodies. Betas sink to gamma (index record
//! written) before anything moves into delta, and delta promotion loads
//! one index segment at a time, filtering out transient stragglers from
//! previous runs.

use log::warn;

use crate::qindex::QueueIndex;
use crate::queue::entry::{Delta, MsgStatus};
use crate::queue::TieredQueue;
use crate::Result;

/// Write the index publish record that turns a beta into a gamma,
/// adjusting the RAM-index counter the beta was counted in.
fn write_gamma(
    index: &mut QueueIndex,
    ram_index_count: &mut u64,
    status: &mut MsgStatus,
) -> Result<()> {
    if !status.index_on_disk {
        index.publish(status.guid, status.seq, status.persistent)?;
        status.index_on_disk = true;
        *ram_index_count -= 1;
    }
    Ok(())
}

impl TieredQueue {
    /// RAM-index budget: as the beta share of the RAM-resident queue
    /// grows, the gamma share must grow with it so that later beta→delta
    /// transitions stay cheap. `None` means unlimited.
    pub(crate) fn permitted_ram_index(&self) -> Option<u64> {
        let ab = self.len - self.delta.count;
        if ab == 0 {
            return None;
        }
        let b = (self.q2.len() + self.q3.len()) as u64;
        let beta_frac = b as f64 / ab as f64;
        Some((b as f64 - beta_frac * b as f64) as u64)
    }

    pub(crate) fn ram_index_exhausted(&self) -> bool {
        match self.permitted_ram_index() {
            Some(permitted) => self.ram_index_count >= permitted,
            None => false,
        }
    }

    /// Demote betas to gammas in batches of `ram_index_batch`, tail of
    /// q3 first, then q2. Excesses smaller than one batch are left
    /// alone to amortize the index writes.
    pub(crate) fn limit_ram_index(&mut self) -> Result<()> {
        let Some(permitted) = self.permitted_ram_index() else {
            return Ok(());
        };
        let over = self.ram_index_count.saturating_sub(permitted);
        let batch = self.config.ram_index_batch as u64;
        if over < batch {
            return Ok(());
        }

        let mut budget = batch;
        let Self {
            ref mut q2,
            ref mut q3,
            ref mut index,
            ref mut ram_index_count,
            ..
        } = *self;
        for status in q3.iter_mut().rev().chain(q2.iter_mut().rev()) {
            if budget == 0 {
                break;
            }
            if !status.index_on_disk {
                write_gamma(index, ram_index_count, status)?;
                budget -= 1;
            }
        }
        Ok(())
    }

    /// Demote q1 alphas (oldest first) to betas until the RAM-message
    /// target is met.
    pub(crate) fn maybe_push_q1_to_betas(&mut self) -> Result<()> {
        let Some(target) = self.target_ram_msg_count else {
            return Ok(());
        };
        while self.ram_msg_count > target {
            let Some(mut status) = self.q1.pop_front() else {
                break;
            };
            self.demote_alpha(&mut status)?;
            self.store_beta_entry(status);
        }
        Ok(())
    }

    /// Demote q4 alphas (youngest first) to betas until the RAM-message
    /// target is met. They join the front of q3, staying adjacent in seq
    /// order.
    pub(crate) fn maybe_push_q4_to_betas(&mut self) -> Result<()> {
        let Some(target) = self.target_ram_msg_count else {
            return Ok(());
        };
        while self.ram_msg_count > target {
            let Some(mut status) = self.q4.pop_back() else {
                break;
            };
            self.demote_alpha(&mut status)?;
            self.q3.push_front(status);
        }
        Ok(())
    }

    /// Shared alpha→beta step: body to the store, RAM counters adjusted,
    /// index record written when the RAM-index budget is gone.
    fn demote_alpha(&mut self, status: &mut MsgStatus) -> Result<()> {
        debug_assert!(status.is_alpha());
        self.write_body_to_store(status)?;
        status.msg = None;
        self.ram_msg_count -= 1;
        if !status.index_on_disk {
            if self.ram_index_exhausted() {
                self.index
                    .publish(status.guid, status.seq, status.persistent)?;
                status.index_on_disk = true;
            } else {
                self.ram_index_count += 1;
            }
        }
        Ok(())
    }

    /// Demotion β/γ→δ: all of q2 and the later-segment tail of q3 move
    /// into delta. The segment containing q3's head stays resident so
    /// the queue is never wholly inside delta.
    pub(crate) fn push_betas_to_deltas(&mut self) -> Result<()> {
        if !self.q2.is_empty() {
            let start = self.q2.front().expect("q2 non-empty").seq;
            let end = self.q2.back().expect("q2 non-empty").seq + 1;
            let count = self.q2.len() as u64;
            let Self {
                ref mut q2,
                ref mut index,
                ref mut ram_index_count,
                ..
            } = *self;
            for mut status in q2.drain(..) {
                write_gamma(index, ram_index_count, &mut status)?;
            }
            self.delta = self.delta.fold(Delta::new(start, count, end));
        }

        if let Some(head_seq) = self.q3.front().map(|status| status.seq) {
            let boundary = self.index.next_segment_boundary(head_seq);
            let mut moved = 0u64;
            let mut start = 0u64;
            let mut end = 0u64;
            while self
                .q3
                .back()
                .is_some_and(|status| status.seq >= boundary)
            {
                let mut status = self.q3.pop_back().expect("q3 non-empty");
                let Self {
                    ref mut index,
                    ref mut ram_index_count,
                    ..
                } = *self;
                write_gamma(index, ram_index_count, &mut status)?;
                if moved == 0 {
                    end = status.seq + 1;
                }
                start = status.seq;
                moved += 1;
            }
            if moved > 0 {
                self.delta = Delta::new(start, moved, end).fold(self.delta);
            }
        }
        self.check();
        Ok(())
    }

    /// Promotion δ→β: load the index segment at delta's start into q3,
    /// acking stale transients from previous runs along the way. When
    /// delta empties, q2 joins q3.
    pub(crate) fn maybe_deltas_to_betas(&mut self) -> Result<()> {
        if self.delta.is_blank() {
            return Ok(());
        }
        let start = self.delta.start;
        let cap = self
            .index
            .next_segment_boundary(start)
            .min(self.delta.end);
        let (entries, _) = self.index.read(start, cap)?;
        let loaded = entries.len() as u64;

        let mut stale = 0u64;
        for entry in entries {
            if !entry.persistent && entry.seq < self.transient_threshold {
                self.index.ack_one(entry.seq)?;
                stale += 1;
                continue;
            }
            self.q3.push_back(MsgStatus {
                seq: entry.seq,
                guid: entry.guid,
                msg: None,
                persistent: entry.persistent,
                delivered: entry.delivered,
                msg_on_disk: true,
                index_on_disk: true,
            });
        }
        if stale > 0 {
            warn!(
                "queue {}: discarded {stale} stale transient messages",
                self.name()
            );
            self.len -= stale;
        }

        let remaining = self.delta.count - loaded;
        self.delta = if remaining == 0 {
            Delta::BLANK
        } else {
            Delta::new(cap, remaining, self.delta.end)
        };

        if self.delta.is_blank() {
            while let Some(status) = self.q2.pop_front() {
                self.q3.push_back(status);
            }
        } else if self.q3.is_empty() {
            // The whole segment was stale transients; keep draining.
            return self.maybe_deltas_to_betas();
        }
        Ok(())
    }

    /// Bring RAM usage back under the current target: index records
    /// first, then alphas out of q1 and q4, then betas into delta when
    /// the target is zero.
    pub(crate) fn reduce_memory_use(&mut self) -> Result<()> {
        let Some(target) = self.target_ram_msg_count else {
            return Ok(());
        };
        self.limit_ram_index()?;
        self.maybe_push_q1_to_betas()?;
        self.maybe_push_q4_to_betas()?;
        if target == 0 {
            self.push_betas_to_deltas()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::clock::ManualClock;
    use crate::message::Message;
    use crate::qindex::IndexConfig;
    use crate::queue::{QueueConfig, QueueSettings, TieredQueue};
    use crate::store::{MessageStore, StoreConfig};

    fn settings() -> QueueSettings {
        QueueSettings {
            queue: QueueConfig { ram_index_batch: 4 },
            index: IndexConfig {
                segment_entries: 16,
                max_journal_entries: 32,
            },
        }
    }

    fn harness(dir: &TempDir) -> TieredQueue {
        harness_with_clock(dir, &ManualClock::new(0))
    }

    fn harness_with_clock(dir: &TempDir, clock: &ManualClock) -> TieredQueue {
        let (persistent, _) = MessageStore::open(
            dir.path().join("store-persistent"),
            StoreConfig::default(),
            &[],
        )
        .unwrap();
        let transient = MessageStore::open_transient(
            dir.path().join("store-transient"),
            StoreConfig::default(),
        )
        .unwrap();
        TieredQueue::init(
            "paging",
            dir.path().join("queues").join("paging"),
            true,
            false,
            &persistent,
            &transient,
            true,
            Arc::new(clock.clone()),
            settings(),
        )
        .unwrap()
    }

    fn publish_n(queue: &mut TieredQueue, n: usize, persistent: bool) {
        for i in 0..n {
            let msg = Message::new(
                format!("body-{i:05}").into_bytes(),
                Vec::new(),
                persistent,
            );
            queue.publish(msg).unwrap();
        }
    }

    #[test]
    fn zero_target_pages_all_alphas_out() {
        let dir = TempDir::new().unwrap();
        let mut queue = harness(&dir);
        publish_n(&mut queue, 40, false);
        assert_eq!(queue.status().ram_msg_count, 40);

        queue.set_ram_duration_target(Some(0.0)).unwrap();
        let status = queue.status();
        assert_eq!(status.ram_msg_count, 0);
        assert_eq!(status.q1, 0);
        assert_eq!(status.q4, 0);
        // One segment's worth stays in q3, the rest sinks to delta.
        assert_eq!(status.q3, 16);
        assert_eq!(status.delta.count, 24);
        assert_eq!(status.len, 40);
    }

    #[test]
    fn relaxing_the_target_restores_fetchability_in_order() {
        let dir = TempDir::new().unwrap();
        let mut queue = harness(&dir);
        publish_n(&mut queue, 40, true);
        queue.set_ram_duration_target(Some(0.0)).unwrap();
        queue.set_ram_duration_target(None).unwrap();

        for i in 0..40 {
            let fetched = queue.fetch(false).unwrap().expect("message present");
            assert_eq!(
                fetched.message.payload(),
                format!("body-{i:05}").as_bytes()
            );
        }
        assert!(queue.fetch(false).unwrap().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn zero_target_publishes_fold_into_delta() {
        let dir = TempDir::new().unwrap();
        let mut queue = harness(&dir);
        publish_n(&mut queue, 24, false); // 16 + half a segment
        queue.set_ram_duration_target(Some(0.0)).unwrap();

        let before = queue.status();
        assert_eq!(before.q3, 16);
        assert_eq!(before.delta.count, 8);

        // Same segment as the delta tail: straight to delta.
        publish_n(&mut queue, 1, false);
        let status = queue.status();
        assert_eq!(status.q1, 0);
        assert_eq!(status.delta.count, 9);
        assert_eq!(status.len, 25);
    }

    #[test]
    fn reduce_drains_q1_before_q4() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(0);
        let mut queue = harness_with_clock(&dir, &clock);

        publish_n(&mut queue, 10, false);
        clock.advance(1_000_000);
        queue.ram_duration().unwrap();
        // Ingress measured at ten messages per second, so a one-second
        // target holds all ten alphas in RAM without demoting.
        queue.set_ram_duration_target(Some(1.0)).unwrap();
        assert_eq!(queue.status().target_ram_msg_count, Some(10));

        // At the target, new publishes go index-bound into q3; once q3
        // is occupied, alphas published under the target land in q1.
        publish_n(&mut queue, 2, false);
        for _ in 0..3 {
            queue.fetch(false).unwrap().unwrap();
        }
        publish_n(&mut queue, 3, false);
        let status = queue.status();
        assert_eq!(status.q4, 7);
        assert_eq!(status.q3, 2);
        assert_eq!(status.q1, 3);
        assert_eq!(status.ram_msg_count, 10);

        // Tightening by two demotes from q1 first; q4's next-to-deliver
        // alphas are untouched.
        queue.set_ram_duration_target(Some(0.8)).unwrap();
        let status = queue.status();
        assert_eq!(status.ram_msg_count, 8);
        assert_eq!(status.q1, 1);
        assert_eq!(status.q4, 7);
        assert_eq!(status.q3, 4);

        // Tightening past q1 finally reaches into q4.
        queue.set_ram_duration_target(Some(0.5)).unwrap();
        let status = queue.status();
        assert_eq!(status.ram_msg_count, 5);
        assert_eq!(status.q1, 0);
        assert_eq!(status.q4, 5);
        assert_eq!(status.q3, 7);
    }

    #[test]
    fn limit_ram_index_grows_the_gamma_share() {
        let dir = TempDir::new().unwrap();
        let mut queue = harness(&dir);
        publish_n(&mut queue, 64, false);
        queue.set_ram_duration_target(Some(0.0)).unwrap();
        queue.set_ram_duration_target(None).unwrap();

        // All 64 sit in q3 as betas/gammas now; keep publishing alphas
        // and let the per-publish limit pass write index records.
        publish_n(&mut queue, 64, false);
        let status = queue.status();
        let betas = status.q2 + status.q3;
        assert!(status.ram_index_count < betas as u64);
    }
}
