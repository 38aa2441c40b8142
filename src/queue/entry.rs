//! Tier records for the queue structures.
//!
//! Every resident message is tracked by a [`MsgStatus`]; which of the
//! queue structures it sits in, together with the `msg` and
//! `index_on_disk` fields, determines its tier:
//!
//! - **alpha** (q1/q4): body and position both in RAM (`msg` present)
//! - **beta** (q2/q3): body on disk, position in RAM only
//! - **gamma** (q2/q3): body on disk, position in RAM and on disk
//! - **delta**: body and position both on disk, summarized by [`Delta`]

use crate::guid::Guid;
use crate::message::Message;

#[derive(Debug, Clone)]
pub struct MsgStatus {
    pub seq: u64,
    pub guid: Guid,
    /// The body; evicted (None) once the message leaves alpha.
    pub msg: Option<Message>,
    pub persistent: bool,
    pub delivered: bool,
    pub msg_on_disk: bool,
    pub index_on_disk: bool,
}

impl MsgStatus {
    pub fn new(seq: u64, msg: Message, persistent: bool) -> Self {
        Self {
            seq,
            guid: msg.guid(),
            msg: Some(msg),
            persistent,
            delivered: false,
            msg_on_disk: false,
            index_on_disk: false,
        }
    }

    pub fn is_alpha(&self) -> bool {
        self.msg.is_some()
    }

    /// Beta: position in RAM only. Gamma: position also in the index.
    pub fn is_beta(&self) -> bool {
        self.msg.is_none() && !self.index_on_disk
    }

    pub fn is_gamma(&self) -> bool {
        self.msg.is_none() && self.index_on_disk
    }
}

/// A pending (delivered, not yet acked) message.
///
/// Messages whose body is on disk shrink to a pointer; the rest keep
/// their full status so requeue does not need a store read.
#[derive(Debug, Clone)]
pub enum PendingAck {
    OnDisk {
        guid: Guid,
        persistent: bool,
        index_on_disk: bool,
    },
    InRam(MsgStatus),
}

impl PendingAck {
    pub fn of(status: MsgStatus) -> Self {
        if status.msg_on_disk {
            PendingAck::OnDisk {
                guid: status.guid,
                persistent: status.persistent,
                index_on_disk: status.index_on_disk,
            }
        } else {
            PendingAck::InRam(status)
        }
    }

    pub fn guid(&self) -> Guid {
        match self {
            PendingAck::OnDisk { guid, .. } => *guid,
            PendingAck::InRam(status) => status.guid,
        }
    }

    pub fn is_persistent(&self) -> bool {
        match self {
            PendingAck::OnDisk { persistent, .. } => *persistent,
            PendingAck::InRam(status) => status.persistent,
        }
    }

    pub fn msg_on_disk(&self) -> bool {
        matches!(self, PendingAck::OnDisk { .. })
    }

    pub fn index_on_disk(&self) -> bool {
        match self {
            PendingAck::OnDisk { index_on_disk, .. } => *index_on_disk,
            PendingAck::InRam(status) => status.index_on_disk,
        }
    }
}

/// A contiguous run of messages wholly on disk: seq-ids in
/// `[start, end)`, of which `count` are live. The blank delta has
/// `count == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub start: u64,
    pub count: u64,
    pub end: u64,
}

impl Delta {
    pub const BLANK: Delta = Delta {
        start: 0,
        count: 0,
        end: 0,
    };

    pub fn new(start: u64, count: u64, end: u64) -> Self {
        let delta = Self { start, count, end };
        debug_assert!(delta.is_blank() || start + count <= end);
        delta
    }

    pub fn is_blank(&self) -> bool {
        self.count == 0
    }

    /// Fold another run into this one. The runs must not interleave:
    /// `other` starts at or after this delta ends (or one side is blank).
    pub fn fold(self, other: Delta) -> Delta {
        if self.is_blank() {
            return other;
        }
        if other.is_blank() {
            return self;
        }
        debug_assert!(self.end <= other.start + other.count && self.start <= other.start);
        Delta::new(self.start, self.count + other.count, other.end)
    }
}

impl Default for Delta {
    fn default() -> Self {
        Self::BLANK
    }
}
