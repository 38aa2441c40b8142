//! Variable-capacity message queue engine.
//!
//! `strataq` is the storage core of a message broker queue: it accepts
//! publishes, delivers in FIFO order with at-least-once acknowledgement
//! semantics, participates in transactions, and survives restarts. The
//! defining feature is that a queue transparently pages message bodies
//! and index positions between RAM and disk, so queue depth is bounded
//! by disk while a drained queue runs at RAM speed.
//!
//! # Architecture
//!
//! ```text
//! publisher ──▶ TieredQueue ──▶ consumer
//!                │  q4 q3 Δ q2 q1   (tiers, oldest→youngest)
//!                ├─▶ QueueIndex     (journal + seq-addressed segments)
//!                └─▶ MessageStore   (shared, content-addressed bodies)
//!                      ├ persistent (fsynced, survives restart)
//!                      └ transient  (wiped at startup)
//! ```
//!
//! A message's *tier* says how much of it is resident: alpha (body and
//! position in RAM), beta (body on disk), gamma (beta plus an index
//! record), delta (body and position on disk, summarized by one compact
//! counter). The rate estimator turns a seconds-to-drain target into a
//! RAM-message budget and the paging transitions keep the queue inside
//! it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use strataq::clock::SystemClock;
//! use strataq::engine::{Engine, EngineConfig};
//! use strataq::message::Message;
//!
//! let engine = Engine::start("./data", EngineConfig::default(), Arc::new(SystemClock))?;
//! let mut queue = engine.open_queue("orders", true, true)?;
//!
//! queue.publish(Message::new(b"hello".to_vec(), Vec::new(), true))?;
//! if let Some(fetched) = queue.fetch(true)? {
//!     queue.ack(&[fetched.ack_tag.unwrap()])?;
//! }
//! # Ok::<(), strataq::Error>(())
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod guid;
pub mod message;
mod meta;
pub mod qindex;
pub mod queue;
pub mod rates;
pub mod store;
pub mod txn;

pub use error::{Error, Result};
pub use guid::Guid;
pub use message::Message;
pub use queue::{BackingQueue, Fetched, QueueStatus, TieredQueue};
pub use store::{ClientRef, MessageStore};
pub use txn::TxnId;
