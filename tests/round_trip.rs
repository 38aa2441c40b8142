//! Basic FIFO delivery and the full publish→fetch→ack round trip.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use strataq::clock::ManualClock;
use strataq::engine::{Engine, EngineConfig};
use strataq::message::Message;
use strataq::qindex::IndexConfig;

fn config() -> EngineConfig {
    EngineConfig {
        index: IndexConfig {
            segment_entries: 64,
            max_journal_entries: 128,
        },
        ..EngineConfig::default()
    }
}

fn start(root: &Path) -> Engine {
    Engine::start(root, config(), Arc::new(ManualClock::new(0))).unwrap()
}

fn msg(i: u64, persistent: bool) -> Message {
    Message::new(
        format!("payload-{i:06}").into_bytes(),
        Vec::new(),
        persistent,
    )
}

#[test]
fn fifo_without_ack() {
    let dir = TempDir::new().unwrap();
    let engine = start(dir.path());
    let mut queue = engine.open_queue("fifo", true, false).unwrap();

    for i in 0..3 {
        queue.publish(msg(i, false)).unwrap();
    }
    assert_eq!(queue.len(), 3);

    for i in 0..3 {
        let fetched = queue.fetch(false).unwrap().expect("message available");
        assert_eq!(fetched.message.payload(), msg(i, false).payload());
        assert!(!fetched.is_delivered);
        assert!(fetched.ack_tag.is_none());
        assert_eq!(fetched.remaining, 2 - i);
    }
    assert!(queue.fetch(false).unwrap().is_none());
    assert_eq!(queue.len(), 0);
}

#[test]
fn fifo_interleaved_with_publishes() {
    let dir = TempDir::new().unwrap();
    let engine = start(dir.path());
    let mut queue = engine.open_queue("interleave", true, false).unwrap();

    queue.publish(msg(0, false)).unwrap();
    queue.publish(msg(1, true)).unwrap();
    let first = queue.fetch(false).unwrap().unwrap();
    assert_eq!(first.message.payload(), msg(0, false).payload());

    queue.publish(msg(2, false)).unwrap();
    for i in 1..3 {
        let fetched = queue.fetch(false).unwrap().unwrap();
        assert_eq!(fetched.message.payload(), msg(i, false).payload());
    }
    assert!(queue.is_empty());
}

#[test]
fn publish_fetch_ack_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let engine = start(dir.path());
    let mut queue = engine.open_queue("clean", true, false).unwrap();

    let count = 200u64; // several index segments
    for i in 0..count {
        queue.publish(msg(i, true)).unwrap();
    }
    assert_eq!(queue.len(), count);

    let mut tags = Vec::new();
    for i in 0..count {
        let fetched = queue.fetch(true).unwrap().expect("message available");
        assert_eq!(fetched.message.payload(), msg(i, true).payload());
        tags.push(fetched.ack_tag.expect("ack required"));
    }
    queue.ack(&tags).unwrap();
    assert_eq!(queue.len(), 0);

    // Ack and requeue of nothing are no-ops.
    queue.ack(&[]).unwrap();
    queue.requeue(&[]).unwrap();

    // Fold the index: every segment became fully acked and is deleted.
    queue.handle_pre_hibernate().unwrap();
    let queue_dir = engine.queue_dir("clean");
    let segments = strataq::qindex::segment::discover_segments(&queue_dir).unwrap();
    assert!(segments.is_empty(), "index segments left: {segments:?}");

    // Every persistent body was released.
    let stats = engine.persistent_store().stats().unwrap();
    assert_eq!(stats.entries, 0);
}

#[test]
fn acked_tags_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = start(dir.path());
    let mut queue = engine.open_queue("idem", true, false).unwrap();

    queue.publish(msg(0, true)).unwrap();
    let tag = queue.fetch(true).unwrap().unwrap().ack_tag.unwrap();
    queue.ack(&[tag]).unwrap();
    // A second ack of the same tag is ignored.
    queue.ack(&[tag]).unwrap();
    assert_eq!(queue.len(), 0);
}

#[test]
fn purge_drops_everything_at_every_tier() {
    let dir = TempDir::new().unwrap();
    let engine = start(dir.path());
    let mut queue = engine.open_queue("purged", true, false).unwrap();

    for i in 0..150 {
        queue.publish(msg(i, i % 2 == 0)).unwrap();
    }
    queue.set_ram_duration_target(Some(0.0)).unwrap();
    queue.set_ram_duration_target(None).unwrap();
    for i in 150..170 {
        queue.publish(msg(i, false)).unwrap();
    }

    assert_eq!(queue.purge().unwrap(), 170);
    assert_eq!(queue.len(), 0);
    assert!(queue.fetch(false).unwrap().is_none());
}
