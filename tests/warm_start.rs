//! Durable queues across a clean shutdown: contents come back from disk
//! and drain in order.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use strataq::clock::ManualClock;
use strataq::engine::{Engine, EngineConfig};
use strataq::message::Message;
use strataq::qindex::IndexConfig;

const SEGMENT: u64 = 64;

fn config() -> EngineConfig {
    EngineConfig {
        index: IndexConfig {
            segment_entries: SEGMENT,
            max_journal_entries: 128,
        },
        ..EngineConfig::default()
    }
}

fn start(root: &Path) -> Engine {
    Engine::start(root, config(), Arc::new(ManualClock::new(0))).unwrap()
}

fn msg(i: u64) -> Message {
    Message::new(format!("payload-{i:06}").into_bytes(), Vec::new(), true)
}

#[test]
fn persistent_messages_survive_clean_restart() {
    let dir = TempDir::new().unwrap();
    let count = 4 * SEGMENT + 17;

    {
        let engine = start(dir.path());
        let mut queue = engine.open_queue("orders", true, false).unwrap();
        for i in 0..count {
            queue.publish(msg(i)).unwrap();
        }
        queue.sync().unwrap();
        queue.terminate().unwrap();
        engine.terminate().unwrap();
    }

    {
        let engine = start(dir.path());
        assert!(engine.persistent_recovered());
        let mut queue = engine.open_queue("orders", true, true).unwrap();
        engine.finish_recovery().unwrap();

        assert_eq!(queue.len(), count);
        let status = queue.status();
        // The head segment is primed into q3; the rest waits in delta.
        assert_eq!(status.q3 as u64, SEGMENT);
        assert_eq!(status.delta.count, count - SEGMENT);
        assert_eq!(status.q1, 0);
        assert_eq!(status.q2, 0);
        assert_eq!(status.q4, 0);

        let mut tags = Vec::new();
        for i in 0..count {
            let fetched = queue.fetch(true).unwrap().expect("recovered message");
            assert_eq!(fetched.message.payload(), msg(i).payload());
            assert!(fetched.message.is_persistent());
            tags.push(fetched.ack_tag.unwrap());
        }
        assert!(queue.fetch(true).unwrap().is_none());
        queue.ack(&tags).unwrap();

        queue.terminate().unwrap();
        engine.terminate().unwrap();
    }

    // Third start: the queue is empty and stays that way.
    let engine = start(dir.path());
    let queue = engine.open_queue("orders", true, true).unwrap();
    assert_eq!(queue.len(), 0);
    assert!(queue.is_empty());
}

#[test]
fn delivered_but_unacked_messages_come_back_redelivered() {
    let dir = TempDir::new().unwrap();
    {
        let engine = start(dir.path());
        let mut queue = engine.open_queue("redelivery", true, false).unwrap();
        for i in 0..5 {
            queue.publish(msg(i)).unwrap();
        }
        // Deliver two without acking; the pending entries die with the
        // shutdown, the messages must not.
        let first = queue.fetch(true).unwrap().unwrap();
        let second = queue.fetch(true).unwrap().unwrap();
        assert!(first.ack_tag.is_some() && second.ack_tag.is_some());
        queue.terminate().unwrap();
        engine.terminate().unwrap();
    }

    let engine = start(dir.path());
    let mut queue = engine.open_queue("redelivery", true, true).unwrap();
    assert_eq!(queue.len(), 5);
    for i in 0..5 {
        let fetched = queue.fetch(false).unwrap().expect("recovered message");
        assert_eq!(fetched.message.payload(), msg(i).payload());
        // The two that had been delivered carry the redelivery flag.
        assert_eq!(fetched.is_delivered, i < 2);
    }
}

#[test]
fn non_durable_queues_start_empty() {
    let dir = TempDir::new().unwrap();
    {
        let engine = start(dir.path());
        let mut queue = engine.open_queue("scratch", false, false).unwrap();
        for i in 0..10 {
            queue.publish(msg(i)).unwrap();
        }
        queue.terminate().unwrap();
        engine.terminate().unwrap();
    }
    let engine = start(dir.path());
    let queue = engine.open_queue("scratch", false, true).unwrap();
    assert_eq!(queue.len(), 0);
}
