//! Driving the duration target: squeezing pages the queue out of RAM,
//! relaxing brings it back, and the RAM budget holds throughout.

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

fn start_with_clock(root: &Path, clock: &ManualClock) -> Engine {
    Engine::start(root, config(), Arc::new(clock.clone())).unwrap()
}

fn msg(i: u64) -> Message {
    Message::new(format!("payload-{i:06}").into_bytes(), Vec::new(), false)
}

#[test]
fn zero_target_empties_ram_and_relaxing_restores_order() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(0);
    let engine = start_with_clock(dir.path(), &clock);
    let mut queue = engine.open_queue("squeeze", true, false).unwrap();

    let count = 2 * SEGMENT;
    for i in 0..count {
        queue.publish(msg(i)).unwrap();
    }
    assert_eq!(queue.status().ram_msg_count, count);

    queue.set_ram_duration_target(Some(0.0)).unwrap();
    let status = queue.status();
    assert_eq!(status.ram_msg_count, 0);
    assert_eq!(status.target_ram_msg_count, Some(0));
    assert_eq!(status.q1, 0);
    assert_eq!(status.q4, 0);
    assert_eq!(status.q3 as u64, SEGMENT);
    assert_eq!(status.delta.count, SEGMENT);
    assert_eq!(status.len, count);

    queue.set_ram_duration_target(None).unwrap();
    for i in 0..count {
        let fetched = queue.fetch(false).unwrap().expect("paged-out message");
        assert_eq!(fetched.message.payload(), msg(i).payload());
    }
    assert!(queue.fetch(false).unwrap().is_none());
}

#[test]
fn ram_budget_holds_under_a_finite_target() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(0);
    let engine = start_with_clock(dir.path(), &clock);
    let mut queue = engine.open_queue("budget", true, false).unwrap();

    // Build up a measurable ingress rate: 1000 msgs over one second.
    for i in 0..1000 {
        queue.publish(msg(i)).unwrap();
    }
    clock.advance(1_000_000);
    queue.ram_duration().unwrap();

    // A tenth of a second of headroom at ~1000 msg/s → target ≈ 100.
    queue.set_ram_duration_target(Some(0.1)).unwrap();
    let status = queue.status();
    let target = status.target_ram_msg_count.expect("finite target");
    assert!(target > 0);
    assert!(
        status.ram_msg_count <= target,
        "ram {} over target {target}",
        status.ram_msg_count
    );

    // Further publishes keep respecting the budget.
    for i in 1000..1500 {
        queue.publish(msg(i)).unwrap();
        let status = queue.status();
        assert!(status.ram_msg_count <= status.target_ram_msg_count.unwrap());
    }
    assert_eq!(queue.len(), 1500);
}

#[test]
fn drain_estimate_reflects_rates() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(0);
    let engine = start_with_clock(dir.path(), &clock);
    let mut queue = engine.open_queue("estimate", true, false).unwrap();

    // Idle queue: infinite drain time.
    assert_eq!(queue.ram_duration().unwrap(), None);

    for i in 0..200 {
        queue.publish(msg(i)).unwrap();
    }
    clock.advance(1_000_000);
    let estimate = queue.ram_duration().unwrap();
    assert!(estimate.is_some());
    assert!(estimate.unwrap() > 0.0);
}

#[test]
fn setting_the_same_target_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(0);
    let engine = start_with_clock(dir.path(), &clock);
    let mut queue = engine.open_queue("idem", true, false).unwrap();

    for i in 0..100 {
        queue.publish(msg(i)).unwrap();
    }
    queue.set_ram_duration_target(Some(0.0)).unwrap();
    let first = queue.status();
    queue.set_ram_duration_target(Some(0.0)).unwrap();
    let second = queue.status();

    assert_eq!(first.q3, second.q3);
    assert_eq!(first.delta, second.delta);
    assert_eq!(first.ram_msg_count, second.ram_msg_count);

    // An infinite target is the same as no target.
    queue.set_ram_duration_target(Some(f64::INFINITY)).unwrap();
    assert_eq!(queue.status().target_ram_msg_count, None);
}
