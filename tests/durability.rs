mod common;

use common::{harness, Harness};
use epkv::durability::{Level, Requirements, SyncWriteTimeout};
use epkv::item::{Item, ItemOperation};
use epkv::{Cookie, DocKey, SetOptions, Status, VBucketState};
use serde_json::json;
use std::time::{Duration, Instant};

fn active_with_topology(raw: serde_json::Value) -> Harness {
    let h = harness(VBucketState::Active);
    h.vb.set_state(VBucketState::Active, Some(&raw))
        .expect("install topology");
    h
}

fn durable_set(
    h: &Harness,
    key: &str,
    level: Level,
    timeout: Option<SyncWriteTimeout>,
    cookie: u64,
) -> u64 {
    let opts = SetOptions {
        durability: Some(Requirements::new(level, timeout).expect("valid level")),
        cookie: Some(Cookie(cookie)),
        ..SetOptions::default()
    };
    h.vb.set(DocKey::plain(key), b"value".to_vec(), opts)
        .expect("durable set accepted")
        .seqno
}

#[test]
fn majority_commit_over_two_node_chain() {
    let h = active_with_topology(json!([["a", "b"]]));
    let prepare_seqno = durable_set(&h, "k", Level::Majority, None, 1);
    assert_eq!(prepare_seqno, 1);
    assert_eq!(h.vb.num_tracked_sync_writes(), 1);
    assert!(h.observer.sync_write_results().is_empty());

    h.vb.seqno_ack_received("b", 1).expect("ack accepted");

    assert_eq!(h.vb.num_tracked_sync_writes(), 0);
    assert_eq!(
        h.observer.sync_write_results(),
        vec![(Cookie(1), Status::Success)]
    );
    // The commit item landed at the next seqno.
    assert_eq!(h.vb.high_seqno(), 2);
    let drained = h.vb.checkpoint_manager().get_items_for_persistence(100);
    let commit = drained
        .items
        .iter()
        .find(|i| i.operation == ItemOperation::Commit)
        .expect("commit queued");
    assert_eq!(commit.by_seqno, Some(2));
    assert_eq!(commit.prepare_seqno, Some(1));
}

#[test]
fn persist_to_majority_fences_the_high_prepared_seqno() {
    let h = active_with_topology(json!([["a", "b", "c"]]));
    durable_set(&h, "k1", Level::Majority, None, 1);
    durable_set(&h, "k2", Level::PersistToMajority, None, 2);
    durable_set(&h, "k3", Level::Majority, None, 3);
    assert_eq!(h.vb.num_tracked_sync_writes(), 3);
    // The unpersisted fence at seqno 2 pins the HPS behind it.
    assert_eq!(h.vb.high_prepared_seqno(), 1);

    h.vb.seqno_ack_received("b", 3).expect("ack");
    h.vb.seqno_ack_received("c", 3).expect("ack");
    // The first prepare reaches majority (the active prepared it, b and c
    // acked); the fenced ones cannot move until the local flusher does.
    assert_eq!(h.vb.high_prepared_seqno(), 1);
    assert_eq!(h.vb.num_tracked_sync_writes(), 2);
    assert_eq!(
        h.observer.sync_write_results(),
        vec![(Cookie(1), Status::Success)]
    );

    h.vb.notify_persistence(2);
    assert_eq!(h.vb.high_prepared_seqno(), 3);
    assert_eq!(h.vb.num_tracked_sync_writes(), 0);
    // Remaining commits complete in prepare order.
    assert_eq!(
        h.observer.sync_write_results(),
        vec![
            (Cookie(1), Status::Success),
            (Cookie(2), Status::Success),
            (Cookie(3), Status::Success),
        ]
    );
}

#[test]
fn unacked_prepare_times_out_with_ambiguous_outcome() {
    let h = active_with_topology(json!([["a", "b"]]));
    let prepare_seqno = durable_set(&h, "k", Level::Majority, Some(SyncWriteTimeout::Ms(1)), 1);
    assert_eq!(prepare_seqno, 1);
    assert_eq!(h.vb.high_prepared_seqno(), 1);

    h.vb.process_sync_write_timeouts(Instant::now() + Duration::from_secs(1));

    assert_eq!(h.vb.num_tracked_sync_writes(), 0);
    assert_eq!(
        h.observer.sync_write_results(),
        vec![(Cookie(1), Status::SyncWriteAmbiguous)]
    );
    // The active's own prepared position survives the abort.
    assert_eq!(h.vb.high_prepared_seqno(), 1);
    let drained = h.vb.checkpoint_manager().get_items_for_persistence(100);
    let abort = drained
        .items
        .iter()
        .find(|i| i.operation == ItemOperation::Abort)
        .expect("abort queued");
    assert_eq!(abort.prepare_seqno, Some(1));
    // The pending value is gone: a plain write goes straight through.
    h.vb.set(DocKey::plain("k"), b"after".to_vec(), SetOptions::default())
        .expect("key writable after abort");
}

#[test]
fn infinite_timeout_survives_any_wall_clock() {
    let h = active_with_topology(json!([["a", "b"]]));
    durable_set(&h, "k", Level::Majority, Some(SyncWriteTimeout::Infinity), 1);
    h.vb.process_sync_write_timeouts(Instant::now() + Duration::from_secs(100_000_000));
    assert_eq!(h.vb.num_tracked_sync_writes(), 1);
    assert!(h.observer.sync_write_results().is_empty());
}

#[test]
fn undefined_replica_slot_makes_durability_impossible() {
    let h = active_with_topology(json!([["a", null]]));
    let opts = SetOptions {
        durability: Some(Requirements::majority()),
        ..SetOptions::default()
    };
    assert_eq!(
        h.vb.set(DocKey::plain("k"), b"v".to_vec(), opts).unwrap_err(),
        Status::DurabilityImpossible
    );
    // Nothing was queued for the refused write.
    assert_eq!(h.vb.high_seqno(), 0);
}

#[test]
fn demotion_hands_tracked_prepares_to_the_passive_monitor() {
    let h = active_with_topology(json!([["a", "b"]]));
    for (i, key) in ["k1", "k2", "k3"].iter().enumerate() {
        durable_set(&h, key, Level::Majority, None, i as u64 + 1);
    }
    assert_eq!(h.vb.num_tracked_sync_writes(), 3);
    assert_eq!(h.vb.high_prepared_seqno(), 3);

    h.vb.set_state(VBucketState::Replica, None).expect("demote");

    // Tracked set and HPS crossed the handoff; the clients did not.
    assert_eq!(h.vb.num_tracked_sync_writes(), 3);
    assert_eq!(h.vb.high_prepared_seqno(), 3);
    let results = h.observer.sync_write_results();
    assert_eq!(results.len(), 3);
    assert!(
        results
            .iter()
            .all(|(_, status)| *status == Status::SyncWriteAmbiguous)
    );

    // Resolutions now arrive from the new active, strictly in order.
    let mut commit = Item::commit(h.vb.id(), DocKey::plain("k1"), 1);
    commit.by_seqno = Some(4);
    h.vb.add_backfill_item(commit).expect("commit applied");
    assert_eq!(h.vb.num_tracked_sync_writes(), 2);

    let mut abort = Item::abort(h.vb.id(), DocKey::plain("k2"), 2);
    abort.by_seqno = Some(5);
    h.vb.add_backfill_item(abort).expect("abort applied");
    assert_eq!(h.vb.num_tracked_sync_writes(), 1);
}

#[test]
fn replica_acks_its_high_prepared_seqno_on_persistence() {
    let h = harness(VBucketState::Replica);
    let mut prepare = Item::mutation(h.vb.id(), DocKey::plain("k"), b"v".to_vec());
    prepare.operation = ItemOperation::Prepare;
    prepare.by_seqno = Some(1);
    prepare.durability = Some(
        Requirements::new(
            Level::PersistToMajority,
            Some(SyncWriteTimeout::Ms(10_000)),
        )
        .unwrap(),
    );
    h.vb.add_backfill_item(prepare).expect("prepare tracked");
    assert_eq!(h.vb.high_prepared_seqno(), 0);

    h.vb.notify_persistence(1);
    assert_eq!(h.vb.high_prepared_seqno(), 1);
    assert_eq!(h.observer.last_seqno_ack(), Some(1));
}

#[test]
fn replica_rejects_prepares_with_unresolved_timeouts() {
    let h = harness(VBucketState::Replica);
    let mut prepare = Item::mutation(h.vb.id(), DocKey::plain("k"), b"v".to_vec());
    prepare.operation = ItemOperation::Prepare;
    prepare.by_seqno = Some(1);
    prepare.durability = Some(Requirements::majority());
    assert_eq!(
        h.vb.add_backfill_item(prepare).unwrap_err(),
        Status::Einval
    );
}
