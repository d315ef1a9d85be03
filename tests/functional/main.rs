// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the lease pool machinery.
//!
//! These drive the real range parser, pipeline driver, command builders
//! and reply processors against an in-memory Redis stand-in, so the
//! whole ADD/REMOVE/RELEASE/SHOW lifecycle is exercised without a
//! server.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run a specific test
//! cargo test --test functional test_add_then_rerun_is_idempotent
//! ```


use fake_redis::{FakeRedis, Fault};
use redis_ippool_tool::actions::{AddAction, ReleaseAction, RemoveAction, ShowAction};
use redis_ippool_tool::pipeline::run_lease_op;
use redis_ippool_tool::run::{Action, Operation};

const POOL: &[u8] = b"test_pool";

fn op(action: Action, text: &str, prefix: u8) -> Operation {
    Operation::parse(action, text, POOL.to_vec(), None, prefix).unwrap()
}

fn op_with_range(action: Action, text: &str, range: &[u8]) -> Operation {
    Operation::parse(action, text, POOL.to_vec(), Some(range.to_vec()), 0).unwrap()
}

async fn add(fake: &mut FakeRedis, text: &str, prefix: u8) -> u64 {
    let operation = op(Action::Add, text, prefix);
    let mut count = 0;
    run_lease_op(fake, &operation, &AddAction::new(operation.range.clone()), &mut count)
        .await
        .unwrap();
    count
}

async fn remove(fake: &mut FakeRedis, text: &str) -> u64 {
    let operation = op(Action::Remove, text, 0);
    let mut count = 0;
    run_lease_op(fake, &operation, &RemoveAction, &mut count)
        .await
        .unwrap();
    count
}

async fn release(fake: &mut FakeRedis, text: &str) -> u64 {
    let operation = op(Action::Release, text, 0);
    let mut count = 0;
    run_lease_op(fake, &operation, &ReleaseAction, &mut count)
        .await
        .unwrap();
    count
}

async fn show(fake: &mut FakeRedis, text: &str) -> Vec<redis_ippool_tool::Lease> {
    let operation = op(Action::Show, text, 0);
    let mut leases = Vec::new();
    run_lease_op(fake, &operation, &ShowAction, &mut leases)
        .await
        .unwrap();
    leases
}

fn pool_members(fake: &FakeRedis) -> Vec<String> {
    fake.keyspace
        .zsets
        .get(&b"{test_pool}:pool".to_vec())
        .map(|zset| zset.keys().cloned().collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_add_v4_block_excludes_broadcast() {
    let mut fake = FakeRedis::new();
    assert_eq!(add(&mut fake, "10.0.0.0/30", 0).await, 3);
    assert_eq!(pool_members(&fake), ["10.0.0.0", "10.0.0.1", "10.0.0.2"]);
    // All scores start at zero: free until the allocator hands them out.
    let zset = &fake.keyspace.zsets[&b"{test_pool}:pool".to_vec()];
    assert!(zset.values().all(|score| *score == 0));
}

#[tokio::test]
async fn test_add_then_rerun_is_idempotent() {
    let mut fake = FakeRedis::new();
    assert_eq!(add(&mut fake, "10.0.0.0/30", 0).await, 3);
    assert_eq!(add(&mut fake, "10.0.0.0/30", 0).await, 0);
    assert_eq!(pool_members(&fake).len(), 3);
}

#[tokio::test]
async fn test_add_v6_hosts_excludes_broadcast() {
    let mut fake = FakeRedis::new();
    assert_eq!(add(&mut fake, "2001:db8::/126", 128).await, 3);
    assert_eq!(
        pool_members(&fake),
        ["2001:db8::", "2001:db8::1", "2001:db8::2"]
    );
}

#[tokio::test]
async fn test_add_v6_sub_prefixes() {
    let mut fake = FakeRedis::new();
    assert_eq!(add(&mut fake, "2001:db8::/120", 124).await, 16);
    let members = pool_members(&fake);
    assert_eq!(members.len(), 16);
    assert!(members.contains(&"2001:db8::/124".to_string()));
    assert!(members.contains(&"2001:db8::10/124".to_string()));
    assert!(members.contains(&"2001:db8::f0/124".to_string()));
}

#[tokio::test]
async fn test_add_records_range_id() {
    let mut fake = FakeRedis::new();
    let operation = op_with_range(Action::Add, "10.0.0.1", b"floor-3");
    let mut count = 0;
    run_lease_op(
        &mut fake,
        &operation,
        &AddAction::new(operation.range.clone()),
        &mut count,
    )
    .await
    .unwrap();
    assert_eq!(count, 1);
    let hash = &fake.keyspace.hashes[&b"{test_pool}:ip:10.0.0.1".to_vec()];
    assert_eq!(hash["range"], b"floor-3");
}

#[tokio::test]
async fn test_show_fresh_lease() {
    let mut fake = FakeRedis::new();
    add(&mut fake, "10.0.0.1", 0).await;

    let leases = show(&mut fake, "10.0.0.1").await;
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].ipaddr.to_string(), "10.0.0.1");
    assert_eq!(leases[0].next_event, 0);
    assert!(leases[0].device.is_none());
    assert!(leases[0].gateway.is_none());
    // The range tag is stored as an empty string when no range id was
    // supplied; display treats it as absent.
    assert_eq!(leases[0].range.as_deref(), Some(&b""[..]));
}

#[tokio::test]
async fn test_show_skips_non_members() {
    let mut fake = FakeRedis::new();
    add(&mut fake, "10.0.0.1", 0).await;
    // The /30 covers four candidate addresses but only one is a member.
    let leases = show(&mut fake, "10.0.0.0/30").await;
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].ipaddr.to_string(), "10.0.0.1");
}

#[tokio::test]
async fn test_release_zeroes_score_and_unlinks_device() {
    let mut fake = FakeRedis::new();
    add(&mut fake, "10.0.0.1", 0).await;

    // Simulate the allocator handing the lease to a device.
    let pool_key = b"{test_pool}:pool".to_vec();
    fake.keyspace
        .zsets
        .get_mut(&pool_key)
        .unwrap()
        .insert("10.0.0.1".to_string(), 1_999_999_999);
    fake.link_device(POOL, "10.0.0.1", b"02:00:00:aa:bb:cc");

    assert_eq!(release(&mut fake, "10.0.0.1").await, 1);

    // Score back to zero, device reverse key gone, hash still there.
    assert_eq!(fake.keyspace.zsets[&pool_key]["10.0.0.1"], 0);
    assert!(
        !fake
            .keyspace
            .strings
            .contains_key(&b"{test_pool}:device:02:00:00:aa:bb:cc".to_vec())
    );
    assert!(
        fake.keyspace
            .hashes
            .contains_key(&b"{test_pool}:ip:10.0.0.1".to_vec())
    );
}

#[tokio::test]
async fn test_release_of_already_released_lease_leaves_device_key() {
    let mut fake = FakeRedis::new();
    add(&mut fake, "10.0.0.1", 0).await;
    fake.link_device(POOL, "10.0.0.1", b"dev-1");

    // Score is already zero, so the script exits before the device
    // lookup: nothing released, reverse key untouched.
    assert_eq!(release(&mut fake, "10.0.0.1").await, 0);
    assert!(
        fake.keyspace
            .strings
            .contains_key(&b"{test_pool}:device:dev-1".to_vec())
    );
}

#[tokio::test]
async fn test_release_then_remove_then_show_empty() {
    let mut fake = FakeRedis::new();
    add(&mut fake, "10.0.0.1", 0).await;

    assert_eq!(release(&mut fake, "10.0.0.1").await, 0);
    assert_eq!(remove(&mut fake, "10.0.0.1").await, 1);
    assert!(show(&mut fake, "10.0.0.1").await.is_empty());
}

#[tokio::test]
async fn test_release_counts_only_changed_scores() {
    let mut fake = FakeRedis::new();
    add(&mut fake, "10.0.0.0/30", 0).await;
    let pool_key = b"{test_pool}:pool".to_vec();
    fake.keyspace
        .zsets
        .get_mut(&pool_key)
        .unwrap()
        .insert("10.0.0.2".to_string(), 1_999_999_999);

    // Only the address with a live expiry counts as released.
    assert_eq!(release(&mut fake, "10.0.0.0/30").await, 1);
}

#[tokio::test]
async fn test_remove_deletes_every_key() {
    let mut fake = FakeRedis::new();
    add(&mut fake, "10.0.0.1", 0).await;
    fake.link_device(POOL, "10.0.0.1", b"02:00:00:aa:bb:cc");

    assert_eq!(remove(&mut fake, "10.0.0.1").await, 1);

    assert!(pool_members(&fake).is_empty());
    assert!(
        !fake
            .keyspace
            .hashes
            .contains_key(&b"{test_pool}:ip:10.0.0.1".to_vec())
    );
    assert!(
        !fake
            .keyspace
            .strings
            .contains_key(&b"{test_pool}:device:02:00:00:aa:bb:cc".to_vec())
    );
    // A second removal finds nothing.
    assert_eq!(remove(&mut fake, "10.0.0.1").await, 0);
}

#[tokio::test]
async fn test_remove_tolerates_partially_removed_state() {
    let mut fake = FakeRedis::new();
    add(&mut fake, "10.0.0.1", 0).await;
    fake.link_device(POOL, "10.0.0.1", b"02:00:00:aa:bb:cc");

    // The ZSET entry is already gone but the hash and device key linger.
    fake.keyspace
        .zsets
        .get_mut(&b"{test_pool}:pool".to_vec())
        .unwrap()
        .remove("10.0.0.1");

    assert_eq!(remove(&mut fake, "10.0.0.1").await, 0);
    assert!(fake.keyspace.hashes.is_empty());
    assert!(fake.keyspace.strings.is_empty());
}

#[tokio::test]
async fn test_moved_redirect_yields_identical_state() {
    // Rewind safety: a MOVED at any point within the batch must leave
    // the pool exactly as a redirect-free run would.
    let clean = {
        let mut fake = FakeRedis::new();
        add(&mut fake, "10.0.0.0/29", 0).await;
        fake.keyspace
    };

    // 7 addresses at 4 commands each = 28 commands in the batch.
    for applied in [0, 1, 4, 13, 27, 28] {
        let mut fake = FakeRedis::with_fault(Fault { batch: 0, applied });
        let count = add(&mut fake, "10.0.0.0/29", 0).await;
        assert_eq!(
            fake.keyspace, clean,
            "state diverged with fault after {applied} commands"
        );
        assert_eq!(fake.follows, 1);
        // Addresses whose transaction completed before the redirect are
        // replayed as already-present, so the count can undershoot, but
        // never overshoot.
        assert!(count <= 7, "count {count} overshot with fault at {applied}");
    }
}

#[tokio::test]
async fn test_redirect_mid_release_yields_identical_state() {
    let seeded = || async {
        let mut fake = FakeRedis::new();
        add(&mut fake, "10.0.0.0/29", 0).await;
        let pool_key = b"{test_pool}:pool".to_vec();
        for member in ["10.0.0.2", "10.0.0.5"] {
            fake.keyspace
                .zsets
                .get_mut(&pool_key)
                .unwrap()
                .insert(member.to_string(), 1_999_999_999);
        }
        fake.link_device(POOL, "10.0.0.2", b"dev-2");
        fake
    };

    let clean = {
        let mut fake = seeded().await;
        release(&mut fake, "10.0.0.0/29").await;
        fake.keyspace
    };

    // The seeding ADD already committed batch 0; the release is batch 1.
    for applied in [0, 2, 3, 6] {
        let mut fake = seeded().await;
        fake.set_fault(Fault { batch: 1, applied });
        release(&mut fake, "10.0.0.0/29").await;
        assert_eq!(
            fake.keyspace, clean,
            "state diverged with fault after {applied} commands"
        );
    }
}

#[tokio::test]
async fn test_multiple_operations_in_order() {
    // A command line like `-a 10.0.0.0/30 -r 10.0.0.1 -d 10.0.0.2`
    // runs its operations serially in argument order.
    let mut fake = FakeRedis::new();
    assert_eq!(add(&mut fake, "10.0.0.0/30", 0).await, 3);
    assert_eq!(release(&mut fake, "10.0.0.1").await, 0);
    assert_eq!(remove(&mut fake, "10.0.0.2").await, 1);
    assert_eq!(pool_members(&fake), ["10.0.0.0", "10.0.0.1"]);
}

#[tokio::test]
async fn test_large_range_pipelines_in_batches() {
    // A /22 is 1023 usable addresses: more reply slots than one batch
    // carries, so the driver must split and still count every address.
    let mut fake = FakeRedis::new();
    assert_eq!(add(&mut fake, "10.4.0.0/22", 0).await, 1023);
    assert_eq!(pool_members(&fake).len(), 1023);
}
