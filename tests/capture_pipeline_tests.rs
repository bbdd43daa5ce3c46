//! End-to-end tests for the pcap capture pipeline.
//!
//! Tests drive the public surface only: packets go in through the sharded
//! queue, workers run on their own threads, and assertions are made against
//! the produced files, the swapped counter blocks, and the packet pool.

use flowtap::capture::WorkerManager;
use flowtap::config::{CaptureConfig, QueueConfig};
use flowtap::packet::{
    timestamp_now, AclAction, EndpointData, MetaPacket, MetaPacketPool, PolicyData,
    ACTION_PACKET_CAPTURING,
};
use flowtap::queue::multi_queue;
use flowtap::WorkerCounter;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A capture pipeline with one worker, rooted in a temp directory.
fn start_pipeline(
    dir: &Path,
    max_file_period_second: u64,
) -> (
    WorkerManager,
    flowtap::MultiQueue,
    Arc<MetaPacketPool>,
) {
    let capture_config = CaptureConfig {
        base_directory: dir.to_string_lossy().into_owned(),
        max_file_period_second,
        ..Default::default()
    };
    let queue_config = QueueConfig {
        queue_count: 1,
        queue_size: 1024,
        tick_interval_second: 3600, // ticks are driven manually
    };
    let (queue, readers) = multi_queue(queue_config.queue_count, queue_config.queue_size);
    let pool = Arc::new(MetaPacketPool::new());
    let mut manager = WorkerManager::new(
        &capture_config,
        &queue_config,
        queue.clone(),
        readers,
        Arc::clone(&pool),
    );
    manager.start().unwrap();
    (manager, queue, pool)
}

/// A ToR IPv4 packet with one capture action, emitted on its source side.
fn tor_packet(pool: &MetaPacketPool, timestamp: Duration, acl_gid: u16) -> Box<MetaPacket> {
    let mut packet = pool.acquire();
    packet.timestamp = timestamp;
    packet.in_port = 0x30001;
    packet.ip_src = 0x0a000001;
    packet.ip_dst = 0x0a000002;
    packet.mac_src = 0x02;
    packet.mac_dst = 0x04;
    packet.l2_end_0 = true;
    packet.packet_len = 128;
    packet.raw = vec![0u8; 96];
    packet.endpoint_data = Some(EndpointData::default());
    packet.policy_data = Some(PolicyData {
        acl_actions: vec![AclAction {
            acl_gid,
            action_flags: ACTION_PACKET_CAPTURING,
        }],
    });
    packet
}

fn total(counters: Vec<WorkerCounter>) -> WorkerCounter {
    let mut sum = WorkerCounter::default();
    for counter in &counters {
        sum.merge(counter);
    }
    sum
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

// ============================================================================
// CAPTURE AND FINALIZATION
// ============================================================================

#[test]
fn test_tor_capture_creates_temp_then_final_file() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, queue, pool) = start_pipeline(dir.path(), 300);

    let now = timestamp_now();
    queue.send(0, tor_packet(&pool, now, 5)).unwrap();

    // The open file is a .pcap.temp under the ACL group directory.
    let acl_dir = dir.path().join("5");
    assert!(wait_for(|| {
        file_names(&acl_dir)
            .iter()
            .any(|n| n.starts_with("tor_000000000002_010000000001_") && n.ends_with(".0.pcap.temp"))
    }));

    manager.close();

    // Close promotes it to the final name; nothing temp remains.
    let names = file_names(&acl_dir);
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with(".0.pcap"), "got {}", names[0]);
    assert!(!names[0].ends_with(".temp"));

    let sum = total(manager.counters());
    assert_eq!(sum.file_creations, 1);
    assert_eq!(sum.file_closes, 1);
    assert_eq!(sum.buffered_count, 1);
    assert_eq!(sum.written_count, 1);

    assert_eq!(pool.len(), 1, "packet must be released");
}

#[test]
fn test_multiple_actions_fan_out_per_acl_group() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, queue, pool) = start_pipeline(dir.path(), 300);

    let now = timestamp_now();
    let mut packet = tor_packet(&pool, now, 5);
    packet.l2_end_1 = true; // both sides emit
    if let Some(policy) = packet.policy_data.as_mut() {
        policy.acl_actions.push(AclAction {
            acl_gid: 9,
            action_flags: ACTION_PACKET_CAPTURING,
        });
        // Ignored: zero GID and non-capturing flags.
        policy.acl_actions.push(AclAction {
            acl_gid: 0,
            action_flags: ACTION_PACKET_CAPTURING,
        });
        policy.acl_actions.push(AclAction {
            acl_gid: 7,
            action_flags: 0,
        });
    }
    queue.send(0, packet).unwrap();
    manager.close();

    // Two emit-set members x two capturing actions = four files.
    assert_eq!(file_names(&dir.path().join("5")).len(), 2);
    assert_eq!(file_names(&dir.path().join("9")).len(), 2);
    assert!(!dir.path().join("7").exists());
    assert!(!dir.path().join("0").exists());

    let sum = total(manager.counters());
    assert_eq!(sum.file_creations, 4);
    assert_eq!(sum.file_closes, 4);
    assert_eq!(sum.buffered_count, 4, "each write call is independent");
}

// ============================================================================
// TICK-DRIVEN ROTATION
// ============================================================================

#[test]
fn test_tick_rotates_aged_writer() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, queue, pool) = start_pipeline(dir.path(), 300);

    // First packet time far enough back that the period has expired.
    let stale = timestamp_now() - Duration::from_secs(700);
    queue.send(0, tor_packet(&pool, stale, 5)).unwrap();

    let acl_dir = dir.path().join("5");
    assert!(wait_for(|| file_names(&acl_dir)
        .iter()
        .any(|n| n.ends_with(".pcap.temp"))));

    queue.tick_all();
    assert!(wait_for(|| {
        let names = file_names(&acl_dir);
        names.len() == 1 && names[0].ends_with(".0.pcap")
    }));

    // Counter swaps are destructive; accumulate until the close shows up.
    let mut sum = WorkerCounter::default();
    assert!(wait_for(|| {
        for counter in manager.counters() {
            sum.merge(&counter);
        }
        sum.file_closes == 1
    }));
    manager.close();
}

#[test]
fn test_tick_without_aged_writers_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, queue, pool) = start_pipeline(dir.path(), 300);

    let now = timestamp_now();
    queue.send(0, tor_packet(&pool, now, 5)).unwrap();
    let acl_dir = dir.path().join("5");
    assert!(wait_for(|| !file_names(&acl_dir).is_empty()));

    queue.tick_all();
    queue.tick_all();
    std::thread::sleep(Duration::from_millis(50));

    // Still the same open temp file, no closes.
    let names = file_names(&acl_dir);
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with(".pcap.temp"));
    assert_eq!(total(manager.counters()).file_closes, 0);
    manager.close();
}

// ============================================================================
// DROP PATHS
// ============================================================================

#[test]
fn test_unroutable_packets_are_released_without_files() {
    let dir = tempfile::tempdir().unwrap();
    let (mut manager, queue, pool) = start_pipeline(dir.path(), 300);
    let now = timestamp_now();

    // Ingress port outside both tap ranges.
    let mut packet = tor_packet(&pool, now, 5);
    packet.in_port = 0x20000;
    queue.send(0, packet).unwrap();

    // Missing policy annotation (upstream invariant violation).
    let mut packet = tor_packet(&pool, now, 5);
    packet.policy_data = None;
    queue.send(0, packet).unwrap();

    // Empty emit set: ToR without any L2 terminus.
    let mut packet = tor_packet(&pool, now, 5);
    packet.l2_end_0 = false;
    queue.send(0, packet).unwrap();

    manager.close();

    assert_eq!(pool.len(), 3, "all packets must be released");
    let sum = total(manager.counters());
    assert_eq!(sum.file_creations, 0);
    assert!(file_names(dir.path()).is_empty());
}
