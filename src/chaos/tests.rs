//! Chaos Integration Tests.
//!
//! Client workloads running while replicas are killed and rebooted, followed
//! by a full coherence audit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::ivy::{IvyConfig, IvySystem, ManagerId, NodeId, PageId};

use super::checker::{Checker, SharedHistory};
use super::nemesis::{Fault, Nemesis, NemesisConfig};
use super::workload::Workload;

fn chaos_config(nodes: u32) -> IvyConfig {
    IvyConfig::new(nodes)
        .with_request_timeout(Duration::from_millis(400))
        .with_election_timeout(Duration::from_millis(100))
        .with_tick_interval(Duration::from_millis(2))
}

/// Audit everything the checker knows about.
fn audit(system: &IvySystem, history: &SharedHistory) {
    let checker = Checker::new();
    let result = checker.check_history(&history.snapshot());
    assert!(result.passed, "History violations: {:#?}", result.violations);
    assert_eq!(result.stats.failed_operations, 0);

    let cluster = checker.check_cluster(&system.manager_states(), &system.node_snapshots());
    assert!(cluster.is_empty(), "Cluster violations: {:#?}", cluster);

    let halts = checker.check_halts(&system.fatal_errors());
    assert!(halts.is_empty(), "Halted actors: {:#?}", halts);
}

/// Test: Random Kill/Reboot
///
/// Multi-threaded chaos test with:
/// - 5 client nodes, each on its own thread, over 3 pages
/// - Nemesis killing the primary or backup and rebooting it on a seeded schedule
/// - History and cluster audit at the end
#[test]
fn test_random_kill_reboot() {
    for seed in [1u64, 2, 3] {
        let system = IvySystem::start(chaos_config(5)).unwrap();
        let history = SharedHistory::new();
        let stop = AtomicBool::new(false);
        let mut nemesis = Nemesis::new(NemesisConfig {
            tick_interval: Duration::from_millis(150),
            seed,
            ..Default::default()
        });

        let workload = Workload {
            clients: system.node_ids(),
            pages: 3,
            ops_per_client: 12,
            write_ratio: 0.5,
            seed,
        };

        let successful = thread::scope(|s| {
            let nemesis_thread = s.spawn(|| nemesis.run(&system, &stop));
            let successful = workload.run(&system, &history);
            stop.store(true, Ordering::SeqCst);
            let _ = nemesis_thread.join();
            successful
        });

        eprintln!(
            "seed {}: {} ops, {} disruptions",
            seed,
            successful,
            nemesis.disruptions()
        );
        assert_eq!(successful, 60);
        audit(&system, &history);
    }
}

/// Test: Failover Under Load
///
/// 1. Readers and writers run on every node
/// 2. The primary is killed, then rebooted, then the new primary is killed
/// 3. Every operation completes and the history is coherent
#[test]
fn test_scripted_failover_under_load() {
    let system = IvySystem::start(chaos_config(4)).unwrap();
    let history = SharedHistory::new();
    let mut nemesis = Nemesis::new(NemesisConfig::default());

    let workload = Workload {
        clients: system.node_ids(),
        pages: 2,
        ops_per_client: 15,
        write_ratio: 0.4,
        seed: 99,
    };

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            nemesis.inject(&system, Fault::KillPrimary);
            thread::sleep(Duration::from_millis(300));
            nemesis.inject(&system, Fault::Reboot);
            thread::sleep(Duration::from_millis(100));
            nemesis.inject(&system, Fault::KillPrimary);
            thread::sleep(Duration::from_millis(300));
            nemesis.inject(&system, Fault::Reboot);
        });
        workload.run(&system, &history);
    });

    audit(&system, &history);
}

/// Test: Backup Crash Is Invisible
///
/// Killing and rebooting the backup never delays or breaks client traffic.
#[test]
fn test_backup_crash_is_invisible() {
    let system = IvySystem::start(chaos_config(3)).unwrap();
    system.node_write(NodeId(1), PageId(0), "a").unwrap();
    let primary = system.primary().unwrap();
    let backup = if primary == ManagerId(1) { ManagerId(2) } else { ManagerId(1) };

    for round in 0..3 {
        system.kill_manager(backup).unwrap();
        let value = format!("round {}", round);
        system.node_write(NodeId(2), PageId(0), value.clone()).unwrap();
        assert_eq!(system.node_read(NodeId(3), PageId(0)).unwrap(), value);
        system.reboot_manager(backup).unwrap();
        assert_eq!(system.primary(), Some(primary));
    }

    // The rebooted backup can take over with everything it learned.
    system.kill_manager(primary).unwrap();
    assert_eq!(system.node_read(NodeId(1), PageId(0)).unwrap(), "round 2");
    assert_eq!(system.primary(), Some(backup));
}
