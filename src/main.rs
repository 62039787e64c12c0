mod chaos;
mod ivy;

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chaos::{Checker, Nemesis, NemesisConfig, SharedHistory, Workload};
use ivy::{IvyConfig, IvyError, IvySystem, ManagerId, NodeId, PageId};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        None | Some("basic") => run_basic(),
        Some("failover") => run_failover(),
        Some("chaos") => {
            let seed = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
            run_chaos(seed)
        }
        Some(_) => {
            print_usage();
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("scenario failed: {}", e);
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: ivyft [scenario]");
    eprintln!("Scenarios:");
    eprintln!("  basic        - 10 nodes, N5 writes P0, every node reads it");
    eprintln!("  failover     - kill and reboot replicas between writes");
    eprintln!("  chaos [seed] - random workload under a random fault schedule");
    eprintln!("  (none)       - Same as 'basic'");
}

/// Read `page` from every node and compare with `expected`.
fn read_everywhere(system: &IvySystem, page: PageId, expected: &str) -> Result<(), IvyError> {
    for node in system.node_ids() {
        let value = system.node_read(node, page)?;
        if value != expected {
            eprintln!("{} read {:?} from {}, expected {:?}", node, value, page, expected);
            process::exit(1);
        }
    }
    println!("all nodes read {:?} from {}", expected, page);
    Ok(())
}

fn run_basic() -> Result<(), IvyError> {
    let system = IvySystem::start(IvyConfig::default())?;
    system.node_write(NodeId(5), PageId(0), "hello")?;
    read_everywhere(&system, PageId(0), "hello")
}

fn run_failover() -> Result<(), IvyError> {
    let cm1 = ManagerId(1);
    let cm2 = ManagerId(2);
    let system = IvySystem::start(IvyConfig::default())?;

    // Primary gone before any request.
    system.kill_manager(cm1)?;
    system.node_write(NodeId(10), PageId(0), "page zero")?;
    system.node_write(NodeId(10), PageId(1), "page one")?;
    read_everywhere(&system, PageId(0), "page zero")?;
    read_everywhere(&system, PageId(1), "page one")?;

    // Alternate reboot and kill between writes.
    system.reboot_manager(cm1)?;
    let mut dead = cm2;
    system.kill_manager(dead)?;
    for n in 1..=6u32 {
        let value = format!("write {}", n);
        system.node_write(NodeId(n), PageId(0), value.clone())?;
        read_everywhere(&system, PageId(0), &value)?;

        let live = if dead == cm1 { cm2 } else { cm1 };
        system.reboot_manager(dead)?;
        system.kill_manager(live)?;
        dead = live;
    }
    println!("primary is now {:?}", system.primary());
    Ok(())
}

fn run_chaos(seed: u64) -> Result<(), IvyError> {
    let config = IvyConfig::default()
        .with_request_timeout(Duration::from_millis(400))
        .with_election_timeout(Duration::from_millis(100))
        .with_tick_interval(Duration::from_millis(2));
    let system = IvySystem::start(config)?;
    let history = SharedHistory::new();
    let stop = AtomicBool::new(false);
    let mut nemesis = Nemesis::new(NemesisConfig {
        seed,
        ..Default::default()
    });
    let workload = Workload {
        clients: system.node_ids(),
        pages: 4,
        ops_per_client: 20,
        write_ratio: 0.3,
        seed,
    };

    let successful = thread::scope(|s| {
        let nemesis_thread = s.spawn(|| nemesis.run(&system, &stop));
        let successful = workload.run(&system, &history);
        stop.store(true, Ordering::SeqCst);
        let _ = nemesis_thread.join();
        successful
    });

    let checker = Checker::new();
    let result = checker.check_history(&history.snapshot());
    let passed = result.passed;
    let mut violations = result.violations;
    violations.extend(checker.check_cluster(&system.manager_states(), &system.node_snapshots()));
    violations.extend(checker.check_halts(&system.fatal_errors()));

    println!("=== Chaos Results (seed {}) ===", seed);
    println!("Operations: {} ({} successful)", result.stats.total_operations, successful);
    println!("Reads: {}, writes: {}", result.stats.reads, result.stats.writes);
    println!("Faults injected: {}", nemesis.disruptions());
    let started = nemesis.get_history().first().map(|e| e.timestamp);
    for event in nemesis.get_history().iter().filter(|e| e.target.is_some()) {
        let at = started.map(|t| event.timestamp.duration_since(t)).unwrap_or_default();
        println!("  +{:>6.0?} {:?}: {}", at, event.fault, event.details);
    }
    println!("Messages sent: {}, dropped: {}", system.network().messages_sent(), system.network().messages_dropped());
    for violation in &violations {
        println!(
            "VIOLATION {:?}: {} (history entries {:?})",
            violation.kind, violation.description, violation.related_entries
        );
    }
    if !passed || !violations.is_empty() {
        process::exit(1);
    }
    println!("=== PASSED ===");
    Ok(())
}
