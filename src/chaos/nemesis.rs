//! Nemesis - The Fault Injector.
//!
//! Periodically crashes and reboots manager replicas:
//! - KillPrimary: crashes the current primary
//! - KillBackup: crashes the replica that is not primary
//! - Reboot: restarts a dead replica
//!
//! At most one replica is ever down, and a replica is only killed while its
//! peer is in sync, so the directory always survives somewhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::ivy::{IvySystem, ManagerId, ReplicaRole, MANAGER_IDS};

/// Types of faults the Nemesis can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    KillPrimary,
    KillBackup,
    /// Reboot whichever replica is dead.
    Reboot,
    /// No operation (do nothing this tick).
    Noop,
}

/// Record of a fault injection event.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    pub timestamp: Instant,
    pub fault: Fault,
    pub target: Option<ManagerId>,
    pub details: String,
}

#[derive(Debug, Clone)]
pub struct NemesisConfig {
    /// How often to consider injecting a fault.
    pub tick_interval: Duration,
    /// Probability of injecting a fault on each tick (0.0 - 1.0).
    pub fault_probability: f64,
    /// Weights for KillPrimary and KillBackup.
    pub kill_weights: [f64; 2],
    /// Seed for the fault schedule.
    pub seed: u64,
}

impl Default for NemesisConfig {
    fn default() -> Self {
        NemesisConfig {
            tick_interval: Duration::from_millis(100),
            fault_probability: 0.5,
            kill_weights: [2.0, 1.0], // Favor the interesting case
            seed: 0,
        }
    }
}

pub struct Nemesis {
    config: NemesisConfig,
    rng: StdRng,
    history: Vec<FaultEvent>,
}

impl Nemesis {
    pub fn new(config: NemesisConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Nemesis {
            config,
            rng,
            history: Vec::new(),
        }
    }

    /// Roll the dice once. A dead replica is always rebooted before anything
    /// else is killed.
    pub fn step(&mut self, system: &IvySystem) -> FaultEvent {
        if self.rng.gen::<f64>() >= self.config.fault_probability {
            return self.inject(system, Fault::Noop);
        }
        if MANAGER_IDS.iter().any(|&id| !system.is_alive(id)) {
            return self.inject(system, Fault::Reboot);
        }
        let fault = self.choose_kill();
        self.inject(system, fault)
    }

    /// Run [`Nemesis::step`] every tick until `stop` is set, then reboot any
    /// replica still down.
    pub fn run(&mut self, system: &IvySystem, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(self.config.tick_interval);
            self.step(system);
        }
        self.inject(system, Fault::Reboot);
    }

    /// Inject a specific fault. Kills that would leave no in-sync replica
    /// are skipped.
    pub fn inject(&mut self, system: &IvySystem, fault: Fault) -> FaultEvent {
        let (target, details) = match fault {
            Fault::KillPrimary | Fault::KillBackup => self.kill(system, fault),
            Fault::Reboot => match MANAGER_IDS.into_iter().find(|&id| !system.is_alive(id)) {
                Some(id) => match system.reboot_manager(id) {
                    Ok(()) => (Some(id), format!("Rebooted {}", id)),
                    Err(e) => (Some(id), format!("Reboot of {} failed: {}", id, e)),
                },
                None => (None, "Nothing to reboot".to_string()),
            },
            Fault::Noop => (None, "No operation".to_string()),
        };

        let event = FaultEvent {
            timestamp: Instant::now(),
            fault,
            target,
            details,
        };
        if fault != Fault::Noop {
            info!(fault = ?event.fault, details = %event.details, "nemesis");
        }
        self.history.push(event.clone());
        event
    }

    fn kill(&self, system: &IvySystem, fault: Fault) -> (Option<ManagerId>, String) {
        let states = system.manager_states();
        if states.len() < MANAGER_IDS.len() || states.iter().any(|s| !s.synced) {
            return (None, "Skipped kill: a replica is down or out of sync".to_string());
        }

        let want_primary = fault == Fault::KillPrimary;
        let Some(victim) = states
            .iter()
            .find(|s| (s.role == ReplicaRole::Primary) == want_primary)
            .map(|s| s.id)
        else {
            return (None, "Skipped kill: no matching replica".to_string());
        };

        match system.kill_manager(victim) {
            Ok(()) => (Some(victim), format!("Killed {} ({:?})", victim, fault)),
            Err(e) => {
                warn!(replica = %victim, error = %e, "kill failed");
                (Some(victim), format!("Kill of {} failed: {}", victim, e))
            }
        }
    }

    fn choose_kill(&mut self) -> Fault {
        let total: f64 = self.config.kill_weights.iter().sum();
        let r = self.rng.gen::<f64>() * total;
        if r < self.config.kill_weights[0] {
            Fault::KillPrimary
        } else {
            Fault::KillBackup
        }
    }

    pub fn get_history(&self) -> &[FaultEvent] {
        &self.history
    }

    /// Faults that actually changed the cluster.
    pub fn disruptions(&self) -> usize {
        self.history
            .iter()
            .filter(|e| e.fault != Fault::Noop && e.target.is_some())
            .count()
    }
}
