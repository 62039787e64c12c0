//! Random client workload.
//!
//! Each client node runs on its own thread and issues a seeded mix of reads
//! and writes over a small set of pages, recording every operation into a
//! shared history. Written values are unique so the checker can tell which
//! write a read observed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::ivy::{IvySystem, NodeId, PageId};

use super::checker::{Operation, OperationResult, SharedHistory};

#[derive(Debug, Clone)]
pub struct Workload {
    pub clients: Vec<NodeId>,
    pub pages: u64,
    pub ops_per_client: u32,
    /// Probability that an operation is a write.
    pub write_ratio: f64,
    pub seed: u64,
}

impl Workload {
    /// Run every client to completion. Returns the number of successful
    /// operations.
    pub fn run(&self, system: &IvySystem, history: &SharedHistory) -> u64 {
        let successful = AtomicU64::new(0);

        thread::scope(|s| {
            for &node in &self.clients {
                let successful = &successful;
                let history = history.clone();
                let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(u64::from(node.0)));
                s.spawn(move || {
                    for i in 0..self.ops_per_client {
                        let page = PageId(rng.gen_range(0..self.pages));
                        let start = Instant::now();

                        let (operation, result) = if rng.gen_bool(self.write_ratio) {
                            let value = format!("{}#{}", node, i);
                            let result = system
                                .node_write(node, page, value.clone())
                                .map(|()| String::new());
                            let result = match OperationResult::from(&result) {
                                OperationResult::Success { .. } => OperationResult::Success { value: None },
                                other => other,
                            };
                            (Operation::Write { node, page, value }, result)
                        } else {
                            let result = system.node_read(node, page);
                            (Operation::Read { node, page }, OperationResult::from(&result))
                        };

                        debug!(node = %node, op = ?operation, result = ?result, "client op");
                        if matches!(result, OperationResult::Success { .. } | OperationResult::NotFound) {
                            successful.fetch_add(1, Ordering::SeqCst);
                        }
                        history.record(start, operation, result);
                    }
                });
            }
        });

        successful.load(Ordering::SeqCst)
    }
}
