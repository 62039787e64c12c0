pub mod nemesis;
pub mod checker;
pub mod workload;

#[cfg(test)]
mod tests;

pub use nemesis::{Nemesis, NemesisConfig};
pub use checker::{Checker, SharedHistory};
pub use workload::Workload;
