//! Per-block orchestration: inference synthesis and the reputer cycle.

pub mod epoch;
pub mod input;

pub use epoch::{EpochEngine, EpochReport, RoleSortition};
pub use input::{seed_ledger, EpochInput, PriorRegret};
