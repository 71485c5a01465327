pub mod core;
pub mod engine;
pub mod ledger;
pub mod math;
pub mod model;
pub mod scoring;
pub mod sortition;
pub mod synthesis;

pub use crate::core::{Config, EngineError, Result, TopicParams};
pub use crate::engine::{EpochEngine, EpochInput, EpochReport};
pub use crate::ledger::{InMemoryLedger, Ledger};
pub use crate::math::Dec;
