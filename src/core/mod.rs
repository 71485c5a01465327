pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, RuntimeConfig, TopicParams};
pub use error::{EngineError, Result, WithStep};
