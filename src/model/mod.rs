//! Data model shared by synthesis, loss aggregation and scoring.

pub mod bundle;
pub mod inference;

pub use bundle::{
    OneOutInfererForecasterValues, ReputerValueBundle, ValueBundle, WithheldWorkerAttributedValue,
    WorkerAttributedValue,
};
pub use inference::{Forecast, ForecastElement, Inference};

use crate::math::Dec;
use serde::{Deserialize, Serialize};

pub type TopicId = u64;
pub type BlockHeight = i64;
pub type ActorId = String;
pub type Stake = u128;
pub type ListeningCoefficient = Dec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Inferer,
    Forecaster,
    Reputer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nonce {
    pub block_height: BlockHeight,
}

impl Nonce {
    pub fn new(block_height: BlockHeight) -> Self {
        Self { block_height }
    }
}

/// Pairs the reputer round with the worker round it evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputerRequestNonce {
    pub reputer_nonce: Nonce,
}

/// A regret (or any EMA-tracked value) stamped with the block that wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimestampedValue {
    pub block_height: BlockHeight,
    pub value: Dec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    pub address: ActorId,
    pub score: Dec,
}

impl Score {
    pub fn new(topic_id: TopicId, block_height: BlockHeight, address: impl Into<ActorId>, score: Dec) -> Self {
        Self {
            topic_id,
            block_height,
            address: address.into(),
            score,
        }
    }

    /// Never-written entries come back from ledgers as block 0 with a zero score.
    pub fn is_unset(&self) -> bool {
        self.block_height == 0 && self.score.is_zero()
    }
}
