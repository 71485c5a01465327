//! Accessors for the state the engine reads and writes between epochs.
//!
//! The engine never owns storage. Callers hand it something implementing these
//! traits; [`InMemoryLedger`] is the deterministic reference implementation.

pub mod memory;

pub use memory::InMemoryLedger;

use crate::core::error::Result;
use crate::math::Dec;
use crate::model::{ActorId, ActorType, Score, Stake, TimestampedValue, TopicId};
use serde::{Deserialize, Serialize};

/// The independent regret series tracked per topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegretFamily {
    Inferer,
    Forecaster,
    NaiveInferer,
    OneOutInfererInferer,
    OneOutInfererForecaster,
    OneOutForecasterInferer,
    OneOutForecasterForecaster,
    OneInForecasterInferer,
    OneInForecasterSelf,
}

impl RegretFamily {
    pub fn is_paired(&self) -> bool {
        !matches!(
            self,
            RegretFamily::Inferer | RegretFamily::Forecaster | RegretFamily::NaiveInferer
        )
    }
}

/// Identifies one regret value.
///
/// `counterpart` is the withheld worker for one-out families and the one-in
/// forecaster for one-in families; `worker` is the actor whose regret it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegretKey {
    pub family: RegretFamily,
    pub worker: ActorId,
    #[serde(default)]
    pub counterpart: Option<ActorId>,
}

impl RegretKey {
    pub fn single(family: RegretFamily, worker: impl Into<ActorId>) -> Self {
        Self {
            family,
            worker: worker.into(),
            counterpart: None,
        }
    }

    pub fn inferer(worker: &str) -> Self {
        Self::single(RegretFamily::Inferer, worker)
    }

    pub fn forecaster(worker: &str) -> Self {
        Self::single(RegretFamily::Forecaster, worker)
    }

    pub fn paired(family: RegretFamily, counterpart: impl Into<ActorId>, worker: impl Into<ActorId>) -> Self {
        Self {
            family,
            worker: worker.into(),
            counterpart: Some(counterpart.into()),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait RegretLedger {
    /// Returns the stored regret and whether none was ever written.
    ///
    /// When nothing was written the value is the topic's initial regret.
    fn get_regret(&self, topic_id: TopicId, key: &RegretKey) -> Result<(TimestampedValue, bool)>;

    fn set_regret(&mut self, topic_id: TopicId, key: &RegretKey, regret: TimestampedValue) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ScoreLedger {
    /// Unset entries come back as block 0 with a zero score.
    fn get_score_ema(&self, topic_id: TopicId, actor_type: ActorType, actor: &str) -> Result<Score>;

    fn set_score_ema(&mut self, topic_id: TopicId, actor_type: ActorType, score: Score) -> Result<()>;

    fn set_epoch_score(&mut self, topic_id: TopicId, actor_type: ActorType, score: Score) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait StakeLedger {
    fn get_stake(&self, topic_id: TopicId, reputer: &str) -> Result<Stake>;
}

#[cfg_attr(test, mockall::automock)]
pub trait CoefficientLedger {
    /// Reputers without a stored coefficient listen fully (1).
    fn get_coefficient(&self, topic_id: TopicId, reputer: &str) -> Result<Dec>;

    fn set_coefficient(&mut self, topic_id: TopicId, reputer: &str, coefficient: Dec) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait TopicStateLedger {
    fn get_initial_regret(&self, topic_id: TopicId) -> Result<Dec>;

    fn set_initial_regret(&mut self, topic_id: TopicId, regret: Dec) -> Result<()>;

    fn get_previous_quantile_score(&self, topic_id: TopicId, actor_type: ActorType) -> Result<Dec>;

    fn set_previous_quantile_score(&mut self, topic_id: TopicId, actor_type: ActorType, score: Dec) -> Result<()>;

    /// Combined loss of the latest reputer round, zero before the first one.
    fn get_network_loss(&self, topic_id: TopicId) -> Result<Dec>;

    fn set_network_loss(&mut self, topic_id: TopicId, loss: Dec) -> Result<()>;
}

/// Everything an epoch run touches.
pub trait Ledger: RegretLedger + ScoreLedger + StakeLedger + CoefficientLedger + TopicStateLedger {}

impl<T> Ledger for T where T: RegretLedger + ScoreLedger + StakeLedger + CoefficientLedger + TopicStateLedger {}

/// Stored EMAs of `actors`, in the order given.
pub fn score_ema_list<L: ScoreLedger + ?Sized>(
    ledger: &L,
    topic_id: TopicId,
    actor_type: ActorType,
    actors: &[ActorId],
) -> Result<Vec<Score>> {
    actors
        .iter()
        .map(|a| ledger.get_score_ema(topic_id, actor_type, a))
        .collect()
}
