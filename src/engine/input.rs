use crate::core::error::Result;
use crate::ledger::{InMemoryLedger, RegretKey, RegretLedger, TopicStateLedger};
use crate::math::Dec;
use crate::model::{ActorId, BlockHeight, Forecast, Inference, ReputerValueBundle, Stake, TimestampedValue, TopicId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorRegret {
    pub key: RegretKey,
    pub value: TimestampedValue,
}

/// One block of work for a topic, as read by the binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochInput {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    #[serde(default)]
    pub inferences: Vec<Inference>,
    #[serde(default)]
    pub forecasts: Vec<Forecast>,
    #[serde(default)]
    pub reputer_bundles: Vec<ReputerValueBundle>,
    #[serde(default)]
    pub stakes: BTreeMap<ActorId, Stake>,
    #[serde(default)]
    pub prior_regrets: Vec<PriorRegret>,
    #[serde(default)]
    pub initial_regret: Option<Dec>,
    /// Combined loss of the previous reputer round.
    #[serde(default)]
    pub network_combined_loss: Option<Dec>,
}

/// Loads stakes, prior regrets and topic state from `input` into `ledger`.
pub fn seed_ledger(ledger: &mut InMemoryLedger, input: &EpochInput) -> Result<()> {
    let topic_id = input.topic_id;
    for (reputer, stake) in &input.stakes {
        ledger.insert_stake(topic_id, reputer, *stake);
    }
    for prior in &input.prior_regrets {
        ledger.set_regret(topic_id, &prior.key, prior.value)?;
    }
    if let Some(initial) = input.initial_regret {
        ledger.set_initial_regret(topic_id, initial)?;
    }
    if let Some(loss) = input.network_combined_loss {
        ledger.set_network_loss(topic_id, loss)?;
    }
    debug!(
        topic_id,
        stakes = input.stakes.len(),
        regrets = input.prior_regrets.len(),
        "ledger seeded"
    );
    Ok(())
}
