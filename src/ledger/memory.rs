use super::{CoefficientLedger, RegretKey, RegretLedger, ScoreLedger, StakeLedger, TopicStateLedger};
use crate::core::error::Result;
use crate::math::Dec;
use crate::model::{ActorId, ActorType, Score, Stake, TimestampedValue, TopicId};
use std::collections::BTreeMap;

/// BTreeMap-backed ledger. Iteration order is deterministic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    regrets: BTreeMap<(TopicId, RegretKey), TimestampedValue>,
    score_emas: BTreeMap<(TopicId, ActorType, ActorId), Score>,
    epoch_scores: BTreeMap<(TopicId, ActorType, ActorId), Score>,
    stakes: BTreeMap<(TopicId, ActorId), Stake>,
    coefficients: BTreeMap<(TopicId, ActorId), Dec>,
    initial_regrets: BTreeMap<TopicId, Dec>,
    previous_quantiles: BTreeMap<(TopicId, ActorType), Dec>,
    network_losses: BTreeMap<TopicId, Dec>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stake(mut self, topic_id: TopicId, reputer: &str, stake: Stake) -> Self {
        self.stakes.insert((topic_id, reputer.to_string()), stake);
        self
    }

    pub fn insert_stake(&mut self, topic_id: TopicId, reputer: &str, stake: Stake) {
        self.stakes.insert((topic_id, reputer.to_string()), stake);
    }

    pub fn epoch_scores(&self, topic_id: TopicId, actor_type: ActorType) -> Vec<Score> {
        self.epoch_scores
            .iter()
            .filter(|((t, a, _), _)| *t == topic_id && *a == actor_type)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn score_emas(&self, topic_id: TopicId, actor_type: ActorType) -> Vec<Score> {
        self.score_emas
            .iter()
            .filter(|((t, a, _), _)| *t == topic_id && *a == actor_type)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn regret_count(&self, topic_id: TopicId) -> usize {
        self.regrets.keys().filter(|(t, _)| *t == topic_id).count()
    }
}

impl RegretLedger for InMemoryLedger {
    fn get_regret(&self, topic_id: TopicId, key: &RegretKey) -> Result<(TimestampedValue, bool)> {
        match self.regrets.get(&(topic_id, key.clone())) {
            Some(regret) => Ok((*regret, false)),
            None => {
                let initial = self.get_initial_regret(topic_id)?;
                Ok((
                    TimestampedValue {
                        block_height: 0,
                        value: initial,
                    },
                    true,
                ))
            }
        }
    }

    fn set_regret(&mut self, topic_id: TopicId, key: &RegretKey, regret: TimestampedValue) -> Result<()> {
        self.regrets.insert((topic_id, key.clone()), regret);
        Ok(())
    }
}

impl ScoreLedger for InMemoryLedger {
    fn get_score_ema(&self, topic_id: TopicId, actor_type: ActorType, actor: &str) -> Result<Score> {
        Ok(self
            .score_emas
            .get(&(topic_id, actor_type, actor.to_string()))
            .cloned()
            .unwrap_or_else(|| Score::new(topic_id, 0, actor, Dec::ZERO)))
    }

    fn set_score_ema(&mut self, topic_id: TopicId, actor_type: ActorType, score: Score) -> Result<()> {
        self.score_emas
            .insert((topic_id, actor_type, score.address.clone()), score);
        Ok(())
    }

    fn set_epoch_score(&mut self, topic_id: TopicId, actor_type: ActorType, score: Score) -> Result<()> {
        self.epoch_scores
            .insert((topic_id, actor_type, score.address.clone()), score);
        Ok(())
    }
}

impl StakeLedger for InMemoryLedger {
    fn get_stake(&self, topic_id: TopicId, reputer: &str) -> Result<Stake> {
        Ok(self
            .stakes
            .get(&(topic_id, reputer.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

impl CoefficientLedger for InMemoryLedger {
    fn get_coefficient(&self, topic_id: TopicId, reputer: &str) -> Result<Dec> {
        Ok(self
            .coefficients
            .get(&(topic_id, reputer.to_string()))
            .copied()
            .unwrap_or(Dec::ONE))
    }

    fn set_coefficient(&mut self, topic_id: TopicId, reputer: &str, coefficient: Dec) -> Result<()> {
        self.coefficients.insert((topic_id, reputer.to_string()), coefficient);
        Ok(())
    }
}

impl TopicStateLedger for InMemoryLedger {
    fn get_initial_regret(&self, topic_id: TopicId) -> Result<Dec> {
        Ok(self.initial_regrets.get(&topic_id).copied().unwrap_or(Dec::ZERO))
    }

    fn set_initial_regret(&mut self, topic_id: TopicId, regret: Dec) -> Result<()> {
        self.initial_regrets.insert(topic_id, regret);
        Ok(())
    }

    fn get_previous_quantile_score(&self, topic_id: TopicId, actor_type: ActorType) -> Result<Dec> {
        Ok(self
            .previous_quantiles
            .get(&(topic_id, actor_type))
            .copied()
            .unwrap_or(Dec::ZERO))
    }

    fn set_previous_quantile_score(&mut self, topic_id: TopicId, actor_type: ActorType, score: Dec) -> Result<()> {
        self.previous_quantiles.insert((topic_id, actor_type), score);
        Ok(())
    }

    fn get_network_loss(&self, topic_id: TopicId) -> Result<Dec> {
        Ok(self.network_losses.get(&topic_id).copied().unwrap_or(Dec::ZERO))
    }

    fn set_network_loss(&mut self, topic_id: TopicId, loss: Dec) -> Result<()> {
        self.network_losses.insert(topic_id, loss);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RegretFamily;

    #[test]
    fn test_missing_regret_reports_no_prior_with_initial_value() {
        let mut ledger = InMemoryLedger::new();
        ledger.set_initial_regret(1, Dec::from_i64(5)).unwrap();
        let key = RegretKey::single(RegretFamily::Inferer, "w1");
        let (regret, no_prior) = ledger.get_regret(1, &key).unwrap();
        assert!(no_prior);
        assert_eq!(regret.value, Dec::from_i64(5));

        ledger
            .set_regret(1, &key, TimestampedValue { block_height: 7, value: Dec::ONE })
            .unwrap();
        let (regret, no_prior) = ledger.get_regret(1, &key).unwrap();
        assert!(!no_prior);
        assert_eq!(regret.block_height, 7);
    }

    #[test]
    fn test_paired_keys_are_distinct() {
        let mut ledger = InMemoryLedger::new();
        let ab = RegretKey::paired(RegretFamily::OneInForecasterInferer, "a", "b");
        let ba = RegretKey::paired(RegretFamily::OneInForecasterInferer, "b", "a");
        ledger
            .set_regret(1, &ab, TimestampedValue { block_height: 1, value: Dec::ONE })
            .unwrap();
        assert!(!ledger.get_regret(1, &ab).unwrap().1);
        assert!(ledger.get_regret(1, &ba).unwrap().1);
    }

    #[test]
    fn test_defaults() {
        let ledger = InMemoryLedger::new().with_stake(1, "r1", 100);
        assert_eq!(ledger.get_stake(1, "r1").unwrap(), 100);
        assert_eq!(ledger.get_stake(1, "r2").unwrap(), 0);
        assert_eq!(ledger.get_coefficient(1, "r1").unwrap(), Dec::ONE);
        assert!(ledger.get_score_ema(1, ActorType::Reputer, "r1").unwrap().is_unset());
        assert_eq!(ledger.get_network_loss(1).unwrap(), Dec::ZERO);
    }
}
