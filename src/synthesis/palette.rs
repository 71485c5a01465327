//! The working set one synthesis scenario runs over.
//!
//! A palette is a plain value. Every what-if (leave one out, keep one in,
//! alternative regret family) starts from an owned copy, so the scenarios of
//! one epoch never observe each other's edits.

use super::bootstrap::{ForecasterStatus, InfererStatus, StatefulRegret};
use super::forecast_implied::calc_forecast_implied_inferences;
use super::weight::{calc_weights_given_workers, RegretInformedWeights};
use crate::core::config::TopicParams;
use crate::core::error::{Result, WithStep};
use crate::ledger::{RegretKey, RegretLedger};
use crate::math::Dec;
use crate::model::inference::{latest_forecasts_by_forecaster, latest_inferences_by_inferer};
use crate::model::{ActorId, BlockHeight, Forecast, Inference, TopicId};
use std::collections::BTreeMap;
use tracing::debug;

/// Everything synthesis needs for one topic at one block.
#[derive(Debug, Clone)]
pub struct SynthRequest {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    pub inferences: Vec<Inference>,
    pub forecasts: Vec<Forecast>,
    /// Combined loss of the latest reputer round.
    pub network_combined_loss: Dec,
    pub epsilon: Dec,
    pub epsilon_safe_div: Dec,
    pub p_norm: Dec,
    pub c_norm: Dec,
}

impl SynthRequest {
    pub fn new(
        topic_id: TopicId,
        block_height: BlockHeight,
        inferences: Vec<Inference>,
        forecasts: Vec<Forecast>,
        network_combined_loss: Dec,
        params: &TopicParams,
    ) -> Self {
        Self {
            topic_id,
            block_height,
            inferences,
            forecasts,
            network_combined_loss,
            epsilon: params.epsilon,
            epsilon_safe_div: params.epsilon_safe_div,
            p_norm: params.p_norm,
            c_norm: params.c_norm,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthPalette {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    /// Sorted, unique.
    pub inferers: Vec<ActorId>,
    pub inference_by_worker: BTreeMap<ActorId, Inference>,
    pub inferer_regrets: BTreeMap<ActorId, StatefulRegret>,
    /// Sorted, unique.
    pub forecasters: Vec<ActorId>,
    pub forecast_by_worker: BTreeMap<ActorId, Forecast>,
    pub forecast_implied_inferences: BTreeMap<ActorId, Dec>,
    pub forecaster_regrets: BTreeMap<ActorId, StatefulRegret>,
    pub inferer_status: InfererStatus,
    pub forecaster_status: ForecasterStatus,
    pub network_combined_loss: Dec,
    pub epsilon: Dec,
    pub epsilon_safe_div: Dec,
    pub p_norm: Dec,
    pub c_norm: Dec,
}

impl SynthPalette {
    /// Deduplicates the request, loads inferer and forecaster regrets and
    /// derives the forecast-implied inferences.
    pub fn build<L: RegretLedger + ?Sized>(request: &SynthRequest, ledger: &L) -> Result<Self> {
        let inference_by_worker = latest_inferences_by_inferer(&request.inferences);
        let forecast_by_worker = latest_forecasts_by_forecaster(&request.forecasts);
        let inferers: Vec<ActorId> = inference_by_worker.keys().cloned().collect();
        let forecasters: Vec<ActorId> = forecast_by_worker.keys().cloned().collect();

        let palette = SynthPalette {
            topic_id: request.topic_id,
            block_height: request.block_height,
            inferers,
            inference_by_worker,
            inferer_regrets: BTreeMap::new(),
            forecasters,
            forecast_by_worker,
            forecast_implied_inferences: BTreeMap::new(),
            forecaster_regrets: BTreeMap::new(),
            inferer_status: InfererStatus::AllNew,
            forecaster_status: ForecasterStatus::AllNew,
            network_combined_loss: request.network_combined_loss,
            epsilon: request.epsilon,
            epsilon_safe_div: request.epsilon_safe_div,
            p_norm: request.p_norm,
            c_norm: request.c_norm,
        };
        let mut palette = palette.with_regret_family(ledger, RegretKey::inferer, RegretKey::forecaster)?;
        palette.forecast_implied_inferences = calc_forecast_implied_inferences(&palette)?;
        debug!(
            topic_id = palette.topic_id,
            inferers = palette.inferers.len(),
            forecasters = palette.forecasters.len(),
            inferer_status = ?palette.inferer_status,
            "palette built"
        );
        Ok(palette)
    }

    /// Copy of the palette with regrets re-read under other keys.
    ///
    /// `inferer_key` and `forecaster_key` name the ledger entry for each worker.
    pub fn with_regret_family<L, FI, FF>(&self, ledger: &L, inferer_key: FI, forecaster_key: FF) -> Result<Self>
    where
        L: RegretLedger + ?Sized,
        FI: Fn(&str) -> RegretKey,
        FF: Fn(&str) -> RegretKey,
    {
        let inferer_regrets = load_regrets(ledger, self.topic_id, &self.inferers, inferer_key)?;
        let forecaster_regrets = load_regrets(ledger, self.topic_id, &self.forecasters, forecaster_key)?;
        Ok(self.clone().with_regrets(inferer_regrets, forecaster_regrets))
    }

    /// Replaces both regret maps and recomputes the bootstrap statuses.
    pub fn with_regrets(
        mut self,
        inferer_regrets: BTreeMap<ActorId, StatefulRegret>,
        forecaster_regrets: BTreeMap<ActorId, StatefulRegret>,
    ) -> Self {
        self.inferer_regrets = inferer_regrets;
        self.forecaster_regrets = forecaster_regrets;
        self.refresh_inferer_status();
        self.refresh_forecaster_status();
        self
    }

    /// Copy without one inferer. Forecast-implied inferences are left as they were.
    pub fn without_inferer(&self, withheld: &str) -> Self {
        let remaining: Vec<ActorId> = self.inferers.iter().filter(|w| *w != withheld).cloned().collect();
        self.clone().update_inferers_info(remaining)
    }

    pub fn without_forecaster(&self, withheld: &str) -> Self {
        let remaining: Vec<ActorId> = self.forecasters.iter().filter(|w| *w != withheld).cloned().collect();
        self.clone().update_forecasters_info(remaining)
    }

    pub fn only_forecaster(&self, kept: &str) -> Self {
        let remaining: Vec<ActorId> = self.forecasters.iter().filter(|w| *w == kept).cloned().collect();
        self.clone().update_forecasters_info(remaining)
    }

    /// Same palette with the forecaster set emptied.
    pub fn without_forecasters(&self) -> Self {
        self.clone().update_forecasters_info(Vec::new())
    }

    /// Narrows the inferer set and every inferer-keyed map to `inferers`.
    pub fn update_inferers_info(mut self, inferers: Vec<ActorId>) -> Self {
        self.inference_by_worker.retain(|w, _| inferers.contains(w));
        self.inferer_regrets.retain(|w, _| inferers.contains(w));
        self.inferers = inferers;
        self.refresh_inferer_status();
        self
    }

    /// Narrows the forecaster set and every forecaster-keyed map to `forecasters`.
    pub fn update_forecasters_info(mut self, forecasters: Vec<ActorId>) -> Self {
        self.forecast_by_worker.retain(|w, _| forecasters.contains(w));
        self.forecast_implied_inferences.retain(|w, _| forecasters.contains(w));
        self.forecaster_regrets.retain(|w, _| forecasters.contains(w));
        self.forecasters = forecasters;
        self.refresh_forecaster_status();
        self
    }

    /// Recomputes the forecast-implied inferences against the current inferer set.
    pub fn with_recomputed_forecast_implied(mut self) -> Result<Self> {
        self.forecast_implied_inferences = calc_forecast_implied_inferences(&self)?;
        Ok(self)
    }

    fn refresh_inferer_status(&mut self) {
        self.inferer_status = InfererStatus::from_regrets(
            self.inferers
                .iter()
                .filter_map(|w| self.inferer_regrets.get_key_value(w)),
        );
    }

    fn refresh_forecaster_status(&mut self) {
        self.forecaster_status = ForecasterStatus::from_regrets(
            self.forecasters
                .iter()
                .filter_map(|w| self.forecaster_regrets.get_key_value(w)),
        );
    }

    /// Regret-informed weights for the workers in the palette.
    ///
    /// Empty while fewer than two inferers have history, since no weighting is
    /// needed then.
    pub fn calc_weights(&self) -> Result<RegretInformedWeights> {
        if self.inferer_status.is_bootstrapping() {
            return Ok(RegretInformedWeights::default());
        }
        let inferers: Vec<(&ActorId, StatefulRegret)> = self
            .inferers
            .iter()
            .filter_map(|w| self.inferer_regrets.get(w).map(|r| (w, *r)))
            .collect();
        let forecasters: Vec<(&ActorId, StatefulRegret)> = self
            .forecasters
            .iter()
            .filter_map(|w| self.forecaster_regrets.get(w).map(|r| (w, *r)))
            .collect();
        calc_weights_given_workers(&inferers, &forecasters, self.epsilon, self.p_norm, self.c_norm)
    }

    /// Σ w·value / Σ w over the palette, honoring the bootstrap rules.
    ///
    /// All-new inferers are averaged uniformly. With exactly one established
    /// inferer its value is returned as is. Otherwise inferers, and forecasters
    /// when there is more than one established inferer, contribute by weight.
    /// Returns NaN when nothing contributes.
    pub fn calc_weighted_inference(&self, weights: &RegretInformedWeights) -> Result<Dec> {
        match &self.inferer_status {
            InfererStatus::AllNew => {
                let values: Vec<Dec> = self
                    .inferers
                    .iter()
                    .filter_map(|w| self.inference_by_worker.get(w).map(|i| i.value))
                    .collect();
                if values.is_empty() {
                    return Ok(Dec::NAN);
                }
                crate::math::utils::mean(&values).step("uniform inference average")
            }
            InfererStatus::AllNewExceptOne(single) => Ok(self
                .inference_by_worker
                .get(single)
                .map(|i| i.value)
                .unwrap_or(Dec::NAN)),
            InfererStatus::NotNew => {
                let mut acc = WeightAccumulator::default();
                for inferer in &self.inferers {
                    let (Some(inference), Some(weight), Some(regret)) = (
                        self.inference_by_worker.get(inferer),
                        weights.inferer(inferer),
                        self.inferer_regrets.get(inferer),
                    ) else {
                        continue;
                    };
                    acc.accumulate(inference.value, weight, regret.no_prior, false)?;
                }
                for forecaster in &self.forecasters {
                    let (Some(value), Some(weight), Some(regret)) = (
                        self.forecast_implied_inferences.get(forecaster),
                        weights.forecaster(forecaster),
                        self.forecaster_regrets.get(forecaster),
                    ) else {
                        continue;
                    };
                    acc.accumulate(*value, weight, regret.no_prior, false)?;
                }
                acc.finish(self.epsilon)
            }
        }
    }
}

fn load_regrets<L, F>(
    ledger: &L,
    topic_id: TopicId,
    workers: &[ActorId],
    key: F,
) -> Result<BTreeMap<ActorId, StatefulRegret>>
where
    L: RegretLedger + ?Sized,
    F: Fn(&str) -> RegretKey,
{
    workers
        .iter()
        .map(|worker| {
            let (regret, no_prior) = ledger.get_regret(topic_id, &key(worker))?;
            Ok((worker.clone(), StatefulRegret::new(regret.value, no_prior)))
        })
        .collect()
}

/// Running numerator and denominator of a weighted inference.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightAccumulator {
    weighted_sum: Dec,
    weight_sum: Dec,
    contributors: usize,
}

impl WeightAccumulator {
    /// Adds one worker's value.
    ///
    /// A worker without history is skipped unless all its peers are new too,
    /// in which case everyone counts with weight one. Zero and NaN weights are
    /// skipped.
    pub fn accumulate(&mut self, value: Dec, weight: Dec, no_prior: bool, all_peers_new: bool) -> Result<()> {
        if no_prior && !all_peers_new {
            return Ok(());
        }
        if all_peers_new {
            self.weighted_sum = self.weighted_sum.add(value).step("accumulate inference")?;
            self.weight_sum = self.weight_sum.add(Dec::ONE).step("accumulate weight")?;
            self.contributors += 1;
            return Ok(());
        }
        if weight.is_nan() || weight.is_zero() {
            return Ok(());
        }
        let term = weight.mul(value).step("weight times inference")?;
        self.weighted_sum = self.weighted_sum.add(term).step("accumulate inference")?;
        self.weight_sum = self.weight_sum.add(weight).step("accumulate weight")?;
        self.contributors += 1;
        Ok(())
    }

    pub fn finish(self, epsilon: Dec) -> Result<Dec> {
        if self.contributors == 0 {
            return Ok(Dec::NAN);
        }
        let denominator = if self.weight_sum.lt(epsilon) { epsilon } else { self.weight_sum };
        self.weighted_sum.quo(denominator).step("normalize weighted inference")
    }
}
