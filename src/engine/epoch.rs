use crate::core::config::TopicParams;
use crate::core::error::{EngineError, Result};
use crate::ledger::{score_ema_list, Ledger, StakeLedger, TopicStateLedger};
use crate::math::Dec;
use crate::model::{ActorId, ActorType, BlockHeight, Forecast, Inference, ReputerValueBundle, Score, Stake, TopicId, ValueBundle};
use crate::scoring::{
    calc_and_save_score_ema_for_active_set, calc_forecaster_scores, calc_inferer_scores,
    calc_reputer_scores_set_listening_coefficients, update_passive_scores_with_active_quantile,
};
use crate::sortition::{find_top_n_by_score_desc, RankedScores};
use crate::synthesis::{calc_network_inferences, calc_network_losses, get_calc_set_network_regrets, NetworkInferences, RegretUpdate, SynthRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Where each actor of one role landed after merit sortition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSortition {
    pub actor_type: ActorType,
    /// Refreshed EMAs of the active actors, best first.
    pub active: Vec<Score>,
    pub passive: Vec<ActorId>,
    /// Quantile the passive actors were pulled toward.
    pub quantile: Dec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    pub network_losses: ValueBundle,
    pub reputer_scores: Vec<Score>,
    pub inferer_scores: Vec<Score>,
    pub forecaster_scores: Vec<Score>,
    pub regrets: RegretUpdate,
    pub sortition: Vec<RoleSortition>,
}

/// Runs the per-block flows of one topic against a ledger.
///
/// Every read and write goes through `ledger`; the engine keeps no state of its own
/// beyond the topic parameters.
pub struct EpochEngine<'a, L: Ledger + ?Sized> {
    ledger: &'a mut L,
    params: TopicParams,
}

impl<'a, L: Ledger + ?Sized> EpochEngine<'a, L> {
    pub fn new(ledger: &'a mut L, params: TopicParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { ledger, params })
    }

    pub fn params(&self) -> &TopicParams {
        &self.params
    }

    /// Synthesizes the network inference for a worker round.
    ///
    /// The forecast-implied step uses the combined loss stored by the latest
    /// reputer cycle of the topic.
    pub fn run_inference_synthesis(
        &self,
        topic_id: TopicId,
        block_height: BlockHeight,
        inferences: Vec<Inference>,
        forecasts: Vec<Forecast>,
    ) -> Result<NetworkInferences> {
        let network_combined_loss = self.ledger.get_network_loss(topic_id)?;
        let request = SynthRequest::new(
            topic_id,
            block_height,
            inferences,
            forecasts,
            network_combined_loss,
            &self.params,
        );
        calc_network_inferences(&request, &*self.ledger)
    }

    /// Scores a reputer round and folds it into regrets and score EMAs.
    pub fn run_reputer_cycle(
        &mut self,
        topic_id: TopicId,
        block_height: BlockHeight,
        reputer_bundles: Vec<ReputerValueBundle>,
    ) -> Result<EpochReport> {
        let reports = latest_bundle_per_reputer(reputer_bundles)?;
        if reports.is_empty() {
            return Err(EngineError::EmptyArray("reputer value bundles"));
        }
        info!(topic_id, block_height, reputers = reports.len(), "running reputer cycle");

        let mut stakes: BTreeMap<ActorId, Stake> = BTreeMap::new();
        for report in &reports {
            let reputer = &report.value_bundle.reputer;
            stakes.insert(reputer.clone(), self.ledger.get_stake(topic_id, reputer)?);
        }
        let mut network_losses = calc_network_losses(&stakes, &reports, self.params.epsilon)?;
        network_losses.topic_id = topic_id;
        self.ledger.set_network_loss(topic_id, network_losses.combined_value)?;

        let reputer_scores =
            calc_reputer_scores_set_listening_coefficients(&mut *self.ledger, topic_id, block_height, &reports, &self.params)?;
        let inferer_scores = calc_inferer_scores(&mut *self.ledger, topic_id, block_height, &network_losses)?;
        let forecaster_scores = calc_forecaster_scores(&mut *self.ledger, topic_id, block_height, &network_losses)?;
        let regrets = get_calc_set_network_regrets(&mut *self.ledger, topic_id, block_height, &network_losses, &self.params)?;

        let sortition = vec![
            self.update_role_emas(
                topic_id,
                block_height,
                ActorType::Inferer,
                &inferer_scores,
                self.params.max_top_inferers,
                self.params.active_inferer_quantile,
            )?,
            self.update_role_emas(
                topic_id,
                block_height,
                ActorType::Forecaster,
                &forecaster_scores,
                self.params.max_top_forecasters,
                self.params.active_forecaster_quantile,
            )?,
            self.update_role_emas(
                topic_id,
                block_height,
                ActorType::Reputer,
                &reputer_scores,
                self.params.max_top_reputers,
                self.params.active_reputer_quantile,
            )?,
        ];

        info!(
            topic_id,
            block_height,
            combined_loss = %network_losses.combined_value,
            regrets_written = regrets.regrets_written,
            "reputer cycle complete"
        );

        Ok(EpochReport {
            topic_id,
            block_height,
            network_losses,
            reputer_scores,
            inferer_scores,
            forecaster_scores,
            regrets,
            sortition,
        })
    }

    /// Ranks the role by previous EMA, refreshes the top actors with their new
    /// scores and pulls the rest toward the active quantile.
    fn update_role_emas(
        &mut self,
        topic_id: TopicId,
        block_height: BlockHeight,
        actor_type: ActorType,
        epoch_scores: &[Score],
        max_top: u64,
        quantile: Dec,
    ) -> Result<RoleSortition> {
        let alpha = self.params.merit_sortition_alpha;
        if epoch_scores.is_empty() {
            return Ok(RoleSortition {
                actor_type,
                active: Vec::new(),
                passive: Vec::new(),
                quantile: self.ledger.get_previous_quantile_score(topic_id, actor_type)?,
            });
        }

        let actors: Vec<ActorId> = epoch_scores.iter().map(|s| s.address.clone()).collect();
        let previous = score_ema_list(&*self.ledger, topic_id, actor_type, &actors)?;
        let max_top = usize::try_from(max_top).unwrap_or(usize::MAX);
        let ranked = find_top_n_by_score_desc(max_top, &previous, block_height);

        let mut active = Vec::with_capacity(ranked.top.len());
        for score in epoch_scores.iter().filter(|s| ranked.is_top(&s.address)) {
            active.push(calc_and_save_score_ema_for_active_set(
                &mut *self.ledger,
                topic_id,
                block_height,
                actor_type,
                alpha,
                score,
            )?);
        }
        let active = find_top_n_by_score_desc(active.len(), &active, block_height).top;

        let passive: Vec<ActorId> = ranked.passive().map(|s| s.address.clone()).collect();
        let refreshed = RankedScores {
            top: active.clone(),
            all_sorted: ranked.all_sorted,
            is_top: ranked.is_top,
        };
        let quantile = update_passive_scores_with_active_quantile(
            &mut *self.ledger,
            topic_id,
            block_height,
            actor_type,
            alpha,
            quantile,
            &refreshed,
        )?;

        Ok(RoleSortition {
            actor_type,
            active,
            passive,
            quantile,
        })
    }
}

/// Keeps the last bundle of each reputer, validated and deduplicated, ordered by reputer.
fn latest_bundle_per_reputer(bundles: Vec<ReputerValueBundle>) -> Result<Vec<ReputerValueBundle>> {
    let mut latest: BTreeMap<ActorId, ReputerValueBundle> = BTreeMap::new();
    for mut bundle in bundles {
        bundle.value_bundle.dedup();
        bundle.value_bundle.validate()?;
        if latest.insert(bundle.value_bundle.reputer.clone(), bundle).is_some() {
            warn!("reputer submitted more than one bundle, keeping the latest");
        }
    }
    Ok(latest.into_values().collect())
}
