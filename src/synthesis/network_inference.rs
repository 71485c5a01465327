//! Network inference stages.
//!
//! Each stage is a function of the base palette (plus the regret ledger for
//! the families it needs) and returns its slice of the value bundle.
//! [`calc_network_inferences`] composes them.

use super::bootstrap::StatefulRegret;
use super::palette::{SynthPalette, SynthRequest};
use super::weight::RegretInformedWeights;
use crate::core::error::Result;
use crate::ledger::{RegretFamily, RegretKey, RegretLedger};
use crate::math::Dec;
use crate::model::{
    ActorId, OneOutInfererForecasterValues, ValueBundle, WithheldWorkerAttributedValue, WorkerAttributedValue,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Synthesis output together with the weights behind the combined value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInferences {
    pub value_bundle: ValueBundle,
    pub forecast_implied_inferences: Vec<WorkerAttributedValue>,
    pub inferer_weights: Vec<WorkerAttributedValue>,
    pub forecaster_weights: Vec<WorkerAttributedValue>,
}

fn weights_to_values(weights: &BTreeMap<ActorId, Dec>) -> Vec<WorkerAttributedValue> {
    weights
        .iter()
        .map(|(worker, weight)| WorkerAttributedValue::new(worker.clone(), *weight))
        .collect()
}

/// Combined value over every inferer and forecaster.
pub fn combined_stage(palette: &SynthPalette) -> Result<(Dec, RegretInformedWeights)> {
    let weights = palette.calc_weights()?;
    let value = palette.calc_weighted_inference(&weights)?;
    debug!(topic_id = palette.topic_id, combined = %value, "combined inference");
    Ok((value, weights))
}

/// Combined value with forecasters removed, weighted by naive regrets.
pub fn naive_stage<L: RegretLedger + ?Sized>(palette: &SynthPalette, ledger: &L) -> Result<Dec> {
    let scenario = palette.without_forecasters().with_regret_family(
        ledger,
        |inferer| RegretKey::single(RegretFamily::NaiveInferer, inferer),
        RegretKey::forecaster,
    )?;
    let weights = scenario.calc_weights()?;
    let value = scenario.calc_weighted_inference(&weights)?;
    debug!(topic_id = palette.topic_id, naive = %value, "naive inference");
    Ok(value)
}

/// Output of the one-out-inferer stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OneOutInfererOutput {
    pub values: Vec<WithheldWorkerAttributedValue>,
    /// Forecast-implied inferences recomputed without each withheld inferer.
    pub forecaster_values: Vec<OneOutInfererForecasterValues>,
}

/// Network value with each inferer withheld in turn.
///
/// Forecast-implied inferences are recomputed without the withheld inferer,
/// then weighting uses that inferer's one-out regret family. Skipped until at
/// least two inferers have history. A withheld inferer without history yields
/// NaN.
pub fn one_out_inferer_stage<L: RegretLedger + ?Sized>(
    palette: &SynthPalette,
    ledger: &L,
) -> Result<OneOutInfererOutput> {
    if palette.inferer_status.is_bootstrapping() {
        debug!(topic_id = palette.topic_id, status = ?palette.inferer_status, "skipping one-out inferer values");
        return Ok(OneOutInfererOutput::default());
    }

    let mut values = Vec::with_capacity(palette.inferers.len());
    let mut nested: BTreeMap<ActorId, Vec<WithheldWorkerAttributedValue>> = BTreeMap::new();
    for withheld in &palette.inferers {
        let established = palette
            .inferer_regrets
            .get(withheld)
            .map(|r| !r.no_prior)
            .unwrap_or(false);
        if !established {
            values.push(WithheldWorkerAttributedValue::new(withheld.clone(), Dec::NAN));
            continue;
        }

        let narrowed = palette.without_inferer(withheld).with_recomputed_forecast_implied()?;
        for (forecaster, implied) in &narrowed.forecast_implied_inferences {
            nested
                .entry(forecaster.clone())
                .or_default()
                .push(WithheldWorkerAttributedValue::new(withheld.clone(), *implied));
        }

        let scenario = narrowed.with_regret_family(
            ledger,
            |inferer| RegretKey::paired(RegretFamily::OneOutInfererInferer, withheld.as_str(), inferer),
            |forecaster| RegretKey::paired(RegretFamily::OneOutInfererForecaster, withheld.as_str(), forecaster),
        )?;
        let weights = scenario.calc_weights()?;
        let value = scenario.calc_weighted_inference(&weights)?;
        values.push(WithheldWorkerAttributedValue::new(withheld.clone(), value));
    }

    Ok(OneOutInfererOutput {
        values,
        forecaster_values: nested
            .into_iter()
            .map(|(forecaster, one_out_inferer_values)| OneOutInfererForecasterValues {
                forecaster,
                one_out_inferer_values,
            })
            .collect(),
    })
}

/// Network value with each forecaster withheld in turn.
///
/// Skipped while either role is bootstrapping or there is at most one forecaster.
pub fn one_out_forecaster_stage<L: RegretLedger + ?Sized>(
    palette: &SynthPalette,
    ledger: &L,
) -> Result<Vec<WithheldWorkerAttributedValue>> {
    if palette.inferer_status.is_bootstrapping()
        || palette.forecaster_status.is_bootstrapping()
        || palette.forecasters.len() <= 1
    {
        debug!(topic_id = palette.topic_id, "skipping one-out forecaster values");
        return Ok(Vec::new());
    }

    palette
        .forecasters
        .iter()
        .map(|withheld| -> Result<WithheldWorkerAttributedValue> {
            let scenario = palette.without_forecaster(withheld).with_regret_family(
                ledger,
                |inferer| RegretKey::paired(RegretFamily::OneOutForecasterInferer, withheld.as_str(), inferer),
                |forecaster| {
                    RegretKey::paired(RegretFamily::OneOutForecasterForecaster, withheld.as_str(), forecaster)
                },
            )?;
            let weights = scenario.calc_weights()?;
            let value = scenario.calc_weighted_inference(&weights)?;
            Ok(WithheldWorkerAttributedValue::new(withheld.clone(), value))
        })
        .collect()
}

/// Network value with inferers plus a single forecaster, for each forecaster.
///
/// The kept forecaster is weighted by its one-in self regret; a forecaster
/// without one yet gets NaN. Skipped under the same conditions as the
/// one-out-forecaster stage.
pub fn one_in_forecaster_stage<L: RegretLedger + ?Sized>(
    palette: &SynthPalette,
    ledger: &L,
) -> Result<Vec<WorkerAttributedValue>> {
    if palette.inferer_status.is_bootstrapping()
        || palette.forecaster_status.is_bootstrapping()
        || palette.forecasters.len() <= 1
    {
        debug!(topic_id = palette.topic_id, "skipping one-in forecaster values");
        return Ok(Vec::new());
    }

    let mut values = Vec::with_capacity(palette.forecasters.len());
    for kept in &palette.forecasters {
        let (self_regret, no_self_prior) = ledger.get_regret(
            palette.topic_id,
            &RegretKey::paired(RegretFamily::OneInForecasterSelf, kept.as_str(), kept.as_str()),
        )?;
        if no_self_prior {
            values.push(WorkerAttributedValue::new(kept.clone(), Dec::NAN));
            continue;
        }
        let forecaster_regret = StatefulRegret::established(self_regret.value);

        let only = palette.only_forecaster(kept);
        let scenario = only.with_regret_family(
            ledger,
            |inferer| RegretKey::paired(RegretFamily::OneInForecasterInferer, kept.as_str(), inferer),
            RegretKey::forecaster,
        )?;
        let forecaster_regrets = BTreeMap::from([(kept.clone(), forecaster_regret)]);
        let inferer_regrets = scenario.inferer_regrets.clone();
        let scenario = scenario.with_regrets(inferer_regrets, forecaster_regrets);

        let weights = scenario.calc_weights()?;
        let value = scenario.calc_weighted_inference(&weights)?;
        values.push(WorkerAttributedValue::new(kept.clone(), value));
    }
    Ok(values)
}

/// Raw inferences and forecast-implied inferences as bundle entries.
pub fn inferer_forecaster_values_stage(
    palette: &SynthPalette,
) -> (Vec<WorkerAttributedValue>, Vec<WorkerAttributedValue>) {
    let inferer_values = palette
        .inferers
        .iter()
        .filter_map(|w| {
            palette
                .inference_by_worker
                .get(w)
                .map(|i| WorkerAttributedValue::new(w.clone(), i.value))
        })
        .collect();
    let forecaster_values = palette
        .forecasters
        .iter()
        .filter_map(|f| match palette.forecast_implied_inferences.get(f) {
            Some(value) => Some(WorkerAttributedValue::new(f.clone(), *value)),
            None => {
                warn!(topic_id = palette.topic_id, forecaster = %f, "no forecast-implied inference");
                None
            }
        })
        .collect();
    (inferer_values, forecaster_values)
}

/// Runs every synthesis stage for one topic and block.
pub fn calc_network_inferences<L: RegretLedger + ?Sized>(
    request: &SynthRequest,
    ledger: &L,
) -> Result<NetworkInferences> {
    info!(
        topic_id = request.topic_id,
        block_height = request.block_height,
        inferences = request.inferences.len(),
        forecasts = request.forecasts.len(),
        "synthesizing network inference"
    );

    if request.inferences.is_empty() {
        warn!(topic_id = request.topic_id, "no inferences to synthesize");
        return Ok(NetworkInferences {
            value_bundle: ValueBundle {
                topic_id: request.topic_id,
                combined_value: Dec::NAN,
                naive_value: Dec::NAN,
                ..Default::default()
            },
            ..Default::default()
        });
    }

    let palette = SynthPalette::build(request, ledger)?;
    let (inferer_values, forecaster_values) = inferer_forecaster_values_stage(&palette);

    if palette.inferers.len() == 1 {
        let single = inferer_values[0].value;
        debug!(topic_id = palette.topic_id, "single inferer, network inference is its value");
        return Ok(NetworkInferences {
            value_bundle: ValueBundle {
                topic_id: palette.topic_id,
                combined_value: single,
                naive_value: single,
                inferer_values,
                forecaster_values: forecaster_values.clone(),
                ..Default::default()
            },
            forecast_implied_inferences: forecaster_values,
            ..Default::default()
        });
    }

    let (combined_value, weights) = combined_stage(&palette)?;
    let naive_value = naive_stage(&palette, ledger)?;
    let one_out_inferers = one_out_inferer_stage(&palette, ledger)?;
    let one_out_forecaster_values = one_out_forecaster_stage(&palette, ledger)?;
    let one_in_forecaster_values = one_in_forecaster_stage(&palette, ledger)?;

    info!(
        topic_id = palette.topic_id,
        block_height = palette.block_height,
        combined = %combined_value,
        naive = %naive_value,
        "network inference synthesized"
    );

    Ok(NetworkInferences {
        value_bundle: ValueBundle {
            topic_id: palette.topic_id,
            combined_value,
            naive_value,
            inferer_values,
            forecaster_values: forecaster_values.clone(),
            one_out_inferer_values: one_out_inferers.values,
            one_out_forecaster_values,
            one_in_forecaster_values,
            one_out_inferer_forecaster_values: one_out_inferers.forecaster_values,
            ..Default::default()
        },
        forecast_implied_inferences: forecaster_values,
        inferer_weights: weights_to_values(&weights.inferers),
        forecaster_weights: weights_to_values(&weights.forecasters),
    })
}

/// Convenience wrapper returning the bundle and the weights behind it.
pub fn get_network_inference<L: RegretLedger + ?Sized>(
    request: &SynthRequest,
    ledger: &L,
) -> Result<(ValueBundle, Vec<WorkerAttributedValue>, Vec<WorkerAttributedValue>)> {
    let inferences = calc_network_inferences(request, ledger)?;
    Ok((
        inferences.value_bundle,
        inferences.inferer_weights,
        inferences.forecaster_weights,
    ))
}
