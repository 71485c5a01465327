use super::bootstrap::{InfererStatus, StatefulRegret};
use super::palette::SynthPalette;
use super::weight::calc_weights_given_workers;
use crate::core::error::{Result, WithStep};
use crate::math::{median, Dec};
use crate::model::ActorId;
use std::collections::BTreeMap;
use tracing::debug;

/// Forecast-implied inference of every forecaster in the palette.
///
/// Only forecast elements about inferers still in the palette count. While
/// every inferer is new the implied value is the median of the referenced
/// inferences. Otherwise each element becomes a regret
/// `network_combined_loss - forecasted_loss` and the referenced inferences are
/// blended by the weights those regrets produce. A forecaster whose weights sum
/// to zero gets no implied inference.
pub fn calc_forecast_implied_inferences(palette: &SynthPalette) -> Result<BTreeMap<ActorId, Dec>> {
    let mut implied = BTreeMap::new();
    for forecaster in &palette.forecasters {
        let Some(forecast) = palette.forecast_by_worker.get(forecaster) else {
            continue;
        };
        let elements: Vec<(&ActorId, Dec, Dec)> = forecast
            .forecast_elements
            .iter()
            .filter_map(|el| {
                palette
                    .inference_by_worker
                    .get(&el.inferer)
                    .map(|inference| (&el.inferer, el.value, inference.value))
            })
            .collect();
        if elements.is_empty() {
            debug!(topic_id = palette.topic_id, %forecaster, "forecast references no current inferer");
            continue;
        }

        if palette.inferer_status == InfererStatus::AllNew {
            let values: Vec<Dec> = elements.iter().map(|(_, _, v)| *v).collect();
            let value = median(&values).step("median of forecasted inferences")?;
            implied.insert(forecaster.clone(), value);
            continue;
        }

        let weights: BTreeMap<ActorId, Dec> = if elements.len() == 1 {
            BTreeMap::from([(elements[0].0.clone(), Dec::ONE)])
        } else {
            let regrets = elements
                .iter()
                .map(|(inferer, forecasted_loss, _)| {
                    let regret = palette
                        .network_combined_loss
                        .sub(*forecasted_loss)
                        .step("forecast regret of network inference")?;
                    Ok((*inferer, StatefulRegret::established(regret)))
                })
                .collect::<Result<Vec<_>>>()?;
            calc_weights_given_workers(&regrets, &[], palette.epsilon, palette.p_norm, palette.c_norm)?.inferers
        };

        let mut dot = Dec::ZERO;
        let mut weight_sum = Dec::ZERO;
        for (inferer, _, inference) in &elements {
            let weight = weights.get(*inferer).copied().unwrap_or(Dec::ZERO);
            if weight.is_zero() || weight.is_nan() {
                continue;
            }
            dot = weight
                .mul(*inference)
                .and_then(|term| dot.add(term))
                .step("forecast-implied dot product")?;
            weight_sum = weight_sum.add(weight).step("forecast-implied weight sum")?;
        }
        if weight_sum.is_zero() {
            debug!(topic_id = palette.topic_id, %forecaster, "forecast weights sum to zero");
            continue;
        }
        let value = dot.quo(weight_sum).step("forecast-implied inference")?;
        implied.insert(forecaster.clone(), value);
    }
    Ok(implied)
}
