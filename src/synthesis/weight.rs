use super::bootstrap::StatefulRegret;
use crate::core::error::{EngineError, Result, WithStep};
use crate::math::{gradient, std_dev, Dec};
use crate::model::ActorId;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

/// Regret-informed weights, kept apart per role because one address may act as both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegretInformedWeights {
    pub inferers: BTreeMap<ActorId, Dec>,
    pub forecasters: BTreeMap<ActorId, Dec>,
}

impl RegretInformedWeights {
    pub fn inferer(&self, worker: &str) -> Option<Dec> {
        self.inferers.get(worker).copied()
    }

    pub fn forecaster(&self, worker: &str) -> Option<Dec> {
        self.forecasters.get(worker).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.inferers.is_empty() && self.forecasters.is_empty()
    }
}

/// Maps a normalized regret to a weight through φ'_p.
///
/// Regrets above `c + 6.75/p` are capped. When even the largest regret sits
/// below `c - 8.25/p` the whole set is shifted up so that the largest lands on
/// that bound. Anything still below `c - 17.25/p` gets no weight.
pub fn calc_weight_from_normalized_regret(
    normalized_regret: Dec,
    max_normalized_regret: Dec,
    p_norm: Dec,
    c_norm: Dec,
) -> Result<Dec> {
    if normalized_regret.is_nan() {
        return Ok(Dec::ZERO);
    }
    let upper = c_norm
        .add(Dec::new(dec!(6.75)).quo(p_norm).step("weight upper bound")?)
        .step("weight upper bound")?;
    let anchor = c_norm
        .sub(Dec::new(dec!(8.25)).quo(p_norm).step("weight anchor")?)
        .step("weight anchor")?;
    let cutoff = c_norm
        .sub(Dec::new(dec!(17.25)).quo(p_norm).step("weight cutoff")?)
        .step("weight cutoff")?;

    let mut regret = normalized_regret;
    if regret.gt(upper) {
        regret = upper;
    }
    if max_normalized_regret.lt(anchor) {
        regret = regret
            .sub(max_normalized_regret)
            .and_then(|r| r.add(anchor))
            .step("anchor normalized regret")?;
    }
    if regret.lt(cutoff) {
        return Ok(Dec::ZERO);
    }
    gradient(p_norm, c_norm, regret).step("weight gradient")
}

/// Weights for the given inferer and forecaster regrets.
///
/// The spread is measured over regrets with history only. Every regret is
/// normalized by it and contributes to the maximum; regrets without history
/// end up with zero weight. NaN regrets are ignored and weigh zero.
pub fn calc_weights_given_workers(
    inferer_regrets: &[(&ActorId, StatefulRegret)],
    forecaster_regrets: &[(&ActorId, StatefulRegret)],
    epsilon: Dec,
    p_norm: Dec,
    c_norm: Dec,
) -> Result<RegretInformedWeights> {
    let established: Vec<Dec> = inferer_regrets
        .iter()
        .chain(forecaster_regrets)
        .filter(|(_, r)| !r.no_prior && !r.value.is_nan())
        .map(|(_, r)| r.value)
        .collect();
    if established.is_empty() {
        return Err(EngineError::EmptyArray("no regrets to calculate weights"));
    }

    let spread = std_dev(&established)
        .and_then(|s| s.abs())
        .and_then(|s| s.add(epsilon))
        .step("regret spread")?;

    let normalize = |entries: &[(&ActorId, StatefulRegret)]| -> Result<Vec<(ActorId, StatefulRegret, Dec)>> {
        entries
            .iter()
            .map(|(worker, regret)| {
                let normalized = if regret.value.is_nan() {
                    Dec::NAN
                } else {
                    regret.value.quo(spread).step("normalize regret")?
                };
                Ok(((*worker).clone(), *regret, normalized))
            })
            .collect()
    };
    let inferers = normalize(inferer_regrets)?;
    let forecasters = normalize(forecaster_regrets)?;

    let mut max_regret: Option<Dec> = None;
    for (_, _, normalized) in inferers.iter().chain(&forecasters) {
        if normalized.is_nan() {
            continue;
        }
        max_regret = match max_regret {
            Some(current) if !normalized.gt(current) => Some(current),
            _ => Some(*normalized),
        };
    }
    let max_regret = max_regret.unwrap_or(Dec::ZERO);

    let weigh = |entries: Vec<(ActorId, StatefulRegret, Dec)>| -> Result<BTreeMap<ActorId, Dec>> {
        entries
            .into_iter()
            .map(|(worker, regret, normalized)| {
                let weight = if regret.no_prior {
                    Dec::ZERO
                } else {
                    calc_weight_from_normalized_regret(normalized, max_regret, p_norm, c_norm)?
                };
                Ok((worker, weight))
            })
            .collect()
    };

    Ok(RegretInformedWeights {
        inferers: weigh(inferers)?,
        forecasters: weigh(forecasters)?,
    })
}
