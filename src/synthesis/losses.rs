use crate::core::error::{EngineError, Result, WithStep};
use crate::math::Dec;
use crate::model::{
    ActorId, OneOutInfererForecasterValues, ReputerValueBundle, Stake, ValueBundle, WithheldWorkerAttributedValue,
    WorkerAttributedValue,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Numerator and denominator of a stake-weighted average being built up.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningWeightedLoss {
    pub unnormalized_weighted_loss: Dec,
    pub sum_weight: Dec,
}

impl RunningWeightedLoss {
    pub fn update(&mut self, weight: Dec, value: Dec) -> Result<()> {
        let term = value.mul(weight).step("stake-weighted loss")?;
        self.unnormalized_weighted_loss = self.unnormalized_weighted_loss.add(term).step("stake-weighted loss")?;
        self.sum_weight = self.sum_weight.add(weight).step("stake sum")?;
        Ok(())
    }

    /// Weighted average with the denominator floored at `epsilon`. A zero
    /// result becomes `epsilon` so consumers can take its logarithm.
    pub fn normalize(&self, epsilon: Dec) -> Result<Dec> {
        let denominator = if self.sum_weight.lt(epsilon) { epsilon } else { self.sum_weight };
        let loss = self
            .unnormalized_weighted_loss
            .quo(denominator)
            .step("normalize weighted loss")?;
        Ok(if loss.is_zero() { epsilon } else { loss })
    }
}

fn accumulate<K: Ord>(running: &mut BTreeMap<K, RunningWeightedLoss>, key: K, stake: Dec, value: Dec) -> Result<()> {
    running.entry(key).or_default().update(stake, value)
}

fn normalize_all<K: Ord + Clone>(running: &BTreeMap<K, RunningWeightedLoss>, epsilon: Dec) -> Result<Vec<(K, Dec)>> {
    running
        .iter()
        .map(|(key, loss)| Ok((key.clone(), loss.normalize(epsilon)?)))
        .collect()
}

fn stake_of(stakes: &BTreeMap<ActorId, Stake>, reputer: &str) -> Result<Dec> {
    let stake = stakes
        .get(reputer)
        .ok_or_else(|| EngineError::invalid(format!("no stake for reputer {}", reputer)))?;
    Dec::from_u128(*stake).step("stake to decimal")
}

/// Stake-weighted consensus of every loss family the reputers reported.
///
/// Each reputer weighs only the keys it actually reported, so partial reports
/// neither zero-fill nor skew the other workers. Output is sorted by address.
pub fn calc_network_losses(
    stakes: &BTreeMap<ActorId, Stake>,
    reports: &[ReputerValueBundle],
    epsilon: Dec,
) -> Result<ValueBundle> {
    let mut combined = RunningWeightedLoss::default();
    let mut naive = RunningWeightedLoss::default();
    let mut inferers: BTreeMap<ActorId, RunningWeightedLoss> = BTreeMap::new();
    let mut forecasters: BTreeMap<ActorId, RunningWeightedLoss> = BTreeMap::new();
    let mut one_out_inferers: BTreeMap<ActorId, RunningWeightedLoss> = BTreeMap::new();
    let mut one_out_forecasters: BTreeMap<ActorId, RunningWeightedLoss> = BTreeMap::new();
    let mut one_in_forecasters: BTreeMap<ActorId, RunningWeightedLoss> = BTreeMap::new();
    let mut one_out_inferer_forecasters: BTreeMap<(ActorId, ActorId), RunningWeightedLoss> = BTreeMap::new();

    for report in reports {
        let bundle = &report.value_bundle;
        let stake = stake_of(stakes, &bundle.reputer)?;

        combined.update(stake, bundle.combined_value)?;
        naive.update(stake, bundle.naive_value)?;
        for loss in &bundle.inferer_values {
            accumulate(&mut inferers, loss.worker.clone(), stake, loss.value)?;
        }
        for loss in &bundle.forecaster_values {
            accumulate(&mut forecasters, loss.worker.clone(), stake, loss.value)?;
        }
        for loss in &bundle.one_out_inferer_values {
            accumulate(&mut one_out_inferers, loss.worker.clone(), stake, loss.value)?;
        }
        for loss in &bundle.one_out_forecaster_values {
            accumulate(&mut one_out_forecasters, loss.worker.clone(), stake, loss.value)?;
        }
        for loss in &bundle.one_in_forecaster_values {
            accumulate(&mut one_in_forecasters, loss.worker.clone(), stake, loss.value)?;
        }
        for nested in &bundle.one_out_inferer_forecaster_values {
            for loss in &nested.one_out_inferer_values {
                accumulate(
                    &mut one_out_inferer_forecasters,
                    (nested.forecaster.clone(), loss.worker.clone()),
                    stake,
                    loss.value,
                )?;
            }
        }
    }

    let attributed = |running: &BTreeMap<ActorId, RunningWeightedLoss>| -> Result<Vec<WorkerAttributedValue>> {
        Ok(normalize_all(running, epsilon)?
            .into_iter()
            .map(|(worker, value)| WorkerAttributedValue::new(worker, value))
            .collect())
    };
    let withheld = |running: &BTreeMap<ActorId, RunningWeightedLoss>| -> Result<Vec<WithheldWorkerAttributedValue>> {
        Ok(normalize_all(running, epsilon)?
            .into_iter()
            .map(|(worker, value)| WithheldWorkerAttributedValue::new(worker, value))
            .collect())
    };

    let mut nested: Vec<OneOutInfererForecasterValues> = Vec::new();
    for ((forecaster, withheld_inferer), value) in normalize_all(&one_out_inferer_forecasters, epsilon)? {
        let entry = WithheldWorkerAttributedValue::new(withheld_inferer, value);
        match nested.last_mut() {
            Some(last) if last.forecaster == forecaster => last.one_out_inferer_values.push(entry),
            _ => nested.push(OneOutInfererForecasterValues {
                forecaster,
                one_out_inferer_values: vec![entry],
            }),
        }
    }

    let losses = ValueBundle {
        combined_value: combined.normalize(epsilon)?,
        naive_value: naive.normalize(epsilon)?,
        inferer_values: attributed(&inferers)?,
        forecaster_values: attributed(&forecasters)?,
        one_out_inferer_values: withheld(&one_out_inferers)?,
        one_out_forecaster_values: withheld(&one_out_forecasters)?,
        one_in_forecaster_values: attributed(&one_in_forecasters)?,
        one_out_inferer_forecaster_values: nested,
        ..Default::default()
    };
    debug!(reports = reports.len(), combined = %losses.combined_value, "network losses aggregated");
    Ok(losses)
}

/// Only the stake-weighted combined loss.
pub fn calc_combined_network_loss(
    stakes: &BTreeMap<ActorId, Stake>,
    reports: &[ReputerValueBundle],
    epsilon: Dec,
) -> Result<Dec> {
    let mut combined = RunningWeightedLoss::default();
    for report in reports {
        let stake = stake_of(stakes, &report.value_bundle.reputer)?;
        combined.update(stake, report.value_bundle.combined_value)?;
    }
    combined.normalize(epsilon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::in_delta;

    fn d(s: &str) -> Dec {
        s.parse().unwrap()
    }

    fn report(reputer: &str, combined: &str, inferers: &[(&str, &str)]) -> ReputerValueBundle {
        ReputerValueBundle {
            value_bundle: ValueBundle {
                reputer: reputer.to_string(),
                combined_value: d(combined),
                naive_value: d(combined),
                inferer_values: inferers
                    .iter()
                    .map(|(w, v)| WorkerAttributedValue::new(*w, d(v)))
                    .collect(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_single_reputer_loss_is_identity() {
        let stakes = BTreeMap::from([("r1".to_string(), 1_000u128)]);
        let losses = calc_network_losses(&stakes, &[report("r1", "0.1234", &[("w1", "0.5")])], d("1e-18")).unwrap();
        assert_eq!(losses.combined_value, d("0.1234"));
        assert_eq!(losses.inferer_values[0].value, d("0.5"));
    }

    #[test]
    fn test_two_reputers_weighted_by_stake() {
        let stakes = BTreeMap::from([("r1".to_string(), 300u128), ("r2".to_string(), 100u128)]);
        let reports = [report("r1", "0.2", &[]), report("r2", "0.6", &[])];
        let losses = calc_network_losses(&stakes, &reports, d("1e-18")).unwrap();
        assert!(in_delta(d("0.3"), losses.combined_value, d("0.00001")).unwrap());
        assert_eq!(
            calc_combined_network_loss(&stakes, &reports, d("1e-18")).unwrap(),
            losses.combined_value
        );
    }

    #[test]
    fn test_partial_reports_only_weigh_reported_keys() {
        let stakes = BTreeMap::from([("r1".to_string(), 100u128), ("r2".to_string(), 900u128)]);
        let reports = [
            report("r1", "1", &[("w1", "0.4"), ("w2", "0.8")]),
            report("r2", "1", &[("w2", "0.2")]),
        ];
        let losses = calc_network_losses(&stakes, &reports, d("1e-18")).unwrap();
        let workers: Vec<&str> = losses.inferer_values.iter().map(|v| v.worker.as_str()).collect();
        assert_eq!(workers, vec!["w1", "w2"]);
        assert_eq!(losses.inferer_values[0].value, d("0.4"));
        assert!(in_delta(d("0.26"), losses.inferer_values[1].value, d("0.0000001")).unwrap());
    }

    #[test]
    fn test_zero_loss_is_replaced_by_epsilon() {
        let stakes = BTreeMap::from([("r1".to_string(), 5u128)]);
        let losses = calc_network_losses(&stakes, &[report("r1", "0", &[])], d("0.0001")).unwrap();
        assert_eq!(losses.combined_value, d("0.0001"));
    }

    #[test]
    fn test_missing_stake_is_invalid_input() {
        let stakes = BTreeMap::new();
        let err = calc_network_losses(&stakes, &[report("r1", "1", &[])], d("1e-18")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_nested_family_grouped_per_forecaster() {
        let stakes = BTreeMap::from([("r1".to_string(), 1u128)]);
        let mut r = report("r1", "1", &[]);
        r.value_bundle.one_out_inferer_forecaster_values = vec![
            OneOutInfererForecasterValues {
                forecaster: "f2".into(),
                one_out_inferer_values: vec![WithheldWorkerAttributedValue::new("w1", d("0.3"))],
            },
            OneOutInfererForecasterValues {
                forecaster: "f1".into(),
                one_out_inferer_values: vec![
                    WithheldWorkerAttributedValue::new("w2", d("0.1")),
                    WithheldWorkerAttributedValue::new("w1", d("0.2")),
                ],
            },
        ];
        let losses = calc_network_losses(&stakes, &[r], d("1e-18")).unwrap();
        let nested = &losses.one_out_inferer_forecaster_values;
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0].forecaster, "f1");
        assert_eq!(nested[0].one_out_inferer_values[0].worker, "w1");
        assert_eq!(nested[1].one_out_inferer_values[0].value, d("0.3"));
    }
}
