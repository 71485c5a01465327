use crate::core::config::TopicParams;
use crate::core::error::{EngineError, Result, WithStep};
use crate::ledger::{CoefficientLedger, ScoreLedger, StakeLedger};
use crate::math::{sum, Dec, MathResult};
use crate::model::{
    ActorId, ActorType, BlockHeight, ReputerValueBundle, Score, TopicId, ValueBundle, WithheldWorkerAttributedValue,
    WorkerAttributedValue,
};
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Knobs of the listening-coefficient gradient descent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusParams {
    pub learning_rate: Dec,
    pub max_iterations: u64,
    pub epsilon_reputer: Dec,
    /// Stands in for a zero consensus norm.
    pub epsilon: Dec,
    pub min_stake_fraction: Dec,
    pub max_gradient_threshold: Dec,
}

impl From<&TopicParams> for ConsensusParams {
    fn from(params: &TopicParams) -> Self {
        Self {
            learning_rate: params.learning_rate,
            max_iterations: params.max_iterations,
            epsilon_reputer: params.epsilon_reputer,
            epsilon: params.epsilon_safe_div,
            min_stake_fraction: params.min_stake_fraction,
            max_gradient_threshold: params.max_gradient_threshold,
        }
    }
}

/// Final reputer scores and the coefficients they were computed with.
#[derive(Debug, Clone, PartialEq)]
pub struct ReputersOutput {
    pub scores: Vec<Dec>,
    pub coefficients: Vec<Dec>,
    pub iterations: u64,
}

fn sum_weighted(weights: &[Dec], values: &[Dec]) -> MathResult<Dec> {
    weights
        .iter()
        .zip(values)
        .try_fold(Dec::ZERO, |acc, (w, v)| acc.add(w.mul(*v)?))
}

/// `min(1, N·a·S / Σ(a·S))`: the share of consensus one reputer may carry.
pub fn get_adjusted_stake(
    stake: Dec,
    all_stakes: &[Dec],
    coefficient: Dec,
    all_coefficients: &[Dec],
    num_reputers: Dec,
) -> Result<Dec> {
    if all_stakes.is_empty() || all_stakes.len() != all_coefficients.len() {
        return Err(EngineError::invalid(format!(
            "{} stakes against {} listening coefficients",
            all_stakes.len(),
            all_coefficients.len()
        )));
    }
    let listened = sum_weighted(all_coefficients, all_stakes).step("listened stake")?;
    let fraction = num_reputers
        .mul(coefficient)
        .and_then(|v| v.mul(stake))
        .and_then(|v| v.quo(listened))
        .step("adjusted stake")?;
    fraction.min(Dec::ONE).step("adjusted stake")
}

/// Column-wise stake-weighted consensus of the reported loss vectors.
///
/// Losses arrive in log space, so the weighted mean here is a weighted
/// geometric mean of the raw losses. NaN entries drop out of both numerator
/// and denominator of their column. Also returns, per column, the reported
/// value lying farthest below consensus (signed `consensus − loss`); it stands
/// in for a reputer's own NaN.
pub fn get_stake_weighted_loss_matrix(
    adjusted_stakes: &[Dec],
    reported_losses: &[Vec<Dec>],
) -> Result<(Vec<Dec>, Vec<Dec>)> {
    let columns = reported_losses
        .first()
        .map(Vec::len)
        .ok_or(EngineError::EmptyArray("reported losses"))?;
    if adjusted_stakes.len() != reported_losses.len() {
        return Err(EngineError::invalid(format!(
            "{} stakes against {} loss vectors",
            adjusted_stakes.len(),
            reported_losses.len()
        )));
    }
    if reported_losses.iter().any(|row| row.len() != columns) {
        return Err(EngineError::invalid("loss vectors differ in length"));
    }

    let mut consensus = Vec::with_capacity(columns);
    let mut most_distant = Vec::with_capacity(columns);
    for j in 0..columns {
        let reported: Vec<(Dec, Dec)> = reported_losses
            .iter()
            .zip(adjusted_stakes)
            .filter(|(row, _)| !row[j].is_nan())
            .map(|(row, stake)| (row[j], *stake))
            .collect();

        let column_stake = reported
            .iter()
            .try_fold(Dec::ZERO, |acc, (_, stake)| acc.add(*stake))
            .step("column stake")?;
        // A column nobody is listened to on stays at zero.
        let mut value = Dec::ZERO;
        if column_stake.is_positive() {
            for (loss, stake) in &reported {
                value = loss
                    .mul(*stake)
                    .and_then(|v| v.quo(column_stake))
                    .and_then(|v| value.add(v))
                    .step("consensus loss")?;
            }
        }

        let mut farthest = value;
        let mut max_distance = Dec::from_i64(-1);
        for (loss, _) in &reported {
            let distance = value.sub(*loss).step("distance to consensus")?;
            if distance.gt(max_distance) {
                max_distance = distance;
                farthest = *loss;
            }
        }
        consensus.push(value);
        most_distant.push(farthest);
    }
    Ok((consensus, most_distant))
}

/// Proximity of one reputer to consensus: `1 / (‖L_m − L‖ / ‖L‖ + ε_reputer)`.
pub fn get_consensus_score(
    reputer_losses: &[Dec],
    consensus_losses: &[Dec],
    most_distant_values: &[Dec],
    epsilon_reputer: Dec,
    epsilon: Dec,
) -> Result<Dec> {
    if reputer_losses.len() != consensus_losses.len() || most_distant_values.len() != consensus_losses.len() {
        return Err(EngineError::invalid(format!(
            "reputer reported {} losses, consensus has {}",
            reputer_losses.len(),
            consensus_losses.len()
        )));
    }

    let mut norm_squared = Dec::ZERO;
    for c in consensus_losses {
        norm_squared = c.mul(*c).and_then(|sq| norm_squared.add(sq)).step("consensus norm")?;
    }
    let mut consensus_norm = norm_squared.sqrt().step("consensus norm")?;
    if consensus_norm.is_zero() {
        consensus_norm = epsilon;
    }

    let mut distance_squared = Dec::ZERO;
    for ((loss, consensus), farthest) in reputer_losses.iter().zip(consensus_losses).zip(most_distant_values) {
        let loss = if loss.is_nan() { *farthest } else { *loss };
        distance_squared = loss
            .sub(*consensus)
            .and_then(|d| d.mul(d))
            .and_then(|sq| distance_squared.add(sq))
            .step("distance to consensus")?;
    }

    distance_squared
        .sqrt()
        .and_then(|d| d.quo(consensus_norm))
        .and_then(|d| d.add(epsilon_reputer))
        .and_then(|d| Dec::ONE.quo(d))
        .step("consensus score")
}

/// Scores every reputer against the consensus built from the given coefficients.
pub fn get_all_consensus_scores(
    all_losses: &[Vec<Dec>],
    stakes: &[Dec],
    coefficients: &[Dec],
    epsilon_reputer: Dec,
    epsilon: Dec,
) -> Result<Vec<Dec>> {
    if all_losses.len() != stakes.len() {
        return Err(EngineError::invalid(format!(
            "{} loss vectors for {} reputers",
            all_losses.len(),
            stakes.len()
        )));
    }
    let num_reputers = Dec::from_usize(stakes.len()).step("reputer count")?;
    let adjusted_stakes = stakes
        .iter()
        .zip(coefficients)
        .map(|(stake, coefficient)| get_adjusted_stake(*stake, stakes, *coefficient, coefficients, num_reputers))
        .collect::<Result<Vec<Dec>>>()?;

    let (consensus, most_distant) = get_stake_weighted_loss_matrix(&adjusted_stakes, all_losses)?;
    all_losses
        .iter()
        .map(|losses| get_consensus_score(losses, &consensus, &most_distant, epsilon_reputer, epsilon))
        .collect()
}

fn max_abs_difference(a: &[Dec], b: &[Dec]) -> MathResult<Dec> {
    a.iter()
        .zip(b)
        .try_fold(Dec::ZERO, |acc, (x, y)| acc.max(x.sub(*y)?.abs()?))
}

/// Calibrates listening coefficients by finite-difference gradient ascent on
/// the stake-weighted total consensus score.
///
/// Each step moves coefficients by `learning_rate · gradient`, clamped to
/// [0, 1]. A step that would drop the listened stake fraction below
/// `min_stake_fraction` is scaled back to land exactly on it; if the
/// fraction cannot move at all the descent stops. Returned scores are those
/// of the final coefficients.
pub fn get_all_reputers_output(
    all_losses: &[Vec<Dec>],
    stakes: &[Dec],
    initial_coefficients: &[Dec],
    params: &ConsensusParams,
) -> Result<ReputersOutput> {
    if stakes.is_empty() {
        return Err(EngineError::EmptyArray("reputer stakes"));
    }
    if stakes.len() != initial_coefficients.len() || stakes.len() != all_losses.len() {
        return Err(EngineError::invalid(format!(
            "{} stakes, {} coefficients, {} loss vectors",
            stakes.len(),
            initial_coefficients.len(),
            all_losses.len()
        )));
    }
    let total_stake = sum(stakes).step("total reputer stake")?;
    if !total_stake.is_positive() {
        return Err(EngineError::invalid("reputers hold no stake"));
    }

    let finite_step = Dec::new(dec!(0.001));
    let scores_for = |coefficients: &[Dec]| {
        get_all_consensus_scores(all_losses, stakes, coefficients, params.epsilon_reputer, params.epsilon)
    };
    let listened_fraction = |coefficients: &[Dec]| {
        sum_weighted(coefficients, stakes)
            .and_then(|v| v.quo(total_stake))
            .step("listened stake fraction")
    };

    let mut coefficients = initial_coefficients.to_vec();
    let mut max_gradient = Dec::ONE;
    let mut iterations = 0u64;

    while max_gradient.gte(params.max_gradient_threshold) && iterations < params.max_iterations {
        let old_coefficients = coefficients.clone();
        let base_total = sum_weighted(&scores_for(&coefficients)?, stakes).step("stake-weighted score")?;

        let mut gradient = Vec::with_capacity(coefficients.len());
        for l in 0..coefficients.len() {
            let delta = if coefficients[l] == Dec::ONE {
                finite_step.neg().step("coefficient perturbation")?
            } else {
                finite_step
            };
            let mut perturbed = coefficients.clone();
            perturbed[l] = perturbed[l].add(delta).step("coefficient perturbation")?;
            let perturbed_total = sum_weighted(&scores_for(&perturbed)?, stakes).step("stake-weighted score")?;
            let g = base_total
                .quo(perturbed_total)
                .and_then(|ratio| Dec::ONE.sub(ratio))
                .and_then(|v| v.quo(delta))
                .step("coefficient gradient")?;
            gradient.push(g);
        }

        let new_coefficients = coefficients
            .iter()
            .zip(&gradient)
            .map(|(c, g)| {
                params
                    .learning_rate
                    .mul(*g)
                    .and_then(|step| c.add(step))
                    .and_then(|v| v.max(Dec::ZERO))
                    .and_then(|v| v.min(Dec::ONE))
                    .step("coefficient update")
            })
            .collect::<Result<Vec<Dec>>>()?;

        let old_fraction = listened_fraction(&old_coefficients)?;
        let new_fraction = listened_fraction(&new_coefficients)?;
        if new_fraction.lt(params.min_stake_fraction) {
            let moved = new_fraction.sub(old_fraction).step("listened fraction change")?;
            if moved.is_zero() {
                debug!(iterations, "listened stake fraction is stuck, stopping");
                break;
            }
            let scale = params
                .min_stake_fraction
                .sub(old_fraction)
                .and_then(|v| v.quo(moved))
                .step("stake fraction correction")?;
            for (l, coefficient) in coefficients.iter_mut().enumerate() {
                *coefficient = new_coefficients[l]
                    .sub(old_coefficients[l])
                    .and_then(|diff| diff.mul(scale))
                    .and_then(|v| old_coefficients[l].add(v))
                    .step("stake fraction correction")?;
            }
        } else {
            coefficients = new_coefficients;
        }

        max_gradient = max_abs_difference(&coefficients, &old_coefficients)
            .and_then(|v| v.quo(params.learning_rate))
            .step("coefficient change")?;
        iterations += 1;
        debug!(iterations, max_gradient = %max_gradient, "listening coefficients stepped");
    }

    let scores = scores_for(&coefficients)?;
    Ok(ReputersOutput {
        scores,
        coefficients,
        iterations,
    })
}

fn missing<'a>(present: impl Iterator<Item = &'a str>, all_workers: &'a BTreeSet<ActorId>) -> Vec<&'a ActorId> {
    let present: BTreeSet<&str> = present.collect();
    all_workers.iter().filter(|w| !present.contains(w.as_str())).collect()
}

/// Appends a NaN entry, in address order, for every worker of `all_workers`
/// absent from `values`.
pub fn ensure_all_workers_present(values: &mut Vec<WorkerAttributedValue>, all_workers: &BTreeSet<ActorId>) {
    let absent = missing(values.iter().map(|v| v.worker.as_str()), all_workers);
    let padding: Vec<WorkerAttributedValue> = absent
        .into_iter()
        .map(|w| WorkerAttributedValue::new(w.clone(), Dec::NAN))
        .collect();
    values.extend(padding);
}

pub fn ensure_all_workers_present_withheld(
    values: &mut Vec<WithheldWorkerAttributedValue>,
    all_workers: &BTreeSet<ActorId>,
) {
    let absent = missing(values.iter().map(|v| v.worker.as_str()), all_workers);
    let padding: Vec<WithheldWorkerAttributedValue> = absent
        .into_iter()
        .map(|w| WithheldWorkerAttributedValue::new(w.clone(), Dec::NAN))
        .collect();
    values.extend(padding);
}

/// Pads every report so all of them cover the same workers in every family.
pub fn ensure_worker_presence(reports: &mut [ReputerValueBundle]) {
    let mut inferers = BTreeSet::new();
    let mut forecasters = BTreeSet::new();
    let mut one_out_inferers = BTreeSet::new();
    let mut one_out_forecasters = BTreeSet::new();
    let mut one_in_forecasters = BTreeSet::new();
    let mut nested: BTreeMap<ActorId, BTreeSet<ActorId>> = BTreeMap::new();

    for report in reports.iter() {
        let bundle = &report.value_bundle;
        inferers.extend(bundle.inferer_values.iter().map(|v| v.worker.clone()));
        forecasters.extend(bundle.forecaster_values.iter().map(|v| v.worker.clone()));
        one_out_inferers.extend(bundle.one_out_inferer_values.iter().map(|v| v.worker.clone()));
        one_out_forecasters.extend(bundle.one_out_forecaster_values.iter().map(|v| v.worker.clone()));
        one_in_forecasters.extend(bundle.one_in_forecaster_values.iter().map(|v| v.worker.clone()));
        for group in &bundle.one_out_inferer_forecaster_values {
            nested
                .entry(group.forecaster.clone())
                .or_default()
                .extend(group.one_out_inferer_values.iter().map(|v| v.worker.clone()));
        }
    }

    for report in reports.iter_mut() {
        let bundle = &mut report.value_bundle;
        ensure_all_workers_present(&mut bundle.inferer_values, &inferers);
        ensure_all_workers_present(&mut bundle.forecaster_values, &forecasters);
        ensure_all_workers_present_withheld(&mut bundle.one_out_inferer_values, &one_out_inferers);
        ensure_all_workers_present_withheld(&mut bundle.one_out_forecaster_values, &one_out_forecasters);
        ensure_all_workers_present(&mut bundle.one_in_forecaster_values, &one_in_forecasters);
        for (forecaster, withheld) in &nested {
            let position = bundle
                .one_out_inferer_forecaster_values
                .iter()
                .position(|g| &g.forecaster == forecaster);
            let index = match position {
                Some(index) => index,
                None => {
                    bundle
                        .one_out_inferer_forecaster_values
                        .push(crate::model::OneOutInfererForecasterValues {
                            forecaster: forecaster.clone(),
                            one_out_inferer_values: Vec::new(),
                        });
                    bundle.one_out_inferer_forecaster_values.len() - 1
                }
            };
            ensure_all_workers_present_withheld(
                &mut bundle.one_out_inferer_forecaster_values[index].one_out_inferer_values,
                withheld,
            );
        }
    }
}

fn sorted_values<'a>(entries: impl Iterator<Item = (&'a str, Dec)>) -> Vec<Dec> {
    let mut entries: Vec<(&str, Dec)> = entries.collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, v)| v).collect()
}

/// Flattens a loss bundle into the vector compared across reputers.
///
/// Order: combined, naive, inferers, forecasters, nested one-out-inferer per
/// forecaster, one-out inferers, one-out forecasters, one-in forecasters.
/// Each group is sorted by address.
pub fn extract_values(bundle: &ValueBundle) -> Vec<Dec> {
    let mut values = vec![bundle.combined_value, bundle.naive_value];
    values.extend(sorted_values(
        bundle.inferer_values.iter().map(|v| (v.worker.as_str(), v.value)),
    ));
    values.extend(sorted_values(
        bundle.forecaster_values.iter().map(|v| (v.worker.as_str(), v.value)),
    ));

    let mut groups: Vec<_> = bundle.one_out_inferer_forecaster_values.iter().collect();
    groups.sort_by(|a, b| a.forecaster.cmp(&b.forecaster));
    for group in groups {
        values.extend(sorted_values(
            group.one_out_inferer_values.iter().map(|v| (v.worker.as_str(), v.value)),
        ));
    }

    values.extend(sorted_values(
        bundle.one_out_inferer_values.iter().map(|v| (v.worker.as_str(), v.value)),
    ));
    values.extend(sorted_values(
        bundle.one_out_forecaster_values.iter().map(|v| (v.worker.as_str(), v.value)),
    ));
    values.extend(sorted_values(
        bundle.one_in_forecaster_values.iter().map(|v| (v.worker.as_str(), v.value)),
    ));
    values
}

/// Scores reputers by proximity to consensus and persists the calibrated
/// listening coefficients and the epoch scores.
pub fn calc_reputer_scores_set_listening_coefficients<L>(
    ledger: &mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    reports: &[ReputerValueBundle],
    params: &TopicParams,
) -> Result<Vec<Score>>
where
    L: StakeLedger + CoefficientLedger + ScoreLedger + ?Sized,
{
    if reports.is_empty() {
        info!(topic_id, block_height, "no reputer reports, skipping reputer scores");
        return Ok(Vec::new());
    }

    let mut reports = reports.to_vec();
    ensure_worker_presence(&mut reports);

    let mut reputers = Vec::with_capacity(reports.len());
    let mut stakes = Vec::with_capacity(reports.len());
    let mut coefficients = Vec::with_capacity(reports.len());
    let mut losses = Vec::with_capacity(reports.len());
    for report in &reports {
        let reputer = report.value_bundle.reputer.as_str();
        let stake = ledger.get_stake(topic_id, reputer)?;
        stakes.push(Dec::from_u128(stake).step("stake to decimal")?);
        coefficients.push(ledger.get_coefficient(topic_id, reputer)?);
        losses.push(extract_values(&report.value_bundle));
        reputers.push(reputer.to_string());
    }

    let output = get_all_reputers_output(&losses, &stakes, &coefficients, &ConsensusParams::from(params))?;

    let mut scores = Vec::with_capacity(reputers.len());
    for ((reputer, score), coefficient) in reputers.into_iter().zip(output.scores).zip(output.coefficients) {
        ledger.set_coefficient(topic_id, &reputer, coefficient)?;
        let score = Score::new(topic_id, block_height, reputer, score);
        ledger.set_epoch_score(topic_id, ActorType::Reputer, score.clone())?;
        scores.push(score);
    }
    info!(
        topic_id,
        block_height,
        reputers = scores.len(),
        iterations = output.iterations,
        "reputer scores computed"
    );
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::model::Stake;
    use crate::math::in_delta;

    fn d(s: &str) -> Dec {
        s.parse().unwrap()
    }

    fn ds(values: &[&str]) -> Vec<Dec> {
        values.iter().map(|v| d(v)).collect()
    }

    #[test]
    fn test_adjusted_stake_is_capped_at_one() {
        let stakes = ds(&["100", "100", "400"]);
        let coefficients = ds(&["1", "1", "1"]);
        let n = Dec::from_i64(3);
        let small = get_adjusted_stake(stakes[0], &stakes, coefficients[0], &coefficients, n).unwrap();
        assert_eq!(small, d("0.5"));
        let large = get_adjusted_stake(stakes[2], &stakes, coefficients[2], &coefficients, n).unwrap();
        assert_eq!(large, Dec::ONE);
    }

    #[test]
    fn test_adjusted_stake_rejects_mismatched_slices() {
        let err = get_adjusted_stake(Dec::ONE, &ds(&["1"]), Dec::ONE, &ds(&["1", "1"]), Dec::ONE).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_loss_matrix_skips_nan_columns_entries() {
        let stakes = ds(&["1", "1", "1"]);
        let losses = vec![ds(&["0.1", "0.4"]), ds(&["0.3", "NaN"]), ds(&["0.2", "0.2"])];
        let (consensus, farthest) = get_stake_weighted_loss_matrix(&stakes, &losses).unwrap();
        assert!(in_delta(d("0.2"), consensus[0], d("0.0000001")).unwrap());
        assert!(in_delta(d("0.3"), consensus[1], d("0.0000001")).unwrap());
        assert_eq!(farthest[1], d("0.2"));
    }

    #[test]
    fn test_most_distant_value_is_furthest_below_consensus() {
        let stakes = ds(&["1", "1", "1"]);
        let losses = vec![ds(&["0.4"]), ds(&["NaN"]), ds(&["0.2"])];
        let (consensus, farthest) = get_stake_weighted_loss_matrix(&stakes, &losses).unwrap();
        assert!(in_delta(d("0.3"), consensus[0], d("0.0000001")).unwrap());
        // 0.4 is as far from 0.3 as 0.2, but above it
        assert_eq!(farthest[0], d("0.2"));

        let skewed = vec![ds(&["0.9"]), ds(&["0.5"]), ds(&["0.4"])];
        let (consensus, farthest) = get_stake_weighted_loss_matrix(&stakes, &skewed).unwrap();
        assert!(consensus[0].gt(d("0.59")) && consensus[0].lt(d("0.61")));
        assert_eq!(farthest[0], d("0.4"));
    }

    #[test]
    fn test_loss_matrix_requires_rows() {
        assert!(matches!(
            get_stake_weighted_loss_matrix(&[], &[]),
            Err(EngineError::EmptyArray(_))
        ));
        let ragged = vec![ds(&["1", "2"]), ds(&["1"])];
        assert!(get_stake_weighted_loss_matrix(&ds(&["1", "1"]), &ragged).is_err());
    }

    #[test]
    fn test_consensus_score_at_consensus_is_inverse_epsilon() {
        let consensus = ds(&["0.5", "0.5"]);
        let score = get_consensus_score(&consensus, &consensus, &consensus, d("0.01"), d("1e-18")).unwrap();
        assert_eq!(score, Dec::from_i64(100));
    }

    #[test]
    fn test_consensus_score_substitutes_nan() {
        let consensus = ds(&["3", "4"]);
        let farthest = ds(&["3", "9"]);
        let with_nan = get_consensus_score(&ds(&["3", "NaN"]), &consensus, &farthest, d("0"), d("1e-18")).unwrap();
        // distance 5 over norm 5
        assert!(in_delta(Dec::ONE, with_nan, d("0.0000001")).unwrap());
    }

    #[test]
    fn test_agreeing_reputers_outscore_outlier() {
        let losses = vec![ds(&["0.1", "0.2", "0.3"]), ds(&["0.1", "0.2", "0.3"]), ds(&["0.5", "0.9", "0.1"])];
        let stakes = ds(&["100", "100", "100"]);
        let scores = get_all_consensus_scores(&losses, &stakes, &ds(&["1", "1", "1"]), d("0.01"), d("1e-18")).unwrap();
        assert_eq!(scores[0], scores[1]);
        assert!(scores[0].gt(scores[2]));
    }

    #[test]
    fn test_gradient_descent_lowers_outlier_coefficient() {
        let losses = vec![ds(&["0.1", "0.2", "0.3"]), ds(&["0.1", "0.2", "0.3"]), ds(&["0.5", "0.9", "0.1"])];
        let stakes = ds(&["100", "100", "100"]);
        let params = ConsensusParams::from(&TopicParams::default());
        let output = get_all_reputers_output(&losses, &stakes, &ds(&["1", "1", "1"]), &params).unwrap();
        assert_eq!(output.coefficients[0], Dec::ONE);
        assert_eq!(output.coefficients[1], Dec::ONE);
        assert!(output.coefficients[2].lt(Dec::ONE));
        assert!(output.iterations >= 1);
    }

    #[test]
    fn test_zero_iterations_keep_coefficients() {
        let losses = vec![ds(&["0.1"]), ds(&["0.3"])];
        let stakes = ds(&["1", "3"]);
        let params = ConsensusParams {
            max_iterations: 0,
            ..ConsensusParams::from(&TopicParams::default())
        };
        let output = get_all_reputers_output(&losses, &stakes, &ds(&["1", "0.5"]), &params).unwrap();
        assert_eq!(output.coefficients, ds(&["1", "0.5"]));
        assert_eq!(output.iterations, 0);
        assert_eq!(output.scores.len(), 2);
    }

    fn listened(coefficients: &[Dec], stakes: &[Dec]) -> Dec {
        sum_weighted(coefficients, stakes).unwrap().quo(sum(stakes).unwrap()).unwrap()
    }

    #[test]
    fn test_descent_is_held_at_min_stake_fraction() {
        let losses = vec![ds(&["0.1", "0.2", "0.3"]), ds(&["0.1", "0.2", "0.3"]), ds(&["0.5", "0.9", "0.1"])];
        let stakes = ds(&["100", "100", "100"]);
        let floor = d("0.9999");
        let params = ConsensusParams {
            min_stake_fraction: floor,
            ..ConsensusParams::from(&TopicParams::default())
        };
        let output = get_all_reputers_output(&losses, &stakes, &ds(&["1", "1", "1"]), &params).unwrap();

        // unconstrained, the outlier drops well below 0.9997 on the first step
        assert!(output.coefficients[2].lt(Dec::ONE));
        assert!(output.coefficients[2].gt(d("0.999")));
        assert!(in_delta(floor, listened(&output.coefficients, &stakes), d("0.000000001")).unwrap());
        assert!(output.iterations >= 1);
    }

    #[test]
    fn test_descent_stops_when_listened_fraction_cannot_move() {
        // A lone reputer is always the consensus, so every gradient is zero.
        let losses = vec![ds(&["0.1", "0.4"])];
        let stakes = ds(&["10"]);
        let stuck = ConsensusParams {
            min_stake_fraction: d("0.9"),
            ..ConsensusParams::from(&TopicParams::default())
        };
        let output = get_all_reputers_output(&losses, &stakes, &ds(&["0.5"]), &stuck).unwrap();
        assert_eq!(output.coefficients, ds(&["0.5"]));
        assert_eq!(output.iterations, 0);
        assert_eq!(output.scores, vec![Dec::from_i64(100)]);

        let unconstrained = ConsensusParams {
            min_stake_fraction: Dec::ZERO,
            ..stuck
        };
        let output = get_all_reputers_output(&losses, &stakes, &ds(&["0.5"]), &unconstrained).unwrap();
        assert_eq!(output.coefficients, ds(&["0.5"]));
        assert_eq!(output.iterations, 1);
    }

    #[test]
    fn test_reputers_without_stake_are_rejected() {
        let params = ConsensusParams::from(&TopicParams::default());
        let err = get_all_reputers_output(&[ds(&["1"])], &ds(&["0"]), &ds(&["1"]), &params).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    fn report(reputer: &str, inferers: &[(&str, &str)], one_in: &[(&str, &str)]) -> ReputerValueBundle {
        ReputerValueBundle {
            value_bundle: ValueBundle {
                reputer: reputer.into(),
                combined_value: d("0.1"),
                naive_value: d("0.2"),
                inferer_values: inferers.iter().map(|(w, v)| WorkerAttributedValue::new(*w, d(v))).collect(),
                one_in_forecaster_values: one_in.iter().map(|(w, v)| WorkerAttributedValue::new(*w, d(v))).collect(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_missing_workers_padded_with_nan() {
        let mut values = vec![WorkerAttributedValue::new("b", Dec::ONE)];
        let all: BTreeSet<ActorId> = ["c", "a", "b"].iter().map(|s| s.to_string()).collect();
        ensure_all_workers_present(&mut values, &all);
        let workers: Vec<&str> = values.iter().map(|v| v.worker.as_str()).collect();
        assert_eq!(workers, vec!["b", "a", "c"]);
        assert!(values[1].value.is_nan());

        let mut withheld = vec![];
        ensure_all_workers_present_withheld(&mut withheld, &all);
        assert_eq!(withheld.len(), 3);
    }

    #[test]
    fn test_reports_aligned_before_extraction() {
        let mut reports = vec![
            report("r1", &[("w2", "0.5"), ("w1", "0.4")], &[("f1", "0.3")]),
            report("r2", &[("w1", "0.6")], &[]),
        ];
        reports[0].value_bundle.one_out_inferer_forecaster_values = vec![crate::model::OneOutInfererForecasterValues {
            forecaster: "f1".into(),
            one_out_inferer_values: vec![WithheldWorkerAttributedValue::new("w1", d("0.7"))],
        }];
        ensure_worker_presence(&mut reports);

        let first = extract_values(&reports[0].value_bundle);
        let second = extract_values(&reports[1].value_bundle);
        assert_eq!(first.len(), second.len());
        // combined, naive, w1, w2, nested f1/w1, one-in f1
        assert_eq!(first, ds(&["0.1", "0.2", "0.4", "0.5", "0.7", "0.3"]));
        assert_eq!(second[2], d("0.6"));
        assert!(second[3].is_nan());
        assert!(second[4].is_nan());
        assert!(second[5].is_nan());
    }

    #[test]
    fn test_reputer_scores_persist_coefficients() {
        let mut ledger = InMemoryLedger::new().with_stake(1, "r1", 1_000).with_stake(1, "r2", 1_000);
        let reports = vec![
            report("r1", &[("w1", "0.4")], &[]),
            report("r2", &[("w1", "0.4")], &[]),
        ];
        let scores =
            calc_reputer_scores_set_listening_coefficients(&mut ledger, 1, 50, &reports, &TopicParams::default())
                .unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].score, Dec::from_i64(100));
        assert_eq!(ledger.get_coefficient(1, "r2").unwrap(), Dec::ONE);
        assert_eq!(ledger.epoch_scores(1, ActorType::Reputer).len(), 2);
    }

    mockall::mock! {
        ReputerLedger {}
        impl StakeLedger for ReputerLedger {
            fn get_stake(&self, topic_id: TopicId, reputer: &str) -> Result<Stake>;
        }
        impl CoefficientLedger for ReputerLedger {
            fn get_coefficient(&self, topic_id: TopicId, reputer: &str) -> Result<Dec>;
            fn set_coefficient(&mut self, topic_id: TopicId, reputer: &str, coefficient: Dec) -> Result<()>;
        }
        impl ScoreLedger for ReputerLedger {
            fn get_score_ema(&self, topic_id: TopicId, actor_type: ActorType, actor: &str) -> Result<Score>;
            fn set_score_ema(&mut self, topic_id: TopicId, actor_type: ActorType, score: Score) -> Result<()>;
            fn set_epoch_score(&mut self, topic_id: TopicId, actor_type: ActorType, score: Score) -> Result<()>;
        }
    }

    #[test]
    fn test_one_coefficient_and_score_written_per_reputer() {
        let mut ledger = MockReputerLedger::new();
        ledger.expect_get_stake().times(3).returning(|_, _| Ok(500));
        ledger.expect_get_coefficient().times(3).returning(|_, _| Ok(Dec::ONE));
        ledger
            .expect_set_coefficient()
            .withf(|topic, _, value| *topic == 4 && value.gte(Dec::ZERO) && value.lte(Dec::ONE))
            .times(3)
            .returning(|_, _, _| Ok(()));
        ledger
            .expect_set_epoch_score()
            .withf(|topic, actor_type, score| *topic == 4 && *actor_type == ActorType::Reputer && score.block_height == 9)
            .times(3)
            .returning(|_, _, _| Ok(()));
        ledger.expect_set_score_ema().never();

        let reports = vec![
            report("r1", &[("w1", "0.4")], &[]),
            report("r2", &[("w1", "0.5")], &[]),
            report("r3", &[("w1", "0.45")], &[]),
        ];
        let scores =
            calc_reputer_scores_set_listening_coefficients(&mut ledger, 4, 9, &reports, &TopicParams::default())
                .unwrap();
        assert_eq!(scores.len(), 3);
    }
}
