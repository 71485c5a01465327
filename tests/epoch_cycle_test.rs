use oracle_consensus_engine::core::TopicParams;
use oracle_consensus_engine::engine::{EpochEngine, EpochReport};
use oracle_consensus_engine::ledger::{InMemoryLedger, ScoreLedger, TopicStateLedger};
use oracle_consensus_engine::math::{in_delta, Dec};
use oracle_consensus_engine::model::{
    ActorId, ActorType, Forecast, ForecastElement, Inference, ReputerValueBundle, Score, Stake, ValueBundle,
    WithheldWorkerAttributedValue, WorkerAttributedValue,
};
use oracle_consensus_engine::scoring::{calc_and_save_score_ema_for_active_set, get_all_reputers_output, ConsensusParams};
use oracle_consensus_engine::sortition::{find_top_n_by_score_desc, get_quantile_of_scores};
use oracle_consensus_engine::synthesis::{calc_network_losses, calc_weight_from_normalized_regret};
use std::collections::BTreeMap;

fn d(s: &str) -> Dec {
    s.parse().unwrap()
}

fn attributed(values: &[(&str, &str)]) -> Vec<WorkerAttributedValue> {
    values.iter().map(|(w, v)| WorkerAttributedValue::new(*w, d(v))).collect()
}

fn inference(worker: &str, value: &str) -> Inference {
    Inference {
        topic_id: 1,
        block_height: 100,
        inferer: worker.to_string(),
        value: d(value),
    }
}

fn forecast(forecaster: &str, elements: &[(&str, &str)]) -> Forecast {
    Forecast {
        topic_id: 1,
        block_height: 100,
        forecaster: forecaster.to_string(),
        forecast_elements: elements
            .iter()
            .map(|(w, v)| ForecastElement {
                inferer: w.to_string(),
                value: d(v),
            })
            .collect(),
    }
}

fn inferences() -> Vec<Inference> {
    vec![inference("w0", "1"), inference("w1", "2"), inference("w2", "3")]
}

fn forecasts() -> Vec<Forecast> {
    vec![
        forecast("f0", &[("w0", "0.4"), ("w1", "0.2"), ("w2", "0.3")]),
        forecast("f1", &[("w0", "0.1"), ("w1", "0.5"), ("w2", "0.2")]),
    ]
}

fn loss_bundle(reputer: &str, shift: &str) -> ReputerValueBundle {
    let shift = d(shift);
    let v = |s: &str| d(s).add(shift).unwrap();
    let attributed_shifted = |values: &[(&str, &str)]| -> Vec<WorkerAttributedValue> {
        values.iter().map(|(w, s)| WorkerAttributedValue::new(*w, v(s))).collect()
    };
    let withheld_shifted = |values: &[(&str, &str)]| -> Vec<WithheldWorkerAttributedValue> {
        values
            .iter()
            .map(|(w, s)| WithheldWorkerAttributedValue::new(*w, v(s)))
            .collect()
    };
    ReputerValueBundle {
        value_bundle: ValueBundle {
            topic_id: 1,
            reputer: reputer.to_string(),
            combined_value: v("0.5"),
            naive_value: v("0.6"),
            inferer_values: attributed_shifted(&[("w0", "0.4"), ("w1", "0.6"), ("w2", "0.5")]),
            forecaster_values: attributed_shifted(&[("f0", "0.45"), ("f1", "0.55")]),
            one_out_inferer_values: withheld_shifted(&[("w0", "0.7"), ("w1", "0.45"), ("w2", "0.5")]),
            one_out_forecaster_values: withheld_shifted(&[("f0", "0.52"), ("f1", "0.48")]),
            one_in_forecaster_values: attributed_shifted(&[("f0", "0.55"), ("f1", "0.58")]),
            ..Default::default()
        },
    }
}

fn reputer_round() -> Vec<ReputerValueBundle> {
    vec![
        loss_bundle("r0", "0"),
        loss_bundle("r1", "0"),
        loss_bundle("r2", "0.2"),
    ]
}

fn staked_ledger() -> InMemoryLedger {
    InMemoryLedger::new()
        .with_stake(1, "r0", 100)
        .with_stake(1, "r1", 100)
        .with_stake(1, "r2", 100)
}

fn run_round(ledger: &mut InMemoryLedger) -> EpochReport {
    let mut engine = EpochEngine::new(ledger, TopicParams::default()).unwrap();
    engine.run_reputer_cycle(1, 124, reputer_round()).unwrap()
}

#[test]
fn test_full_epoch_cycle() {
    let mut ledger = staked_ledger();

    let first = {
        let engine = EpochEngine::new(&mut ledger, TopicParams::default()).unwrap();
        engine.run_inference_synthesis(1, 100, inferences(), forecasts()).unwrap()
    };
    // Nobody has history yet: plain average, no sensitivity values.
    assert_eq!(first.value_bundle.combined_value, d("2"));
    assert!(first.value_bundle.one_out_inferer_values.is_empty());

    let report = run_round(&mut ledger);
    assert_eq!(report.inferer_scores.len(), 3);
    assert_eq!(report.forecaster_scores.len(), 2);
    assert_eq!(report.reputer_scores.len(), 3);
    // 3 inferer, 3 naive, 2 forecaster, 6 + 6 one-out inferer, 6 + 2 one-out forecaster, 6 + 2 one-in
    assert_eq!(report.regrets.regrets_written, 36);
    assert!(report.regrets.topic_initial_regret.is_some());
    assert_eq!(ledger.get_network_loss(1).unwrap(), report.network_losses.combined_value);

    let second = {
        let engine = EpochEngine::new(&mut ledger, TopicParams::default()).unwrap();
        engine.run_inference_synthesis(1, 136, inferences(), forecasts()).unwrap()
    };
    let bundle = &second.value_bundle;
    assert!(bundle.combined_value.gt(d("1")) && bundle.combined_value.lt(d("3")));
    assert_eq!(bundle.one_out_inferer_values.len(), 3);
    assert_eq!(bundle.one_out_forecaster_values.len(), 2);
    assert_eq!(bundle.one_in_forecaster_values.len(), 2);
    assert_eq!(second.inferer_weights.len(), 3);
}

#[test]
fn test_identical_inputs_give_identical_reports() {
    let mut a = staked_ledger();
    let mut b = staked_ledger();
    assert_eq!(run_round(&mut a), run_round(&mut b));
    assert_eq!(a.score_emas(1, ActorType::Reputer), b.score_emas(1, ActorType::Reputer));
}

#[test]
fn test_outlier_reputer_scores_lowest() {
    let mut ledger = staked_ledger();
    let report = run_round(&mut ledger);
    let by_reputer: BTreeMap<&str, Dec> = report
        .reputer_scores
        .iter()
        .map(|s| (s.address.as_str(), s.score))
        .collect();
    assert!(by_reputer["r0"].gt(by_reputer["r2"]));
    assert!(in_delta(by_reputer["r0"], by_reputer["r1"], d("0.0000001")).unwrap());
}

#[test]
fn test_single_inferer_scores_zero() {
    let mut ledger = InMemoryLedger::new().with_stake(1, "r0", 10);
    let bundle = ReputerValueBundle {
        value_bundle: ValueBundle {
            reputer: "r0".to_string(),
            combined_value: d("0.3"),
            naive_value: d("0.3"),
            inferer_values: attributed(&[("w0", "0.3")]),
            ..Default::default()
        },
    };
    let mut engine = EpochEngine::new(&mut ledger, TopicParams::default()).unwrap();
    let report = engine.run_reputer_cycle(1, 50, vec![bundle]).unwrap();
    assert_eq!(report.inferer_scores, vec![Score::new(1, 50, "w0", Dec::ZERO)]);
}

#[test]
fn test_network_loss_is_stake_weighted_and_linear() {
    let stakes: BTreeMap<ActorId, Stake> = BTreeMap::from([("r0".to_string(), 1), ("r1".to_string(), 3)]);
    let report = |reputer: &str, combined: &str, workers: &[(&str, &str)]| ReputerValueBundle {
        value_bundle: ValueBundle {
            reputer: reputer.to_string(),
            combined_value: d(combined),
            naive_value: d(combined),
            inferer_values: attributed(workers),
            ..Default::default()
        },
    };

    let losses = calc_network_losses(
        &stakes,
        &[
            report("r0", "0.2", &[("w0", "0.2"), ("w1", "0.8")]),
            report("r1", "0.6", &[("w0", "0.6")]),
        ],
        d("0.0001"),
    )
    .unwrap();
    // (1·0.2 + 3·0.6) / 4
    assert_eq!(losses.combined_value, d("0.5"));
    assert_eq!(losses.inferer_values[0].value, d("0.5"));
    // w1 was reported by r0 only.
    assert_eq!(losses.inferer_values[1].value, d("0.8"));

    let doubled = calc_network_losses(
        &stakes,
        &[report("r0", "0.4", &[]), report("r1", "1.2", &[])],
        d("0.0001"),
    )
    .unwrap();
    assert_eq!(doubled.combined_value, d("1"));
}

#[test]
fn test_gradient_descent_never_lowers_total_score() {
    let losses = vec![
        vec![d("0.1"), d("0.2"), d("0.3")],
        vec![d("0.1"), d("0.2"), d("0.3")],
        vec![d("0.5"), d("0.9"), d("0.1")],
    ];
    let stakes = vec![d("100"), d("100"), d("100")];
    let coefficients = vec![Dec::ONE, Dec::ONE, Dec::ONE];
    let params = ConsensusParams::from(&TopicParams::default());

    let run = |iterations: u64| {
        let params = ConsensusParams {
            max_iterations: iterations,
            ..params
        };
        get_all_reputers_output(&losses, &stakes, &coefficients, &params).unwrap()
    };
    let weighted_total = |scores: &[Dec]| {
        scores
            .iter()
            .zip(&stakes)
            .fold(Dec::ZERO, |acc, (s, w)| acc.add(s.mul(*w).unwrap()).unwrap())
    };

    let mut previous_total = weighted_total(&run(0).scores);
    let mut previous_outlier = Dec::ONE;
    for iterations in [2, 5, 20] {
        let output = run(iterations);
        let total = weighted_total(&output.scores);
        assert!(total.gte(previous_total), "{} iterations lowered the total", iterations);
        assert!(output.coefficients[2].lte(previous_outlier));
        assert!(output.coefficients[0].gt(d("0.99")));
        previous_total = total;
        previous_outlier = output.coefficients[2];
    }
    assert!(previous_outlier.lt(Dec::ONE));
}

#[test]
fn test_weight_grows_with_regret_and_p_norm_sharpens() {
    let c = d("0.75");
    let max = d("0.5");
    let mut last = Dec::ZERO;
    for regret in ["-1", "0", "0.25", "0.5"] {
        let weight = calc_weight_from_normalized_regret(d(regret), max, d("3"), c).unwrap();
        assert!(weight.gt(last));
        last = weight;
    }

    let ratio = |p: &str| {
        let good = calc_weight_from_normalized_regret(d("0.5"), max, d(p), c).unwrap();
        let bad = calc_weight_from_normalized_regret(d("-1"), max, d(p), c).unwrap();
        good.quo(bad).unwrap()
    };
    assert!(ratio("4").gt(ratio("2")));
}

#[test]
fn test_sortition_ignores_input_order() {
    let scores: Vec<Score> = [("a", "5"), ("b", "5"), ("c", "5"), ("d", "7"), ("e", "5")]
        .iter()
        .map(|(a, s)| Score::new(1, 9, *a, d(s)))
        .collect();
    let mut reversed = scores.clone();
    reversed.reverse();

    let forward = find_top_n_by_score_desc(3, &scores, 4242);
    let backward = find_top_n_by_score_desc(3, &reversed, 4242);
    assert_eq!(forward, backward);
    assert_eq!(forward.top[0].address, "d");
}

#[test]
fn test_score_ema_and_quantile() {
    let mut ledger = InMemoryLedger::new();
    ledger
        .set_score_ema(1, ActorType::Reputer, Score::new(1, 3, "r0", d("200")))
        .unwrap();
    let ema =
        calc_and_save_score_ema_for_active_set(&mut ledger, 1, 6, ActorType::Reputer, d("0.1"), &Score::new(1, 6, "r0", d("300")))
            .unwrap();
    assert!(in_delta(d("210"), ema.score, d("0.0001")).unwrap());

    let sorted: Vec<Score> = [90, 80, 70, 60, 50]
        .iter()
        .enumerate()
        .map(|(i, v)| Score::new(1, 1, format!("a{}", i), Dec::from_i64(*v)))
        .collect();
    assert_eq!(get_quantile_of_scores(&sorted, d("0.5")).unwrap(), Dec::from_i64(70));
    assert_eq!(get_quantile_of_scores(&sorted, d("0.2")).unwrap().to_i64().unwrap(), 58);
}
