use crate::core::error::{Result, WithStep};
use crate::ledger::ScoreLedger;
use crate::math::Dec;
use crate::model::{ActorType, BlockHeight, Score, TopicId, ValueBundle};
use tracing::{debug, info};

/// How much a network without this worker loses: `one_out_loss − combined_loss`.
pub fn calc_one_out_score(one_out_loss: Dec, combined_loss: Dec) -> Result<Dec> {
    one_out_loss.sub(combined_loss).step("one-out score")
}

/// How much this worker alone improves the naive network: `naive_loss − one_in_loss`.
pub fn calc_one_in_score(naive_loss: Dec, one_in_loss: Dec) -> Result<Dec> {
    naive_loss.sub(one_in_loss).step("one-in score")
}

/// Share of a forecaster's score that rewards its unique contribution: `1 / 2^(n − 1)`.
pub fn get_f_unique_agg(num_forecasters: usize) -> Result<Dec> {
    let exponent = num_forecasters.saturating_sub(1) as i64;
    Dec::from_i64(2)
        .powi(exponent)
        .and_then(|denominator| Dec::ONE.quo(denominator))
        .step("fUniqueAgg")
}

/// `f·one_in + (1 − f)·one_out`
pub fn get_final_worker_score_forecast_task(one_in_score: Dec, one_out_score: Dec, f_unique_agg: Dec) -> Result<Dec> {
    let unique = f_unique_agg.mul(one_in_score).step("forecast score")?;
    Dec::ONE
        .sub(f_unique_agg)
        .and_then(|rest| rest.mul(one_out_score))
        .and_then(|shared| unique.add(shared))
        .step("forecast score")
}

fn write_epoch_scores<L: ScoreLedger + ?Sized>(
    ledger: &mut L,
    topic_id: TopicId,
    actor_type: ActorType,
    scores: &[Score],
) -> Result<()> {
    for score in scores {
        ledger.set_epoch_score(topic_id, actor_type, score.clone())?;
    }
    Ok(())
}

/// Inferer scores from the network losses, written as epoch scores.
///
/// A lone inferer scores zero: there is no network to withhold it from.
pub fn calc_inferer_scores<L: ScoreLedger + ?Sized>(
    ledger: &mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    losses: &ValueBundle,
) -> Result<Vec<Score>> {
    let scores = if let [only] = losses.inferer_values.as_slice() {
        vec![Score::new(topic_id, block_height, only.worker.clone(), Dec::ZERO)]
    } else {
        losses
            .one_out_inferer_values
            .iter()
            .map(|one_out| {
                let score = calc_one_out_score(one_out.value, losses.combined_value)?;
                Ok(Score::new(topic_id, block_height, one_out.worker.clone(), score))
            })
            .collect::<Result<Vec<Score>>>()?
    };

    write_epoch_scores(ledger, topic_id, ActorType::Inferer, &scores)?;
    info!(topic_id, block_height, inferers = scores.len(), "inferer scores computed");
    Ok(scores)
}

/// Forecaster scores from the network losses, written as epoch scores.
///
/// Blends the one-in and one-out signals with `fUniqueAgg`. A lone forecaster
/// scores zero; forecasters missing either signal are not scored.
pub fn calc_forecaster_scores<L: ScoreLedger + ?Sized>(
    ledger: &mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    losses: &ValueBundle,
) -> Result<Vec<Score>> {
    let scores = if let [only] = losses.forecaster_values.as_slice() {
        vec![Score::new(topic_id, block_height, only.worker.clone(), Dec::ZERO)]
    } else if losses.forecaster_values.is_empty() {
        Vec::new()
    } else {
        let f_unique_agg = get_f_unique_agg(losses.forecaster_values.len())?;
        let one_out = losses.one_out_forecaster_map();
        let mut scores = Vec::with_capacity(losses.one_in_forecaster_values.len());
        for one_in in &losses.one_in_forecaster_values {
            let Some(one_out_loss) = one_out.get(one_in.worker.as_str()) else {
                debug!(topic_id, forecaster = %one_in.worker, "no one-out loss, forecaster not scored");
                continue;
            };
            let one_in_score = calc_one_in_score(losses.naive_value, one_in.value)?;
            let one_out_score = calc_one_out_score(*one_out_loss, losses.combined_value)?;
            let score = get_final_worker_score_forecast_task(one_in_score, one_out_score, f_unique_agg)?;
            scores.push(Score::new(topic_id, block_height, one_in.worker.clone(), score));
        }
        scores
    };

    write_epoch_scores(ledger, topic_id, ActorType::Forecaster, &scores)?;
    info!(topic_id, block_height, forecasters = scores.len(), "forecaster scores computed");
    Ok(scores)
}
