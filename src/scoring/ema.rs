use crate::core::error::{Result, WithStep};
use crate::ledger::{ScoreLedger, TopicStateLedger};
use crate::math::{calc_ema, Dec};
use crate::model::{ActorType, BlockHeight, Score, TopicId};
use crate::sortition::{get_quantile_of_scores, RankedScores};
use tracing::debug;

fn blend_into_ema<L: ScoreLedger + ?Sized>(
    ledger: &mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    actor_type: ActorType,
    alpha: Dec,
    actor: &str,
    target: Dec,
) -> Result<Score> {
    let previous = ledger.get_score_ema(topic_id, actor_type, actor)?;
    let value = calc_ema(alpha, target, previous.score, previous.is_unset()).step("score ema")?;
    let ema = Score::new(topic_id, block_height, actor, value);
    ledger.set_score_ema(topic_id, actor_type, ema.clone())?;
    Ok(ema)
}

/// Blends an active actor's new epoch score into its stored EMA.
///
/// The first score ever seen seeds the EMA as is.
pub fn calc_and_save_score_ema_for_active_set<L: ScoreLedger + ?Sized>(
    ledger: &mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    actor_type: ActorType,
    alpha: Dec,
    new_score: &Score,
) -> Result<Score> {
    blend_into_ema(
        ledger,
        topic_id,
        block_height,
        actor_type,
        alpha,
        &new_score.address,
        new_score.score,
    )
}

/// Moves an actor's EMA toward the last quantile saved for its role.
pub fn calc_and_save_score_ema_with_last_saved_topic_quantile<L>(
    ledger: &mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    actor_type: ActorType,
    alpha: Dec,
    actor: &str,
) -> Result<Score>
where
    L: ScoreLedger + TopicStateLedger + ?Sized,
{
    let quantile = ledger.get_previous_quantile_score(topic_id, actor_type)?;
    blend_into_ema(ledger, topic_id, block_height, actor_type, alpha, actor, quantile)
}

/// Pulls every passive actor's EMA toward the quantile of the active set.
///
/// The quantile is taken over the top actors only and saved as the role's
/// previous quantile. With no active actors, passive ones follow the last
/// saved quantile instead. Returns the quantile used.
pub fn update_passive_scores_with_active_quantile<L>(
    ledger: &mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    actor_type: ActorType,
    alpha: Dec,
    quantile: Dec,
    ranked: &RankedScores,
) -> Result<Dec>
where
    L: ScoreLedger + TopicStateLedger + ?Sized,
{
    if ranked.top.is_empty() {
        for passive in &ranked.all_sorted {
            calc_and_save_score_ema_with_last_saved_topic_quantile(
                ledger,
                topic_id,
                block_height,
                actor_type,
                alpha,
                &passive.address,
            )?;
        }
        return ledger.get_previous_quantile_score(topic_id, actor_type);
    }

    let active_quantile = get_quantile_of_scores(&ranked.top, quantile)?;
    ledger.set_previous_quantile_score(topic_id, actor_type, active_quantile)?;

    let mut updated = 0usize;
    for passive in ranked.passive() {
        blend_into_ema(
            ledger,
            topic_id,
            block_height,
            actor_type,
            alpha,
            &passive.address,
            active_quantile,
        )?;
        updated += 1;
    }
    debug!(topic_id, ?actor_type, updated, quantile = %active_quantile, "passive scores moved to active quantile");
    Ok(active_quantile)
}
