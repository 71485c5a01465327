use crate::core::error::{EngineError, Result, WithStep};
use crate::math::utils::interpolate_at;
use crate::math::Dec;
use crate::model::Score;

/// Quantile of an already descending-sorted score list.
///
/// `position = (1 − q)·(n − 1)`, interpolated linearly between neighbours, so
/// q = 0.25 is the value a quarter of the way up from the bottom.
pub fn get_quantile_of_scores(sorted_scores: &[Score], quantile: Dec) -> Result<Dec> {
    if sorted_scores.is_empty() {
        return Err(EngineError::EmptyArray("scores for quantile"));
    }
    if quantile.is_nan() || quantile.lt(Dec::ZERO) || quantile.gt(Dec::ONE) {
        return Err(EngineError::invalid(format!("quantile {} outside [0, 1]", quantile)));
    }
    let values: Vec<Dec> = sorted_scores.iter().map(|s| s.score).collect();
    let position = Dec::from_usize(values.len() - 1)
        .and_then(|last| Dec::ONE.sub(quantile)?.mul(last))
        .step("quantile position")?;
    interpolate_at(&values, position).step("quantile of scores")
}
