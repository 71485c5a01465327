use super::{Dec, MathError, MathResult};

/// Exponential moving average.
///
/// Returns `current` unchanged on the first observation or when nothing moved,
/// otherwise `alpha * current + (1 - alpha) * previous`.
pub fn calc_ema(alpha: Dec, current: Dec, previous: Dec, first_time: bool) -> MathResult<Dec> {
    if alpha.is_nan() || current.is_nan() || previous.is_nan() {
        return Err(MathError::NaN);
    }
    if first_time || current == previous {
        return Ok(current);
    }
    let blended_current = alpha.mul(current)?;
    let one_minus_alpha = Dec::ONE.sub(alpha)?;
    let blended_previous = one_minus_alpha.mul(previous)?;
    blended_current.add(blended_previous)
}

pub fn sum(values: &[Dec]) -> MathResult<Dec> {
    values.iter().try_fold(Dec::ZERO, |acc, v| acc.add(*v))
}

pub fn mean(values: &[Dec]) -> MathResult<Dec> {
    if values.is_empty() {
        return Err(MathError::Empty("mean"));
    }
    sum(values)?.quo(Dec::from_usize(values.len())?)
}

/// Sample standard deviation (n - 1 denominator). A single value has zero spread.
pub fn std_dev(values: &[Dec]) -> MathResult<Dec> {
    if values.is_empty() {
        return Err(MathError::Empty("std_dev"));
    }
    if values.iter().any(Dec::is_nan) {
        return Err(MathError::NaN);
    }
    if values.len() == 1 {
        return Ok(Dec::ZERO);
    }
    let avg = mean(values)?;
    let mut sum_sq = Dec::ZERO;
    for v in values {
        let diff = v.sub(avg)?;
        sum_sq = sum_sq.add(diff.mul(diff)?)?;
    }
    let denom = Dec::from_usize(values.len() - 1)?;
    sum_sq.quo(denom)?.sqrt()
}

/// Median of unsorted values. Empty input yields zero.
pub fn median(values: &[Dec]) -> MathResult<Dec> {
    if values.iter().any(Dec::is_nan) {
        return Err(MathError::NaN);
    }
    if values.is_empty() {
        return Ok(Dec::ZERO);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Ok(sorted[mid])
    } else {
        sorted[mid - 1].add(sorted[mid])?.quo(Dec::from_i64(2))
    }
}

/// Σ(w·v) / Σw. Fails when the weights sum to zero.
pub fn weighted_mean(values: &[Dec], weights: &[Dec]) -> MathResult<Dec> {
    if values.len() != weights.len() {
        return Err(MathError::Domain(format!(
            "weighted_mean length mismatch: {} values, {} weights",
            values.len(),
            weights.len()
        )));
    }
    let mut numerator = Dec::ZERO;
    let mut denominator = Dec::ZERO;
    for (v, w) in values.iter().zip(weights) {
        numerator = numerator.add(v.mul(*w)?)?;
        denominator = denominator.add(*w)?;
    }
    numerator.quo(denominator)
}

/// φ_p(x) = ln(1 + e^(p·(x − c)))
pub fn phi(p: Dec, c: Dec, x: Dec) -> MathResult<Dec> {
    let exponent = p.mul(x.sub(c)?)?;
    Dec::ONE.add(exponent.exp()?)?.ln()
}

/// φ'_p(x) = p / (e^(p·(c − x)) + 1)
pub fn gradient(p: Dec, c: Dec, x: Dec) -> MathResult<Dec> {
    let exponent = p.mul(c.sub(x)?)?;
    let denom = exponent.exp()?.add(Dec::ONE)?;
    p.quo(denom)
}

/// |expected − actual| ≤ epsilon
pub fn in_delta(expected: Dec, actual: Dec, epsilon: Dec) -> MathResult<bool> {
    let diff = expected.sub(actual)?.abs()?;
    Ok(diff.lte(epsilon))
}

/// Quantile of unsorted values, ascending convention: position = q·(n − 1).
pub fn get_quantile_of_decs(values: &[Dec], quantile: Dec) -> MathResult<Dec> {
    if quantile.lt(Dec::ZERO) || quantile.gt(Dec::ONE) || quantile.is_nan() {
        return Err(MathError::Domain(format!("quantile {} outside [0, 1]", quantile)));
    }
    if values.iter().any(Dec::is_nan) {
        return Err(MathError::NaN);
    }
    if values.is_empty() {
        return Ok(Dec::ZERO);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let position = quantile.mul(Dec::from_usize(sorted.len() - 1)?)?;
    interpolate_at(&sorted, position)
}

/// Linear interpolation between the order statistics around `position`.
pub(crate) fn interpolate_at(sorted: &[Dec], position: Dec) -> MathResult<Dec> {
    let lower = position.floor()?;
    let upper = position.ceil()?;
    let lower_idx = lower.to_usize()?;
    let upper_idx = upper.to_usize()?;
    if lower_idx >= sorted.len() || upper_idx >= sorted.len() {
        return Err(MathError::Domain(format!(
            "position {} outside {} values",
            position,
            sorted.len()
        )));
    }
    if lower_idx == upper_idx {
        return Ok(sorted[lower_idx]);
    }
    let frac = position.sub(lower)?;
    let span = sorted[upper_idx].sub(sorted[lower_idx])?;
    sorted[lower_idx].add(frac.mul(span)?)
}
