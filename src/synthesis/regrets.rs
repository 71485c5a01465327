use crate::core::config::TopicParams;
use crate::core::error::{EngineError, Result, WithStep};
use crate::ledger::{RegretFamily, RegretKey, RegretLedger, TopicStateLedger};
use crate::math::{calc_ema, std_dev, Dec};
use crate::model::{BlockHeight, TimestampedValue, TopicId, ValueBundle};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// New regret from a loss difference: EMA of `loss_a - loss_b` over `previous`.
///
/// Without a prior regret the raw difference is taken as is.
pub fn compute_and_build_em_regret(
    loss_a: Dec,
    loss_b: Dec,
    previous: Dec,
    alpha: Dec,
    block_height: BlockHeight,
    no_prior: bool,
) -> Result<TimestampedValue> {
    let diff = loss_a.sub(loss_b).step("loss difference")?;
    let value = calc_ema(alpha, diff, previous, no_prior).step("regret ema")?;
    Ok(TimestampedValue { block_height, value })
}

/// Regret assigned to workers that have never been scored.
///
/// `min(R) + (c - 8.25/p)·(|σ(R)| + ε)`: a newcomer lands just below the
/// weakest established worker, at the point where weights start to matter.
pub fn calc_topic_initial_regret(regrets: &[Dec], epsilon: Dec, p_norm: Dec, c_norm: Dec) -> Result<Dec> {
    let mut iter = regrets.iter().copied();
    let first = iter
        .next()
        .ok_or(EngineError::EmptyArray("regrets for topic initial regret"))?;
    let min = iter.try_fold(first, |acc, r| acc.min(r)).step("minimum regret")?;
    let spread = std_dev(regrets)
        .and_then(|s| s.abs())
        .and_then(|s| s.add(epsilon))
        .step("initial regret spread")?;
    let offset = Dec::new(dec!(8.25))
        .quo(p_norm)
        .and_then(|v| c_norm.sub(v))
        .and_then(|v| v.mul(spread))
        .step("initial regret offset")?;
    min.add(offset).step("topic initial regret")
}

/// Counts of what a regret update wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegretUpdate {
    pub regrets_written: usize,
    pub topic_initial_regret: Option<Dec>,
}

struct RegretWriter<'a, L: ?Sized> {
    ledger: &'a mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    alpha: Dec,
    written: usize,
}

impl<'a, L: RegretLedger + ?Sized> RegretWriter<'a, L> {
    fn update(&mut self, key: RegretKey, loss_a: Dec, loss_b: Dec) -> Result<Dec> {
        let (previous, no_prior) = self.ledger.get_regret(self.topic_id, &key)?;
        let regret =
            compute_and_build_em_regret(loss_a, loss_b, previous.value, self.alpha, self.block_height, no_prior)?;
        debug!(topic_id = self.topic_id, family = ?key.family, worker = %key.worker, regret = %regret.value, "regret updated");
        self.ledger.set_regret(self.topic_id, &key, regret)?;
        self.written += 1;
        Ok(regret.value)
    }
}

/// Folds one round of network losses into every regret family, then resets
/// the topic initial regret from the refreshed inferer and forecaster regrets.
///
/// The withheld or one-in worker is the counterpart of each paired key.
pub fn get_calc_set_network_regrets<L>(
    ledger: &mut L,
    topic_id: TopicId,
    block_height: BlockHeight,
    losses: &ValueBundle,
    params: &TopicParams,
) -> Result<RegretUpdate>
where
    L: RegretLedger + TopicStateLedger + ?Sized,
{
    let inferer_losses = losses.inferer_map();
    let forecaster_losses = losses.forecaster_map();
    let nested_losses = losses.one_out_inferer_forecaster_map();

    let mut writer = RegretWriter {
        ledger: &mut *ledger,
        topic_id,
        block_height,
        alpha: params.alpha_regret,
        written: 0,
    };
    let mut fresh_regrets = Vec::new();

    for inferer in &losses.inferer_values {
        let regret = writer.update(RegretKey::inferer(&inferer.worker), losses.combined_value, inferer.value)?;
        fresh_regrets.push(regret);
        writer.update(
            RegretKey::single(RegretFamily::NaiveInferer, inferer.worker.as_str()),
            losses.naive_value,
            inferer.value,
        )?;
    }

    for forecaster in &losses.forecaster_values {
        let regret = writer.update(
            RegretKey::forecaster(&forecaster.worker),
            losses.combined_value,
            forecaster.value,
        )?;
        fresh_regrets.push(regret);
    }

    for one_out in &losses.one_out_inferer_values {
        let withheld = one_out.worker.as_str();
        for inferer in losses.inferer_values.iter().filter(|v| v.worker != withheld) {
            writer.update(
                RegretKey::paired(RegretFamily::OneOutInfererInferer, withheld, inferer.worker.as_str()),
                one_out.value,
                inferer.value,
            )?;
        }
        for forecaster in &losses.forecaster_values {
            let forecaster_loss = nested_losses
                .get(&(forecaster.worker.as_str(), withheld))
                .copied()
                .unwrap_or(forecaster.value);
            writer.update(
                RegretKey::paired(RegretFamily::OneOutInfererForecaster, withheld, forecaster.worker.as_str()),
                one_out.value,
                forecaster_loss,
            )?;
        }
    }

    for one_out in &losses.one_out_forecaster_values {
        let withheld = one_out.worker.as_str();
        for inferer in &losses.inferer_values {
            writer.update(
                RegretKey::paired(RegretFamily::OneOutForecasterInferer, withheld, inferer.worker.as_str()),
                one_out.value,
                inferer.value,
            )?;
        }
        for forecaster in losses.forecaster_values.iter().filter(|v| v.worker != withheld) {
            writer.update(
                RegretKey::paired(RegretFamily::OneOutForecasterForecaster, withheld, forecaster.worker.as_str()),
                one_out.value,
                forecaster.value,
            )?;
        }
    }

    for one_in in &losses.one_in_forecaster_values {
        let kept = one_in.worker.as_str();
        for inferer in &losses.inferer_values {
            writer.update(
                RegretKey::paired(RegretFamily::OneInForecasterInferer, kept, inferer.worker.as_str()),
                one_in.value,
                inferer.value,
            )?;
        }
        if let Some(own_loss) = forecaster_losses.get(kept) {
            writer.update(
                RegretKey::paired(RegretFamily::OneInForecasterSelf, kept, kept),
                one_in.value,
                *own_loss,
            )?;
        }
    }

    let regrets_written = writer.written;
    let topic_initial_regret = if fresh_regrets.is_empty() {
        None
    } else {
        let initial = calc_topic_initial_regret(&fresh_regrets, params.epsilon, params.p_norm, params.c_norm)?;
        ledger.set_initial_regret(topic_id, initial)?;
        Some(initial)
    };

    info!(
        topic_id,
        block_height,
        regrets_written,
        inferers = inferer_losses.len(),
        forecasters = forecaster_losses.len(),
        "network regrets updated"
    );
    Ok(RegretUpdate {
        regrets_written,
        topic_initial_regret,
    })
}
