use super::{ActorId, ReputerRequestNonce, TopicId};
use crate::core::error::{EngineError, Result};
use crate::math::Dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAttributedValue {
    pub worker: ActorId,
    pub value: Dec,
}

impl WorkerAttributedValue {
    pub fn new(worker: impl Into<ActorId>, value: Dec) -> Self {
        Self {
            worker: worker.into(),
            value,
        }
    }
}

/// Value of the network computed while `worker` was withheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithheldWorkerAttributedValue {
    pub worker: ActorId,
    pub value: Dec,
}

impl WithheldWorkerAttributedValue {
    pub fn new(worker: impl Into<ActorId>, value: Dec) -> Self {
        Self {
            worker: worker.into(),
            value,
        }
    }
}

/// Forecast-implied values of one forecaster, one entry per withheld inferer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneOutInfererForecasterValues {
    pub forecaster: ActorId,
    pub one_out_inferer_values: Vec<WithheldWorkerAttributedValue>,
}

/// Synthesis output, or a reputer's loss report of the same shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueBundle {
    pub topic_id: TopicId,
    pub reputer_request_nonce: Option<ReputerRequestNonce>,
    pub reputer: ActorId,
    pub combined_value: Dec,
    pub naive_value: Dec,
    pub inferer_values: Vec<WorkerAttributedValue>,
    pub forecaster_values: Vec<WorkerAttributedValue>,
    pub one_out_inferer_values: Vec<WithheldWorkerAttributedValue>,
    pub one_out_forecaster_values: Vec<WithheldWorkerAttributedValue>,
    pub one_in_forecaster_values: Vec<WorkerAttributedValue>,
    pub one_out_inferer_forecaster_values: Vec<OneOutInfererForecasterValues>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputerValueBundle {
    pub value_bundle: ValueBundle,
}

/// Collapses duplicates onto the first slot of each key, keeping the last value.
fn dedup_by_key<T>(items: &mut Vec<T>, key: fn(&T) -> &str) {
    let mut slot: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if let Some(&idx) = slot.get(key(&item)) {
            kept[idx] = item;
            continue;
        }
        slot.insert(key(&item).to_string(), kept.len());
        kept.push(item);
    }
    *items = kept;
}

fn attributed_worker(v: &WorkerAttributedValue) -> &str {
    &v.worker
}

fn withheld_worker(v: &WithheldWorkerAttributedValue) -> &str {
    &v.worker
}

fn nested_forecaster(v: &OneOutInfererForecasterValues) -> &str {
    &v.forecaster
}

impl ValueBundle {
    /// Removes duplicate per-worker entries, keeping the latest submitted value.
    pub fn dedup(&mut self) {
        dedup_by_key(&mut self.inferer_values, attributed_worker);
        dedup_by_key(&mut self.forecaster_values, attributed_worker);
        dedup_by_key(&mut self.one_in_forecaster_values, attributed_worker);
        dedup_by_key(&mut self.one_out_inferer_values, withheld_worker);
        dedup_by_key(&mut self.one_out_forecaster_values, withheld_worker);
        dedup_by_key(&mut self.one_out_inferer_forecaster_values, nested_forecaster);
        for nested in self.one_out_inferer_forecaster_values.iter_mut() {
            dedup_by_key(&mut nested.one_out_inferer_values, withheld_worker);
        }
    }

    /// Structural checks applied to reputer-reported loss bundles.
    pub fn validate(&self) -> Result<()> {
        if self.reputer.trim().is_empty() {
            return Err(EngineError::invalid("value bundle has no reputer"));
        }
        if self.combined_value.is_nan() || self.naive_value.is_nan() {
            return Err(EngineError::invalid(format!(
                "reputer {} reported NaN combined or naive loss",
                self.reputer
            )));
        }
        let attributed = self
            .inferer_values
            .iter()
            .chain(&self.forecaster_values)
            .chain(&self.one_in_forecaster_values)
            .map(|v| (&v.worker, v.value));
        let withheld = self
            .one_out_inferer_values
            .iter()
            .chain(&self.one_out_forecaster_values)
            .chain(
                self.one_out_inferer_forecaster_values
                    .iter()
                    .flat_map(|n| n.one_out_inferer_values.iter()),
            )
            .map(|v| (&v.worker, v.value));
        for (worker, value) in attributed.chain(withheld) {
            if worker.trim().is_empty() {
                return Err(EngineError::invalid(format!(
                    "reputer {} reported a value with no worker",
                    self.reputer
                )));
            }
            if value.is_nan() {
                return Err(EngineError::invalid(format!(
                    "reputer {} reported NaN loss for worker {}",
                    self.reputer, worker
                )));
            }
        }
        if self
            .one_out_inferer_forecaster_values
            .iter()
            .any(|n| n.forecaster.trim().is_empty())
        {
            return Err(EngineError::invalid(format!(
                "reputer {} reported nested values with no forecaster",
                self.reputer
            )));
        }
        Ok(())
    }

    pub fn inferer_map(&self) -> HashMap<&str, Dec> {
        self.inferer_values.iter().map(|v| (v.worker.as_str(), v.value)).collect()
    }

    pub fn forecaster_map(&self) -> HashMap<&str, Dec> {
        self.forecaster_values.iter().map(|v| (v.worker.as_str(), v.value)).collect()
    }

    pub fn one_out_inferer_map(&self) -> HashMap<&str, Dec> {
        self.one_out_inferer_values.iter().map(|v| (v.worker.as_str(), v.value)).collect()
    }

    pub fn one_out_forecaster_map(&self) -> HashMap<&str, Dec> {
        self.one_out_forecaster_values.iter().map(|v| (v.worker.as_str(), v.value)).collect()
    }

    pub fn one_in_forecaster_map(&self) -> HashMap<&str, Dec> {
        self.one_in_forecaster_values.iter().map(|v| (v.worker.as_str(), v.value)).collect()
    }

    /// (forecaster, withheld inferer) -> value
    pub fn one_out_inferer_forecaster_map(&self) -> HashMap<(&str, &str), Dec> {
        self.one_out_inferer_forecaster_values
            .iter()
            .flat_map(|n| {
                n.one_out_inferer_values
                    .iter()
                    .map(move |v| ((n.forecaster.as_str(), v.worker.as_str()), v.value))
            })
            .collect()
    }
}
