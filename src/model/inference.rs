use super::{ActorId, BlockHeight, TopicId};
use crate::math::Dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    pub inferer: ActorId,
    pub value: Dec,
}

/// A forecaster's predicted loss for one inferer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastElement {
    pub inferer: ActorId,
    pub value: Dec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    pub forecaster: ActorId,
    pub forecast_elements: Vec<ForecastElement>,
}

impl Forecast {
    /// Keeps the last element submitted for each inferer, ordered by inferer.
    pub fn dedup_elements(&mut self) {
        let mut latest: BTreeMap<ActorId, Dec> = BTreeMap::new();
        for el in self.forecast_elements.drain(..) {
            latest.insert(el.inferer, el.value);
        }
        self.forecast_elements = latest
            .into_iter()
            .map(|(inferer, value)| ForecastElement { inferer, value })
            .collect();
    }
}

/// Latest inference per inferer, keyed by address.
pub fn latest_inferences_by_inferer(inferences: &[Inference]) -> BTreeMap<ActorId, Inference> {
    let mut by_inferer = BTreeMap::new();
    for inference in inferences {
        by_inferer.insert(inference.inferer.clone(), inference.clone());
    }
    by_inferer
}

/// Latest forecast per forecaster with de-duplicated elements, keyed by address.
pub fn latest_forecasts_by_forecaster(forecasts: &[Forecast]) -> BTreeMap<ActorId, Forecast> {
    let mut by_forecaster = BTreeMap::new();
    for forecast in forecasts {
        let mut forecast = forecast.clone();
        forecast.dedup_elements();
        by_forecaster.insert(forecast.forecaster.clone(), forecast);
    }
    by_forecaster
}
