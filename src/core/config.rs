use crate::core::error::{EngineError, Result};
use crate::math::Dec;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub topic: TopicParams,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub log_level: String,
    pub epoch_input_path: Option<String>,
}

/// Per-topic and module parameters read by the consensus calculations.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopicParams {
    pub p_norm: Dec,
    pub c_norm: Dec,
    pub alpha_regret: Dec,
    pub epsilon: Dec,
    pub epsilon_safe_div: Dec,
    pub epsilon_reputer: Dec,
    pub merit_sortition_alpha: Dec,
    pub learning_rate: Dec,
    pub max_gradient_threshold: Dec,
    pub min_stake_fraction: Dec,
    pub max_iterations: u64,
    pub ground_truth_lag: i64,
    pub epoch_length: i64,
    pub max_top_inferers: u64,
    pub max_top_forecasters: u64,
    pub max_top_reputers: u64,
    pub active_inferer_quantile: Dec,
    pub active_forecaster_quantile: Dec,
    pub active_reputer_quantile: Dec,
}

impl Default for TopicParams {
    fn default() -> Self {
        Self {
            p_norm: Dec::from_i64(3),
            c_norm: Dec::new(dec!(0.75)),
            alpha_regret: Dec::new(dec!(0.1)),
            epsilon: Dec::new(dec!(0.0001)),
            epsilon_safe_div: Dec::new(dec!(0.000000000000000001)),
            epsilon_reputer: Dec::new(dec!(0.01)),
            merit_sortition_alpha: Dec::new(dec!(0.1)),
            learning_rate: Dec::new(dec!(0.05)),
            max_gradient_threshold: Dec::new(dec!(0.001)),
            min_stake_fraction: Dec::new(dec!(0.5)),
            max_iterations: 10,
            ground_truth_lag: 12,
            epoch_length: 12,
            max_top_inferers: 48,
            max_top_forecasters: 6,
            max_top_reputers: 12,
            active_inferer_quantile: Dec::new(dec!(0.25)),
            active_forecaster_quantile: Dec::new(dec!(0.25)),
            active_reputer_quantile: Dec::new(dec!(0.25)),
        }
    }
}

impl TopicParams {
    pub fn validate(&self) -> Result<()> {
        if !self.p_norm.is_positive() {
            return Err(EngineError::invalid(format!("p_norm must be positive, got {}", self.p_norm)));
        }
        if self.c_norm.is_nan() {
            return Err(EngineError::invalid("c_norm is NaN"));
        }
        if !self.alpha_regret.is_positive() || self.alpha_regret.gt(Dec::ONE) {
            return Err(EngineError::invalid(format!(
                "alpha_regret must be in (0, 1], got {}",
                self.alpha_regret
            )));
        }
        if !self.merit_sortition_alpha.is_positive() || self.merit_sortition_alpha.gt(Dec::ONE) {
            return Err(EngineError::invalid(format!(
                "merit_sortition_alpha must be in (0, 1], got {}",
                self.merit_sortition_alpha
            )));
        }
        for (name, eps) in [
            ("epsilon", self.epsilon),
            ("epsilon_safe_div", self.epsilon_safe_div),
            ("epsilon_reputer", self.epsilon_reputer),
            ("learning_rate", self.learning_rate),
        ] {
            if !eps.is_positive() {
                return Err(EngineError::invalid(format!("{} must be positive, got {}", name, eps)));
            }
        }
        for (name, q) in [
            ("min_stake_fraction", self.min_stake_fraction),
            ("active_inferer_quantile", self.active_inferer_quantile),
            ("active_forecaster_quantile", self.active_forecaster_quantile),
            ("active_reputer_quantile", self.active_reputer_quantile),
        ] {
            if q.is_nan() || q.lt(Dec::ZERO) || q.gt(Dec::ONE) {
                return Err(EngineError::invalid(format!("{} must be in [0, 1], got {}", name, q)));
            }
        }
        if self.epoch_length <= 0 || self.ground_truth_lag < 0 {
            return Err(EngineError::invalid("epoch_length must be positive and ground_truth_lag non-negative"));
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = TopicParams::default();
        let topic = TopicParams {
            p_norm: env_or("P_NORM", defaults.p_norm),
            c_norm: env_or("C_NORM", defaults.c_norm),
            alpha_regret: env_or("ALPHA_REGRET", defaults.alpha_regret),
            epsilon: env_or("EPSILON", defaults.epsilon),
            epsilon_safe_div: env_or("EPSILON_SAFE_DIV", defaults.epsilon_safe_div),
            epsilon_reputer: env_or("EPSILON_REPUTER", defaults.epsilon_reputer),
            merit_sortition_alpha: env_or("MERIT_SORTITION_ALPHA", defaults.merit_sortition_alpha),
            learning_rate: env_or("LEARNING_RATE", defaults.learning_rate),
            max_gradient_threshold: env_or("MAX_GRADIENT_THRESHOLD", defaults.max_gradient_threshold),
            min_stake_fraction: env_or("MIN_STAKE_FRACTION", defaults.min_stake_fraction),
            max_iterations: env_or("MAX_ITERATIONS", defaults.max_iterations),
            ground_truth_lag: env_or("GROUND_TRUTH_LAG", defaults.ground_truth_lag),
            epoch_length: env_or("EPOCH_LENGTH", defaults.epoch_length),
            max_top_inferers: env_or("MAX_TOP_INFERERS", defaults.max_top_inferers),
            max_top_forecasters: env_or("MAX_TOP_FORECASTERS", defaults.max_top_forecasters),
            max_top_reputers: env_or("MAX_TOP_REPUTERS", defaults.max_top_reputers),
            active_inferer_quantile: env_or("ACTIVE_INFERER_QUANTILE", defaults.active_inferer_quantile),
            active_forecaster_quantile: env_or(
                "ACTIVE_FORECASTER_QUANTILE",
                defaults.active_forecaster_quantile,
            ),
            active_reputer_quantile: env_or("ACTIVE_REPUTER_QUANTILE", defaults.active_reputer_quantile),
        };
        topic.validate()?;

        Ok(Config {
            topic,
            runtime: RuntimeConfig {
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                epoch_input_path: env::var("EPOCH_INPUT_PATH").ok(),
            },
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        let params = TopicParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.c_norm, Dec::from_str("0.75").unwrap());
        assert_eq!(params.epsilon_safe_div, Dec::from_str("1e-18").unwrap());
        assert!(!params.min_stake_fraction.is_nan());
        assert_eq!(params.max_top_forecasters, 6);
    }

    #[test]
    fn test_validate_rejects_bad_quantile() {
        let params = TopicParams {
            active_reputer_quantile: Dec::from_str("1.5").unwrap(),
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_non_positive_p_norm() {
        let params = TopicParams {
            p_norm: Dec::ZERO,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }
}
