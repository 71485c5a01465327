//! Deterministic decimal arithmetic shared by every consensus calculation.

pub mod dec;
pub mod utils;

pub use dec::{Dec, MathResult};
pub use utils::{
    calc_ema, get_quantile_of_decs, gradient, in_delta, median, phi, std_dev, sum, weighted_mean,
};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MathError {
    #[error("decimal value is NaN")]
    NaN,

    #[error("decimal overflow in {0}")]
    Overflow(&'static str),

    #[error("division by zero")]
    DivisionByZero,

    #[error("value outside function domain: {0}")]
    Domain(String),

    #[error("cannot parse decimal: {0}")]
    Parse(String),

    #[error("empty input to {0}")]
    Empty(&'static str),
}
