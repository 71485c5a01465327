use crate::math::MathError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("empty array: {0}")]
    EmptyArray(&'static str),

    #[error("arithmetic failure in {step}: {source}")]
    Arithmetic {
        step: &'static str,
        #[source]
        source: MathError,
    },

    #[error("ledger access failed: {0}")]
    Ledger(String),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}

/// Attaches the name of the calculation step to a math failure.
pub trait WithStep<T> {
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T> WithStep<T> for std::result::Result<T, MathError> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|source| EngineError::Arithmetic { step, source })
    }
}
