use crate::math::Dec;
use crate::model::ActorId;
use serde::{Deserialize, Serialize};

/// A regret as loaded from the ledger, together with whether it was ever written.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatefulRegret {
    pub value: Dec,
    pub no_prior: bool,
}

impl StatefulRegret {
    pub fn new(value: Dec, no_prior: bool) -> Self {
        Self { value, no_prior }
    }

    /// A regret that participates in weighting as if it had history.
    pub fn established(value: Dec) -> Self {
        Self {
            value,
            no_prior: false,
        }
    }
}

/// How many inferers in the working set already carry a regret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfererStatus {
    AllNew,
    /// Exactly one inferer has history; it alone drives the inference.
    AllNewExceptOne(ActorId),
    NotNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForecasterStatus {
    AllNew,
    AllNewExceptOne,
    NotNew,
}

impl InfererStatus {
    pub fn from_regrets<'a, I>(regrets: I) -> Self
    where
        I: IntoIterator<Item = (&'a ActorId, &'a StatefulRegret)>,
    {
        let mut established = regrets.into_iter().filter(|(_, r)| !r.no_prior);
        match (established.next(), established.next()) {
            (None, _) => InfererStatus::AllNew,
            (Some((worker, _)), None) => InfererStatus::AllNewExceptOne(worker.clone()),
            _ => InfererStatus::NotNew,
        }
    }

    /// True for the two bootstrap states in which peers cannot be compared yet.
    pub fn is_bootstrapping(&self) -> bool {
        !matches!(self, InfererStatus::NotNew)
    }
}

impl ForecasterStatus {
    pub fn from_regrets<'a, I>(regrets: I) -> Self
    where
        I: IntoIterator<Item = (&'a ActorId, &'a StatefulRegret)>,
    {
        match regrets.into_iter().filter(|(_, r)| !r.no_prior).take(2).count() {
            0 => ForecasterStatus::AllNew,
            1 => ForecasterStatus::AllNewExceptOne,
            _ => ForecasterStatus::NotNew,
        }
    }

    pub fn is_bootstrapping(&self) -> bool {
        !matches!(self, ForecasterStatus::NotNew)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn regrets(entries: &[(&str, bool)]) -> BTreeMap<ActorId, StatefulRegret> {
        entries
            .iter()
            .map(|(w, no_prior)| (w.to_string(), StatefulRegret::new(Dec::ONE, *no_prior)))
            .collect()
    }

    #[test]
    fn test_inferer_status_transitions() {
        assert_eq!(InfererStatus::from_regrets(&regrets(&[])), InfererStatus::AllNew);
        assert_eq!(
            InfererStatus::from_regrets(&regrets(&[("a", true), ("b", true)])),
            InfererStatus::AllNew
        );
        assert_eq!(
            InfererStatus::from_regrets(&regrets(&[("a", true), ("b", false)])),
            InfererStatus::AllNewExceptOne("b".to_string())
        );
        assert_eq!(
            InfererStatus::from_regrets(&regrets(&[("a", false), ("b", false), ("c", true)])),
            InfererStatus::NotNew
        );
    }

    #[test]
    fn test_forecaster_status_counts_established() {
        assert_eq!(
            ForecasterStatus::from_regrets(&regrets(&[("f1", false)])),
            ForecasterStatus::AllNewExceptOne
        );
        assert!(ForecasterStatus::from_regrets(&regrets(&[("f1", true)])).is_bootstrapping());
        assert!(!ForecasterStatus::from_regrets(&regrets(&[("f1", false), ("f2", false)])).is_bootstrapping());
    }
}
