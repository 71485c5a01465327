//! Reputer, inferer and forecaster scoring and the score EMAs behind sortition.

pub mod actor;
pub mod consensus;
pub mod ema;

pub use actor::{calc_forecaster_scores, calc_inferer_scores, get_f_unique_agg};
pub use consensus::{
    calc_reputer_scores_set_listening_coefficients, ensure_all_workers_present, ensure_all_workers_present_withheld,
    extract_values, get_all_reputers_output, ConsensusParams, ReputersOutput,
};
pub use ema::{calc_and_save_score_ema_for_active_set, update_passive_scores_with_active_quantile};
