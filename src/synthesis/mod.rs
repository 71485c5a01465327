//! Inference synthesis and the loss and regret bookkeeping that feeds it.

pub mod bootstrap;
pub mod forecast_implied;
pub mod losses;
pub mod network_inference;
pub mod nonce;
pub mod palette;
pub mod regrets;
pub mod weight;

pub use bootstrap::{ForecasterStatus, InfererStatus, StatefulRegret};
pub use forecast_implied::calc_forecast_implied_inferences;
pub use losses::{calc_combined_network_loss, calc_network_losses, RunningWeightedLoss};
pub use network_inference::{calc_network_inferences, get_network_inference, NetworkInferences};
pub use palette::{SynthPalette, SynthRequest, WeightAccumulator};
pub use regrets::{calc_topic_initial_regret, compute_and_build_em_regret, get_calc_set_network_regrets, RegretUpdate};
pub use weight::{calc_weight_from_normalized_regret, calc_weights_given_workers, RegretInformedWeights};
