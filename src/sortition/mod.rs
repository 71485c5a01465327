//! Merit sortition: seeded top-N ranking and the quantile used for passive actors.

pub mod quantile;
pub mod selector;

pub use quantile::get_quantile_of_scores;
pub use selector::{find_top_n_by_score_desc, RankedScores};
