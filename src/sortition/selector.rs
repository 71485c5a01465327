use crate::model::{ActorId, BlockHeight, Score};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Outcome of a merit sortition over one role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedScores {
    /// At most `n` entries, best first.
    pub top: Vec<Score>,
    pub all_sorted: Vec<Score>,
    pub is_top: BTreeSet<ActorId>,
}

impl RankedScores {
    pub fn is_top(&self, actor: &str) -> bool {
        self.is_top.contains(actor)
    }

    pub fn passive(&self) -> impl Iterator<Item = &Score> {
        self.all_sorted.iter().filter(move |s| !self.is_top.contains(&s.address))
    }
}

// 0 ranks first.
fn rank_class(score: &Score) -> u8 {
    if score.score.is_nan() || score.is_unset() {
        1
    } else {
        0
    }
}

/// One draw per actor, in address order, from a generator seeded by the block.
fn draw_tiebreakers(scores: &[Score], seed: BlockHeight) -> BTreeMap<ActorId, u64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);
    let addresses: BTreeSet<&ActorId> = scores.iter().map(|s| &s.address).collect();
    addresses
        .into_iter()
        .map(|address| (address.clone(), rng.next_u64()))
        .collect()
}

/// Sorts `scores` descending and keeps the best `n`.
///
/// Equal scores are ordered by a per-actor draw from a ChaCha8 stream seeded
/// with `seed` (the block height), so every replica ranks identically. Unset
/// and NaN entries go last.
pub fn find_top_n_by_score_desc(n: usize, scores: &[Score], seed: BlockHeight) -> RankedScores {
    let tiebreakers = draw_tiebreakers(scores, seed);
    let tiebreak = |s: &Score| tiebreakers.get(&s.address).copied().unwrap_or_default();

    let mut all_sorted = scores.to_vec();
    all_sorted.sort_by(|a, b| {
        rank_class(a)
            .cmp(&rank_class(b))
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            .then_with(|| tiebreak(b).cmp(&tiebreak(a)))
            .then_with(|| a.address.cmp(&b.address))
    });

    let top: Vec<Score> = all_sorted.iter().take(n).cloned().collect();
    let is_top = top.iter().map(|s| s.address.clone()).collect();
    if all_sorted.len() > n {
        debug!(kept = n, dropped = all_sorted.len() - n, seed, "sortition truncated");
    }
    RankedScores { top, all_sorted, is_top }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Dec;

    fn score(address: &str, value: i64) -> Score {
        Score::new(1, 10, address, Dec::from_i64(value))
    }

    #[test]
    fn test_sorted_descending_and_truncated() {
        let scores = vec![score("a", 3), score("b", 9), score("c", 5), score("d", 1)];
        let ranked = find_top_n_by_score_desc(2, &scores, 100);
        let top: Vec<&str> = ranked.top.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(top, vec!["b", "c"]);
        assert_eq!(ranked.all_sorted.len(), 4);
        assert!(ranked.is_top("b"));
        assert!(!ranked.is_top("a"));
        let passive: Vec<&str> = ranked.passive().map(|s| s.address.as_str()).collect();
        assert_eq!(passive, vec!["a", "d"]);
    }

    #[test]
    fn test_n_larger_than_input() {
        let ranked = find_top_n_by_score_desc(10, &[score("a", 1)], 1);
        assert_eq!(ranked.top.len(), 1);
        assert_eq!(ranked.all_sorted.len(), 1);
    }

    #[test]
    fn test_ties_are_reproducible_per_seed() {
        let scores: Vec<Score> = ["a", "b", "c", "d", "e", "f"].iter().map(|a| score(a, 7)).collect();
        let first = find_top_n_by_score_desc(3, &scores, 42);
        for _ in 0..5 {
            assert_eq!(find_top_n_by_score_desc(3, &scores, 42), first);
        }
        let mut reversed = scores.clone();
        reversed.reverse();
        assert_eq!(find_top_n_by_score_desc(3, &reversed, 42).all_sorted, first.all_sorted);
    }

    #[test]
    fn test_unset_scores_sort_last() {
        let unset = Score::new(1, 0, "new", Dec::ZERO);
        let scores = vec![unset, score("neg", -5), score("pos", 2)];
        let ranked = find_top_n_by_score_desc(3, &scores, 9);
        let order: Vec<&str> = ranked.all_sorted.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(order, vec!["pos", "neg", "new"]);
    }
}
