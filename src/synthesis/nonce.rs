use crate::model::{BlockHeight, Nonce, ReputerRequestNonce};

/// Nonces no older than one epoch at `block_height`.
pub fn filter_nonces_within_epoch_length(nonces: &[Nonce], block_height: BlockHeight, epoch_length: i64) -> Vec<Nonce> {
    nonces
        .iter()
        .filter(|n| block_height - n.block_height <= epoch_length)
        .copied()
        .collect()
}

/// Latest reputer nonces whose ground truth is already available, newest first.
///
/// A nonce qualifies once `current >= nonce + ground_truth_lag + epoch_length`.
/// The input is left untouched.
pub fn select_top_n_reputer_nonces(
    nonces: &[ReputerRequestNonce],
    n: usize,
    current_block_height: BlockHeight,
    ground_truth_lag: i64,
    epoch_length: i64,
) -> Vec<ReputerRequestNonce> {
    let mut sorted = nonces.to_vec();
    sorted.sort_by(|a, b| b.reputer_nonce.block_height.cmp(&a.reputer_nonce.block_height));
    sorted
        .into_iter()
        .filter(|nonce| current_block_height >= nonce.reputer_nonce.block_height + ground_truth_lag + epoch_length)
        .take(n)
        .collect()
}

/// The first `n` worker nonces in the order given.
pub fn select_top_n_worker_nonces(nonces: &[Nonce], n: usize) -> Vec<Nonce> {
    nonces.iter().take(n).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reputer(block: BlockHeight) -> ReputerRequestNonce {
        ReputerRequestNonce {
            reputer_nonce: Nonce::new(block),
        }
    }

    #[test]
    fn test_filter_within_epoch() {
        let nonces = [Nonce::new(80), Nonce::new(88), Nonce::new(95), Nonce::new(100)];
        let kept = filter_nonces_within_epoch_length(&nonces, 100, 12);
        assert_eq!(kept, vec![Nonce::new(88), Nonce::new(95), Nonce::new(100)]);
    }

    #[test]
    fn test_reputer_nonces_need_ground_truth() {
        let nonces = [reputer(10), reputer(40), reputer(30), reputer(20)];
        let selected = select_top_n_reputer_nonces(&nonces, 2, 50, 5, 10);
        let blocks: Vec<BlockHeight> = selected.iter().map(|n| n.reputer_nonce.block_height).collect();
        assert_eq!(blocks, vec![30, 20]);
        assert_eq!(nonces[0].reputer_nonce.block_height, 10);
    }

    #[test]
    fn test_worker_nonces_truncate() {
        let nonces = [Nonce::new(3), Nonce::new(2), Nonce::new(1)];
        assert_eq!(select_top_n_worker_nonces(&nonces, 2), vec![Nonce::new(3), Nonce::new(2)]);
        assert_eq!(select_top_n_worker_nonces(&nonces, 5).len(), 3);
    }
}
