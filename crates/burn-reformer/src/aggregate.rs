//! Unsorting and multi-round aggregation

use burn::prelude::*;

use crate::sorting::gather_rows;

/// Per-position result after combining all hashing rounds
#[derive(Debug, Clone)]
pub struct Aggregated<B: Backend> {
    /// [rows, seq_len, dim]
    pub output: Tensor<B, 3>,
    /// Softmax weight of every round [rows, n_hashes, seq_len]; `None` for a single round
    pub round_weights: Option<Tensor<B, 3>>,
}

/// Restores round-major ticker order
///
/// # Arguments
///
/// * `sorted_output` - Attention output in sorted order [rows, n_hashes * seq_len, dim]
/// * `sorted_logits` - Log-partition values in sorted order [rows, n_hashes * seq_len]
/// * `undo_sort` - Inverse sort permutation [rows, n_hashes * seq_len]
pub fn unsort<B: Backend>(
    sorted_output: Tensor<B, 3>,
    sorted_logits: Tensor<B, 2>,
    undo_sort: Tensor<B, 2, Int>,
) -> (Tensor<B, 3>, Tensor<B, 2>) {
    let output = gather_rows(sorted_output, undo_sort.clone());
    let logits = sorted_logits.gather(1, undo_sort);
    (output, logits)
}

/// Combines the rounds of an unsorted output
///
/// Each round is weighted by `softmax_r(logits)`, so rounds that found more
/// attention mass for a position contribute more to it.
pub fn combine_rounds<B: Backend>(
    output: Tensor<B, 3>,
    logits: Tensor<B, 2>,
    n_hashes: usize,
    seq_len: usize,
) -> Aggregated<B> {
    let [rows, _, dim] = output.dims();

    if n_hashes == 1 {
        return Aggregated {
            output,
            round_weights: None,
        };
    }

    let output = output.reshape([rows, n_hashes, seq_len, dim]);
    let logits = logits.reshape([rows, n_hashes, seq_len, 1]);

    let max = logits.clone().max_dim(1).detach();
    let lse = (logits.clone() - max.clone()).exp().sum_dim(1).log() + max;
    let weights = (logits - lse).exp();

    let combined = (output * weights.clone())
        .sum_dim(1)
        .reshape([rows, seq_len, dim]);

    Aggregated {
        output: combined,
        round_weights: Some(weights.reshape([rows, n_hashes, seq_len])),
    }
}
