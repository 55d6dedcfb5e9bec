//! Masked dot-product attention inside sorted chunks
//!
//! Each chunk attends to itself and to the chunk before it. Masked logits are
//! set to [`MASK_VALUE`] instead of `-inf` so every softmax row stays finite
//! and differentiable.

use burn::prelude::*;

use crate::config::SelfMaskPolicy;
use crate::sorting::look_one_back;

/// Logit assigned to masked query/key pairs
pub const MASK_VALUE: f64 = -5e4;

/// Sorted, chunked inputs for one pass of local attention
#[derive(Debug, Clone)]
pub struct ChunkedInputs<B: Backend> {
    /// Shared query/key vectors [rows, n_chunks, bucket_size, dim]
    pub qk: Tensor<B, 4>,
    /// Values [rows, n_chunks, bucket_size, v_dim]
    pub v: Tensor<B, 4>,
    /// Original sequence positions [rows, n_chunks, bucket_size]
    pub positions: Tensor<B, 3, Int>,
    /// Bucket ids [rows, n_chunks, bucket_size]
    pub buckets: Tensor<B, 3, Int>,
    /// Per-round chunk locations [rows, n_chunks, bucket_size, 2 * n_hashes],
    /// present when duplicate attention is corrected
    pub locations: Option<Tensor<B, 4, Int>>,
}

/// Which masks to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMasking {
    pub causal: bool,
    pub attend_across_buckets: bool,
    pub self_mask: SelfMaskPolicy,
}

/// Result of local attention, still in sorted order
#[derive(Debug, Clone)]
pub struct ChunkAttention<B: Backend> {
    /// Attention output [rows, n_chunks, bucket_size, v_dim]
    pub output: Tensor<B, 4>,
    /// Log-partition value of every query [rows, n_chunks, bucket_size]
    pub logsumexp: Tensor<B, 3>,
    /// Masked logits [rows, n_chunks, bucket_size, 2 * bucket_size]
    pub logits: Tensor<B, 4>,
    /// Attention weights before dropout, same shape as `logits`
    pub weights: Tensor<B, 4>,
    /// Positions of the attended keys [rows, n_chunks, 2 * bucket_size]
    pub key_positions: Tensor<B, 3, Int>,
}

/// Scales vectors to unit length along the last dimension
pub fn make_unit_length<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    // Epsilon inside the root keeps the gradient finite for zero vectors
    let norm = ((x.clone() * x.clone()).sum_dim(D - 1) + 1e-12).sqrt();
    x / norm
}

/// Runs masked attention within every chunk and its predecessor
///
/// Keys are the unit-normalized queries; queries keep their norm, which acts
/// as a learned temperature. `dropout` is an inverted-dropout mask over the
/// attention weights, or `None` to skip dropout.
pub fn chunk_attention<B: Backend>(
    inputs: ChunkedInputs<B>,
    masking: &ChunkMasking,
    dropout: Option<Tensor<B, 4>>,
) -> ChunkAttention<B> {
    let [rows, chunks, bucket_size, dim] = inputs.qk.dims();
    let window = 2 * bucket_size;

    let k = look_one_back(make_unit_length(inputs.qk.clone()));
    let v = look_one_back(inputs.v);
    let key_positions = look_one_back(inputs.positions.clone());
    let key_buckets = look_one_back(inputs.buckets.clone());

    // [rows, chunks, bucket_size, window]
    let mut dots = inputs.qk.matmul(k.swap_dims(2, 3)) * (dim as f64).powf(-0.5);

    let query_pos = per_query(inputs.positions, window);
    let key_pos = per_key(key_positions.clone(), bucket_size);

    let causal_mask = masking
        .causal
        .then(|| query_pos.clone().lower(key_pos.clone()));
    let bucket_mask = (!masking.attend_across_buckets).then(|| {
        per_query(inputs.buckets, window).not_equal(per_key(key_buckets, bucket_size))
    });
    let self_mask = query_pos.equal(key_pos);
    let self_mask = match masking.self_mask {
        SelfMaskPolicy::Always => self_mask,
        SelfMaskPolicy::UnlessOnlyCandidate => {
            spare_lonely_self(self_mask, causal_mask.as_ref(), bucket_mask.as_ref(), window)
        }
    };

    if let Some(mask) = causal_mask {
        dots = dots.mask_fill(mask, MASK_VALUE);
    }
    dots = dots.mask_fill(self_mask, MASK_VALUE);
    if let Some(mask) = bucket_mask {
        dots = dots.mask_fill(mask, MASK_VALUE);
    }

    if let Some(locations) = inputs.locations {
        dots = dots - (duplicate_counts(locations) + 1e-9).log();
    }

    let max = dots.clone().max_dim(3).detach();
    let logsumexp = (dots.clone() - max.clone()).exp().sum_dim(3).log() + max;
    let weights = (dots.clone() - logsumexp.clone()).exp();

    let attended = match dropout {
        Some(mask) => weights.clone() * mask,
        None => weights.clone(),
    };
    let output = attended.matmul(v);

    ChunkAttention {
        output,
        logsumexp: logsumexp.reshape([rows, chunks, bucket_size]),
        logits: dots,
        weights,
        key_positions,
    }
}

/// Number of rounds in which each query sees each key
///
/// Counts are integer bookkeeping and carry no gradient.
///
/// # Returns
///
/// [rows, n_chunks, bucket_size, 2 * bucket_size], every entry at least 0
pub fn duplicate_counts<B: Backend>(locations: Tensor<B, 4, Int>) -> Tensor<B, 4> {
    let [rows, chunks, bucket_size, slots] = locations.dims();
    let n_hashes = slots / 2;
    let window = 2 * bucket_size;

    let own = locations.clone().narrow(3, 0, n_hashes);
    let query_locs = Tensor::cat(vec![own.clone(), own], 3)
        .unsqueeze_dim::<5>(3)
        .repeat_dim(3, window);
    let key_locs = look_one_back(locations)
        .unsqueeze_dim::<5>(2)
        .repeat_dim(2, bucket_size);

    query_locs
        .equal(key_locs)
        .int()
        .sum_dim(4)
        .reshape([rows, chunks, bucket_size, window])
        .float()
}

/// Broadcasts per-query values over the key window
fn per_query<B: Backend>(x: Tensor<B, 3, Int>, window: usize) -> Tensor<B, 4, Int> {
    x.unsqueeze_dim::<4>(3).repeat_dim(3, window)
}

/// Broadcasts per-key values over the queries of a chunk
fn per_key<B: Backend>(x: Tensor<B, 3, Int>, bucket_size: usize) -> Tensor<B, 4, Int> {
    x.unsqueeze_dim::<4>(2).repeat_dim(2, bucket_size)
}

/// Drops the self mask for queries that have no other surviving candidate
fn spare_lonely_self<B: Backend>(
    self_mask: Tensor<B, 4, Bool>,
    causal_mask: Option<&Tensor<B, 4, Bool>>,
    bucket_mask: Option<&Tensor<B, 4, Bool>>,
    window: usize,
) -> Tensor<B, 4, Bool> {
    let mut blocked = self_mask.clone().int();
    for mask in [causal_mask, bucket_mask].into_iter().flatten() {
        blocked = blocked + mask.clone().int();
    }

    let has_other = blocked
        .equal_elem(0)
        .any_dim(3)
        .int()
        .repeat_dim(3, window);

    (self_mask.int() * has_other).equal_elem(1)
}
