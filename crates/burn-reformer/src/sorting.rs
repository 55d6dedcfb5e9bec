//! Bucket sorting and chunking
//!
//! Positions are sorted by `bucket * seq_len + position`, which groups every
//! bucket contiguously while keeping original order inside a bucket. The
//! sorted order is then cut into fixed-size chunks.
//!
//! All tensors here are `Int`; they carry no gradient. Float tensors gathered
//! through them keep theirs.

use burn::prelude::*;
use burn::tensor::{BasicOps, Element, Numeric, TensorKind};

/// Sort permutation of flattened (round, position) items
#[derive(Debug, Clone)]
pub struct SortedBuckets<B: Backend> {
    /// Sorted composite keys [rows, n_hashes * seq_len]
    pub keys: Tensor<B, 2, Int>,
    /// Sorted slot -> ticker (round * seq_len + position)
    pub sticker: Tensor<B, 2, Int>,
    /// Ticker -> sorted slot; inverse of `sticker`
    pub undo_sort: Tensor<B, 2, Int>,
    /// Sequence length the ticker wraps at
    pub seq_len: usize,
}

impl<B: Backend> SortedBuckets<B> {
    /// Sorts bucket ids [rows, n_hashes * seq_len] produced by hashing
    pub fn new(buckets: Tensor<B, 2, Int>, seq_len: usize) -> Self {
        let [rows, items] = buckets.dims();
        let device = buckets.device();

        let ticker = Tensor::<B, 1, Int>::arange(0..items as i64, &device)
            .reshape([1, items])
            .repeat_dim(0, rows);
        let keys = buckets.mul_scalar(seq_len as i64) + ticker.remainder_scalar(seq_len as i64);

        // Keys are unique within a row, so the permutation is the stable one
        let (keys, sticker) = keys.sort_with_indices(1);
        let undo_sort = sticker.clone().argsort(1);

        Self {
            keys,
            sticker,
            undo_sort,
            seq_len,
        }
    }

    /// Original sequence position of every sorted slot
    pub fn positions(&self) -> Tensor<B, 2, Int> {
        self.sticker.clone().remainder_scalar(self.seq_len as i64)
    }

    /// Bucket id of every sorted slot
    pub fn buckets(&self) -> Tensor<B, 2, Int> {
        self.keys.clone().div_scalar(self.seq_len as i64)
    }
}

/// Gathers `x[row, index[row, i], :]` for every row: [rows, items, dim]
pub fn gather_rows<B, K>(x: Tensor<B, 3, K>, index: Tensor<B, 2, Int>) -> Tensor<B, 3, K>
where
    B: Backend,
    K: Numeric<B>,
    K::Elem: Element,
{
    let [_, _, dim] = x.dims();
    let index = index.unsqueeze_dim::<3>(2).repeat_dim(2, dim);
    x.gather(1, index)
}

/// Extends every chunk with the chunk before it (chunk 0 wraps to the last)
///
/// Input is [rows, n_chunks, chunk_len, ...]; output doubles axis 2.
pub fn look_one_back<B, const D: usize, K>(x: Tensor<B, D, K>) -> Tensor<B, D, K>
where
    B: Backend,
    K: TensorKind<B> + BasicOps<B>,
{
    let chunks = x.dims()[1];
    let previous = if chunks > 1 {
        Tensor::cat(
            vec![
                x.clone().narrow(1, chunks - 1, 1),
                x.clone().narrow(1, 0, chunks - 1),
            ],
            1,
        )
    } else {
        x.clone()
    };
    Tensor::cat(vec![x, previous], 2)
}

/// Chunk locations of every sorted item in every round
///
/// For each item and round `r` this records the chunk that holds the item
/// in round `r` and the chunk after it (which sees it through look-one-back).
/// Unless attending across buckets, locations are prefixed by the item's
/// bucket so only same-bucket visits match.
///
/// # Returns
///
/// [rows, n_chunks, bucket_size, 2 * n_hashes]: own chunks for each round,
/// then next chunks for each round.
pub fn duplicate_locations<B: Backend>(
    sorted: &SortedBuckets<B>,
    buckets: Tensor<B, 2, Int>,
    n_hashes: usize,
    bucket_size: usize,
    attend_across_buckets: bool,
) -> Tensor<B, 4, Int> {
    let [rows, items] = buckets.dims();
    let seq_len = sorted.seq_len;
    let n_chunks = items / bucket_size;

    let own = sorted.undo_sort.clone().div_scalar(bucket_size as i64);
    let next = own.clone().add_scalar(1).remainder_scalar(n_chunks as i64);
    let (own, next) = if attend_across_buckets {
        (own, next)
    } else {
        let prefix = buckets.mul_scalar(n_chunks as i64);
        (prefix.clone() + own, prefix + next)
    };

    // [rows, seq_len, 2 * n_hashes]
    let locations = Tensor::cat(
        vec![
            own.reshape([rows, n_hashes, seq_len]),
            next.reshape([rows, n_hashes, seq_len]),
        ],
        1,
    )
    .swap_dims(1, 2);

    gather_rows(locations, sorted.positions()).reshape([rows, n_chunks, bucket_size, 2 * n_hashes])
}
