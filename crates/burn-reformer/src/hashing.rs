//! Random-rotation hashing
//!
//! Angular LSH: vectors are projected through a random rotation, the
//! projection is concatenated with its negation and the bucket is the
//! argmax over the result. With `n_buckets / 2` rotation columns this
//! covers exactly `n_buckets` half-space assignments.
//!
//! See [Practical and Optimal LSH for Angular Distance](https://arxiv.org/abs/1509.02897).

use burn::prelude::*;

use crate::error::LshError;

/// Number of rotation columns needed for one hashing pass
///
/// Rehashing draws one block of `n_buckets / 2` columns per round; top-k
/// hashing draws a single block.
pub fn rotation_columns(n_buckets: usize, n_hashes: usize, rehash_each_round: bool) -> usize {
    let rounds = if rehash_each_round { n_hashes } else { 1 };
    rounds * n_buckets / 2
}

/// Hashes vectors into buckets
///
/// # Arguments
///
/// * `vecs` - Hash input [rows, seq_len, dim]
/// * `rotations` - Random rotations [rows, dim, rotation_columns(..)]
/// * `n_buckets` - Buckets per round (must be even)
/// * `n_hashes` - Number of hashing rounds
/// * `rehash_each_round` - Fresh rotation per round, or top-k buckets of one rotation
///
/// # Returns
///
/// Bucket ids [rows, n_hashes * seq_len], round-major. When rehashing, round
/// `r` ids are offset by `r * n_buckets` so rounds never share an id.
pub fn hash_vectors<B: Backend>(
    vecs: Tensor<B, 3>,
    rotations: Tensor<B, 3>,
    n_buckets: usize,
    n_hashes: usize,
    rehash_each_round: bool,
) -> Result<Tensor<B, 2, Int>, LshError> {
    if n_buckets == 0 || n_buckets % 2 != 0 {
        return Err(LshError::OddBucketCount(n_buckets));
    }
    if !rehash_each_round && n_hashes > n_buckets {
        return Err(LshError::TooManyHashRounds {
            n_hashes,
            n_buckets,
        });
    }

    let [rows, seq_len, _dim] = vecs.dims();
    let half = n_buckets / 2;
    let device = vecs.device();

    // [rows, seq_len, columns]
    let rotated = vecs.matmul(rotations);

    let buckets = if rehash_each_round {
        // [rows, n_hashes, seq_len, half]
        let rotated = rotated
            .reshape([rows, seq_len, n_hashes, half])
            .swap_dims(1, 2);
        let rotated = Tensor::cat(vec![rotated.clone(), rotated.neg()], 3);

        let buckets: Tensor<B, 3, Int> = rotated.argmax(3).reshape([rows, n_hashes, seq_len]);
        buckets + round_offsets::<B>(rows, n_hashes, seq_len, n_buckets, &device)
    } else {
        let rotated = Tensor::cat(vec![rotated.clone(), rotated.neg()], 2);
        let (_, top) = rotated.topk_with_indices(n_hashes, 2);
        top.swap_dims(1, 2)
    };

    Ok(buckets.reshape([rows, n_hashes * seq_len]))
}

/// `r * n_buckets` for every position of round `r`: [rows, n_hashes, seq_len]
fn round_offsets<B: Backend>(
    rows: usize,
    n_hashes: usize,
    seq_len: usize,
    n_buckets: usize,
    device: &B::Device,
) -> Tensor<B, 3, Int> {
    Tensor::<B, 1, Int>::arange(0..n_hashes as i64, device)
        .mul_scalar(n_buckets as i64)
        .reshape([1, n_hashes, 1])
        .repeat_dim(0, rows)
        .repeat_dim(2, seq_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{row_ids, CallRng};
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ints<const D: usize>(t: Tensor<TestBackend, D, Int>) -> Vec<i64> {
        t.into_data().convert::<i64>().to_vec::<i64>().unwrap()
    }

    fn random_input(rows: usize, seq_len: usize, dim: usize) -> Tensor<TestBackend, 3> {
        let device = Default::default();
        CallRng::new(99).rotations(&row_ids(rows, 1, 0), seq_len, dim, true, &device)
    }

    #[test]
    fn test_bucket_ids_in_round_ranges() {
        let device = Default::default();
        let (rows, seq_len, dim, n_buckets, n_hashes) = (2, 16, 8, 4, 3);
        let vecs = random_input(rows, seq_len, dim);
        let rotations = CallRng::new(1).rotations::<TestBackend>(
            &row_ids(rows, 1, 0),
            dim,
            rotation_columns(n_buckets, n_hashes, true),
            false,
            &device,
        );

        let buckets = hash_vectors(vecs, rotations, n_buckets, n_hashes, true).unwrap();
        assert_eq!(buckets.dims(), [rows, n_hashes * seq_len]);

        let ids = ints(buckets);
        for (i, &id) in ids.iter().enumerate() {
            let round = (i % (n_hashes * seq_len)) / seq_len;
            let lo = (round * n_buckets) as i64;
            assert!(
                id >= lo && id < lo + n_buckets as i64,
                "id {id} outside round {round} range"
            );
        }
    }

    #[test]
    fn test_half_space_assignment() {
        let device = Default::default();
        // One rotation column along the first axis: bucket 0 iff x0 > 0
        let rotations = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 0.0], [1, 2, 1]),
            &device,
        );
        let vecs = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![2.0f32, 1.0, -3.0, 1.0, 0.5, -7.0], [1, 3, 2]),
            &device,
        );

        let buckets = hash_vectors(vecs, rotations, 2, 1, true).unwrap();
        assert_eq!(ints(buckets), vec![0, 1, 0]);
    }

    #[test]
    fn test_identical_vectors_share_buckets() {
        let device = Default::default();
        let row = random_input(1, 1, 8);
        let vecs = Tensor::cat(vec![row.clone(), row], 1);
        let rotations = CallRng::new(2).rotations::<TestBackend>(
            &row_ids(1, 1, 0),
            8,
            rotation_columns(8, 4, true),
            false,
            &device,
        );

        let ids = ints(hash_vectors(vecs, rotations, 8, 4, true).unwrap());
        for round in 0..4 {
            assert_eq!(ids[round * 2], ids[round * 2 + 1]);
        }
    }

    #[test]
    fn test_odd_bucket_count_rejected() {
        let device = Default::default();
        let vecs = random_input(1, 6, 4);
        let rotations = Tensor::<TestBackend, 3>::zeros([1, 4, 1], &device);

        let result = hash_vectors(vecs, rotations, 3, 1, true);
        assert!(matches!(result, Err(LshError::OddBucketCount(3))));
    }

    #[test]
    fn test_topk_hashing_without_rehash() {
        let device = Default::default();
        let (seq_len, n_buckets, n_hashes) = (8, 4, 3);
        let vecs = random_input(1, seq_len, 6);
        let rotations = CallRng::new(4).rotations::<TestBackend>(
            &row_ids(1, 1, 0),
            6,
            rotation_columns(n_buckets, n_hashes, false),
            false,
            &device,
        );
        assert_eq!(rotations.dims(), [1, 6, 2]);

        let ids = ints(hash_vectors(vecs, rotations, n_buckets, n_hashes, false).unwrap());
        assert_eq!(ids.len(), n_hashes * seq_len);

        for t in 0..seq_len {
            let mut per_round: Vec<i64> = (0..n_hashes).map(|r| ids[r * seq_len + t]).collect();
            assert!(per_round.iter().all(|&id| (0..n_buckets as i64).contains(&id)));
            per_round.sort_unstable();
            per_round.dedup();
            assert_eq!(per_round.len(), n_hashes, "position {t} reused a bucket");
        }
    }

    #[test]
    fn test_topk_needs_enough_buckets() {
        let device = Default::default();
        let vecs = random_input(1, 4, 4);
        let rotations = Tensor::<TestBackend, 3>::zeros([1, 4, 1], &device);

        let result = hash_vectors(vecs, rotations, 2, 3, false);
        assert!(matches!(
            result,
            Err(LshError::TooManyHashRounds {
                n_hashes: 3,
                n_buckets: 2
            })
        ));
    }
}
