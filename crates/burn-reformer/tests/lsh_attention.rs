//! End-to-end properties of the LSH attention pipeline
//!
//! ```sh
//! cargo test -p burn-reformer --test lsh_attention
//! ```

use burn::prelude::*;
use burn::tensor::TensorData;
use burn_ndarray::NdArray;
use burn_reformer::rng::row_ids;
use burn_reformer::{CallRng, LshAttentionConfig, SelfMaskPolicy};

type TestBackend = NdArray<f32>;

fn floats<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
    t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

fn ints<const D: usize>(t: Tensor<TestBackend, D, Int>) -> Vec<i64> {
    t.into_data().convert::<i64>().to_vec::<i64>().unwrap()
}

/// x[t, t % dim] = 1, shaped [1, 1, seq_len, dim]
fn one_hot_positions(seq_len: usize, dim: usize) -> Tensor<TestBackend, 4> {
    let mut values = vec![0.0f32; seq_len * dim];
    for t in 0..seq_len {
        values[t * dim + t % dim] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [1, 1, seq_len, dim]), &Default::default())
}

/// Seeded standard normal values shaped [batch, heads, seq_len, dim]
fn gaussian(seed: u64, batch: usize, heads: usize, seq_len: usize, dim: usize) -> Tensor<TestBackend, 4> {
    CallRng::new(seed)
        .rotations::<TestBackend>(&row_ids(batch, heads, 0), seq_len, dim, true, &Default::default())
        .reshape([batch, heads, seq_len, dim])
}

#[test]
fn test_single_round_one_hot_input() {
    let attention = LshAttentionConfig::new(64, 1).init().unwrap();
    let x = one_hot_positions(128, 16);

    let out = attention
        .forward(x.clone(), x, &CallRng::new(42), 0)
        .unwrap();

    assert_eq!(out.output.dims(), [1, 1, 128, 16]);
    assert!(out.round_weights.is_none());
    assert!(floats(out.output).iter().all(|v| v.is_finite()));
}

#[test]
fn test_round_weights_sum_to_one() {
    let attention = LshAttentionConfig::new(64, 4).init().unwrap();
    let x = one_hot_positions(128, 16);

    let out = attention
        .forward(x.clone(), x, &CallRng::new(42), 0)
        .unwrap();

    assert_eq!(out.output.dims(), [1, 1, 128, 16]);
    assert!(floats(out.output).iter().all(|v| v.is_finite()));

    let weights = out.round_weights.unwrap();
    assert_eq!(weights.dims(), [1, 1, 4, 128]);
    let sums = floats(weights.sum_dim(2));
    for (t, sum) in sums.iter().enumerate() {
        assert!((sum - 1.0).abs() < 1e-5, "position {t} weights sum to {sum}");
    }
}

#[test]
fn test_bucket_ranges_are_disjoint_per_round() {
    let (seq_len, bucket_size, n_hashes) = (32, 8, 3);
    let n_buckets = seq_len / bucket_size;
    let attention = LshAttentionConfig::new(bucket_size, n_hashes).init().unwrap();
    let qk = gaussian(1, 2, 2, seq_len, 8);

    let out = attention
        .forward(qk.clone(), qk, &CallRng::new(5), 0)
        .unwrap();
    assert_eq!(out.buckets.dims(), [2, 2, n_hashes * seq_len]);

    let ids = ints(out.buckets);
    for (i, &id) in ids.iter().enumerate() {
        let round = (i % (n_hashes * seq_len)) / seq_len;
        let lo = (round * n_buckets) as i64;
        assert!((lo..lo + n_buckets as i64).contains(&id));
    }
}

#[test]
fn test_causal_output_ignores_future_marker() {
    let (seq_len, dim) = (32, 8);
    let attention = LshAttentionConfig::new(8, 2)
        .with_causal(true)
        .with_self_mask(SelfMaskPolicy::UnlessOnlyCandidate)
        .init()
        .unwrap();

    let qk = gaussian(3, 1, 2, seq_len, dim);
    // Only the last position carries a value
    let mut values = vec![0.0f32; 2 * seq_len * dim];
    for head in 0..2 {
        let last = (head * seq_len + seq_len - 1) * dim;
        values[last..last + dim].fill(1000.0);
    }
    let v = Tensor::from_data(TensorData::new(values, [1, 2, seq_len, dim]), &Default::default());

    let out = floats(attention.forward(qk, v, &CallRng::new(8), 0).unwrap().output);
    for head in 0..2 {
        for t in 0..seq_len - 1 {
            let start = (head * seq_len + t) * dim;
            for &o in &out[start..start + dim] {
                assert!(o.abs() < 1e-6, "head {head} position {t} sees the future: {o}");
            }
        }
    }
}

#[test]
fn test_duplicate_correction_is_noop_for_one_round() {
    let qk = gaussian(11, 1, 2, 32, 8);
    let v = gaussian(12, 1, 2, 32, 8);
    let rng = CallRng::new(13);

    let plain = LshAttentionConfig::new(8, 1).init().unwrap();
    let corrected = LshAttentionConfig::new(8, 1)
        .with_allow_duplicate_attention(false)
        .init()
        .unwrap();

    let a = floats(plain.forward(qk.clone(), v.clone(), &rng, 0).unwrap().output);
    let b = floats(corrected.forward(qk, v, &rng, 0).unwrap().output);
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-5);
    }
}

#[test]
fn test_topk_hashing_mode() {
    let (seq_len, bucket_size, n_hashes) = (32, 8, 3);
    let attention = LshAttentionConfig::new(bucket_size, n_hashes)
        .with_rehash_each_round(false)
        .init()
        .unwrap();
    let qk = gaussian(21, 1, 1, seq_len, 8);

    let out = attention
        .forward(qk.clone(), qk, &CallRng::new(2), 0)
        .unwrap();
    assert_eq!(out.output.dims(), [1, 1, seq_len, 8]);
    assert!(floats(out.output).iter().all(|v| v.is_finite()));

    // Every id stays in [0, n_buckets) and rounds pick distinct buckets
    let ids = ints(out.buckets);
    let n_buckets = (seq_len / bucket_size) as i64;
    for t in 0..seq_len {
        let mut picked: Vec<i64> = (0..n_hashes).map(|r| ids[r * seq_len + t]).collect();
        assert!(picked.iter().all(|&id| (0..n_buckets).contains(&id)));
        picked.sort_unstable();
        picked.dedup();
        assert_eq!(picked.len(), n_hashes);
    }
}

#[test]
fn test_same_seed_same_buckets() {
    let attention = LshAttentionConfig::new(8, 2).init().unwrap();
    let qk = gaussian(4, 1, 2, 32, 8);

    let first = attention.forward(qk.clone(), qk.clone(), &CallRng::new(77), 0).unwrap();
    let second = attention.forward(qk.clone(), qk.clone(), &CallRng::new(77), 0).unwrap();
    let other = attention.forward(qk.clone(), qk, &CallRng::new(78), 0).unwrap();

    assert_eq!(ints(first.buckets.clone()), ints(second.buckets));
    assert_eq!(floats(first.output), floats(second.output));
    assert_ne!(ints(first.buckets), ints(other.buckets));
}
