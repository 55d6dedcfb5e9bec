//! LSH attention over a group of heads
//!
//! Composes hashing, sorting, chunked attention and round aggregation for
//! already-projected shared query/key and value tensors.

use burn::prelude::*;

use crate::aggregate::{combine_rounds, unsort};
use crate::chunk_attention::{chunk_attention, ChunkMasking, ChunkedInputs};
use crate::config::LshAttentionConfig;
use crate::error::LshError;
use crate::hashing::{hash_vectors, rotation_columns};
use crate::rng::{row_ids, CallRng, Stream};
use crate::sorting::{duplicate_locations, gather_rows, SortedBuckets};

/// Locality-sensitive hashing attention
///
/// Holds no parameters, only its configuration. Randomness comes from the
/// [`CallRng`] passed to every call.
#[derive(Debug, Clone)]
pub struct LshAttention {
    config: LshAttentionConfig,
}

/// Result of [`LshAttention::forward`]
#[derive(Debug, Clone)]
pub struct LshAttentionOutput<B: Backend> {
    /// Attention output [batch, heads, seq_len, v_dim]
    pub output: Tensor<B, 4>,
    /// Bucket of every position in every round [batch, heads, n_hashes * seq_len]
    pub buckets: Tensor<B, 3, Int>,
    /// Aggregation weights [batch, heads, n_hashes, seq_len]; `None` for one round
    pub round_weights: Option<Tensor<B, 4>>,
}

impl LshAttentionConfig {
    /// Validates the config and builds the attention module
    pub fn init(&self) -> Result<LshAttention, LshError> {
        self.validate()?;
        tracing::debug!(config = ?self, "initialized lsh attention");
        Ok(LshAttention {
            config: self.clone(),
        })
    }
}

impl LshAttention {
    pub fn config(&self) -> &LshAttentionConfig {
        &self.config
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `qk` - Shared query/key vectors [batch, heads, seq_len, dim]
    /// * `v` - Values [batch, heads, seq_len, v_dim]
    /// * `rng` - Random streams of the current call
    /// * `head_offset` - Global index of the first head in this group
    pub fn forward<B: Backend>(
        &self,
        qk: Tensor<B, 4>,
        v: Tensor<B, 4>,
        rng: &CallRng,
        head_offset: usize,
    ) -> Result<LshAttentionOutput<B>, LshError> {
        let config = &self.config;
        let [batch, heads, seq_len, dim] = qk.dims();
        let [v_batch, v_heads, v_seq_len, v_dim] = v.dims();
        let device = qk.device();

        if [v_batch, v_heads, v_seq_len] != [batch, heads, seq_len] {
            return Err(LshError::ShapeMismatch {
                expected: vec![batch, heads, seq_len, v_dim],
                actual: v.dims().to_vec(),
            });
        }

        if seq_len == 0 {
            return Err(LshError::EmptySequence);
        }
        if seq_len % config.bucket_size != 0 {
            return Err(LshError::SeqLenNotDivisible {
                seq_len,
                bucket_size: config.bucket_size,
            });
        }

        let n_hashes = config.n_hashes;
        let bucket_size = config.bucket_size;
        let n_buckets = seq_len / bucket_size;
        let n_chunks = n_hashes * n_buckets;
        let items = n_hashes * seq_len;
        let training = B::ad_enabled();

        tracing::debug!(
            batch,
            heads,
            head_offset,
            seq_len,
            n_buckets,
            n_hashes,
            n_chunks,
            training,
            "lsh attention forward"
        );

        let rows = row_ids(batch, heads, head_offset);
        let n_rows = rows.len();
        let qk = qk.reshape([n_rows, seq_len, dim]);
        let v = v.reshape([n_rows, seq_len, v_dim]);

        // Bucket ids are integers, so the hash input needs no gradient
        let mut hash_input = qk.clone().detach();
        if training && config.drop_for_hash_rate > 0.0 {
            let mask = rng.dropout_mask::<B, 3>(
                Stream::HashDropout,
                &rows,
                [n_rows, seq_len, dim],
                config.drop_for_hash_rate,
                &device,
            );
            hash_input = hash_input * mask;
        }
        let rotations = rng.rotations::<B>(
            &rows,
            dim,
            rotation_columns(n_buckets, n_hashes, config.rehash_each_round),
            config.random_rotations_per_head,
            &device,
        );
        let buckets = hash_vectors(
            hash_input,
            rotations,
            n_buckets,
            n_hashes,
            config.rehash_each_round,
        )?;

        let sorted = SortedBuckets::new(buckets.clone(), seq_len);
        let positions = sorted.positions();

        let locations = (!config.allow_duplicate_attention).then(|| {
            duplicate_locations(
                &sorted,
                buckets.clone(),
                n_hashes,
                bucket_size,
                config.attend_across_buckets,
            )
        });

        let inputs = ChunkedInputs {
            qk: gather_rows(qk, positions.clone()).reshape([n_rows, n_chunks, bucket_size, dim]),
            v: gather_rows(v, positions.clone()).reshape([n_rows, n_chunks, bucket_size, v_dim]),
            positions: positions.reshape([n_rows, n_chunks, bucket_size]),
            buckets: sorted.buckets().reshape([n_rows, n_chunks, bucket_size]),
            locations,
        };
        let masking = ChunkMasking {
            causal: config.causal,
            attend_across_buckets: config.attend_across_buckets,
            self_mask: config.self_mask,
        };
        let dropout = (training && config.dropout > 0.0).then(|| {
            rng.dropout_mask::<B, 4>(
                Stream::AttentionDropout,
                &rows,
                [n_rows, n_chunks, bucket_size, 2 * bucket_size],
                config.dropout,
                &device,
            )
        });

        let attention = chunk_attention(inputs, &masking, dropout);

        let (output, logits) = unsort(
            attention.output.reshape([n_rows, items, v_dim]),
            attention.logsumexp.reshape([n_rows, items]),
            sorted.undo_sort,
        );
        let aggregated = combine_rounds(output, logits, n_hashes, seq_len);

        let expected = [n_rows, seq_len, v_dim];
        let actual = aggregated.output.dims();
        if actual != expected {
            return Err(LshError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }

        Ok(LshAttentionOutput {
            output: aggregated.output.reshape([batch, heads, seq_len, v_dim]),
            buckets: buckets.reshape([batch, heads, items]),
            round_weights: aggregated
                .round_weights
                .map(|w| w.reshape([batch, heads, n_hashes, seq_len])),
        })
    }
}
