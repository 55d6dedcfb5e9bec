//! Multi-head LSH self-attention
//!
//! Projects the input to shared query/key and value spaces, runs
//! [`LshAttention`] over consecutive groups of heads and merges the result.

use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use crate::config::LshSelfAttentionConfig;
use crate::error::LshError;
use crate::lsh_attention::LshAttention;
use crate::rng::CallRng;

/// Multi-head self-attention with LSH attention in every head
#[derive(Module, Debug)]
pub struct LshSelfAttention<B: Backend> {
    /// Shared query/key projection
    pub qk_proj: Linear<B>,
    /// Value projection
    pub v_proj: Linear<B>,
    /// Output projection
    pub o_proj: Linear<B>,
    pub num_heads: usize,
    pub head_dim: usize,
    /// Number of head groups run one after another
    pub head_chunks: usize,
    attention: Ignored<LshAttention>,
}

/// Result of [`LshSelfAttention::forward`]
#[derive(Debug, Clone)]
pub struct LshSelfAttentionOutput<B: Backend> {
    /// [batch, seq_len, d_model]
    pub output: Tensor<B, 3>,
    /// Bucket assignments of all heads [batch, num_heads, n_hashes * seq_len]
    pub buckets: Tensor<B, 3, Int>,
}

impl LshSelfAttentionConfig {
    /// Initialize the self-attention module
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<LshSelfAttention<B>, LshError> {
        self.validate()?;
        let attention = self.attention.init()?;

        tracing::debug!(
            d_model = self.d_model,
            num_heads = self.num_heads,
            head_chunks = self.head_chunks(),
            "initialized lsh self-attention"
        );

        Ok(LshSelfAttention {
            qk_proj: LinearConfig::new(self.d_model, self.d_model)
                .with_bias(false)
                .init(device),
            v_proj: LinearConfig::new(self.d_model, self.d_model)
                .with_bias(false)
                .init(device),
            o_proj: LinearConfig::new(self.d_model, self.d_model).init(device),
            num_heads: self.num_heads,
            head_dim: self.head_dim(),
            head_chunks: self.head_chunks(),
            attention: Ignored(attention),
        })
    }
}

impl<B: Backend> LshSelfAttention<B> {
    pub fn attention(&self) -> &LshAttention {
        &self.attention
    }

    /// Changes how many head groups are processed; the output does not depend on it
    pub fn with_head_chunks(mut self, head_chunks: usize) -> Result<Self, LshError> {
        if head_chunks == 0 || head_chunks > self.num_heads {
            return Err(LshError::InvalidHeadChunks {
                head_chunks,
                num_heads: self.num_heads,
            });
        }
        self.head_chunks = head_chunks;
        Ok(self)
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq_len, d_model]
    /// * `seed` - Seed for the hash rotations and dropout masks of this call
    pub fn forward(&self, x: Tensor<B, 3>, seed: u64) -> Result<LshSelfAttentionOutput<B>, LshError> {
        let [batch, seq_len, d_model] = x.dims();
        let model_dim = self.num_heads * self.head_dim;
        if d_model != model_dim {
            return Err(LshError::ShapeMismatch {
                expected: vec![batch, seq_len, model_dim],
                actual: vec![batch, seq_len, d_model],
            });
        }
        let bucket_size = self.attention.config().bucket_size;
        if seq_len == 0 {
            return Err(LshError::EmptySequence);
        }
        if seq_len % bucket_size != 0 {
            return Err(LshError::SeqLenNotDivisible {
                seq_len,
                bucket_size,
            });
        }

        let rng = CallRng::new(seed);
        let qk = self.split_heads(self.qk_proj.forward(x.clone()));
        let v = self.split_heads(self.v_proj.forward(x));

        let groups = self.head_groups();
        tracing::debug!(
            batch,
            seq_len,
            num_heads = self.num_heads,
            groups = groups.len(),
            seed,
            "lsh self-attention forward"
        );

        let mut outputs = Vec::with_capacity(groups.len());
        let mut buckets = Vec::with_capacity(groups.len());
        for (start, len) in groups {
            tracing::trace!(start, len, "head group");

            let out = self.attention.forward(
                qk.clone().narrow(1, start, len),
                v.clone().narrow(1, start, len),
                &rng,
                start,
            )?;
            outputs.push(out.output);
            buckets.push(out.buckets);
        }

        let output = Tensor::cat(outputs, 1)
            .swap_dims(1, 2)
            .reshape([batch, seq_len, model_dim]);

        Ok(LshSelfAttentionOutput {
            output: self.o_proj.forward(output),
            buckets: Tensor::cat(buckets, 1),
        })
    }

    /// `(first head, head count)` of every head group, in head order
    ///
    /// Always `head_chunks` groups; the first `num_heads % head_chunks`
    /// groups take one extra head.
    pub fn head_groups(&self) -> Vec<(usize, usize)> {
        let base = self.num_heads / self.head_chunks;
        let extra = self.num_heads % self.head_chunks;

        let mut start = 0;
        (0..self.head_chunks)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let group = (start, len);
                start += len;
                group
            })
            .collect()
    }

    /// [batch, seq_len, d_model] -> [batch, num_heads, seq_len, head_dim]
    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, seq_len, _] = x.dims();
        x.reshape([batch, seq_len, self.num_heads, self.head_dim])
            .swap_dims(1, 2)
    }
}
