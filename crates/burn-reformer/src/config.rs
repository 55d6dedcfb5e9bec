//! Configuration for LSH attention and the multi-head wrapper
//!
//! Both configs are plain serde structs. They are immutable once a module
//! has been initialized from them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LshError;

/// How attention from a position to itself is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfMaskPolicy {
    /// Always mask self-attention, even when it leaves a query with no
    /// unmasked candidate (the row then degenerates to a uniform softmax)
    #[default]
    Always,
    /// Mask self-attention only if some other candidate survives the causal
    /// and cross-bucket masks
    UnlessOnlyCandidate,
}

/// Configuration for [`LshAttention`](crate::LshAttention)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LshAttentionConfig {
    /// Dropout applied to attention weights
    pub dropout: f64,
    /// Number of sorted positions per chunk
    pub bucket_size: usize,
    /// Number of hashing rounds
    pub n_hashes: usize,
    /// Forbid attending to later positions
    pub causal: bool,
    /// Allow a pair to be attended in several rounds without correction
    pub allow_duplicate_attention: bool,
    /// Allow attention between positions hashed to different buckets
    pub attend_across_buckets: bool,
    /// Draw fresh rotations for every round (otherwise top-k of one rotation)
    pub rehash_each_round: bool,
    /// Dropout applied to the hash input before rotation
    pub drop_for_hash_rate: f64,
    /// Draw separate rotations for every head
    pub random_rotations_per_head: bool,
    /// Self-attention masking policy
    pub self_mask: SelfMaskPolicy,
}

impl Default for LshAttentionConfig {
    fn default() -> Self {
        Self {
            dropout: 0.0,
            bucket_size: 64,
            n_hashes: 8,
            causal: false,
            allow_duplicate_attention: true,
            attend_across_buckets: true,
            rehash_each_round: true,
            drop_for_hash_rate: 0.0,
            random_rotations_per_head: false,
            self_mask: SelfMaskPolicy::Always,
        }
    }
}

impl LshAttentionConfig {
    /// Creates a config with the given bucket size and hash rounds
    pub fn new(bucket_size: usize, n_hashes: usize) -> Self {
        Self {
            bucket_size,
            n_hashes,
            ..Default::default()
        }
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_allow_duplicate_attention(mut self, allow: bool) -> Self {
        self.allow_duplicate_attention = allow;
        self
    }

    pub fn with_attend_across_buckets(mut self, attend: bool) -> Self {
        self.attend_across_buckets = attend;
        self
    }

    pub fn with_rehash_each_round(mut self, rehash: bool) -> Self {
        self.rehash_each_round = rehash;
        self
    }

    pub fn with_drop_for_hash_rate(mut self, rate: f64) -> Self {
        self.drop_for_hash_rate = rate;
        self
    }

    pub fn with_random_rotations_per_head(mut self, per_head: bool) -> Self {
        self.random_rotations_per_head = per_head;
        self
    }

    pub fn with_self_mask(mut self, policy: SelfMaskPolicy) -> Self {
        self.self_mask = policy;
        self
    }

    /// Checks every construction-time precondition
    pub fn validate(&self) -> Result<(), LshError> {
        for rate in [self.dropout, self.drop_for_hash_rate] {
            if !(0.0..1.0).contains(&rate) {
                return Err(LshError::InvalidDropout(rate));
            }
        }
        if self.bucket_size == 0 {
            return Err(LshError::InvalidParameter(
                "bucket_size must be > 0".to_string(),
            ));
        }
        if self.n_hashes == 0 {
            return Err(LshError::InvalidParameter(
                "n_hashes must be > 0".to_string(),
            ));
        }
        if !self.rehash_each_round && !self.allow_duplicate_attention {
            return Err(LshError::UnsupportedDuplicateMode);
        }
        Ok(())
    }
}

/// Configuration for [`LshSelfAttention`](crate::LshSelfAttention)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LshSelfAttentionConfig {
    /// Model (embedding) dimension
    pub d_model: usize,
    /// Number of attention heads
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Number of head groups processed one after another; defaults to `num_heads`
    #[serde(default)]
    pub head_chunks: Option<usize>,
    /// Inner LSH attention settings
    #[serde(default = "default_wrapped_attention")]
    pub attention: LshAttentionConfig,
}

fn default_num_heads() -> usize {
    8
}

fn default_wrapped_attention() -> LshAttentionConfig {
    LshAttentionConfig::default().with_attend_across_buckets(false)
}

impl LshSelfAttentionConfig {
    /// Creates a config; the wrapper does not attend across buckets by default
    pub fn new(d_model: usize, num_heads: usize) -> Self {
        Self {
            d_model,
            num_heads,
            head_chunks: None,
            attention: default_wrapped_attention(),
        }
    }

    pub fn with_head_chunks(mut self, head_chunks: usize) -> Self {
        self.head_chunks = Some(head_chunks);
        self
    }

    pub fn with_attention(mut self, attention: LshAttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    /// Depth of each head
    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads
    }

    /// Resolved head chunk count
    pub fn head_chunks(&self) -> usize {
        self.head_chunks.unwrap_or(self.num_heads)
    }

    /// Checks every construction-time precondition, including the inner config
    pub fn validate(&self) -> Result<(), LshError> {
        if self.num_heads == 0 || self.d_model % self.num_heads != 0 {
            return Err(LshError::HeadsDoNotDivide {
                d_model: self.d_model,
                num_heads: self.num_heads,
            });
        }
        let head_chunks = self.head_chunks();
        if head_chunks == 0 || head_chunks > self.num_heads {
            return Err(LshError::InvalidHeadChunks {
                head_chunks,
                num_heads: self.num_heads,
            });
        }
        self.attention.validate()
    }

    /// Parses a config from JSON
    pub fn from_json_str(json: &str) -> Result<Self, LshError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a config from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LshError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}
