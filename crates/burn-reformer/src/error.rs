//! Error type shared by configuration and forward passes

use thiserror::Error;

/// Errors raised by LSH attention construction and forward calls
///
/// Every variant is a precondition violation; nothing is retried and no
/// partial output is produced.
#[derive(Error, Debug)]
pub enum LshError {
    #[error("Dropout rates must be in [0, 1), got {0}")]
    InvalidDropout(f64),

    #[error(
        "The setting {{allow_duplicate_attention=false, rehash_each_round=false}} is not implemented"
    )]
    UnsupportedDuplicateMode,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Model dimension {d_model} is not divisible by {num_heads} heads")]
    HeadsDoNotDivide { d_model: usize, num_heads: usize },

    #[error("Head chunk count must be in 1..={num_heads}, got {head_chunks}")]
    InvalidHeadChunks { head_chunks: usize, num_heads: usize },

    #[error("Sequence length {seq_len} needs to be divisible by bucket size {bucket_size}")]
    SeqLenNotDivisible { seq_len: usize, bucket_size: usize },

    #[error("Sequence is empty")]
    EmptySequence,

    #[error("Hashing needs an even number of buckets, got {0}")]
    OddBucketCount(usize),

    #[error("Top-k hashing needs n_hashes <= n_buckets, got {n_hashes} > {n_buckets}")]
    TooManyHashRounds { n_hashes: usize, n_buckets: usize },

    #[error("Output shape {actual:?} does not match value shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}
