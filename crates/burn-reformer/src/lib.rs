//! Reformer LSH Attention for Burn
//!
//! Locality-sensitive hashing attention approximates full self-attention by
//! hashing shared query/key vectors into buckets and attending only within
//! sorted chunks of the same bucket (plus the preceding chunk).
//!
//! # Modules
//!
//! ## Pipeline
//!
//! - [`hashing`] - Random-rotation bucket assignment
//! - [`sorting`] - Bucket sort, chunking and look-one-back
//! - [`chunk_attention`] - Masked attention inside chunks
//! - [`aggregate`] - Unsorting and multi-round combination
//!
//! ## Layers
//!
//! - [`lsh_attention`] - The pipeline over a group of heads
//! - [`self_attention`] - Multi-head wrapper with projections
//!
//! ## Support
//!
//! - [`config`] - Serde configs with validation
//! - [`rng`] - Per-call seeded random streams
//! - [`error`] - Error type
//!
//! # Example
//!
//! ```ignore
//! use burn_reformer::{LshAttentionConfig, LshSelfAttentionConfig};
//!
//! let config = LshSelfAttentionConfig::new(256, 8)
//!     .with_attention(LshAttentionConfig::new(64, 4).with_causal(true));
//! let attn = config.init::<B>(&device)?;
//! let out = attn.forward(x, seed)?;
//! ```

pub mod aggregate;
pub mod chunk_attention;
pub mod config;
pub mod error;
pub mod hashing;
pub mod lsh_attention;
pub mod rng;
pub mod self_attention;
pub mod sorting;

pub use chunk_attention::MASK_VALUE;
pub use config::{LshAttentionConfig, LshSelfAttentionConfig, SelfMaskPolicy};
pub use error::LshError;
pub use lsh_attention::{LshAttention, LshAttentionOutput};
pub use rng::CallRng;
pub use self_attention::{LshSelfAttention, LshSelfAttentionOutput};
