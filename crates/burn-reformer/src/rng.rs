//! Call-scoped random streams
//!
//! Hash rotations and dropout masks are drawn from generators derived from a
//! single per-call seed. Each (purpose, batch, head) triple gets its own
//! stream, so the result of a call does not depend on how heads are grouped
//! or in which order groups run. No global RNG state is read or written.

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// What a random stream is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Random rotations for hashing
    Rotation,
    /// Dropout on the hash input
    HashDropout,
    /// Dropout on attention weights
    AttentionDropout,
}

impl Stream {
    fn tag(self) -> u64 {
        match self {
            Stream::Rotation => 1,
            Stream::HashDropout => 2,
            Stream::AttentionDropout => 3,
        }
    }
}

/// Identity of one row of a flattened `[batch * heads, ...]` tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowId {
    pub batch: usize,
    /// Global head index (not the index within a head group)
    pub head: usize,
}

/// Random generator handle for a single forward call
#[derive(Debug, Clone, Copy)]
pub struct CallRng {
    seed: u64,
}

impl CallRng {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Independent generator for a purpose and a (batch, key) pair
    pub fn stream(&self, stream: Stream, batch: usize, key: usize) -> StdRng {
        let mut state = splitmix64(self.seed ^ stream.tag().wrapping_mul(0xA076_1D64_78BD_642F));
        state = splitmix64(state ^ batch as u64);
        state = splitmix64(state ^ key as u64);
        StdRng::seed_from_u64(state)
    }

    /// Standard normal rotation matrices, one `[dim, cols]` block per row
    ///
    /// With `per_head == false` all heads of a batch element receive the same
    /// matrix.
    pub fn rotations<B: Backend>(
        &self,
        rows: &[RowId],
        dim: usize,
        cols: usize,
        per_head: bool,
        device: &B::Device,
    ) -> Tensor<B, 3> {
        let mut values = Vec::with_capacity(rows.len() * dim * cols);
        for row in rows {
            let key = if per_head { row.head + 1 } else { 0 };
            let mut rng = self.stream(Stream::Rotation, row.batch, key);
            values.extend((0..dim * cols).map(|_| {
                let sample: f32 = StandardNormal.sample(&mut rng);
                sample
            }));
        }
        Tensor::from_data(TensorData::new(values, [rows.len(), dim, cols]), device)
    }

    /// Inverted dropout mask: zeros with probability `prob`, `1 / (1 - prob)` otherwise
    ///
    /// `shape[0]` must equal `rows.len()`; the remaining dimensions are filled
    /// row by row from that row's stream.
    pub fn dropout_mask<B: Backend, const D: usize>(
        &self,
        stream: Stream,
        rows: &[RowId],
        shape: [usize; D],
        prob: f64,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let per_row: usize = shape.iter().skip(1).product();
        let scale = (1.0 / (1.0 - prob)) as f32;
        let mut values = Vec::with_capacity(rows.len() * per_row);
        for row in rows {
            let mut rng = self.stream(stream, row.batch, row.head);
            values.extend((0..per_row).map(|_| {
                if rng.random::<f64>() < prob {
                    0.0
                } else {
                    scale
                }
            }));
        }
        Tensor::from_data(TensorData::new(values, shape), device)
    }
}

/// Row identities for a `[batch, heads]` block whose first head is `head_offset`
pub fn row_ids(batch: usize, heads: usize, head_offset: usize) -> Vec<RowId> {
    (0..batch)
        .flat_map(|b| {
            (0..heads).map(move |h| RowId {
                batch: b,
                head: head_offset + h,
            })
        })
        .collect()
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
