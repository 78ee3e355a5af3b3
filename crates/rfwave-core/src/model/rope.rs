//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Features are rotated as interleaved
//! `(real, imag)` pairs, so channel `2i` and `2i + 1` form pair `i`.
//!
//! Tables are laid out as `[cos | sin]` along the last dimension: a table for
//! head dimension `d` has `d / 2` cosine columns followed by `d / 2` sine
//! columns.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use super::RopeConfig;
use crate::error::{Result, RfwaveError};
use candle_core::{DType, Device, Tensor, D};

/// Build the `(end, dim)` rotary table `[cos(t * f), sin(t * f)]`.
///
/// Frequencies are `f_i = 1 / theta'^(2i / dim)` with
/// `theta' = theta * theta_rescale_factor^(dim / (dim - 2))`. The rescale is
/// the NTK-aware trick for running on longer sequences than seen in training;
/// a factor of `1.0` leaves `theta` untouched.
pub fn precompute_freqs_cis(
    dim: usize,
    end: usize,
    theta: f64,
    theta_rescale_factor: f64,
    device: &Device,
) -> Result<Tensor> {
    if dim == 0 || dim % 2 != 0 {
        return Err(RfwaveError::config(format!(
            "rotary dim must be even and positive, got {dim}"
        )));
    }
    let theta = if theta_rescale_factor == 1.0 {
        theta
    } else if dim <= 2 {
        return Err(RfwaveError::config(
            "theta rescaling needs a rotary dim greater than 2",
        ));
    } else {
        theta * theta_rescale_factor.powf(dim as f64 / (dim as f64 - 2.0))
    };

    // 1 / (theta^(2i/d)) for i in [0, d/2)
    let half_dim = dim / 2;
    let inv_freq: Vec<f32> = (0..half_dim)
        .map(|i| (1.0 / theta.powf(2.0 * i as f64 / dim as f64)) as f32)
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

    let positions: Vec<f32> = (0..end).map(|p| p as f32).collect();
    let positions = Tensor::from_vec(positions, (end, 1), device)?;

    // [end, half_dim]
    let freqs = positions.matmul(&inv_freq)?;

    Ok(Tensor::cat(&[freqs.cos()?, freqs.sin()?], D::Minus1)?)
}

/// Align a cosine or sine table with the pair tensor it rotates.
///
/// * rank 4 `x` of shape `[b, s, h, p]` needs `freqs` of shape `[b, s, p]`
///   and gets a `[b, s, 1, p]` view broadcasting over heads.
/// * rank 3 `x` needs `freqs` of exactly the same shape.
pub fn reshape_for_broadcast(freqs: &Tensor, x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    match dims.len() {
        4 => {
            let expected = [dims[0], dims[1], dims[3]];
            if freqs.dims() != expected {
                return Err(RfwaveError::shape(format!(
                    "rotary table {:?} does not match {:?} for input {:?}",
                    freqs.dims(),
                    expected,
                    dims
                )));
            }
            Ok(freqs.reshape((dims[0], dims[1], 1, dims[3]))?)
        }
        3 => {
            if freqs.dims() != dims {
                return Err(RfwaveError::shape(format!(
                    "rotary table {:?} does not match input {:?}",
                    freqs.dims(),
                    dims
                )));
            }
            Ok(freqs.clone())
        }
        rank => Err(RfwaveError::UnsupportedRank(rank)),
    }
}

/// Rotate interleaved feature pairs of `x` by the angles in `freqs`.
///
/// `None` disables rotation and returns `x` as is. The rotation runs in `f32`
/// and the result is cast back to the dtype of `x`.
pub fn apply_rotary_emb(x: &Tensor, freqs: Option<&Tensor>) -> Result<Tensor> {
    let Some(freqs) = freqs else {
        return Ok(x.clone());
    };

    let dtype = x.dtype();
    let mut pair_shape = x.dims().to_vec();
    let last = pair_shape.pop().unwrap_or(0);
    if last == 0 || last % 2 != 0 {
        return Err(RfwaveError::shape(format!(
            "rotary input needs an even last dimension, got {:?}",
            x.dims()
        )));
    }
    let half = last / 2;
    pair_shape.extend([half, 2]);

    let pairs = x.to_dtype(DType::F32)?.reshape(pair_shape)?;
    let x_r = pairs.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
    let x_i = pairs.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;

    if freqs.dim(D::Minus1)? != last {
        return Err(RfwaveError::shape(format!(
            "rotary table width {} does not match feature width {}",
            freqs.dim(D::Minus1)?,
            last
        )));
    }
    let freqs = freqs.to_dtype(DType::F32)?;
    let cos = reshape_for_broadcast(&freqs.narrow(D::Minus1, 0, half)?, &x_r)?;
    let sin = reshape_for_broadcast(&freqs.narrow(D::Minus1, half, half)?, &x_r)?;

    let out_r = (x_r.broadcast_mul(&cos)? - x_i.broadcast_mul(&sin)?)?;
    let out_i = (x_r.broadcast_mul(&sin)? + x_i.broadcast_mul(&cos)?)?;

    // [..., half, 2] -> [..., last]
    let pair_dim = out_r.rank();
    let out = Tensor::stack(&[out_r, out_i], pair_dim)?.flatten_from(pair_dim - 1)?;

    Ok(out.to_dtype(dtype)?)
}

/// Precomputed rotary table with per-batch row lookup.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// `[max_positions, head_dim]` table of `[cos | sin]`.
    table: Tensor,
    /// Rotated feature width.
    head_dim: usize,
    /// Rows in the table.
    max_positions: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head
    /// * `config` - Base frequency, rescale factor and table length
    /// * `device` - Device for tensors
    pub fn new(head_dim: usize, config: &RopeConfig, device: &Device) -> Result<Self> {
        let table = precompute_freqs_cis(
            head_dim,
            config.max_positions,
            config.theta,
            config.theta_rescale_factor,
            device,
        )?;
        tracing::debug!(
            head_dim,
            max_positions = config.max_positions,
            theta = config.theta,
            "built rotary table"
        );
        Ok(Self {
            table,
            head_dim,
            max_positions: config.max_positions,
        })
    }

    /// The `[max_positions, head_dim]` table.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Get the number of positions in the table.
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Look up table rows for `[batch, len]` integer positions.
    ///
    /// Returns `[batch, len, head_dim]`, the layout attention expects for
    /// rotating `[batch, len, heads, head_dim]` queries and keys.
    pub fn gather(&self, positions: &Tensor) -> Result<Tensor> {
        let (batch, len) = positions.dims2()?;
        let flat = positions.to_dtype(DType::I64)?.flatten_all()?;
        if batch * len > 0 {
            let lo = flat.min(0)?.to_scalar::<i64>()?;
            let hi = flat.max(0)?.to_scalar::<i64>()?;
            if lo < 0 || hi as usize >= self.max_positions {
                return Err(RfwaveError::shape(format!(
                    "positions in [{lo}, {hi}] outside rotary table of {} rows",
                    self.max_positions
                )));
            }
        }
        let rows = self.table.index_select(&flat, 0)?;
        Ok(rows.reshape((batch, len, self.head_dim))?)
    }

    /// Rows `0..seq_len` repeated for every batch entry.
    pub fn sequential(&self, batch: usize, seq_len: usize) -> Result<Tensor> {
        if seq_len > self.max_positions {
            return Err(RfwaveError::shape(format!(
                "sequence of {seq_len} exceeds rotary table of {} rows",
                self.max_positions
            )));
        }
        let rows = self.table.narrow(0, 0, seq_len)?.unsqueeze(0)?;
        Ok(rows
            .broadcast_as((batch, seq_len, self.head_dim))?
            .contiguous()?)
    }
}
