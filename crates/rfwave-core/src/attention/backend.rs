//! Scaled dot-product attention kernels.
//!
//! This module provides:
//! - [`AttentionKernel`] - Trait for scaled dot-product attention kernels
//! - [`ManualKernel`] - Matmul + mask + softmax reference implementation
//! - [`SdpaParams`] - Per-call scale and dropout

use crate::error::{Result, RfwaveError};
use candle_core::{DType, Tensor, D};

/// Per-call parameters for scaled dot-product attention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdpaParams {
    /// Multiplier applied to the queries (`head_dim^-0.5` by default).
    pub scale: f64,
    /// Dropout on attention probabilities; `0.0` outside training.
    pub dropout_p: f32,
}

impl SdpaParams {
    /// Parameters for heads of width `head_dim`, without dropout.
    pub fn new(head_dim: usize) -> Self {
        Self {
            scale: 1.0 / (head_dim as f64).sqrt(),
            dropout_p: 0.0,
        }
    }

    /// Set attention dropout.
    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.dropout_p = dropout_p;
        self
    }
}

/// Kernel computing `softmax(q k^T * scale + mask) v`.
///
/// All tensors are `[batch, heads, len, head_dim]`; `mask` must broadcast to
/// `[batch, heads, q_len, kv_len]`. The output matches the query shape.
pub trait AttentionKernel: Send + Sync + std::fmt::Debug {
    /// Short kernel name for logs.
    fn name(&self) -> &'static str;

    /// Compute attention for one call.
    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        params: &SdpaParams,
    ) -> Result<Tensor>;
}

/// Reference kernel built from plain tensor ops.
///
/// The softmax runs in `f32` and is cast back to the query dtype; masked
/// scores are `-inf` and so get exactly zero probability.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualKernel;

impl ManualKernel {
    /// Create a new manual kernel.
    pub fn new() -> Self {
        Self
    }
}

/// Validate `[batch, heads, len, head_dim]` inputs and return the key length.
pub(crate) fn check_qkv(query: &Tensor, key: &Tensor, value: &Tensor) -> Result<usize> {
    let (qb, qh, _, qd) = query.dims4()?;
    let (kb, kh, kl, kd) = key.dims4()?;
    if key.dims() != value.dims() || (qb, qh, qd) != (kb, kh, kd) {
        return Err(RfwaveError::shape(format!(
            "query {:?}, key {:?}, value {:?} are not compatible",
            query.dims(),
            key.dims(),
            value.dims()
        )));
    }
    Ok(kl)
}

impl AttentionKernel for ManualKernel {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        params: &SdpaParams,
    ) -> Result<Tensor> {
        // No keys to attend to: every query reads an all-zero context
        if check_qkv(query, key, value)? == 0 {
            return Ok(query.zeros_like()?);
        }
        let dtype = query.dtype();

        // (q * scale) @ k^T -> [batch, heads, q_len, kv_len]
        let query = (query * params.scale)?;
        let scores = query.matmul(&key.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;

        let scores = match mask {
            Some(mask) => scores.broadcast_add(&mask.to_dtype(dtype)?)?,
            None => scores,
        };

        // Composed softmax rather than the fused op so gradients flow in training
        let probs =
            candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?.to_dtype(dtype)?;
        let probs = if params.dropout_p > 0.0 {
            candle_nn::ops::dropout(&probs, params.dropout_p)?
        } else {
            probs
        };

        Ok(probs.matmul(&value.contiguous()?)?)
    }
}
