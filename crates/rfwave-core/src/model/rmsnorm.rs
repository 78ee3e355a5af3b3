//! Root Mean Square Layer Normalization.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! The reduction runs in `f32` and the normalized tensor is cast back to the
//! input dtype before scaling, so `f16`/`bf16` activations do not underflow.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::{Result, RfwaveError};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Normalized dimension.
    hidden_size: usize,
}

impl RmsNorm {
    /// Default epsilon.
    pub const DEFAULT_EPS: f64 = 1e-6;

    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        let hidden_size = weight.dims1()?;
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create the layer from a var builder; `weight` starts at ones.
    pub fn load(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = x.dim(D::Minus1)?;
        if last != self.hidden_size {
            return Err(RfwaveError::shape(format!(
                "rmsnorm over {} channels got input {:?}",
                self.hidden_size,
                x.dims()
            )));
        }
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;
        let normalized = x.broadcast_mul(&rsqrt)?.to_dtype(dtype)?;

        Ok(normalized.broadcast_mul(&self.weight.to_dtype(dtype)?)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Replace the scale with another tensor of the same shape.
    pub fn load_weight(&mut self, weight: Tensor) -> Result<()> {
        if weight.dims() != self.weight.dims() {
            return Err(RfwaveError::shape(format!(
                "Expected shape {:?}, got {:?}",
                self.weight.dims(),
                weight.dims()
            )));
        }
        self.weight = weight;
        Ok(())
    }
}
