//! SwiGLU feed-forward block.
//!
//! # Formula
//!
//! `FFN(x) = dropout(w2(silu(w1(x)) * w3(x)))`
//!
//! Where `silu(x) = x * sigmoid(x)`. None of the projections carry a bias.
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::ModelConfig;
use crate::error::{Result, RfwaveError};
use candle_core::Tensor;
use candle_nn::{linear_no_bias, ops::silu, Dropout, Linear, Module, VarBuilder};

/// SwiGLU feed-forward block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Gate projection: dim -> hidden
    w1: Linear,
    /// Down projection: hidden -> dim
    w2: Linear,
    /// Up projection: dim -> hidden
    w3: Linear,
    dropout: Dropout,
    /// Model dimension.
    dim: usize,
    /// Hidden dimension.
    hidden_dim: usize,
}

/// Hidden width used when none is configured: `floor(8 * dim / 3)` rounded
/// up to a multiple of `multiple_of`.
pub fn default_hidden_dim(dim: usize, multiple_of: usize) -> Result<usize> {
    if multiple_of == 0 {
        return Err(RfwaveError::config("multiple_of must be positive"));
    }
    let hidden = 2 * (4 * dim) / 3;
    Ok(multiple_of * hidden.div_ceil(multiple_of))
}

impl FeedForward {
    /// Create the block from a var builder.
    ///
    /// Parameters live under `w1`, `w2` and `w3`.
    pub fn new(
        dim: usize,
        hidden_dim: Option<usize>,
        multiple_of: usize,
        drop: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden_dim = match hidden_dim {
            Some(hidden) => hidden,
            None => default_hidden_dim(dim, multiple_of)?,
        };
        if dim == 0 || hidden_dim == 0 {
            return Err(RfwaveError::config(format!(
                "feed-forward sizes must be positive, got dim={dim} hidden={hidden_dim}"
            )));
        }

        let w1 = linear_no_bias(dim, hidden_dim, vb.pp("w1"))?;
        let w2 = linear_no_bias(hidden_dim, dim, vb.pp("w2"))?;
        let w3 = linear_no_bias(dim, hidden_dim, vb.pp("w3"))?;
        tracing::debug!(dim, hidden_dim, drop, "built feed-forward");

        Ok(Self {
            w1,
            w2,
            w3,
            dropout: Dropout::new(drop),
            dim,
            hidden_dim,
        })
    }

    /// Create the block with the feed-forward settings of `config`.
    pub fn from_config(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Self::new(
            config.dim,
            config.ffn_hidden_dim,
            config.multiple_of,
            config.ffn_drop,
            vb,
        )
    }

    /// Create the block from explicit `[out, in]` weight matrices.
    pub fn from_weights(w1: Tensor, w2: Tensor, w3: Tensor, drop: f32) -> Result<Self> {
        let (hidden_dim, dim) = w1.dims2()?;
        if w3.dims() != w1.dims() || w2.dims() != [dim, hidden_dim] {
            return Err(RfwaveError::shape(format!(
                "w1 {:?}, w2 {:?}, w3 {:?} do not form a {dim} -> {hidden_dim} block",
                w1.dims(),
                w2.dims(),
                w3.dims()
            )));
        }
        Ok(Self {
            w1: Linear::new(w1, None),
            w2: Linear::new(w2, None),
            w3: Linear::new(w3, None),
            dropout: Dropout::new(drop),
            dim,
            hidden_dim,
        })
    }

    /// Forward pass in inference mode.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., dim]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }

    /// Forward pass; dropout is applied only when `train` is set.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = silu(&self.w1.forward(x)?)?;
        let up = self.w3.forward(x)?;
        let out = self.w2.forward(&(gate * up)?)?;
        Ok(self.dropout.forward(&out, train)?)
    }

    /// Get the model dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Get the hidden dimension.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}
