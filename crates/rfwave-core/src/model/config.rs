//! Layer configuration.

use crate::error::{Result, RfwaveError};
use serde::{Deserialize, Serialize};

/// Normalization applied per head to queries and keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QkNormKind {
    /// Affine layer normalization (mean-centred).
    #[default]
    LayerNorm,
    /// Root-mean-square normalization.
    RmsNorm,
}

/// Rotary position embedding parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RopeConfig {
    /// Base frequency.
    pub theta: f64,
    /// NTK-aware rescale of `theta` for extrapolation to longer sequences.
    pub theta_rescale_factor: f64,
    /// Number of positions in the precomputed table.
    pub max_positions: usize,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            theta: 10000.0,
            theta_rescale_factor: 1.0,
            max_positions: 4096,
        }
    }
}

/// Configuration shared by the attention and feed-forward layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model (channel) dimension.
    pub dim: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Bias on the query and key/value projections.
    pub qkv_bias: bool,
    /// Normalize queries and keys per head before rotary application.
    pub qk_norm: bool,
    /// Which normalization `qk_norm` uses.
    pub qk_norm_kind: QkNormKind,
    /// Epsilon for normalization layers.
    pub norm_eps: f64,
    /// Dropout on attention probabilities (training only).
    pub attn_drop: f32,
    /// Dropout after the output projection (training only).
    pub proj_drop: f32,
    /// Feed-forward hidden dimension, derived from `dim` when unset.
    pub ffn_hidden_dim: Option<usize>,
    /// Rounding multiple for the derived feed-forward width.
    pub multiple_of: usize,
    /// Dropout after the feed-forward output (training only).
    pub ffn_drop: f32,
    /// Rotary embeddings; `None` disables rotation.
    pub rope: Option<RopeConfig>,
    /// Prefer the fused attention kernel when it is compiled in.
    pub use_fused_attention: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: 512,
            num_heads: 8,
            qkv_bias: false,
            qk_norm: false,
            qk_norm_kind: QkNormKind::LayerNorm,
            norm_eps: 1e-5,
            attn_drop: 0.0,
            proj_drop: 0.0,
            ffn_hidden_dim: None,
            multiple_of: 256,
            ffn_drop: 0.0,
            rope: Some(RopeConfig::default()),
            use_fused_attention: true,
        }
    }
}

impl ModelConfig {
    /// Config for `dim` channels split over `num_heads` heads, other fields default.
    pub fn new(dim: usize, num_heads: usize) -> Self {
        Self {
            dim,
            num_heads,
            ..Self::default()
        }
    }

    /// Enable per-head query/key normalization.
    pub fn with_qk_norm(mut self, kind: QkNormKind) -> Self {
        self.qk_norm = true;
        self.qk_norm_kind = kind;
        self
    }

    /// Set attention and projection dropout.
    pub fn with_dropout(mut self, attn_drop: f32, proj_drop: f32) -> Self {
        self.attn_drop = attn_drop;
        self.proj_drop = proj_drop;
        self
    }

    /// Dimension of a single head.
    pub fn head_dim(&self) -> usize {
        self.dim / self.num_heads.max(1)
    }

    /// Check construction-time invariants.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(RfwaveError::config("num_heads must be positive"));
        }
        if self.dim == 0 || self.dim % self.num_heads != 0 {
            return Err(RfwaveError::config(format!(
                "dim {} should be divisible by num_heads {}",
                self.dim, self.num_heads
            )));
        }
        for (name, p) in [
            ("attn_drop", self.attn_drop),
            ("proj_drop", self.proj_drop),
            ("ffn_drop", self.ffn_drop),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(RfwaveError::config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        if self.rope.is_some() && self.head_dim() % 2 != 0 {
            return Err(RfwaveError::config(format!(
                "rotary embeddings need an even head_dim, got {}",
                self.head_dim()
            )));
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}
