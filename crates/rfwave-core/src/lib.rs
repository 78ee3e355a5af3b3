//! # RFWave Core
//!
//! Attention layers for a rectified-flow vocoder, built on candle.
//!
//! This crate provides:
//! - **RMS normalization** with `f32` accumulation
//! - **Rotary position embeddings** with per-batch position lookup
//! - **Padding masks** and duration-aligned position indices
//! - **SwiGLU feed-forward** blocks
//! - **Self- and cross-attention** with optional QK normalization
//! - **Fused attention** via candle-flash-attn (`cuda` feature)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod error;
pub mod model;

pub use error::{Result, RfwaveError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attention::{select_kernel, AttentionKernel, ManualKernel, SdpaParams};
    pub use crate::error::{Result, RfwaveError};
    pub use crate::model::{
        apply_rotary_emb, get_pos_embed_indices, modulate, score_mask, Attention, CrossAttention,
        FeedForward, ModelConfig, PositionScale, RmsNorm, RopeConfig, RotaryEmbedding,
    };
}
