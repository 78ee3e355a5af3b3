//! Attention building blocks.
//!
//! Provides the layers and helpers used by the vocoder backbone:
//! - Configuration
//! - RMS normalization and rotary position embeddings
//! - Padding masks and per-batch position indices
//! - SwiGLU feed-forward, self- and cross-attention

mod attention;
mod config;
mod feed_forward;
mod mask;
mod modulate;
mod rmsnorm;
mod rope;

pub use attention::{Attention, CrossAttention, QkNorm};
pub use config::{ModelConfig, QkNormKind, RopeConfig};
pub use feed_forward::{default_hidden_dim, FeedForward};
pub use mask::{
    get_pos_embed_indices, length_or_full, score_mask, score_mask_from_bool_mask, sequence_mask,
    start_or_zeros, PositionScale,
};
pub use modulate::modulate;
pub use rmsnorm::RmsNorm;
pub use rope::{apply_rotary_emb, precompute_freqs_cis, reshape_for_broadcast, RotaryEmbedding};
