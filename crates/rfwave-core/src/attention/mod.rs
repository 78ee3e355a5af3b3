//! Attention kernels.
//!
//! Provides abstractions over different scaled dot-product implementations:
//! - [`ManualKernel`] - matmul + mask + softmax, runs everywhere
//! - [`FlashKernel`] - Flash Attention 2 via candle-flash-attn (`cuda` feature)

mod backend;

pub use backend::{AttentionKernel, ManualKernel, SdpaParams};

#[cfg(feature = "cuda")]
mod flash;

#[cfg(feature = "cuda")]
pub use flash::FlashKernel;

use std::sync::Arc;

/// Whether this build carries the fused attention kernel.
pub const FUSED_AVAILABLE: bool = cfg!(feature = "cuda");

/// Pick the attention kernel for a layer.
///
/// Returns the fused kernel when `prefer_fused` is set and it is compiled in,
/// the manual kernel otherwise.
pub fn select_kernel(prefer_fused: bool) -> Arc<dyn AttentionKernel> {
    #[cfg(feature = "cuda")]
    {
        if prefer_fused {
            return Arc::new(FlashKernel::new());
        }
    }

    if prefer_fused && !FUSED_AVAILABLE {
        tracing::warn!("using slow attention, fused kernel needs the `cuda` feature");
    }
    Arc::new(ManualKernel::new())
}
