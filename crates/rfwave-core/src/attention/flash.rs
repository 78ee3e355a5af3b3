//! Fused GPU attention kernel.
//!
//! [`FlashKernel`] runs Flash Attention 2 through `candle-flash-attn`. The
//! fused kernel has no additive-mask input and no dropout, and only handles
//! `f16`/`bf16` CUDA tensors; calls outside that envelope go through
//! [`ManualKernel`].

use super::backend::{check_qkv, AttentionKernel, ManualKernel, SdpaParams};
use crate::error::Result;
use candle_core::{DType, Tensor};

/// Flash Attention kernel with a manual fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlashKernel {
    fallback: ManualKernel,
}

impl FlashKernel {
    /// Create a new flash kernel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a call with these inputs can use the fused path.
    pub fn supports(query: &Tensor, mask: Option<&Tensor>, params: &SdpaParams) -> bool {
        query.device().is_cuda()
            && matches!(query.dtype(), DType::F16 | DType::BF16)
            && mask.is_none()
            && params.dropout_p == 0.0
    }
}

impl AttentionKernel for FlashKernel {
    fn name(&self) -> &'static str {
        "flash-attn"
    }

    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        params: &SdpaParams,
    ) -> Result<Tensor> {
        if check_qkv(query, key, value)? == 0 || !Self::supports(query, mask, params) {
            return self.fallback.attend(query, key, value, mask, params);
        }

        // Flash attention expects [batch, seq_len, num_heads, head_dim]
        let q = query.transpose(1, 2)?.contiguous()?;
        let k = key.transpose(1, 2)?.contiguous()?;
        let v = value.transpose(1, 2)?.contiguous()?;

        let output = candle_flash_attn::flash_attn(&q, &k, &v, params.scale as f32, false)?;

        // Back to [batch, num_heads, seq_len, head_dim]
        Ok(output.transpose(1, 2)?)
    }
}
