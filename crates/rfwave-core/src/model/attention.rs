//! Multi-head cross attention and self-attention layers.
//!
//! Queries come from one sequence and keys/values from another (possibly of a
//! different length, same batch). Each side gets its own rotary table, which
//! lets the two sequences carry unrelated position encodings, e.g. frame
//! positions for audio queries and duration-aligned positions for phoneme
//! keys.

use super::{apply_rotary_emb, ModelConfig, QkNormKind, RmsNorm};
use crate::attention::{select_kernel, AttentionKernel, SdpaParams};
use crate::error::{Result, RfwaveError};
use candle_core::Tensor;
use candle_nn::{layer_norm, linear, linear_b, Dropout, LayerNorm, Linear, Module, VarBuilder};
use std::sync::Arc;

/// Per-head normalization of queries or keys.
#[derive(Debug, Clone)]
pub enum QkNorm {
    /// Affine layer norm over `head_dim`.
    Layer(LayerNorm),
    /// RMS norm over `head_dim`.
    Rms(RmsNorm),
}

impl QkNorm {
    fn load(kind: QkNormKind, head_dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            QkNormKind::LayerNorm => Self::Layer(layer_norm(head_dim, eps, vb)?),
            QkNormKind::RmsNorm => Self::Rms(RmsNorm::load(head_dim, eps, vb)?),
        })
    }

    /// Normalize over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Layer(norm) => Ok(norm.forward(x)?),
            Self::Rms(norm) => norm.forward(x),
        }
    }
}

/// Multi-head attention between a query and a key/value sequence.
#[derive(Debug, Clone)]
pub struct CrossAttention {
    /// Query projection: dim -> dim
    q: Linear,
    /// Joint key/value projection: dim -> 2 * dim
    kv: Linear,
    q_norm: Option<QkNorm>,
    k_norm: Option<QkNorm>,
    /// Output projection: dim -> dim, with bias
    proj: Linear,
    attn_drop: f32,
    proj_drop: Dropout,
    kernel: Arc<dyn AttentionKernel>,
    dim: usize,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CrossAttention {
    /// Create the layer from a var builder.
    ///
    /// Parameters live under `q`, `kv`, `proj` and, with `qk_norm`, `q_norm`
    /// and `k_norm`. Fails when `dim` is not divisible by `num_heads`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let dim = config.dim;
        let num_heads = config.num_heads;
        let head_dim = config.head_dim();

        let q = linear_b(dim, dim, config.qkv_bias, vb.pp("q"))?;
        let kv = linear_b(dim, 2 * dim, config.qkv_bias, vb.pp("kv"))?;
        let (q_norm, k_norm) = if config.qk_norm {
            let load = |name: &str| {
                QkNorm::load(config.qk_norm_kind, head_dim, config.norm_eps, vb.pp(name))
            };
            (Some(load("q_norm")?), Some(load("k_norm")?))
        } else {
            (None, None)
        };
        let proj = linear(dim, dim, vb.pp("proj"))?;
        let kernel = select_kernel(config.use_fused_attention);

        tracing::debug!(
            dim,
            num_heads,
            head_dim,
            qk_norm = config.qk_norm,
            kernel = kernel.name(),
            "built cross attention"
        );

        Ok(Self {
            q,
            kv,
            q_norm,
            k_norm,
            proj,
            attn_drop: config.attn_drop,
            proj_drop: Dropout::new(config.proj_drop),
            kernel,
            dim,
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// Replace the attention kernel.
    pub fn with_kernel(mut self, kernel: Arc<dyn AttentionKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    /// Inference-mode forward pass, see [`CrossAttention::forward_t`].
    pub fn forward(
        &self,
        q_x: &Tensor,
        kv_x: &Tensor,
        q_freqs: Option<&Tensor>,
        k_freqs: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.forward_t(q_x, kv_x, q_freqs, k_freqs, mask, false)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `q_x` - Query sequence [batch, q_len, dim]
    /// * `kv_x` - Key/value sequence [batch, kv_len, dim]
    /// * `q_freqs` - Rotary rows for queries [batch, q_len, head_dim]
    /// * `k_freqs` - Rotary rows for keys [batch, kv_len, head_dim]
    /// * `mask` - Additive mask broadcastable to [batch, heads, q_len, kv_len]
    /// * `train` - Enables attention and projection dropout
    ///
    /// Returns [batch, q_len, dim]. An empty key/value sequence yields a zero
    /// attention context, so the output is the projection bias alone.
    pub fn forward_t(
        &self,
        q_x: &Tensor,
        kv_x: &Tensor,
        q_freqs: Option<&Tensor>,
        k_freqs: Option<&Tensor>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (bsz, q_len, ch) = q_x.dims3()?;
        let (kv_bsz, kv_len, kv_ch) = kv_x.dims3()?;
        if kv_bsz != bsz || ch != self.dim || kv_ch != self.dim {
            return Err(RfwaveError::shape(format!(
                "query {:?} and key/value {:?} must share batch and have {} channels",
                q_x.dims(),
                kv_x.dims(),
                self.dim
            )));
        }
        if kv_len == 0 {
            let context = Tensor::zeros((bsz, q_len, ch), q_x.dtype(), q_x.device())?;
            return self.project_out(&context, train);
        }

        // [batch, len, heads, head_dim]
        let q = self
            .q
            .forward(q_x)?
            .reshape((bsz, q_len, self.num_heads, self.head_dim))?;
        let kv = self
            .kv
            .forward(kv_x)?
            .reshape((bsz, kv_len, 2, self.num_heads, self.head_dim))?;
        let k = kv.narrow(2, 0, 1)?.squeeze(2)?;
        let v = kv.narrow(2, 1, 1)?.squeeze(2)?;

        let q = match &self.q_norm {
            Some(norm) => norm.forward(&q)?,
            None => q,
        };
        let k = match &self.k_norm {
            Some(norm) => norm.forward(&k)?,
            None => k,
        };
        let q = apply_rotary_emb(&q, q_freqs)?;
        let k = apply_rotary_emb(&k, k_freqs)?;

        // [batch, heads, len, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let params = SdpaParams {
            scale: self.scale,
            dropout_p: if train { self.attn_drop } else { 0.0 },
        };
        let x = self.kernel.attend(&q, &k, &v, mask, &params)?;

        // Merge heads: [batch, q_len, dim]
        let x = x.transpose(1, 2)?.reshape((bsz, q_len, ch))?;
        self.project_out(&x, train)
    }

    fn project_out(&self, context: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.proj.forward(context)?;
        Ok(self.proj_drop.forward(&x, train)?)
    }

    /// Get the model dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Query multiplier, `head_dim^-0.5`.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Name of the attention kernel in use.
    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }
}

/// Self-attention: a [`CrossAttention`] whose queries, keys and values all
/// come from the same sequence.
#[derive(Debug, Clone)]
pub struct Attention {
    inner: CrossAttention,
}

impl Attention {
    /// Create the layer from a var builder.
    ///
    /// Uses the same parameter names as [`CrossAttention::new`].
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: CrossAttention::new(config, vb)?,
        })
    }

    /// Wrap an existing cross attention layer.
    pub fn from_cross(inner: CrossAttention) -> Self {
        Self { inner }
    }

    /// Inference-mode forward pass.
    pub fn forward(
        &self,
        x: &Tensor,
        freqs: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.forward_t(x, freqs, mask, false)
    }

    /// Forward pass with `x` as both query and key/value source.
    pub fn forward_t(
        &self,
        x: &Tensor,
        freqs: Option<&Tensor>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        self.inner.forward_t(x, x, freqs, freqs, mask, train)
    }

    /// The underlying cross attention layer.
    pub fn inner(&self) -> &CrossAttention {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::ManualKernel;
    use crate::model::{
        get_pos_embed_indices, score_mask, PositionScale, RopeConfig, RotaryEmbedding,
    };
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    fn test_config(dim: usize, num_heads: usize) -> ModelConfig {
        ModelConfig {
            use_fused_attention: false,
            ..ModelConfig::new(dim, num_heads)
        }
    }

    fn create_test_cross(varmap: &VarMap, config: &ModelConfig) -> CrossAttention {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        CrossAttention::new(config, vb.pp("attn")).unwrap()
    }

    fn create_rope(head_dim: usize) -> RotaryEmbedding {
        RotaryEmbedding::new(head_dim, &RopeConfig::default(), &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn cross_attention_parameters() {
        let varmap = VarMap::new();
        let attn = create_test_cross(&varmap, &test_config(64, 4));

        assert_eq!(attn.num_heads(), 4);
        assert_eq!(attn.head_dim(), 16);
        assert!((attn.scale() - 0.25).abs() < 1e-12);
        assert_eq!(attn.kernel_name(), "manual");

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["attn.q.weight"].dims(), &[64, 64]);
        assert_eq!(data["attn.kv.weight"].dims(), &[128, 64]);
        assert_eq!(data["attn.proj.weight"].dims(), &[64, 64]);
        assert_eq!(data["attn.proj.bias"].dims(), &[64]);
        assert!(!data.contains_key("attn.q.bias"));
        assert!(!data.contains_key("attn.q_norm.weight"));
    }

    #[test]
    fn cross_attention_qkv_bias_and_norms() {
        let varmap = VarMap::new();
        let config = ModelConfig {
            qkv_bias: true,
            ..test_config(64, 4).with_qk_norm(QkNormKind::LayerNorm)
        };
        let _attn = create_test_cross(&varmap, &config);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["attn.q.bias"].dims(), &[64]);
        assert_eq!(data["attn.kv.bias"].dims(), &[128]);
        assert_eq!(data["attn.q_norm.weight"].dims(), &[16]);
        assert_eq!(data["attn.k_norm.bias"].dims(), &[16]);
    }

    #[test]
    fn cross_attention_indivisible_dim_fails() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let result = CrossAttention::new(&test_config(100, 8), vb);
        assert!(matches!(result, Err(RfwaveError::InvalidConfig(_))));
    }

    #[test]
    fn cross_attention_output_shape() {
        let varmap = VarMap::new();
        let attn = create_test_cross(&varmap, &test_config(64, 4));
        let rope = create_rope(16);

        // [batch=2, q_len=7, dim=64] attending to [batch=2, kv_len=11, dim=64]
        let q_x = Tensor::randn(0.0f32, 1.0, &[2, 7, 64], &Device::Cpu).unwrap();
        let kv_x = Tensor::randn(0.0f32, 1.0, &[2, 11, 64], &Device::Cpu).unwrap();
        let q_freqs = rope.sequential(2, 7).unwrap();
        let k_freqs = rope.sequential(2, 11).unwrap();
        let mask = score_mask(&Tensor::new(&[11u32, 6], &Device::Cpu).unwrap(), Some(11)).unwrap();

        let out = attn
            .forward(&q_x, &kv_x, Some(&q_freqs), Some(&k_freqs), Some(&mask))
            .unwrap();
        assert_eq!(out.dims(), &[2, 7, 64]);
    }

    #[test]
    fn cross_attention_without_rotary_or_mask() {
        let varmap = VarMap::new();
        let attn = create_test_cross(&varmap, &test_config(32, 2));
        let q_x = Tensor::randn(0.0f32, 1.0, &[1, 3, 32], &Device::Cpu).unwrap();
        let kv_x = Tensor::randn(0.0f32, 1.0, &[1, 9, 32], &Device::Cpu).unwrap();

        let out = attn.forward(&q_x, &kv_x, None, None, None).unwrap();
        assert_eq!(out.dims(), &[1, 3, 32]);
    }

    #[test]
    fn empty_key_sequence_returns_projection_bias() {
        let varmap = VarMap::new();
        let attn = create_test_cross(&varmap, &test_config(32, 2));
        let q_x = Tensor::randn(0.0f32, 1.0, &[1, 3, 32], &Device::Cpu).unwrap();
        let kv_x = Tensor::zeros(&[1, 0, 32], DType::F32, &Device::Cpu).unwrap();

        let out = attn.forward(&q_x, &kv_x, None, None, None).unwrap();
        assert_eq!(out.dims(), &[1, 3, 32]);

        let bias = varmap.data().lock().unwrap()["attn.proj.bias"].as_tensor().clone();
        let expected = bias.broadcast_as((1, 3, 32)).unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-6);
    }

    #[test]
    fn cross_attention_shape_errors() {
        let varmap = VarMap::new();
        let attn = create_test_cross(&varmap, &test_config(32, 2));

        let q_x = Tensor::zeros(&[2, 3, 32], DType::F32, &Device::Cpu).unwrap();
        let kv_other_batch = Tensor::zeros(&[1, 3, 32], DType::F32, &Device::Cpu).unwrap();
        let kv_other_dim = Tensor::zeros(&[2, 3, 16], DType::F32, &Device::Cpu).unwrap();

        assert!(matches!(
            attn.forward(&q_x, &kv_other_batch, None, None, None),
            Err(RfwaveError::ShapeMismatch(_))
        ));
        assert!(matches!(
            attn.forward(&q_x, &kv_other_dim, None, None, None),
            Err(RfwaveError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn self_attention_matches_cross_attention() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = test_config(64, 4).with_qk_norm(QkNormKind::RmsNorm);
        let cross = CrossAttention::new(&config, vb.pp("attn")).unwrap();
        // Same prefix, so the same variables
        let attn = Attention::new(&config, vb.pp("attn")).unwrap();

        let rope = create_rope(16);
        let x = Tensor::randn(0.0f32, 1.0, &[2, 9, 64], &Device::Cpu).unwrap();
        let freqs = rope.sequential(2, 9).unwrap();
        let mask = score_mask(&Tensor::new(&[9u32, 4], &Device::Cpu).unwrap(), Some(9)).unwrap();

        let a = attn.forward(&x, Some(&freqs), Some(&mask)).unwrap();
        let c = cross
            .forward(&x, &x, Some(&freqs), Some(&freqs), Some(&mask))
            .unwrap();
        assert!(max_abs_diff(&a, &c) < 1e-6);

        let wrapped = Attention::from_cross(cross);
        let w = wrapped.forward(&x, Some(&freqs), Some(&mask)).unwrap();
        assert!(max_abs_diff(&a, &w) < 1e-6);
    }

    #[test]
    fn masked_keys_do_not_affect_output() {
        let varmap = VarMap::new();
        let attn = create_test_cross(&varmap, &test_config(32, 4));

        let q_x = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &Device::Cpu).unwrap();
        let kv_x = Tensor::randn(0.0f32, 1.0, &[1, 6, 32], &Device::Cpu).unwrap();
        let mask = score_mask(&Tensor::new(&[4u32], &Device::Cpu).unwrap(), Some(6)).unwrap();

        let noise = Tensor::randn(0.0f32, 10.0, &[1, 2, 32], &Device::Cpu).unwrap();
        let kv_perturbed = Tensor::cat(&[&kv_x.narrow(1, 0, 4).unwrap(), &noise], 1).unwrap();

        let a = attn.forward(&q_x, &kv_x, None, None, Some(&mask)).unwrap();
        let b = attn.forward(&q_x, &kv_perturbed, None, None, Some(&mask)).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn shared_position_offset_cancels() {
        // Rotary attention only sees relative positions, so shifting every
        // query and key position by the same amount leaves the output alone.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = Attention::new(&test_config(32, 2), vb).unwrap();
        let rope = create_rope(16);
        let x = Tensor::randn(0.0f32, 1.0, &[2, 5, 32], &Device::Cpu).unwrap();

        let at = |start: i64| {
            let start = Tensor::new(&[start, start], &Device::Cpu).unwrap();
            let positions =
                get_pos_embed_indices(&start, 5, rope.max_positions(), PositionScale::default())
                    .unwrap();
            rope.gather(&positions).unwrap()
        };

        let a = attn.forward(&x, Some(&at(0)), None).unwrap();
        let b = attn.forward(&x, Some(&at(37)), None).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-4);
    }

    #[test]
    fn rotary_changes_cross_output() {
        let varmap = VarMap::new();
        let attn = create_test_cross(&varmap, &test_config(32, 2));
        let rope = create_rope(16);
        let q_x = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &Device::Cpu).unwrap();
        let kv_x = Tensor::randn(0.0f32, 1.0, &[1, 4, 32], &Device::Cpu).unwrap();

        let plain = attn.forward(&q_x, &kv_x, None, None, None).unwrap();
        let k_positions = Tensor::new(&[[3i64, 9, 27, 81]], &Device::Cpu).unwrap();
        let k_freqs = rope.gather(&k_positions).unwrap();
        let rotated = attn.forward(&q_x, &kv_x, None, Some(&k_freqs), None).unwrap();
        assert!(max_abs_diff(&plain, &rotated) > 1e-6);
    }

    #[test]
    fn inference_is_deterministic_training_is_not() {
        let varmap = VarMap::new();
        let config = test_config(32, 2).with_dropout(0.5, 0.5);
        let attn = create_test_cross(&varmap, &config);
        let x = Tensor::randn(0.0f32, 1.0, &[1, 16, 32], &Device::Cpu).unwrap();

        let a = attn.forward(&x, &x, None, None, None).unwrap();
        let b = attn.forward(&x, &x, None, None, None).unwrap();
        assert_eq!(max_abs_diff(&a, &b), 0.0);

        let t1 = attn.forward_t(&x, &x, None, None, None, true).unwrap();
        let t2 = attn.forward_t(&x, &x, None, None, None, true).unwrap();
        assert!(max_abs_diff(&t1, &t2) > 0.0);
    }

    #[test]
    fn explicit_kernel_override() {
        let varmap = VarMap::new();
        let config = ModelConfig::new(32, 2);
        let attn = create_test_cross(&varmap, &config).with_kernel(Arc::new(ManualKernel::new()));
        assert_eq!(attn.kernel_name(), "manual");
    }

    #[test]
    fn gradients_reach_projections() {
        let varmap = VarMap::new();
        let attn = create_test_cross(&varmap, &test_config(16, 2));
        let rope = create_rope(8);
        let x = Tensor::randn(0.0f32, 1.0, &[1, 3, 16], &Device::Cpu).unwrap();
        let freqs = rope.sequential(1, 3).unwrap();

        let out = attn.forward_t(&x, &x, Some(&freqs), Some(&freqs), None, true).unwrap();
        let grads = out.sqr().unwrap().sum_all().unwrap().backward().unwrap();

        let data = varmap.data().lock().unwrap();
        for name in ["attn.q.weight", "attn.kv.weight", "attn.proj.weight"] {
            let var: &Var = &data[name];
            let grad = grads.get(var.as_tensor()).expect(name);
            assert_eq!(grad.dims(), var.dims());
        }
    }
}
