//! Cross attention between audio frames and phoneme tokens.
//!
//! Frames attend to a shorter, padded token sequence. Token positions are
//! stretched onto the frame axis so that both sides share one rotary
//! coordinate system, and padded tokens are masked out.
//!
//! Run with:
//! ```bash
//! cargo run -p rfwave-core --example cross_attention [-- config.json]
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rfwave_core::model::{
    get_pos_embed_indices, score_mask, Attention, CrossAttention, FeedForward, ModelConfig,
    PositionScale, QkNormKind, RmsNorm, RotaryEmbedding,
};
use std::path::Path;
use std::time::Instant;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ModelConfig::from_file(Path::new(&path))?,
        None => ModelConfig::new(256, 4).with_qk_norm(QkNormKind::RmsNorm),
    };

    #[cfg(feature = "cuda")]
    let device = Device::new_cuda(0)?;
    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;

    println!("Cross Attention Example");
    println!("=======================\n");
    println!(
        "dim={} heads={} head_dim={} qk_norm={}",
        config.dim,
        config.num_heads,
        config.head_dim(),
        config.qk_norm
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let norm = RmsNorm::load(config.dim, config.norm_eps, vb.pp("norm"))?;
    let self_attn = Attention::new(&config, vb.pp("self_attn"))?;
    let cross_attn = CrossAttention::new(&config, vb.pp("cross_attn"))?;
    let ffn = FeedForward::from_config(&config, vb.pp("ffn"))?;
    let rope_config = config.rope.clone().unwrap_or_default();
    let rope = RotaryEmbedding::new(config.head_dim(), &rope_config, &device)?;
    println!("kernel: {}", cross_attn.kernel_name());

    // Two utterances: 240 and 180 frames, 40 and 25 phoneme tokens
    let frames = 240usize;
    let tokens = 40usize;
    let frame_lengths = Tensor::new(&[240u32, 180], &device)?;
    let token_lengths = Tensor::new(&[40u32, 25], &device)?;

    let audio = Tensor::randn(0.0f32, 1.0, &[2, frames, config.dim], &device)?;
    let phonemes = Tensor::randn(0.0f32, 1.0, &[2, tokens, config.dim], &device)?;

    // Frame positions are 0..frames; token j sits at trunc(j * frames_i / tokens_i)
    let starts = Tensor::zeros(2, DType::I64, &device)?;
    let frame_pos = get_pos_embed_indices(
        &starts,
        frames,
        rope.max_positions(),
        PositionScale::default(),
    )?;
    let stretch = (frame_lengths.to_dtype(DType::F32)? / token_lengths.to_dtype(DType::F32)?)?;
    let token_pos = get_pos_embed_indices(
        &starts,
        tokens,
        rope.max_positions(),
        PositionScale::PerBatch(&stretch),
    )?;
    let q_freqs = rope.gather(&frame_pos)?;
    let k_freqs = rope.gather(&token_pos)?;

    let frame_mask = score_mask(&frame_lengths, Some(frames))?;
    let token_mask = score_mask(&token_lengths, Some(tokens))?;

    let start = Instant::now();
    let attended = self_attn.forward(&norm.forward(&audio)?, Some(&q_freqs), Some(&frame_mask))?;
    let h = (&audio + attended)?;
    let attended = cross_attn.forward(
        &norm.forward(&h)?,
        &phonemes,
        Some(&q_freqs),
        Some(&k_freqs),
        Some(&token_mask),
    )?;
    let h = (&h + attended)?;
    let h = (&h + ffn.forward(&norm.forward(&h)?)?)?;
    let elapsed = start.elapsed();

    println!("\noutput: {:?}", h.dims());
    println!("elapsed: {:.2?}", elapsed);
    let rms: f32 = h.sqr()?.mean_all()?.sqrt()?.to_scalar()?;
    println!("output rms: {:.4}", rms);

    Ok(())
}
