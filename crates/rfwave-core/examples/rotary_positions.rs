//! Rotary position embeddings and position indices.
//!
//! Prints per-batch position indices for a few start offsets and scales and
//! shows that rotary attention scores depend only on relative position.
//!
//! Run with:
//! ```bash
//! cargo run -p rfwave-core --example rotary_positions
//! ```

use candle_core::{DType, Device, Tensor};
use rfwave_core::model::{
    apply_rotary_emb, get_pos_embed_indices, length_or_full, start_or_zeros, PositionScale,
    RopeConfig, RotaryEmbedding,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let device = Device::Cpu;
    let config = RopeConfig {
        max_positions: 64,
        ..RopeConfig::default()
    };
    let rope = RotaryEmbedding::new(8, &config, &device)?;

    println!("Rotary Positions Example");
    println!("========================\n");

    // Channel-first features with no explicit start or length
    let features = Tensor::zeros(&[3, 16, 10], DType::F32, &device)?;
    let start = start_or_zeros(&features, None)?;
    let length = length_or_full(&features, None)?;
    println!("default start: {:?}", start.to_vec1::<i64>()?);
    println!("default length: {:?}\n", length.to_vec1::<i64>()?);

    let start = Tensor::new(&[0i64, 5, 60], &device)?;
    let uniform = get_pos_embed_indices(&start, 6, rope.max_positions(), PositionScale::default())?;
    println!("uniform positions (last row clamps at {}):", rope.max_positions() - 1);
    for row in uniform.to_vec2::<i64>()? {
        println!("  {:?}", row);
    }

    let scales = Tensor::new(&[0.5f32, 1.0, 2.5], &device)?;
    let scaled = get_pos_embed_indices(
        &Tensor::zeros(3, DType::I64, &device)?,
        6,
        rope.max_positions(),
        PositionScale::PerBatch(&scales),
    )?;
    println!("\nscaled positions:");
    for row in scaled.to_vec2::<i64>()? {
        println!("  {:?}", row);
    }

    // q.k after rotation depends on the position gap only
    let q = Tensor::randn(0.0f32, 1.0, &[1, 1, 1, 8], &device)?;
    let k = Tensor::randn(0.0f32, 1.0, &[1, 1, 1, 8], &device)?;
    println!("\nscore for a gap of 3:");
    for base in [0i64, 10, 40] {
        let q_pos = rope.gather(&Tensor::new(&[[base + 3]], &device)?)?;
        let k_pos = rope.gather(&Tensor::new(&[[base]], &device)?)?;
        let q_rot = apply_rotary_emb(&q, Some(&q_pos))?;
        let k_rot = apply_rotary_emb(&k, Some(&k_pos))?;
        let score: f32 = (q_rot * k_rot)?.sum_all()?.to_scalar()?;
        println!("  positions ({:>2}, {:>2}): {:.5}", base + 3, base, score);
    }

    Ok(())
}
