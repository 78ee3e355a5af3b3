//! Adaptive affine modulation used by conditioned transformer blocks.

use crate::error::{Result, RfwaveError};
use candle_core::Tensor;

/// `x * (1 + scale) + shift`, broadcasting per-batch conditioning over time.
///
/// * `x` - `[batch, seq, dim]`
/// * `shift`, `scale` - `[batch, dim]`
pub fn modulate(x: &Tensor, shift: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let (batch, _, dim) = x.dims3()?;
    for (name, t) in [("shift", shift), ("scale", scale)] {
        if t.dims() != [batch, dim] {
            return Err(RfwaveError::shape(format!(
                "{name} {:?} does not match input {:?}",
                t.dims(),
                x.dims()
            )));
        }
    }
    let gain = (scale.unsqueeze(1)? + 1.0)?;
    Ok(x.broadcast_mul(&gain)?.broadcast_add(&shift.unsqueeze(1)?)?)
}
