//! Sequence masks, additive attention masks and position indices.
//!
//! Additive masks hold exactly `0.0` (attend) or `-inf` (suppress) and are
//! shaped `[batch, 1, 1, len]` so they broadcast over heads and query
//! positions when added to `[batch, heads, q_len, kv_len]` scores.

use crate::error::{Result, RfwaveError};
use candle_core::{DType, Tensor};

/// Step size for [`get_pos_embed_indices`].
#[derive(Debug, Clone, Copy)]
pub enum PositionScale<'a> {
    /// Same step for every batch entry.
    Uniform(f32),
    /// One step per batch entry, shape `[batch]`.
    PerBatch(&'a Tensor),
}

impl Default for PositionScale<'_> {
    fn default() -> Self {
        Self::Uniform(1.0)
    }
}

/// Boolean `[batch, max_length]` mask, `1` where `j < lengths[i]`.
///
/// `max_length` defaults to the longest entry of `lengths`.
pub fn sequence_mask(lengths: &Tensor, max_length: Option<usize>) -> Result<Tensor> {
    let lengths = lengths.to_dtype(DType::I64)?;
    let batch = lengths.dims1()?;
    let max_length = match max_length {
        Some(len) => len,
        None if batch == 0 => 0,
        None => lengths.max(0)?.to_scalar::<i64>()?.max(0) as usize,
    };

    let steps = Tensor::arange(0i64, max_length as i64, lengths.device())?;
    Ok(steps.unsqueeze(0)?.broadcast_lt(&lengths.unsqueeze(1)?)?)
}

/// Additive `[batch, 1, 1, max_length]` mask with `-inf` past each length.
pub fn score_mask(lengths: &Tensor, max_length: Option<usize>) -> Result<Tensor> {
    let valid = sequence_mask(lengths, max_length)?;
    additive(&valid, false)
}

/// Additive `[batch, 1, 1, len]` mask from a `[batch, len]` padding mask.
///
/// Nonzero entries of `padding` are the positions to suppress.
pub fn score_mask_from_bool_mask(padding: &Tensor) -> Result<Tensor> {
    padding.dims2()?;
    let masked = padding.ne(&padding.zeros_like()?)?;
    additive(&masked, true)
}

/// `0` / `-inf` from a u8 condition; `suppress_when_set` picks which side is `-inf`.
fn additive(cond: &Tensor, suppress_when_set: bool) -> Result<Tensor> {
    let device = cond.device();
    let zeros = Tensor::zeros(cond.dims(), DType::F32, device)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, cond.dims(), device)?;

    let mask = if suppress_when_set {
        cond.where_cond(&neg_inf, &zeros)?
    } else {
        cond.where_cond(&zeros, &neg_inf)?
    };
    Ok(mask.unsqueeze(1)?.unsqueeze(2)?)
}

/// Per-batch `[batch, length]` integer positions for embedding lookups.
///
/// Row `i` is `start[i] + trunc(j * scale[i])` for `j in 0..length`. Any
/// index at or beyond `max_pos` is replaced by `max_pos - 1` so lookups never
/// run off the end of a `max_pos`-row table.
pub fn get_pos_embed_indices(
    start: &Tensor,
    length: usize,
    max_pos: usize,
    scale: PositionScale<'_>,
) -> Result<Tensor> {
    if max_pos == 0 {
        return Err(RfwaveError::config("max_pos must be positive"));
    }
    let start = start.to_dtype(DType::I64)?;
    let batch = start.dims1()?;
    let device = start.device();

    let scale = match scale {
        PositionScale::Uniform(step) => Tensor::full(step, batch, device)?,
        PositionScale::PerBatch(steps) => {
            if steps.dims1()? != batch {
                return Err(RfwaveError::shape(format!(
                    "{} position scales for a batch of {}",
                    steps.dims1()?,
                    batch
                )));
            }
            steps.to_dtype(DType::F32)?
        }
    };

    let steps = Tensor::arange(0u32, length as u32, device)?.to_dtype(DType::F32)?;
    let offsets = steps
        .unsqueeze(0)?
        .broadcast_mul(&scale.unsqueeze(1)?)?
        .to_dtype(DType::I64)?;
    let pos = start.unsqueeze(1)?.broadcast_add(&offsets)?;

    let cap = Tensor::full(max_pos as i64 - 1, pos.dims(), device)?;
    Ok(pos.minimum(&cap)?)
}

/// `start`, or zeros when absent, for a channel-first `[batch, channels, time]` input.
pub fn start_or_zeros(x: &Tensor, start: Option<&Tensor>) -> Result<Tensor> {
    match start {
        Some(start) => Ok(start.clone()),
        None => Ok(Tensor::zeros(x.dim(0)?, DType::I64, x.device())?),
    }
}

/// `length`, or the full time axis of a `[batch, channels, time]` input when absent.
pub fn length_or_full(x: &Tensor, length: Option<&Tensor>) -> Result<Tensor> {
    match length {
        Some(length) => Ok(length.clone()),
        None => {
            let (batch, _, time) = x.dims3()?;
            Ok(Tensor::full(time as i64, batch, x.device())?)
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;

    proptest! {
        /// Invariant: additive masks contain only 0 and -inf, matching the lengths
        #[test]
        fn invariant_score_mask_values(
            lengths in prop::collection::vec(0u32..20, 1..6),
            extra in 0usize..5,
        ) {
            let max_len = *lengths.iter().max().unwrap() as usize + extra;
            let t = Tensor::new(lengths.as_slice(), &Device::Cpu).unwrap();
            let mask: Vec<Vec<f32>> = score_mask(&t, Some(max_len)).unwrap()
                .reshape((lengths.len(), max_len)).unwrap()
                .to_vec2().unwrap();

            for (row, &len) in mask.iter().zip(&lengths) {
                for (j, v) in row.iter().enumerate() {
                    if j < len as usize {
                        prop_assert_eq!(*v, 0.0);
                    } else {
                        prop_assert_eq!(*v, f32::NEG_INFINITY);
                    }
                }
            }
        }

        /// Invariant: position indices never reach max_pos
        #[test]
        fn invariant_pos_indices_below_max(
            starts in prop::collection::vec(0i64..50, 1..4),
            length in 1usize..40,
            max_pos in 1usize..64,
            step in 0.0f32..4.0,
        ) {
            let start = Tensor::new(starts.as_slice(), &Device::Cpu).unwrap();
            let scale = PositionScale::Uniform(step);
            let pos = get_pos_embed_indices(&start, length, max_pos, scale).unwrap();
            let rows: Vec<Vec<i64>> = pos.to_vec2().unwrap();
            for row in rows {
                prop_assert_eq!(row.len(), length);
                prop_assert!(row.iter().all(|&p| p < max_pos as i64));
                // non-decreasing for non-negative steps
                prop_assert!(row.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }
}
