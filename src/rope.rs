//! 2D Rotary Position Embeddings with resolution extrapolation.
//!
//! Lumina-Next encodes token positions on a 2D latent grid with rotary
//! embeddings, half of the head dimension per spatial axis. Two scaling
//! knobs extend the embedding beyond the training resolution:
//!
//! - **`linear_factor`** compresses the positional index range: positions are
//!   effectively divided by the factor, interpolating between trained
//!   positions.
//! - **`ntk_factor`** stretches frequency wavelengths by raising the base
//!   frequency, `theta' = theta * ntk_factor^(dim / (dim - 2))`, trading
//!   interpolation error for extrapolation error (NTK-aware scaling).
//!
//! The caller activates exactly one of the two per evaluation, depending on
//! where the current sampling time sits relative to the scaling watershed
//! (see [`crate::scaling`]). Because the active factor changes over the
//! course of a sampling run, these embeddings MUST be regenerated at every
//! integration step; caching them across steps produces wrong results.
//!
//! # Complex Number Representation
//!
//! Candle has no native complex dtype, so frequencies are packed as tensors
//! of shape `[..., 2]` with `[cos, sin]` in the last axis, and rotation is
//! plain complex multiplication: `(a + bi)(c + di) = (ac - bd) + (ad + bc)i`.

use candle::{Device, IndexOp, Tensor, D};

use crate::error::{Error, Result};

/// Base rotary frequency used by Lumina-Next.
const ROPE_THETA: f64 = 10_000.0;

/// Rotary frequencies for a single axis.
///
/// Builds the inverse-frequency vector `1 / theta'^(2i/dim)` for
/// `i in 0..dim/2`, compresses the index range by `1/linear_factor`, and
/// returns `[num_positions, dim/2, 2]` with `[cos, sin]` in the last axis.
///
/// With `linear_factor = ntk_factor = 1.0` this is the classic unscaled
/// rotary embedding.
pub fn get_1d_rotary_pos_embed(
    dim: usize,
    num_positions: usize,
    linear_factor: f64,
    ntk_factor: f64,
    device: &Device,
) -> Result<Tensor> {
    if dim < 4 || !dim.is_multiple_of(2) {
        return Err(Error::config(
            "dim",
            format!("rotary dimension must be an even value >= 4, got {dim}"),
        ));
    }
    if num_positions == 0 {
        return Err(Error::config("num_positions", "must be positive"));
    }
    if linear_factor <= 0.0 || ntk_factor <= 0.0 {
        return Err(Error::config(
            "scaling factors",
            format!("must be positive, got linear={linear_factor}, ntk={ntk_factor}"),
        ));
    }

    // NTK-aware base adjustment: theta' = theta * ntk^(dim / (dim - 2)).
    let theta = ROPE_THETA * ntk_factor.powf(dim as f64 / (dim as f64 - 2.0));

    // Dividing the frequencies by linear_factor is the same outer product as
    // scaling the index range by 1/linear_factor.
    let inv_freq: Vec<f32> = (0..dim / 2)
        .map(|i| (1.0 / (theta.powf(2.0 * i as f64 / dim as f64) * linear_factor)) as f32)
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, dim / 2), device)?;

    let index: Vec<f32> = (0..num_positions).map(|i| i as f32).collect();
    let index = Tensor::from_vec(index, (num_positions, 1), device)?;

    // freqs = outer(index, inv_freq)
    let freqs = index.broadcast_mul(&inv_freq)?; // [num_positions, dim/2]

    // polar(1, freqs) -> (cos(freqs), sin(freqs))
    Ok(Tensor::stack(&[freqs.cos()?, freqs.sin()?], D::Minus1)?)
}

/// Rotary frequencies for a 2D token grid.
///
/// `head_dim` is split evenly across the two spatial axes, each half again
/// split into cos/sin pairs, hence the divisibility-by-4 requirement. The
/// height and width are in latent tokens, not pixels.
///
/// Returns `[height_tokens * width_tokens, head_dim/2, 2]`, rows in row-major
/// grid order, matching the layout the attention layers consume.
pub fn get_2d_rotary_pos_embed(
    head_dim: usize,
    height_tokens: usize,
    width_tokens: usize,
    linear_factor: f64,
    ntk_factor: f64,
    device: &Device,
) -> Result<Tensor> {
    if head_dim < 8 || !head_dim.is_multiple_of(4) {
        return Err(Error::config(
            "head_dim",
            format!(
                "must split evenly across 2 spatial axes of cos/sin pairs \
                 (a multiple of 4, at least 8), got {head_dim}"
            ),
        ));
    }
    if height_tokens == 0 || width_tokens == 0 {
        return Err(Error::config(
            "token grid",
            format!("dimensions must be positive, got {height_tokens}x{width_tokens}"),
        ));
    }

    let axis_dim = head_dim / 2;
    let quarter = head_dim / 4;

    let emb_h = get_1d_rotary_pos_embed(axis_dim, height_tokens, linear_factor, ntk_factor, device)?;
    let emb_w = get_1d_rotary_pos_embed(axis_dim, width_tokens, linear_factor, ntk_factor, device)?;

    // Broadcast each axis over the grid: [h, w, head_dim/4, 2].
    let emb_h = emb_h
        .reshape((height_tokens, 1, quarter, 2))?
        .broadcast_as((height_tokens, width_tokens, quarter, 2))?;
    let emb_w = emb_w
        .reshape((1, width_tokens, quarter, 2))?
        .broadcast_as((height_tokens, width_tokens, quarter, 2))?;

    // Concatenate along the frequency axis and flatten the grid.
    let emb = Tensor::cat(&[emb_h, emb_w], 2)?;
    Ok(emb
        .reshape((height_tokens * width_tokens, axis_dim, 2))?
        .contiguous()?)
}

/// Apply rotary embeddings to query/key activations.
///
/// # Arguments
/// * `x` - Input of shape `[batch, seq, heads, head_dim]`
/// * `freqs_cis` - Frequencies of shape `[seq, head_dim/2, 2]`
///
/// # Returns
/// Rotated tensor of the same shape as `x`.
pub fn apply_rotary_emb(x: &Tensor, freqs_cis: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len, n_heads, head_dim) = x.dims4()?;

    // View the head dimension as complex pairs.
    let x_pairs = x.reshape((b_sz, seq_len, n_heads, head_dim / 2, 2))?;
    let x_real = x_pairs.i((.., .., .., .., 0))?;
    let x_imag = x_pairs.i((.., .., .., .., 1))?;

    // Broadcast the frequencies over batch and heads: [1, seq, 1, head_dim/2].
    let cos = freqs_cis.i((.., .., 0))?.unsqueeze(0)?.unsqueeze(2)?;
    let sin = freqs_cis.i((.., .., 1))?.unsqueeze(0)?.unsqueeze(2)?;

    let out_real = (x_real.broadcast_mul(&cos)? - x_imag.broadcast_mul(&sin)?)?;
    let out_imag = (x_real.broadcast_mul(&sin)? + x_imag.broadcast_mul(&cos)?)?;

    let out = Tensor::stack(&[&out_real, &out_imag], D::Minus1)?;
    Ok(out.reshape((b_sz, seq_len, n_heads, head_dim))?)
}
