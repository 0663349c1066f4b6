//! Tensor aliases and shape helpers shared across the engine.
//!
//! Images are NCHW `f32` arrays with values in `[0, 1]`; latents are NCHW with
//! [`LATENT_CHANNELS`] channels at 1/[`LATENT_DOWNSCALE`] of the pixel resolution.

use ndarray::Array4;

use crate::error::{CcsrError, Result};

/// Image batch `[batch, channels, height, width]`, values in `[0, 1]`.
pub type ImageTensor = Array4<f32>;

/// Latent batch `[batch, LATENT_CHANNELS, height / 8, width / 8]`.
pub type LatentTensor = Array4<f32>;

pub const LATENT_CHANNELS: usize = 4;

/// Spatial reduction factor between pixel space and latent space.
pub const LATENT_DOWNSCALE: usize = 8;

/// Working resolutions are floored to this granularity before sampling.
pub const WORKING_ALIGN: usize = 64;

/// Latent spatial size for a pixel size; both sides must be multiples of 8.
pub fn latent_dims(height: usize, width: usize) -> Result<(usize, usize)> {
    if height == 0
        || width == 0
        || height % LATENT_DOWNSCALE != 0
        || width % LATENT_DOWNSCALE != 0
    {
        return Err(CcsrError::shape_mismatch(
            "latent dims (pixel size must be a non-zero multiple of 8)",
            &[
                height.div_ceil(LATENT_DOWNSCALE).max(1) * LATENT_DOWNSCALE,
                width.div_ceil(LATENT_DOWNSCALE).max(1) * LATENT_DOWNSCALE,
            ],
            &[height, width],
        ));
    }
    Ok((height / LATENT_DOWNSCALE, width / LATENT_DOWNSCALE))
}

/// Floors a dimension to the working granularity.
pub fn floor_to_working(dim: usize) -> usize {
    dim / WORKING_ALIGN * WORKING_ALIGN
}
