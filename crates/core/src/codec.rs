//! Image ↔ latent conversion through the model's VAE, optionally tile-wise.
//!
//! Tiled encode/decode is a single weighted stitch: each tile goes through the
//! VAE once and the outputs are blended with Gaussian weights, which bounds peak
//! memory by the tile size instead of the image size.

use ndarray::{Array4, ArrayView4, Zip};
use tracing::debug;

use crate::error::{ensure_shape, CcsrError, Result};
use crate::tiling::{plan_tiles, BlendAccumulator, BlendMode, Tile, WeightCache};
use crate::types::{latent_dims, ImageTensor, LatentTensor, LATENT_CHANNELS, LATENT_DOWNSCALE};

/// Scale between the VAE's latent distribution and the diffusion latent space.
pub const LATENT_SCALE_FACTOR: f32 = 0.18215;

/// The model's autoencoder. Works on unscaled latents and `[-1, 1]` images.
pub trait VaeModel: Send + Sync {
    /// `[B, 3, H, W]` → `[B, 4, H/8, W/8]`.
    fn encode(&self, image: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;

    /// `[B, 4, h, w]` → `[B, 3, 8h, 8w]`.
    fn decode(&self, latent: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;
}

/// Tile sizes for the codec, in pixels. `None` runs full-frame passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CodecTiling {
    pub encoder_tile: Option<usize>,
    pub decoder_tile: Option<usize>,
}

impl CodecTiling {
    pub fn full_frame() -> Self {
        Self::default()
    }

    pub fn tiled(encoder_tile: usize, decoder_tile: usize) -> Self {
        Self {
            encoder_tile: Some(encoder_tile),
            decoder_tile: Some(decoder_tile),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, size) in [("encoder", self.encoder_tile), ("decoder", self.decoder_tile)] {
            if matches!(size, Some(px) if px < LATENT_DOWNSCALE) {
                return Err(CcsrError::InvalidTileConfig(format!(
                    "{name} tile must be at least {LATENT_DOWNSCALE} pixels"
                )));
            }
        }
        Ok(())
    }
}

/// Codec tile and stride for a pixel tile size, overlapping by a quarter tile.
/// Both are whole latent cells, multiplied by `granularity` (8 for pixel space).
fn codec_grid(tile_px: usize, granularity: usize) -> (usize, usize) {
    let tile = (tile_px / LATENT_DOWNSCALE).max(1);
    let stride = (tile * 3 / 4).max(1);
    (tile * granularity, stride * granularity)
}

pub struct TiledCodec<'a> {
    vae: &'a dyn VaeModel,
    tiling: CodecTiling,
}

impl<'a> TiledCodec<'a> {
    pub fn new(vae: &'a dyn VaeModel, tiling: CodecTiling) -> Self {
        Self { vae, tiling }
    }

    /// `[B, 3, H, W]` image in `[0, 1]` → scaled latent `[B, 4, H/8, W/8]`.
    pub fn encode(&self, image: ArrayView4<'_, f32>) -> Result<LatentTensor> {
        let (batch, _, height, width) = image.dim();
        let (lh, lw) = latent_dims(height, width)?;
        let expected = [batch, LATENT_CHANNELS, lh, lw];
        let input = image.mapv(|v| 2.0 * v - 1.0);

        let tiles = match self.tiling.encoder_tile {
            Some(px) => {
                let (tile, stride) = codec_grid(px, LATENT_DOWNSCALE);
                plan_tiles(height, width, tile, stride)?
            }
            None => vec![Tile::full(height, width)],
        };

        let mut latent = if tiles.len() == 1 {
            let out = self.vae.encode(input.view()).map_err(CcsrError::from_model)?;
            ensure_shape("vae encode output", &expected, out.shape())?;
            out
        } else {
            debug!(tiles = tiles.len(), height, width, "Tiled VAE encode");
            let mut weights = WeightCache::new(BlendMode::Gaussian);
            let mut acc = BlendAccumulator::new(batch, LATENT_CHANNELS, lh, lw);
            for tile in &tiles {
                let out = self
                    .vae
                    .encode(tile.view(&input))
                    .map_err(CcsrError::from_model)?;
                let target = Tile::new(
                    tile.x / LATENT_DOWNSCALE,
                    tile.y / LATENT_DOWNSCALE,
                    tile.width / LATENT_DOWNSCALE,
                    tile.height / LATENT_DOWNSCALE,
                );
                ensure_shape(
                    "vae encode tile output",
                    &[batch, LATENT_CHANNELS, target.height, target.width],
                    out.shape(),
                )?;
                acc.add(&target, out.view(), &weights.for_tile(&target))?;
            }
            acc.finish()?
        };

        latent.mapv_inplace(|v| v * LATENT_SCALE_FACTOR);
        Ok(latent)
    }

    /// Scaled latent `[B, 4, h, w]` → image `[B, 3, 8h, 8w]` clamped to `[0, 1]`.
    pub fn decode(&self, latent: ArrayView4<'_, f32>) -> Result<ImageTensor> {
        let (batch, channels, lh, lw) = latent.dim();
        if channels != LATENT_CHANNELS || lh == 0 || lw == 0 {
            return Err(CcsrError::shape_mismatch(
                "decode input latent",
                &[batch, LATENT_CHANNELS, lh.max(1), lw.max(1)],
                latent.shape(),
            ));
        }
        let (height, width) = (lh * LATENT_DOWNSCALE, lw * LATENT_DOWNSCALE);
        let expected = [batch, 3, height, width];
        let input = latent.mapv(|v| v / LATENT_SCALE_FACTOR);

        let tiles = match self.tiling.decoder_tile {
            Some(px) => {
                let (tile, stride) = codec_grid(px, 1);
                plan_tiles(lh, lw, tile, stride)?
            }
            None => vec![Tile::full(lh, lw)],
        };

        let mut image = if tiles.len() == 1 {
            let out = self.vae.decode(input.view()).map_err(CcsrError::from_model)?;
            ensure_shape("vae decode output", &expected, out.shape())?;
            out
        } else {
            debug!(tiles = tiles.len(), height, width, "Tiled VAE decode");
            let mut weights = WeightCache::new(BlendMode::Gaussian);
            let mut acc = BlendAccumulator::new(batch, 3, height, width);
            for tile in &tiles {
                let out = self
                    .vae
                    .decode(tile.view(&input))
                    .map_err(CcsrError::from_model)?;
                let target = tile.scaled(LATENT_DOWNSCALE);
                ensure_shape(
                    "vae decode tile output",
                    &[batch, 3, target.height, target.width],
                    out.shape(),
                )?;
                acc.add(&target, out.view(), &weights.for_tile(&target))?;
            }
            acc.finish()?
        };

        Zip::from(&mut image).for_each(|v| *v = ((*v + 1.0) / 2.0).clamp(0.0, 1.0));
        Ok(image)
    }
}
