//! The run step: resize → per-image encode / sample / decode / color fix →
//! resize back.
//!
//! A run borrows a [`ModelHandle`] exclusively for its whole duration. Images
//! of a batch are processed sequentially and the observer is polled for
//! cancellation between them, never inside one.

use std::time::Instant;

use ndarray::{s, Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::{CodecTiling, TiledCodec};
use crate::color::{apply_color_fix, ColorCorrector, ColorFixMode};
use crate::error::{ensure_shape, CcsrError, Result};
use crate::model::{CcsrModel, ModelHandle};
use crate::observer::RunObserver;
use crate::resample::{scaled_dims, CpuResampler, ResampleKernel, Resampler};
use crate::sampler::{SamplerConfig, SamplingStrategy, TileConfig, TiledSampler};
use crate::types::{floor_to_working, ImageTensor, WORKING_ALIGN};

/// Every knob of one upscale run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleParams {
    pub resize_method: ResampleKernel,
    pub scale_by: f64,
    pub steps: usize,
    pub t_max: f64,
    pub t_min: f64,
    pub sampling_method: SamplingStrategy,
    /// Sampler tile, pixels.
    pub tile_size: usize,
    pub tile_stride: usize,
    /// Codec tiles, pixels; only used by `ccsr_tiled_vae_gaussian_weights`.
    pub vae_tile_size_encode: usize,
    pub vae_tile_size_decode: usize,
    pub color_fix: ColorFixMode,
    pub keep_model_loaded: bool,
    pub seed: u64,
    pub guidance_scale: f32,
}

impl Default for UpscaleParams {
    fn default() -> Self {
        Self {
            resize_method: ResampleKernel::Lanczos,
            scale_by: 1.0,
            steps: 45,
            t_max: 0.6667,
            t_min: 0.3333,
            sampling_method: SamplingStrategy::CcsrTiledMixdiff,
            tile_size: 512,
            tile_stride: 256,
            vae_tile_size_encode: 1024,
            vae_tile_size_decode: 1024,
            color_fix: ColorFixMode::Adain,
            keep_model_loaded: false,
            seed: 123,
            guidance_scale: 1.0,
        }
    }
}

impl UpscaleParams {
    pub fn to_sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            strategy: self.sampling_method,
            tile: TileConfig {
                tile_size: self.tile_size,
                tile_stride: self.tile_stride,
            },
            steps: self.steps,
            t_min: self.t_min,
            t_max: self.t_max,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
        }
    }

    pub fn codec_tiling(&self) -> CodecTiling {
        if self.sampling_method.tiles_codec() {
            CodecTiling::tiled(self.vae_tile_size_encode, self.vae_tile_size_decode)
        } else {
            CodecTiling::full_frame()
        }
    }

    /// Fails fast on anything that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<()> {
        if !self.scale_by.is_finite() || self.scale_by <= 0.0 {
            return Err(CcsrError::InvalidParameter(format!(
                "scale_by must be a positive number, got {}",
                self.scale_by
            )));
        }
        self.codec_tiling().validate()?;
        self.to_sampler_config().validate()
    }
}

/// Services the pipeline borrows for one run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub resampler: &'a dyn Resampler,
    pub color: Option<&'a dyn ColorCorrector>,
}

impl Default for Collaborators<'static> {
    fn default() -> Self {
        Self {
            resampler: &CpuResampler,
            color: None,
        }
    }
}

#[derive(Debug)]
pub struct UpscaleOutput {
    /// Completed images, `[completed, 3, H, W]`.
    pub images: ImageTensor,
    pub completed: usize,
    pub total: usize,
    pub interrupted: bool,
}

impl UpscaleOutput {
    /// The full batch, or `Interrupted` when the run stopped early.
    pub fn into_complete(self) -> Result<ImageTensor> {
        if self.interrupted {
            return Err(CcsrError::Interrupted {
                completed: self.completed,
                total: self.total,
            });
        }
        Ok(self.images)
    }
}

/// Runs CCSR over an NCHW batch in `[0, 1]`.
///
/// The batch is scaled by `scale_by`, floored to multiples of 64 for
/// sampling, and the result is resized with Lanczos to the sampled height
/// and the scaled aspect ratio. Weights are released afterwards unless
/// `keep_model_loaded` is set, also when the run fails.
pub fn upscale(
    handle: &ModelHandle,
    images: ArrayView4<'_, f32>,
    params: &UpscaleParams,
    collaborators: &Collaborators<'_>,
    observer: &dyn RunObserver,
) -> Result<UpscaleOutput> {
    params.validate()?;
    let (batch, channels, in_h, in_w) = images.dim();
    if batch == 0 || channels != 3 || in_h == 0 || in_w == 0 {
        return Err(CcsrError::shape_mismatch(
            "input batch",
            &[batch.max(1), 3, in_h.max(1), in_w.max(1)],
            images.shape(),
        ));
    }

    let (scaled_h, scaled_w) = scaled_dims(in_h, in_w, params.scale_by);
    let (work_h, work_w) = (floor_to_working(scaled_h), floor_to_working(scaled_w));
    if work_h == 0 || work_w == 0 {
        return Err(CcsrError::InvalidParameter(format!(
            "scaled size {scaled_h}x{scaled_w} is below the {WORKING_ALIGN}px working minimum"
        )));
    }

    let scaled = resize(collaborators.resampler, images, scaled_h, scaled_w, params.resize_method)?;
    let working = resize(collaborators.resampler, scaled.view(), work_h, work_w, ResampleKernel::Bilinear)?;
    info!(
        batch,
        input = %format!("{in_h}x{in_w}"),
        scaled = %format!("{scaled_h}x{scaled_w}"),
        working = %format!("{work_h}x{work_w}"),
        strategy = %params.sampling_method,
        "Starting CCSR run"
    );

    let guard = handle.lock()?;
    let result = guard
        .model()
        .and_then(|model| sample_batch(model, working.view(), params, collaborators, observer));
    if params.keep_model_loaded {
        drop(guard);
    } else {
        guard.release();
        debug!("Model weights released after run");
    }
    let (samples, interrupted) = result?;
    let completed = samples.dim().0;

    // Aspect of the scaled input at the sampled height.
    let target_w = ((work_h as f64 * scaled_w as f64 / scaled_h as f64) as usize).max(1);
    let images = resize(collaborators.resampler, samples.view(), work_h, target_w, ResampleKernel::Lanczos)?;

    Ok(UpscaleOutput {
        images,
        completed,
        total: batch,
        interrupted,
    })
}

fn resize(
    resampler: &dyn Resampler,
    image: ArrayView4<'_, f32>,
    height: usize,
    width: usize,
    kernel: ResampleKernel,
) -> Result<Array4<f32>> {
    let (_, _, h, w) = image.dim();
    if (h, w) == (height, width) {
        return Ok(image.to_owned());
    }
    let out = resampler
        .resize(image, height, width, kernel)
        .map_err(CcsrError::from_model)?;
    let expected = [image.dim().0, image.dim().1, height, width];
    ensure_shape("resampler output", &expected, out.shape())?;
    Ok(out)
}

fn sample_batch(
    model: &CcsrModel,
    working: ArrayView4<'_, f32>,
    params: &UpscaleParams,
    collaborators: &Collaborators<'_>,
    observer: &dyn RunObserver,
) -> Result<(ImageTensor, bool)> {
    let (batch, channels, height, width) = working.dim();
    let codec = TiledCodec::new(model.vae.as_ref(), params.codec_tiling());
    let mut sampler = TiledSampler::new(params.to_sampler_config(), model.denoiser.as_ref(), &model.conditioning);

    let mut out = Array4::zeros((batch, channels, height, width));
    let mut completed = 0;
    let mut interrupted = false;

    for i in 0..batch {
        let started = Instant::now();
        let image = working.slice(s![i..i + 1, .., .., ..]);
        let cond = codec.encode(image)?;
        let latent = sampler.sample(cond.view(), i)?;
        let decoded = codec.decode(latent.view())?;
        ensure_shape("decoded image", image.shape(), decoded.shape())?;
        let fixed = apply_color_fix(collaborators.color, decoded, image, params.color_fix)?;
        out.slice_mut(s![i..i + 1, .., .., ..]).assign(&fixed);
        completed = i + 1;

        info!(
            image = i,
            total = batch,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sampled image"
        );
        observer.on_progress(completed, batch);

        if completed < batch && observer.is_cancelled() {
            info!(completed, total = batch, "Run cancelled; remaining images skipped");
            interrupted = true;
            break;
        }
    }

    if interrupted {
        out = out.slice(s![..completed, .., .., ..]).to_owned();
    }
    Ok((out, interrupted))
}
