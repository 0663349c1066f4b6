//! One reverse-diffusion step for one latent tile.
//!
//! The model predicts the noise `ε` in `x_t`; the step recovers the clean
//! estimate `x̂₀ = √(1/ᾱ)·x_t − √(1/ᾱ − 1)·ε` and samples `x_{t-1}` from the
//! DDPM posterior with the fixed small (posterior) variance. Nothing here holds
//! state between calls, so tiles may be stepped concurrently.

use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Zip};

use crate::error::{ensure_shape, CcsrError, Result};
use crate::schedule::SpacedSchedule;

/// Noise-prediction network conditioned on a latent control image and a
/// text-style context embedding.
pub trait Denoiser: Send + Sync {
    /// `latent` and `condition` share the shape `[B, 4, h, w]`; `timestep` is the
    /// training timestep in `0..1000`. Returns `ε` with the shape of `latent`.
    fn predict_noise(
        &self,
        latent: ArrayView4<'_, f32>,
        timestep: usize,
        condition: ArrayView4<'_, f32>,
        context: ArrayView3<'_, f32>,
    ) -> anyhow::Result<Array4<f32>>;
}

/// Fixed conditioning embedding for a run, plus the optional unconditional
/// embedding used when guidance is enabled.
#[derive(Clone, Debug)]
pub struct Conditioning {
    pub context: Array3<f32>,
    pub uncond_context: Option<Array3<f32>>,
}

impl Conditioning {
    pub fn new(context: Array3<f32>) -> Self {
        Self {
            context,
            uncond_context: None,
        }
    }

    pub fn with_uncond(mut self, uncond_context: Array3<f32>) -> Self {
        self.uncond_context = Some(uncond_context);
        self
    }
}

#[derive(Clone, Debug)]
pub struct StepOutput {
    /// `x_{t-1}`.
    pub latent: Array4<f32>,
    /// Predicted fully denoised latent `x̂₀`.
    pub pred_x0: Array4<f32>,
}

pub struct StepEngine<'a> {
    schedule: &'a SpacedSchedule,
    denoiser: &'a dyn Denoiser,
    conditioning: &'a Conditioning,
    guidance_scale: f32,
}

impl<'a> StepEngine<'a> {
    pub fn new(
        schedule: &'a SpacedSchedule,
        denoiser: &'a dyn Denoiser,
        conditioning: &'a Conditioning,
        guidance_scale: f32,
    ) -> Self {
        Self {
            schedule,
            denoiser,
            conditioning,
            guidance_scale,
        }
    }

    pub fn uses_guidance(&self) -> bool {
        (self.guidance_scale - 1.0).abs() > f32::EPSILON
    }

    /// Guided noise prediction for `latent` at spaced step `index`.
    pub fn predict_noise(
        &self,
        latent: ArrayView4<'_, f32>,
        index: usize,
        condition: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>> {
        ensure_shape("step condition tile", latent.shape(), condition.shape())?;
        let timestep = self.schedule.timestep(index);

        let cond = self
            .denoiser
            .predict_noise(latent, timestep, condition, self.conditioning.context.view())
            .map_err(CcsrError::from_model)?;
        ensure_shape("predicted noise", latent.shape(), cond.shape())?;

        if !self.uses_guidance() {
            return Ok(cond);
        }

        let uncond_context = self
            .conditioning
            .uncond_context
            .as_ref()
            .unwrap_or(&self.conditioning.context);
        let mut eps = self
            .denoiser
            .predict_noise(latent, timestep, condition, uncond_context.view())
            .map_err(CcsrError::from_model)?;
        ensure_shape("predicted noise (unconditional)", latent.shape(), eps.shape())?;

        let scale = self.guidance_scale;
        Zip::from(&mut eps)
            .and(&cond)
            .for_each(|u, &c| *u += scale * (c - *u));
        Ok(eps)
    }

    /// Advances `latent` from spaced step `index` to `index - 1`.
    ///
    /// `noise` must be given for every `index > 0`; step 0 adds no noise.
    pub fn step(
        &self,
        latent: ArrayView4<'_, f32>,
        index: usize,
        condition: ArrayView4<'_, f32>,
        noise: Option<ArrayView4<'_, f32>>,
    ) -> Result<StepOutput> {
        if index >= self.schedule.len() {
            return Err(CcsrError::InvalidParameter(format!(
                "step index {index} outside schedule of {} steps",
                self.schedule.len()
            )));
        }
        let eps = self.predict_noise(latent, index, condition)?;

        let sr = self.schedule.sqrt_recip_alphas_cumprod(index) as f32;
        let srm1 = self.schedule.sqrt_recipm1_alphas_cumprod(index) as f32;
        let mut pred_x0 = Array4::<f32>::zeros(latent.raw_dim());
        Zip::from(&mut pred_x0)
            .and(&latent)
            .and(&eps)
            .for_each(|x0, &x, &e| *x0 = sr * x - srm1 * e);

        let c1 = self.schedule.posterior_mean_coef1(index) as f32;
        let c2 = self.schedule.posterior_mean_coef2(index) as f32;
        let mut next = Array4::<f32>::zeros(latent.raw_dim());
        Zip::from(&mut next)
            .and(&pred_x0)
            .and(&latent)
            .for_each(|out, &x0, &x| *out = c1 * x0 + c2 * x);

        if index > 0 {
            let noise = noise.ok_or_else(|| {
                CcsrError::InvalidParameter(format!("step {index} requires a noise tile"))
            })?;
            ensure_shape("step noise tile", latent.shape(), noise.shape())?;
            let std = (0.5 * self.schedule.posterior_log_variance_clipped(index)).exp() as f32;
            Zip::from(&mut next)
                .and(&noise)
                .for_each(|out, &n| *out += std * n);
        }

        Ok(StepOutput {
            latent: next,
            pred_x0,
        })
    }

    /// Forward-diffuses a clean latent to spaced step `index`:
    /// `√ᾱ·x₀ + √(1−ᾱ)·noise`.
    pub fn forward_diffuse(
        &self,
        clean: ArrayView4<'_, f32>,
        index: usize,
        noise: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>> {
        ensure_shape("forward diffusion noise", clean.shape(), noise.shape())?;
        let acp = self.schedule.alpha_cumprod(index);
        let (a, b) = (acp.sqrt() as f32, (1.0 - acp).sqrt() as f32);
        let mut out = Array4::<f32>::zeros(clean.raw_dim());
        Zip::from(&mut out)
            .and(&clean)
            .and(&noise)
            .for_each(|o, &x, &n| *o = a * x + b * n);
        Ok(out)
    }
}
