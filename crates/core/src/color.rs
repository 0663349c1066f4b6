//! Color-fix policy applied to decoded images.
//!
//! The correction algorithms live outside the engine behind [`ColorCorrector`];
//! the engine only selects the policy and hands over the decoded image and the
//! reference it should match.

use std::str::FromStr;

use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ensure_shape, CcsrError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFixMode {
    None,
    /// Per-channel mean/std matching against the reference.
    #[default]
    Adain,
    /// Low-frequency wavelet bands taken from the reference.
    Wavelet,
}

impl ColorFixMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Adain => "adain",
            Self::Wavelet => "wavelet",
        }
    }
}

impl std::fmt::Display for ColorFixMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorFixMode {
    type Err = CcsrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "adain" => Ok(Self::Adain),
            "wavelet" => Ok(Self::Wavelet),
            other => Err(CcsrError::InvalidParameter(format!(
                "unknown color fix mode '{other}' (expected none, adain or wavelet)"
            ))),
        }
    }
}

pub trait ColorCorrector: Send + Sync {
    /// Returns `image` corrected towards `reference`; both are `[B, 3, H, W]`.
    fn correct(
        &self,
        image: ArrayView4<'_, f32>,
        reference: ArrayView4<'_, f32>,
        mode: ColorFixMode,
    ) -> anyhow::Result<Array4<f32>>;
}

/// Applies `mode` through `corrector`. Without a corrector the image is
/// returned unchanged and a warning is logged.
pub fn apply_color_fix(
    corrector: Option<&dyn ColorCorrector>,
    image: Array4<f32>,
    reference: ArrayView4<'_, f32>,
    mode: ColorFixMode,
) -> Result<Array4<f32>> {
    if mode == ColorFixMode::None {
        return Ok(image);
    }
    let Some(corrector) = corrector else {
        warn!(mode = %mode, "Color fix requested but no color corrector is configured; skipping");
        return Ok(image);
    };
    ensure_shape("color fix reference", image.shape(), reference.shape())?;
    let corrected = corrector
        .correct(image.view(), reference, mode)
        .map_err(CcsrError::from_model)?;
    ensure_shape("color fix output", image.shape(), corrected.shape())?;
    Ok(corrected)
}
