//! Image rescaling for NCHW `f32` batches with selectable interpolation kernels.
//!
//! Every kernel is expressed as per-axis contribution lists (source index and
//! weight per output index) and applied separably: rows first, then columns.

use std::str::FromStr;

use ndarray::{Array4, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{CcsrError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResampleKernel {
    #[serde(rename = "nearest-exact")]
    NearestExact,
    #[serde(rename = "bilinear")]
    Bilinear,
    #[serde(rename = "area")]
    Area,
    #[serde(rename = "bicubic")]
    Bicubic,
    #[default]
    #[serde(rename = "lanczos")]
    Lanczos,
}

impl ResampleKernel {
    pub const ALL: [ResampleKernel; 5] = [
        Self::NearestExact,
        Self::Bilinear,
        Self::Area,
        Self::Bicubic,
        Self::Lanczos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NearestExact => "nearest-exact",
            Self::Bilinear => "bilinear",
            Self::Area => "area",
            Self::Bicubic => "bicubic",
            Self::Lanczos => "lanczos",
        }
    }
}

impl std::fmt::Display for ResampleKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResampleKernel {
    type Err = CcsrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest-exact" | "nearest" => Ok(Self::NearestExact),
            "bilinear" => Ok(Self::Bilinear),
            "area" => Ok(Self::Area),
            "bicubic" => Ok(Self::Bicubic),
            "lanczos" => Ok(Self::Lanczos),
            other => Err(CcsrError::InvalidParameter(format!(
                "unknown resize kernel '{other}'"
            ))),
        }
    }
}

/// Image rescale service consumed by the pipeline.
pub trait Resampler: Send + Sync {
    fn resize(
        &self,
        image: ArrayView4<'_, f32>,
        height: usize,
        width: usize,
        kernel: ResampleKernel,
    ) -> anyhow::Result<Array4<f32>>;
}

/// Pure-Rust separable resampler.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuResampler;

impl Resampler for CpuResampler {
    fn resize(
        &self,
        image: ArrayView4<'_, f32>,
        height: usize,
        width: usize,
        kernel: ResampleKernel,
    ) -> anyhow::Result<Array4<f32>> {
        Ok(resize_nchw(image, height, width, kernel)?)
    }
}

/// Output size of a `scale` rescale, rounded to the nearest pixel.
pub fn scaled_dims(height: usize, width: usize, scale: f64) -> (usize, usize) {
    (
        (height as f64 * scale).round() as usize,
        (width as f64 * scale).round() as usize,
    )
}

type Contributions = Vec<Vec<(usize, f32)>>;

fn nearest(src: usize, dst: usize) -> Contributions {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let i = (((d as f64 + 0.5) * scale) as usize).min(src - 1);
            vec![(i, 1.0)]
        })
        .collect()
}

fn bilinear(src: usize, dst: usize) -> Contributions {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let center = ((d as f64 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (center.floor() as usize).min(src - 1);
            let i1 = (i0 + 1).min(src - 1);
            let frac = (center - i0 as f64).clamp(0.0, 1.0) as f32;
            vec![(i0, 1.0 - frac), (i1, frac)]
        })
        .collect()
}

fn area(src: usize, dst: usize) -> Contributions {
    (0..dst)
        .map(|d| {
            let start = d * src / dst;
            let end = ((d + 1) * src).div_ceil(dst).max(start + 1);
            let w = 1.0 / (end - start) as f32;
            (start..end).map(|i| (i, w)).collect()
        })
        .collect()
}

fn cubic(x: f64) -> f64 {
    const A: f64 = -0.75;
    let x = x.abs();
    if x <= 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        ((A * x - 5.0 * A) * x + 8.0 * A) * x - 4.0 * A
    } else {
        0.0
    }
}

fn bicubic(src: usize, dst: usize) -> Contributions {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let center = (d as f64 + 0.5) * scale - 0.5;
            let base = center.floor();
            let t = center - base;
            (-1..=2)
                .map(|k| {
                    let i = (base as i64 + k).clamp(0, src as i64 - 1) as usize;
                    (i, cubic(k as f64 - t) as f32)
                })
                .collect()
        })
        .collect()
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

fn lanczos3(x: f64) -> f64 {
    if x.abs() < 3.0 {
        sinc(x) * sinc(x / 3.0)
    } else {
        0.0
    }
}

/// Lanczos-3 with the support widened when downscaling (antialiased).
fn lanczos(src: usize, dst: usize) -> Contributions {
    let scale = src as f64 / dst as f64;
    let filter_scale = scale.max(1.0);
    let support = 3.0 * filter_scale;
    (0..dst)
        .map(|d| {
            let center = (d as f64 + 0.5) * scale;
            let lo = ((center - support + 0.5).floor().max(0.0)) as usize;
            let hi = ((center + support + 0.5).floor() as usize).min(src);
            let taps: Vec<(usize, f64)> = (lo..hi)
                .map(|i| (i, lanczos3((i as f64 - center + 0.5) / filter_scale)))
                .collect();
            let total: f64 = taps.iter().map(|(_, w)| w).sum();
            if total.abs() < f64::EPSILON {
                let i = (center as usize).min(src - 1);
                return vec![(i, 1.0)];
            }
            taps.into_iter()
                .map(|(i, w)| (i, (w / total) as f32))
                .collect()
        })
        .collect()
}

fn contributions(src: usize, dst: usize, kernel: ResampleKernel) -> Contributions {
    match kernel {
        ResampleKernel::NearestExact => nearest(src, dst),
        ResampleKernel::Bilinear => bilinear(src, dst),
        ResampleKernel::Area => area(src, dst),
        ResampleKernel::Bicubic => bicubic(src, dst),
        ResampleKernel::Lanczos => lanczos(src, dst),
    }
}

fn resample_axis(input: ArrayView4<'_, f32>, axis: Axis, contribs: &Contributions) -> Array4<f32> {
    let mut shape = input.raw_dim();
    shape[axis.index()] = contribs.len();
    let mut out = Array4::<f32>::zeros(shape);
    for (d, taps) in contribs.iter().enumerate() {
        let mut lane = out.index_axis_mut(axis, d);
        for &(i, w) in taps {
            lane.scaled_add(w, &input.index_axis(axis, i));
        }
    }
    out
}

/// Resizes an NCHW batch to `height` x `width`, clamping results to `[0, 1]`.
pub fn resize_nchw(
    image: ArrayView4<'_, f32>,
    height: usize,
    width: usize,
    kernel: ResampleKernel,
) -> Result<Array4<f32>> {
    let (_, _, src_h, src_w) = image.dim();
    if height == 0 || width == 0 || src_h == 0 || src_w == 0 {
        return Err(CcsrError::InvalidParameter(format!(
            "cannot resize {src_h}x{src_w} to {height}x{width}"
        )));
    }
    if (src_h, src_w) == (height, width) {
        return Ok(image.to_owned());
    }

    let rows = resample_axis(image, Axis(2), &contributions(src_h, height, kernel));
    let mut out = resample_axis(rows.view(), Axis(3), &contributions(src_w, width, kernel));
    out.mapv_inplace(|v| v.clamp(0.0, 1.0));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn gradient(height: usize, width: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
            (x as f32 / width as f32 * 0.5 + y as f32 / height as f32 * 0.4 + c as f32 * 0.03)
                .min(1.0)
        })
    }

    #[test]
    fn test_kernel_names() {
        for kernel in ResampleKernel::ALL {
            assert_eq!(kernel.as_str().parse::<ResampleKernel>().unwrap(), kernel);
        }
        assert_eq!("Nearest".parse::<ResampleKernel>().unwrap(), ResampleKernel::NearestExact);
        assert!("box".parse::<ResampleKernel>().is_err());
        assert_eq!(ResampleKernel::default(), ResampleKernel::Lanczos);
        let json = serde_json::to_string(&ResampleKernel::NearestExact).unwrap();
        assert_eq!(json, "\"nearest-exact\"");
    }

    #[test]
    fn test_constant_image_stays_constant() {
        let image = Array4::from_elem((2, 3, 17, 23), 0.4f32);
        for kernel in ResampleKernel::ALL {
            for (h, w) in [(34, 46), (8, 11), (17, 5)] {
                let out = resize_nchw(image.view(), h, w, kernel).unwrap();
                assert_eq!(out.dim(), (2, 3, h, w));
                assert!(
                    out.iter().all(|&v| (v - 0.4).abs() < 1e-5),
                    "{kernel} to {h}x{w}"
                );
            }
        }
    }

    #[test]
    fn test_identity_size_is_copy() {
        let image = gradient(16, 16);
        let out = resize_nchw(image.view(), 16, 16, ResampleKernel::Lanczos).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn test_nearest_integer_upscale() {
        let image = Array4::from_shape_vec((1, 1, 1, 2), vec![0.25f32, 0.75]).unwrap();
        let out = resize_nchw(image.view(), 2, 4, ResampleKernel::NearestExact).unwrap();
        let row: Vec<f32> = out.slice(s![0, 0, 0, ..]).iter().copied().collect();
        assert_eq!(row, vec![0.25, 0.25, 0.75, 0.75]);
    }

    #[test]
    fn test_area_halving_averages_blocks() {
        let image = Array4::from_shape_vec((1, 1, 2, 2), vec![0.0f32, 0.2, 0.4, 0.6]).unwrap();
        let out = resize_nchw(image.view(), 1, 1, ResampleKernel::Area).unwrap();
        assert!((out[[0, 0, 0, 0]] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let image = Array4::from_shape_vec((1, 1, 1, 2), vec![0.0f32, 1.0]).unwrap();
        let out = resize_nchw(image.view(), 1, 4, ResampleKernel::Bilinear).unwrap();
        let row: Vec<f32> = out.iter().copied().collect();
        assert_eq!(row, vec![0.0, 0.25, 0.75, 1.0]);
    }

    #[test]
    fn test_smooth_round_trip() {
        let image = gradient(32, 48);
        for kernel in [ResampleKernel::Bilinear, ResampleKernel::Bicubic, ResampleKernel::Lanczos] {
            let up = resize_nchw(image.view(), 64, 96, kernel).unwrap();
            let back = resize_nchw(up.view(), 32, 48, kernel).unwrap();
            let max_err = back
                .iter()
                .zip(image.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max);
            assert!(max_err < 0.05, "{kernel}: {max_err}");
        }
    }

    #[test]
    fn test_rejects_empty_target() {
        let image = gradient(8, 8);
        assert!(resize_nchw(image.view(), 0, 8, ResampleKernel::Area).is_err());
    }

    #[test]
    fn test_scaled_dims() {
        assert_eq!(scaled_dims(512, 512, 1.0), (512, 512));
        assert_eq!(scaled_dims(130, 200, 1.5), (195, 300));
        assert_eq!(scaled_dims(100, 75, 0.5), (50, 38));
    }

    #[test]
    fn test_cpu_resampler_trait() {
        let resampler: &dyn Resampler = &CpuResampler;
        let out = resampler
            .resize(gradient(8, 8).view(), 16, 4, ResampleKernel::Bicubic)
            .unwrap();
        assert_eq!(out.dim(), (1, 3, 16, 4));
    }
}
