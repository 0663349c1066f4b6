//! Per-tile blending weights and the weighted accumulator that stitches tiles.
//!
//! `Flat` gives every cell of a tile weight 1.0, so overlaps are plain averages
//! (mixture-of-diffusers "mixdiff"). `Gaussian` is a separable bell centred on the
//! tile with variance `0.01` of the squared tile length per axis, peak-normalized
//! to 1.0, so tile centres dominate and tile borders fade out.
//! Normalization by the per-cell weight sum happens in [`BlendAccumulator::finish`].

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::{s, Array2, Array4, ArrayView4, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::planner::Tile;
use crate::error::{ensure_shape, CcsrError, Result};

/// Variance of the Gaussian falloff, relative to the squared tile length.
pub const GAUSSIAN_VARIANCE: f64 = 0.01;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    #[default]
    Flat,
    Gaussian,
}

impl std::fmt::Display for BlendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Gaussian => write!(f, "gaussian"),
        }
    }
}

fn gaussian_profile(len: usize) -> Vec<f64> {
    let length = len as f64;
    let midpoint = (length - 1.0) / 2.0;
    (0..len)
        .map(|i| {
            let d = (i as f64 - midpoint) / length;
            (-(d * d) / (2.0 * GAUSSIAN_VARIANCE)).exp()
        })
        .collect()
}

/// Weight field for a `height` x `width` tile. Pure function of shape and mode.
pub fn weight_field(height: usize, width: usize, mode: BlendMode) -> Array2<f32> {
    match mode {
        BlendMode::Flat => Array2::ones((height, width)),
        BlendMode::Gaussian => {
            let rows = gaussian_profile(height);
            let cols = gaussian_profile(width);
            Array2::from_shape_fn((height, width), |(y, x)| (rows[y] * cols[x]) as f32)
        }
    }
}

/// Memoizes weight fields per tile shape for one blend mode.
///
/// Grids from the planner contain at most a handful of distinct shapes, so each
/// field is computed once per run.
#[derive(Debug)]
pub struct WeightCache {
    mode: BlendMode,
    fields: HashMap<(usize, usize), Arc<Array2<f32>>>,
}

impl WeightCache {
    pub fn new(mode: BlendMode) -> Self {
        Self {
            mode,
            fields: HashMap::new(),
        }
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }

    pub fn get(&mut self, height: usize, width: usize) -> Arc<Array2<f32>> {
        let mode = self.mode;
        Arc::clone(
            self.fields
                .entry((height, width))
                .or_insert_with(|| Arc::new(weight_field(height, width, mode))),
        )
    }

    pub fn for_tile(&mut self, tile: &Tile) -> Arc<Array2<f32>> {
        self.get(tile.height, tile.width)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Weighted sum of tile outputs over a full canvas, normalized on `finish`.
#[derive(Debug)]
pub struct BlendAccumulator {
    value: Array4<f32>,
    weight: Array2<f32>,
}

impl BlendAccumulator {
    pub fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            value: Array4::zeros((batch, channels, height, width)),
            weight: Array2::zeros((height, width)),
        }
    }

    pub fn add(&mut self, tile: &Tile, values: ArrayView4<'_, f32>, weights: &Array2<f32>) -> Result<()> {
        let (batch, channels, height, width) = self.value.dim();
        if tile.x + tile.width > width || tile.y + tile.height > height {
            return Err(CcsrError::shape_mismatch(
                "blend tile bounds",
                &[height, width],
                &[tile.y + tile.height, tile.x + tile.width],
            ));
        }
        ensure_shape(
            "blend tile values",
            &[batch, channels, tile.height, tile.width],
            values.shape(),
        )?;
        ensure_shape("blend tile weights", &[tile.height, tile.width], weights.shape())?;

        let broadcast = weights.view().insert_axis(Axis(0)).insert_axis(Axis(0));
        Zip::from(tile.view_mut(&mut self.value))
            .and(&values)
            .and_broadcast(&broadcast)
            .for_each(|acc, &v, &w| *acc += v * w);

        let mut sum = self.weight.slice_mut(s![
            tile.y..tile.y + tile.height,
            tile.x..tile.x + tile.width
        ]);
        sum += weights;
        Ok(())
    }

    /// Per-cell sum of contributing weights so far.
    pub fn weight_sum(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Divides the accumulated values by the per-cell weight sum.
    ///
    /// Fails if any cell received no weight, which would mean a tile is missing.
    pub fn finish(self) -> Result<Array4<f32>> {
        if let Some(((y, x), _)) = self.weight.indexed_iter().find(|&(_, &w)| w <= 0.0) {
            return Err(CcsrError::InvalidTileConfig(format!(
                "cell ({y}, {x}) is not covered by any tile"
            )));
        }
        let mut value = self.value;
        let denom = self.weight.view().insert_axis(Axis(0)).insert_axis(Axis(0));
        value /= &denom;
        Ok(value)
    }
}
