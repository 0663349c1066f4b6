use ndarray::{s, Array4, ArrayView4, ArrayViewMut4};
use tracing::debug;

use crate::error::{CcsrError, Result};

/// Rectangular region of a canvas, in the canvas' own units (pixels or latent cells).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tile {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Tile {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole canvas as one tile.
    pub fn full(height: usize, width: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_full(&self, height: usize, width: usize) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }

    /// Same region at `factor` times the resolution (latent tile to pixel tile).
    pub fn scaled(&self, factor: usize) -> Self {
        Self::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    pub fn view<'a>(&self, tensor: &'a Array4<f32>) -> ArrayView4<'a, f32> {
        tensor.slice(s![
            ..,
            ..,
            self.y..self.y + self.height,
            self.x..self.x + self.width
        ])
    }

    pub fn view_mut<'a>(&self, tensor: &'a mut Array4<f32>) -> ArrayViewMut4<'a, f32> {
        tensor.slice_mut(s![
            ..,
            ..,
            self.y..self.y + self.height,
            self.x..self.x + self.width
        ])
    }
}

/// Splits one axis of length `dim` into `(start, len)` spans.
///
/// Spans advance by `stride`; the last one is pulled back so it ends exactly at
/// `dim`, overlapping its predecessor by more than `tile - stride` if needed.
/// A tile at least as long as the axis yields one span covering it.
pub fn plan_axis(dim: usize, tile: usize, stride: usize) -> Result<Vec<(usize, usize)>> {
    validate(tile, stride)?;
    if dim == 0 {
        return Err(CcsrError::InvalidTileConfig(
            "canvas dimension must be non-zero".into(),
        ));
    }
    if tile >= dim {
        return Ok(vec![(0, dim)]);
    }

    let mut spans = Vec::with_capacity((dim - tile).div_ceil(stride) + 1);
    let mut start = 0;
    loop {
        if start + tile >= dim {
            spans.push((dim - tile, tile));
            break;
        }
        spans.push((start, tile));
        start += stride;
    }
    Ok(spans)
}

/// Row-major grid of overlapping tiles covering a `height` x `width` canvas.
pub fn plan_tiles(
    height: usize,
    width: usize,
    tile_size: usize,
    tile_stride: usize,
) -> Result<Vec<Tile>> {
    let rows = plan_axis(height, tile_size, tile_stride)?;
    let cols = plan_axis(width, tile_size, tile_stride)?;

    let tiles: Vec<Tile> = rows
        .iter()
        .flat_map(|&(y, h)| cols.iter().map(move |&(x, w)| Tile::new(x, y, w, h)))
        .collect();

    debug!(
        height,
        width,
        tile_size,
        tile_stride,
        rows = rows.len(),
        cols = cols.len(),
        "Planned tile grid"
    );
    Ok(tiles)
}

fn validate(tile: usize, stride: usize) -> Result<()> {
    if tile == 0 {
        return Err(CcsrError::InvalidTileConfig(
            "tile size must be positive".into(),
        ));
    }
    if stride == 0 {
        return Err(CcsrError::InvalidTileConfig(
            "tile stride must be positive".into(),
        ));
    }
    if stride > tile {
        return Err(CcsrError::InvalidTileConfig(format!(
            "tile stride {stride} exceeds tile size {tile}; tiles would leave gaps"
        )));
    }
    Ok(())
}
