//! Overlapping tile grids and the weight fields used to stitch them back together.

pub mod planner;
pub mod weights;

pub use planner::{plan_axis, plan_tiles, Tile};
pub use weights::{weight_field, BlendAccumulator, BlendMode, WeightCache};
