//! Tiled diffusion super-resolution (CCSR) engine.
//!
//! The load step ([`model::ModelHandle::load`] or [`model::ModelCache`]) is
//! separate from the run step ([`pipeline::upscale`]); everything below the
//! pipeline works on plain `ndarray` tensors behind collaborator traits.

pub mod codec;
pub mod color;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod observer;
pub mod pipeline;
pub mod resample;
pub mod runtime;
pub mod sampler;
pub mod schedule;
pub mod step;
pub mod tiling;
pub mod types;

pub use error::{CcsrError, Result};
