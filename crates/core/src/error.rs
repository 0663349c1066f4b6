//! Error taxonomy for the tiled sampling engine.
//!
//! Configuration problems are reported before any compute starts; collaborator
//! failures (ONNX sessions, VAE, resampler) are carried as [`CcsrError::Model`]
//! unless they look like an allocation failure, in which case they surface as
//! [`CcsrError::DeviceOom`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CcsrError {
    #[error("Invalid tile config: {0}")]
    InvalidTileConfig(String),

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Noise schedule is empty: no timestep of {steps} falls in [t_min={t_min}, t_max={t_max}]")]
    ScheduleEmpty { steps: usize, t_min: f64, t_max: f64 },

    #[error("Device out of memory: {0}")]
    DeviceOom(String),

    #[error("Interrupted after {completed} of {total} images")]
    Interrupted { completed: usize, total: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Model(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CcsrError>;

const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "failed to allocate",
    "cudaerrormemoryallocation",
    "bad_alloc",
];

impl CcsrError {
    /// Wraps a collaborator error, promoting allocation failures to `DeviceOom`.
    pub fn from_model(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let lower = message.to_ascii_lowercase();
        if OOM_MARKERS.iter().any(|marker| lower.contains(marker)) {
            Self::DeviceOom(message)
        } else {
            Self::Model(err)
        }
    }

    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Short stable identifier, used in logs and by the CLI exit path.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTileConfig(_) => "invalid_tile_config",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::ScheduleEmpty { .. } => "schedule_empty",
            Self::DeviceOom(_) => "device_oom",
            Self::Interrupted { .. } => "interrupted",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::Model(_) => "model",
        }
    }
}

/// Fails with `ShapeMismatch` unless `actual == expected`.
pub fn ensure_shape(context: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CcsrError::shape_mismatch(context, expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_from_model_classifies_oom() {
        let err = CcsrError::from_model(anyhow!("CUDA failure 2: out of memory"));
        assert!(matches!(err, CcsrError::DeviceOom(_)));

        let err = CcsrError::from_model(
            anyhow!("Failed to allocate memory for requested buffer of size 1073741824")
                .context("denoiser run failed"),
        );
        assert!(matches!(err, CcsrError::DeviceOom(_)));
    }

    #[test]
    fn test_from_model_keeps_other_errors() {
        let err = CcsrError::from_model(anyhow!("input name 'x' not found"));
        assert!(matches!(err, CcsrError::Model(_)));
        assert_eq!(err.kind(), "model");
        assert_eq!(err.to_string(), "input name 'x' not found");
    }

    #[test]
    fn test_ensure_shape() {
        assert!(ensure_shape("latent", &[1, 4, 8, 8], &[1, 4, 8, 8]).is_ok());
        let err = ensure_shape("latent", &[1, 4, 8, 8], &[1, 4, 8, 9]).unwrap_err();
        assert_eq!(err.kind(), "shape_mismatch");
        assert_eq!(
            err.to_string(),
            "Shape mismatch in latent: expected [1, 4, 8, 8], got [1, 4, 8, 9]"
        );
    }

    #[test]
    fn test_interrupted_message() {
        let err = CcsrError::Interrupted {
            completed: 1,
            total: 3,
        };
        assert_eq!(err.to_string(), "Interrupted after 1 of 3 images");
    }
}
