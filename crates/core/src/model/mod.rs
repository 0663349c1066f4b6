//! Model lifecycle: an explicit load step produces a [`ModelHandle`], runs
//! borrow it exclusively, and the keep-loaded policy decides whether its
//! weights stay resident afterwards.
//!
//! [`ModelCache`] keeps at most one handle alive and reuses it only when the
//! requested checkpoint key matches.

pub mod backend;
pub mod manifest;
pub mod onnx;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::VaeModel;
use crate::error::{CcsrError, Result};
use crate::step::{Conditioning, Denoiser};

pub use backend::InferenceBackend;

/// Numeric precision the graphs run at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// fp16 on GPU backends, fp32 on CPU.
    #[default]
    Auto,
    Fp16,
    Fp32,
}

impl Precision {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "fp16" | "f16" | "half" => Self::Fp16,
            "fp32" | "f32" | "float" => Self::Fp32,
            _ => Self::Auto,
        }
    }

    /// Concrete precision for `backend`; never returns `Auto`.
    pub fn resolve(self, backend: &InferenceBackend) -> Self {
        match (self, backend) {
            (Self::Auto, InferenceBackend::Cpu) => Self::Fp32,
            (Self::Auto, _) => Self::Fp16,
            (explicit, _) => explicit,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fp16 => write!(f, "fp16"),
            Self::Fp32 => write!(f, "fp32"),
        }
    }
}

/// Device placement passed explicitly into every load.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub backend: InferenceBackend,
    pub precision: Precision,
    pub trt_cache_dir: Option<PathBuf>,
}

impl DeviceConfig {
    pub fn cpu() -> Self {
        Self {
            backend: InferenceBackend::Cpu,
            ..Self::default()
        }
    }

    pub fn resolved_precision(&self) -> Precision {
        self.precision.resolve(&self.backend)
    }
}

/// Identity of loaded weights: canonical checkpoint path plus precision.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub path: PathBuf,
    pub precision: Precision,
}

impl CheckpointKey {
    pub fn new(checkpoint: &Path, device: &DeviceConfig) -> Result<Self> {
        let path = checkpoint.canonicalize().map_err(|e| {
            CcsrError::InvalidParameter(format!(
                "checkpoint not found: {} ({e})",
                checkpoint.display()
            ))
        })?;
        Ok(Self {
            path,
            precision: device.resolved_precision(),
        })
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.path.display(), self.precision)
    }
}

/// Materialized weights: the denoiser, the VAE and the fixed conditioning.
pub struct CcsrModel {
    pub denoiser: Box<dyn Denoiser>,
    pub vae: Box<dyn VaeModel>,
    pub conditioning: Conditioning,
}

/// Model-loading service: turns a checkpoint key into in-memory weights.
pub trait ModelLoader: Send + Sync {
    fn load(&self, key: &CheckpointKey, device: &DeviceConfig) -> anyhow::Result<CcsrModel>;
}

pub struct ModelHandle {
    key: CheckpointKey,
    device: DeviceConfig,
    loader: Arc<dyn ModelLoader>,
    slot: Mutex<Option<CcsrModel>>,
}

impl ModelHandle {
    /// Explicit load step. Weights are materialized immediately so loading
    /// errors surface here rather than in the first run.
    pub fn load(loader: Arc<dyn ModelLoader>, checkpoint: &Path, device: DeviceConfig) -> Result<Self> {
        let key = CheckpointKey::new(checkpoint, &device)?;
        let model = materialize(loader.as_ref(), &key, &device)?;
        Ok(Self {
            key,
            device,
            loader,
            slot: Mutex::new(Some(model)),
        })
    }

    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn is_resident(&self) -> bool {
        self.slot_guard().is_some()
    }

    /// Exclusive access for one run; reloads the weights if they were released.
    pub fn lock(&self) -> Result<ModelGuard<'_>> {
        let mut slot = self.slot_guard();
        if slot.is_none() {
            debug!(checkpoint = %self.key, "Re-materializing released model");
            *slot = Some(materialize(self.loader.as_ref(), &self.key, &self.device)?);
        }
        Ok(ModelGuard { slot })
    }

    /// Drops the materialized weights; the next `lock` loads them again.
    pub fn release(&self) {
        if self.slot_guard().take().is_some() {
            info!(checkpoint = %self.key, "Released model weights");
        }
    }

    fn slot_guard(&self) -> MutexGuard<'_, Option<CcsrModel>> {
        self.slot.lock().unwrap_or_else(|poisoned| {
            warn!(checkpoint = %self.key, "Model lock was poisoned by a panicked run; recovering");
            poisoned.into_inner()
        })
    }
}

/// Held for the duration of one run.
pub struct ModelGuard<'a> {
    slot: MutexGuard<'a, Option<CcsrModel>>,
}

impl ModelGuard<'_> {
    pub fn model(&self) -> Result<&CcsrModel> {
        self.slot
            .as_ref()
            .ok_or_else(|| CcsrError::Model(anyhow::anyhow!("model weights were released mid-run")))
    }

    /// Ends the run and drops the weights (keep-loaded disabled).
    pub fn release(mut self) {
        self.slot.take();
    }
}

fn materialize(loader: &dyn ModelLoader, key: &CheckpointKey, device: &DeviceConfig) -> Result<CcsrModel> {
    let started = Instant::now();
    info!(checkpoint = %key, backend = %device.backend, "Loading CCSR model");
    let model = loader.load(key, device).map_err(CcsrError::from_model)?;
    info!(
        checkpoint = %key,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "CCSR model loaded"
    );
    Ok(model)
}

/// Single-slot cache of the most recently loaded model.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    current: Mutex<Option<Arc<ModelHandle>>>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            current: Mutex::new(None),
        }
    }

    /// Returns the cached handle when its key and device match, otherwise
    /// loads `checkpoint` and replaces the cached handle.
    pub fn get_or_load(&self, checkpoint: &Path, device: &DeviceConfig) -> Result<Arc<ModelHandle>> {
        let key = CheckpointKey::new(checkpoint, device)?;
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(handle) = current.as_ref() {
            if handle.key() == &key && handle.device() == device {
                debug!(checkpoint = %key, "Reusing cached model handle");
                return Ok(Arc::clone(handle));
            }
            info!(previous = %handle.key(), requested = %key, "Checkpoint changed; reloading model");
        }

        // Drop the old weights before loading the new ones.
        *current = None;
        let handle = Arc::new(ModelHandle::load(
            Arc::clone(&self.loader),
            &key.path,
            device.clone(),
        )?);
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    pub fn cached_key(&self) -> Option<CheckpointKey> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|handle| handle.key().clone())
    }

    pub fn clear(&self) {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}
