//! ONNX Runtime session construction for the CCSR graphs.
//!
//! [`InferenceBackend`] picks the execution provider chain; [`build_session`]
//! commits one graph file into an `ort::Session`.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Execution provider selection.
///
/// `Tensorrt` needs the TensorRT runtime libraries; when they are missing the
/// session falls back to CUDA. `Cpu` registers no accelerator at all.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
    /// Build TensorRT engines in fp16.
    pub fp16: bool,
}

/// Per-graph TensorRT engine cache: `<base>/<graph file stem>`.
pub fn graph_cache_dir(base_dir: &Path, model_path: &Path) -> PathBuf {
    match model_path.file_stem() {
        Some(stem) => base_dir.join(stem),
        None => base_dir.to_path_buf(),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }
    stats
}

/// Runs `work` while logging a heartbeat every 15 s; TensorRT engine builds
/// for the UNet can take minutes on first use.
fn with_heartbeat<T>(label: String, work: impl FnOnce() -> T) -> T {
    let (stop_tx, stop_rx) = channel::<()>();
    let ticker = thread::spawn(move || {
        let tick = Duration::from_secs(15);
        let mut elapsed = 0_u64;
        loop {
            match stop_rx.recv_timeout(tick) {
                Err(RecvTimeoutError::Timeout) => {
                    elapsed += tick.as_secs();
                    info!(elapsed_secs = elapsed, graph = %label, "Session initialization still in progress");
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    });
    let out = work();
    let _ = stop_tx.send(());
    let _ = ticker.join();
    out
}

/// Build an `ort::Session` for one graph with the backend's provider chain.
///
/// CUDA failures fall through to the CPU provider inside ORT, so a session is
/// returned whenever the graph itself loads.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let path = config.model_path;
    let load_context = || format!("Failed to load ONNX graph: {}", path.display());

    match config.backend {
        InferenceBackend::Cpu => {
            debug!(graph = %path.display(), "Building session on CPU");
            builder.commit_from_file(path).with_context(load_context)
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(graph = %path.display(), "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(path)
                .with_context(load_context)
        }
        InferenceBackend::Tensorrt => {
            let base = config.trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"));
            let cache_dir = graph_cache_dir(base, path);
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(dir = %cache_dir.display(), error = %e, "Failed to create TRT cache directory");
            }
            let before = cache_stats(&cache_dir);
            let started = Instant::now();
            info!(
                graph = %path.display(),
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let cache_path = cache_dir.to_string_lossy().to_string();
            let session = with_heartbeat(path.display().to_string(), || {
                builder
                    .with_execution_providers([
                        TensorRTExecutionProvider::default()
                            .with_engine_cache(true)
                            .with_engine_cache_path(&cache_path)
                            .with_fp16(config.fp16)
                            .with_device_id(0)
                            .build(),
                        CUDAExecutionProvider::default().build(),
                    ])?
                    .commit_from_file(path)
                    .with_context(load_context)
            });

            let after = cache_stats(&cache_dir);
            let elapsed_secs = started.elapsed().as_secs_f64();
            match &session {
                Ok(_) => info!(
                    elapsed_secs,
                    cache_updated = after != before,
                    cache_bytes = after.total_bytes,
                    "TensorRT session ready"
                ),
                Err(e) => error!(elapsed_secs, error = %e, "TensorRT session initialization failed"),
            }
            session
        }
    }
}
