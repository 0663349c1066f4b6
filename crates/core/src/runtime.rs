//! ONNX Runtime shared-library discovery.
//!
//! `ort` is built with `load-dynamic`, so the ORT library is located at run
//! time through `ORT_DYLIB_PATH`. Call [`setup_runtime_libs`] before the first
//! session is built.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::model::InferenceBackend;

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Directories probed for runtime libraries, in order:
/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, `<data_dir>/lib`, then
/// the system lib dirs on Unix.
pub fn candidate_lib_dirs(data_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    if let Some(data_dir) = data_dir {
        push(data_dir.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

pub fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// GPU runtime families the execution providers depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GpuLib {
    CudaRuntime,
    Cudnn,
    TensorRt,
}

pub fn classify_gpu_lib(file_name: &str) -> Option<GpuLib> {
    let name = file_name.to_ascii_lowercase();
    let cuda = ["libcudart", "libcublas", "cudart64_", "cublas64_", "cublaslt64_"];
    let cudnn = ["libcudnn", "cudnn64_"];
    let trt = ["libnvinfer", "libnvonnxparser", "nvinfer", "nvonnxparser"];

    if cuda.iter().any(|p| name.starts_with(p)) {
        Some(GpuLib::CudaRuntime)
    } else if cudnn.iter().any(|p| name.starts_with(p)) {
        Some(GpuLib::Cudnn)
    } else if trt.iter().any(|p| name.starts_with(p)) {
        Some(GpuLib::TensorRt)
    } else {
        None
    }
}

fn detect_gpu_libs(dirs: &[PathBuf]) -> Vec<GpuLib> {
    let mut found: Vec<GpuLib> = dirs
        .iter()
        .filter_map(|dir| std::fs::read_dir(dir).ok())
        .flat_map(|entries| entries.flatten())
        .filter_map(|entry| classify_gpu_lib(&entry.file_name().to_string_lossy()))
        .collect();
    found.sort();
    found.dedup();
    found
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLibs {
    pub ort_dylib: Option<PathBuf>,
    /// `ORT_DYLIB_PATH` was already set by the environment.
    pub preset: bool,
    pub gpu_libs: Vec<GpuLib>,
}

/// Points `ORT_DYLIB_PATH` at the first ORT library found, unless the
/// environment already set it. Runs before tracing is initialized; report the
/// result with [`log_runtime_lib_status`].
pub fn setup_runtime_libs(data_dir: Option<&Path>) -> RuntimeLibs {
    let dirs = candidate_lib_dirs(data_dir);
    let gpu_libs = detect_gpu_libs(&dirs);

    if let Some(existing) = env::var_os(ORT_DYLIB_ENV) {
        return RuntimeLibs {
            ort_dylib: Some(PathBuf::from(existing)),
            preset: true,
            gpu_libs,
        };
    }

    let ort_dylib = find_ort_dylib_in_dirs(&dirs);
    if let Some(path) = &ort_dylib {
        env::set_var(ORT_DYLIB_ENV, path);
    }
    RuntimeLibs {
        ort_dylib,
        preset: false,
        gpu_libs,
    }
}

pub fn log_runtime_lib_status(libs: &RuntimeLibs, backend: &InferenceBackend) {
    match &libs.ort_dylib {
        Some(path) if path.is_file() => info!(path = %path.display(), preset = libs.preset, "ORT library"),
        Some(path) => warn!(path = %path.display(), "{ORT_DYLIB_ENV} points to a missing file"),
        None => warn!("{ORT_DYLIB_ENV} not set; ORT will try default search paths"),
    }
    debug!(gpu_libs = ?libs.gpu_libs, "Detected GPU runtime libraries");

    let missing = match backend {
        InferenceBackend::Cpu => None,
        InferenceBackend::Cuda => (!libs.gpu_libs.contains(&GpuLib::CudaRuntime)).then_some("CUDA runtime"),
        InferenceBackend::Tensorrt => (!libs.gpu_libs.contains(&GpuLib::TensorRt)).then_some("TensorRT"),
    };
    if let Some(what) = missing {
        warn!(
            backend = %backend,
            "{what} libraries not found in the probed lib dirs; relying on the system loader path"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_and_data_paths() {
        let dirs = candidate_lib_dirs(Some(Path::new("/srv/ccsr")));
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
        assert!(dirs.contains(&PathBuf::from("/srv/ccsr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_has_no_duplicates() {
        let dirs = candidate_lib_dirs(None);
        let mut unique = dirs.clone();
        unique.dedup();
        assert_eq!(unique.len(), dirs.len());
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join(ORT_LIB_NAME), b"ort").unwrap();
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second.clone()]),
            Some(second.join(ORT_LIB_NAME))
        );
        std::fs::write(first.join(ORT_LIB_NAME), b"ort").unwrap();
        assert_eq!(find_ort_dylib_in_dirs(&[first.clone(), second]), Some(first.join(ORT_LIB_NAME)));
    }

    #[test]
    fn classify_gpu_libs() {
        assert_eq!(classify_gpu_lib("libcudart.so.12"), Some(GpuLib::CudaRuntime));
        assert_eq!(classify_gpu_lib("cublas64_12.dll"), Some(GpuLib::CudaRuntime));
        assert_eq!(classify_gpu_lib("libcudnn_ops.so.9"), Some(GpuLib::Cudnn));
        assert_eq!(classify_gpu_lib("libnvinfer.so.10"), Some(GpuLib::TensorRt));
        assert_eq!(classify_gpu_lib("libonnxruntime.so.1.23.2"), None);
        assert_eq!(classify_gpu_lib("libonnxruntime_providers_cuda.so"), None);
    }

    #[test]
    fn detect_gpu_libs_dedups_and_orders() {
        let temp = tempfile::tempdir().unwrap();
        for name in ["libnvinfer.so.10", "libcudart.so.12", "libcublas.so.12", "readme.txt"] {
            std::fs::write(temp.path().join(name), b"").unwrap();
        }
        assert_eq!(
            detect_gpu_libs(&[temp.path().to_path_buf()]),
            vec![GpuLib::CudaRuntime, GpuLib::TensorRt]
        );
    }
}
