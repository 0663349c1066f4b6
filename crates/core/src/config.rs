use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{DeviceConfig, InferenceBackend, Precision};
use crate::pipeline::UpscaleParams;

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "CCSR_DATA_DIR";
pub const DEFAULT_MODEL: &str = "real-world_ccsr-fp16";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub device: DeviceSection,
    /// Defaults for every run; CLI flags override individual fields.
    pub sampling: UpscaleParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    pub default_model: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceSection {
    pub backend: InferenceBackend,
    pub precision: Precision,
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw).with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded).with_context(|| format!("failed to write config file: {}", path.display()))
    }

    pub fn models_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.models_dir)
    }

    /// Device placement with the TRT cache resolved against `data_dir`.
    pub fn device_config(&self, data_dir: &Path) -> DeviceConfig {
        DeviceConfig {
            backend: self.device.backend.clone(),
            precision: self.device.precision,
            trt_cache_dir: Some(resolve_relative_to(data_dir, &self.paths.trt_cache_dir)),
        }
    }
}

/// Data directory: CLI override, then `CCSR_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates `data_dir` and writes a default config.toml unless one exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorFixMode;
    use crate::sampler::SamplingStrategy;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.paths.default_model, "real-world_ccsr-fp16");
        assert_eq!(cfg.device.backend, InferenceBackend::Cuda);
        assert_eq!(cfg.device.precision, Precision::Auto);
        assert_eq!(cfg.sampling, UpscaleParams::default());
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let raw = r#"
[device]
backend = "cpu"

[sampling]
sampling_method = "ccsr_tiled_vae_gaussian_weights"
color_fix = "wavelet"
"#;
        let cfg: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.device.backend, InferenceBackend::Cpu);
        assert_eq!(cfg.device.precision, Precision::Auto);
        assert_eq!(cfg.sampling.sampling_method, SamplingStrategy::CcsrTiledVaeGaussianWeights);
        assert_eq!(cfg.sampling.color_fix, ColorFixMode::Wavelet);
        assert_eq!(cfg.sampling.steps, 45);
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn load_missing_or_empty_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());

        fs::write(&path, "  \n").unwrap();
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());

        fs::write(&path, "[device\n").unwrap();
        assert!(AppConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        assert_eq!(data_dir(Some(Path::new("/custom"))), PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }
        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn device_config_resolves_cache_dir() {
        let cfg = AppConfig::default();
        let device = cfg.device_config(Path::new("/data"));
        assert_eq!(device.trt_cache_dir, Some(PathBuf::from("/data/trt_cache")));
        assert_eq!(cfg.models_dir(Path::new("/data")), PathBuf::from("/data/models"));
    }

    #[test]
    fn initialize_creates_and_preserves_config() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("nested");
        initialize_data_dir(&root).expect("initialize data dir");
        assert!(config_path(&root).exists());

        let custom = "[sampling]\nsteps = 12\n";
        fs::write(config_path(&root), custom).unwrap();
        initialize_data_dir(&root).expect("initialize data dir again");
        assert_eq!(fs::read_to_string(config_path(&root)).unwrap(), custom);
        assert_eq!(AppConfig::load_from_path(&config_path(&root)).unwrap().sampling.steps, 12);
    }

    #[test]
    fn resolve_relative_to_paths() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(resolve_relative_to(Path::new("/base"), Path::new("sub")), PathBuf::from("/base/sub"));
    }
}
