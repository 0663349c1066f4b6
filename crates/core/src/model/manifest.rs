//! On-disk checkpoint layout.
//!
//! A CCSR checkpoint is a directory holding a `ccsr.toml` manifest, three ONNX
//! graphs and the raw "empty prompt" conditioning embedding:
//!
//! ```toml
//! name = "real-world_ccsr-fp16"
//! precision = "fp16"
//!
//! [denoiser]
//! file = "denoiser.onnx"
//!
//! [vae_encoder]
//! file = "vae_encoder.onnx"
//!
//! [vae_decoder]
//! file = "vae_decoder.onnx"
//!
//! [embedding]
//! file = "empty_prompt.bin"
//! shape = [1, 77, 1024]
//! dtype = "f32"
//! ```

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::Precision;

pub const MANIFEST_FILE: &str = "ccsr.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphFile {
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingDtype {
    #[default]
    F32,
    F16,
}

impl EmbeddingDtype {
    pub fn element_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }
}

/// Raw little-endian tensor file, `[batch, tokens, channels]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingFile {
    pub file: PathBuf,
    pub shape: [usize; 3],
    #[serde(default)]
    pub dtype: EmbeddingDtype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl EmbeddingFile {
    pub fn byte_len(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.element_size()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<Precision>,
    pub denoiser: GraphFile,
    pub vae_encoder: GraphFile,
    pub vae_decoder: GraphFile,
    pub embedding: EmbeddingFile,
    /// Negative-prompt embedding, only read when guidance is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncond_embedding: Option<EmbeddingFile>,
    #[serde(skip)]
    root: PathBuf,
}

impl ModelManifest {
    /// Load from a checkpoint directory or a direct path to `ccsr.toml`.
    pub fn load(path: &Path) -> Result<Self> {
        let manifest_path = if path.is_dir() {
            path.join(MANIFEST_FILE)
        } else {
            path.to_path_buf()
        };
        let content = fs::read_to_string(&manifest_path)
            .with_context(|| format!("Failed to read model manifest: {}", manifest_path.display()))?;
        let mut manifest: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse model manifest: {}", manifest_path.display()))?;
        manifest.root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        debug!(name = %manifest.name, root = %manifest.root.display(), "Loaded model manifest");
        Ok(manifest)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, file: &Path) -> PathBuf {
        self.root.join(file)
    }

    pub fn denoiser_path(&self) -> PathBuf {
        self.resolve(&self.denoiser.file)
    }

    pub fn vae_encoder_path(&self) -> PathBuf {
        self.resolve(&self.vae_encoder.file)
    }

    pub fn vae_decoder_path(&self) -> PathBuf {
        self.resolve(&self.vae_decoder.file)
    }

    pub fn embedding_path(&self) -> PathBuf {
        self.resolve(&self.embedding.file)
    }

    /// Declared precision, falling back to the `fp16`/`fp32` name convention.
    pub fn declared_precision(&self) -> Precision {
        self.precision
            .unwrap_or_else(|| precision_from_name(&self.name))
    }

    /// Checks every referenced file exists, has the expected size (embeddings)
    /// and matches its configured SHA-256.
    pub fn verify(&self) -> Result<()> {
        let graphs = [
            ("denoiser", &self.denoiser),
            ("vae_encoder", &self.vae_encoder),
            ("vae_decoder", &self.vae_decoder),
        ];
        for (label, graph) in graphs {
            verify_file(label, &self.resolve(&graph.file), graph.sha256.as_deref())?;
        }

        let embeddings = std::iter::once(("embedding", &self.embedding))
            .chain(self.uncond_embedding.as_ref().map(|e| ("uncond_embedding", e)));
        for (label, embedding) in embeddings {
            let path = self.resolve(&embedding.file);
            verify_file(label, &path, embedding.sha256.as_deref())?;
            let actual = fs::metadata(&path)?.len() as usize;
            if actual != embedding.byte_len() {
                bail!(
                    "{label} size mismatch: shape {:?} ({:?}) needs {} bytes, {} has {actual}",
                    embedding.shape,
                    embedding.dtype,
                    embedding.byte_len(),
                    path.display()
                );
            }
        }
        Ok(())
    }
}

fn verify_file(label: &str, path: &Path, expected: Option<&str>) -> Result<()> {
    if !path.is_file() {
        bail!("Model file for {label} not found: {}", path.display());
    }
    match expected {
        Some(expected) => {
            let actual = sha256_file(path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                bail!("SHA256 mismatch for {label}: expected {expected}, got {actual}");
            }
            debug!(file = %path.display(), "Hash verified OK");
        }
        None => debug!(file = %path.display(), "No SHA256 configured; skipping verification"),
    }
    Ok(())
}

pub fn precision_from_name(name: &str) -> Precision {
    let lower = name.to_ascii_lowercase();
    if lower.contains("fp16") {
        Precision::Fp16
    } else if lower.contains("fp32") {
        Precision::Fp32
    } else {
        Precision::Auto
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    /// Directory under the models dir.
    pub dir_name: String,
    pub precision: Precision,
    pub description: String,
    pub builtin: bool,
}

fn builtin_catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry {
            name: "real-world_ccsr-fp16".into(),
            dir_name: "real-world_ccsr-fp16".into(),
            precision: Precision::Fp16,
            description: "CCSR real-world x4 super-resolution, half precision".into(),
            builtin: true,
        },
        CatalogEntry {
            name: "real-world_ccsr-fp32".into(),
            dir_name: "real-world_ccsr-fp32".into(),
            precision: Precision::Fp32,
            description: "CCSR real-world x4 super-resolution, full precision".into(),
            builtin: true,
        },
    ]
}

/// Known checkpoints under one models directory.
pub struct ModelCatalog {
    models_dir: PathBuf,
    entries: Vec<CatalogEntry>,
}

impl ModelCatalog {
    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    /// Adds every subdirectory carrying a readable `ccsr.toml` that is not
    /// already listed.
    pub fn discover(&mut self) -> Result<()> {
        let dir = &self.models_dir;
        if !dir.exists() {
            return Ok(());
        }
        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        let mut found = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            if !path.join(MANIFEST_FILE).is_file() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.entries.iter().any(|e| e.dir_name == dir_name) {
                continue;
            }
            match ModelManifest::load(&path) {
                Ok(manifest) => {
                    info!(name = %manifest.name, dir = %dir_name, "Discovered CCSR checkpoint");
                    found.push(CatalogEntry {
                        precision: manifest.declared_precision(),
                        name: manifest.name,
                        dir_name: dir_name.to_string(),
                        description: "Discovered checkpoint".into(),
                        builtin: false,
                    });
                }
                Err(e) => warn!(dir = %path.display(), error = %e, "Skipping unreadable model manifest"),
            }
        }
        found.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
        self.entries.extend(found);
        Ok(())
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn model_dir(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.dir_name))
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.model_dir(name)
            .map(|dir| dir.join(MANIFEST_FILE).is_file())
            .unwrap_or(false)
    }

    /// Resolves a catalog name or an explicit checkpoint path to a directory.
    pub fn resolve(&self, name_or_path: &str) -> Result<PathBuf> {
        let as_path = Path::new(name_or_path);
        if as_path.join(MANIFEST_FILE).is_file() {
            return Ok(as_path.to_path_buf());
        }
        let Some(dir) = self.model_dir(name_or_path) else {
            bail!("Unknown model: {name_or_path}");
        };
        if !dir.join(MANIFEST_FILE).is_file() {
            bail!(
                "Model {name_or_path} is not installed: expected {} in {}",
                MANIFEST_FILE,
                dir.display()
            );
        }
        Ok(dir)
    }

    pub fn to_json(&self) -> Result<String> {
        let rows: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.name,
                    "precision": e.precision,
                    "description": e.description,
                    "builtin": e.builtin,
                    "installed": self.is_installed(&e.name),
                    "path": self.models_dir.join(&e.dir_name),
                })
            })
            .collect();
        serde_json::to_string_pretty(&rows).context("Failed to serialize model catalog")
    }
}
