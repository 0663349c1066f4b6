//! ONNX Runtime implementations of the model collaborators.
//!
//! Graph I/O is bound by position, so exported graphs only need to respect
//! the input order:
//!
//! - denoiser: `(latent, timesteps, control, context) -> eps`
//! - VAE encoder: `image -> latent` (unscaled, `[-1, 1]` input)
//! - VAE decoder: `latent -> image` (unscaled, `[-1, 1]` output)
//!
//! Inputs declared as `float16` are converted with `half` on the way in and
//! back to f32 on the way out.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array1, Array3, Array4, ArrayD, ArrayView3, ArrayView4, ArrayViewD, Ix4};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};
use tracing::{debug, info};

use super::backend::{build_session, SessionConfig};
use super::manifest::{EmbeddingDtype, EmbeddingFile, ModelManifest};
use super::{CcsrModel, CheckpointKey, DeviceConfig, ModelLoader, Precision};
use crate::codec::VaeModel;
use crate::step::{Conditioning, Denoiser};

struct GraphPort {
    name: String,
    ty: Option<TensorElementType>,
}

impl GraphPort {
    fn is_fp16(&self) -> bool {
        self.ty == Some(TensorElementType::Float16)
    }
}

/// One ONNX graph behind a mutex; tile calls from the rayon pool serialize here.
struct OrtGraph {
    label: &'static str,
    session: Mutex<Session>,
    inputs: Vec<GraphPort>,
    output: GraphPort,
}

fn port_type(ty: &ValueType) -> Option<TensorElementType> {
    match ty {
        ValueType::Tensor { ty, .. } => Some(*ty),
        _ => None,
    }
}

impl OrtGraph {
    fn open(label: &'static str, path: &Path, device: &DeviceConfig, precision: Precision) -> Result<Self> {
        let session = build_session(&SessionConfig {
            model_path: path,
            backend: &device.backend,
            trt_cache_dir: device.trt_cache_dir.as_deref(),
            fp16: precision == Precision::Fp16,
        })?;

        let inputs: Vec<GraphPort> = session
            .inputs()
            .iter()
            .map(|i| GraphPort {
                name: i.name().to_string(),
                ty: port_type(i.dtype()),
            })
            .collect();
        let output = session
            .outputs()
            .first()
            .map(|o| GraphPort {
                name: o.name().to_string(),
                ty: port_type(o.dtype()),
            })
            .with_context(|| format!("{label} graph declares no outputs"))?;

        debug!(
            graph = label,
            inputs = ?inputs.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            output = %output.name,
            fp16_io = inputs.first().map(GraphPort::is_fp16).unwrap_or(false),
            "Opened ONNX graph"
        );

        Ok(Self {
            label,
            session: Mutex::new(session),
            inputs,
            output,
        })
    }

    fn expect_inputs(&self, count: usize) -> Result<()> {
        if self.inputs.len() != count {
            bail!(
                "{} graph has {} inputs, expected {count}",
                self.label,
                self.inputs.len()
            );
        }
        Ok(())
    }

    fn float_input(&self, index: usize, view: ArrayViewD<'_, f32>) -> Result<DynValue> {
        let owned = view.as_standard_layout().into_owned();
        if self.inputs[index].is_fp16() {
            Ok(Tensor::from_array(to_f16(&owned)?)?.into_dyn())
        } else {
            Ok(Tensor::from_array(owned)?.into_dyn())
        }
    }

    fn timestep_input(&self, index: usize, timestep: usize, batch: usize) -> Result<DynValue> {
        match self.inputs[index].ty {
            Some(TensorElementType::Int64) => {
                Ok(Tensor::from_array(Array1::from_elem(batch, timestep as i64))?.into_dyn())
            }
            Some(TensorElementType::Int32) => {
                Ok(Tensor::from_array(Array1::from_elem(batch, timestep as i32))?.into_dyn())
            }
            _ => self.float_input(index, Array1::from_elem(batch, timestep as f32).into_dyn().view()),
        }
    }

    fn extract(&self, value: &DynValue) -> Result<Array4<f32>> {
        let array = if self.output.is_fp16() {
            let view = value.try_extract_array::<f16>()?;
            from_f16(&view.as_standard_layout().into_owned())?
        } else {
            value.try_extract_array::<f32>()?.to_owned()
        };
        array
            .into_dimensionality::<Ix4>()
            .with_context(|| format!("{} graph output is not rank 4", self.label))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| anyhow!("{} session lock poisoned", self.label))
    }

    fn run_single(&self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        self.expect_inputs(1)?;
        let value = self.float_input(0, input.into_dyn())?;
        let mut session = self.lock()?;
        let outputs = session.run(ort::inputs![self.inputs[0].name.as_str() => value])?;
        self.extract(&outputs[self.output.name.as_str()])
    }
}

fn to_f16(array: &ArrayD<f32>) -> Result<ArrayD<f16>> {
    let src = array
        .as_slice()
        .context("tensor must be contiguous for f16 conversion")?;
    let mut data = vec![f16::ZERO; src.len()];
    data.convert_from_f32_slice(src);
    Ok(ArrayD::from_shape_vec(array.shape().to_vec(), data)?)
}

fn from_f16(array: &ArrayD<f16>) -> Result<ArrayD<f32>> {
    let src = array
        .as_slice()
        .context("tensor must be contiguous for f32 conversion")?;
    let mut data = vec![0.0f32; src.len()];
    src.convert_to_f32_slice(&mut data);
    Ok(ArrayD::from_shape_vec(array.shape().to_vec(), data)?)
}

pub struct OrtDenoiser {
    graph: OrtGraph,
}

impl OrtDenoiser {
    pub fn open(path: &Path, device: &DeviceConfig, precision: Precision) -> Result<Self> {
        let graph = OrtGraph::open("denoiser", path, device, precision)?;
        graph.expect_inputs(4)?;
        Ok(Self { graph })
    }
}

impl Denoiser for OrtDenoiser {
    fn predict_noise(
        &self,
        latent: ArrayView4<'_, f32>,
        timestep: usize,
        condition: ArrayView4<'_, f32>,
        context: ArrayView3<'_, f32>,
    ) -> Result<Array4<f32>> {
        let batch = latent.dim().0;
        let (_, tokens, channels) = context.dim();
        let context = context
            .broadcast((batch, tokens, channels))
            .with_context(|| format!("context batch {} cannot cover latent batch {batch}", context.dim().0))?;

        let g = &self.graph;
        let x = g.float_input(0, latent.into_dyn())?;
        let t = g.timestep_input(1, timestep, batch)?;
        let control = g.float_input(2, condition.into_dyn())?;
        let ctx = g.float_input(3, context.into_dyn())?;

        let mut session = g.lock()?;
        let outputs = session.run(ort::inputs![
            g.inputs[0].name.as_str() => x,
            g.inputs[1].name.as_str() => t,
            g.inputs[2].name.as_str() => control,
            g.inputs[3].name.as_str() => ctx,
        ])?;
        g.extract(&outputs[g.output.name.as_str()])
    }
}

pub struct OrtVae {
    encoder: OrtGraph,
    decoder: OrtGraph,
}

impl OrtVae {
    pub fn open(encoder: &Path, decoder: &Path, device: &DeviceConfig, precision: Precision) -> Result<Self> {
        Ok(Self {
            encoder: OrtGraph::open("vae_encoder", encoder, device, precision)?,
            decoder: OrtGraph::open("vae_decoder", decoder, device, precision)?,
        })
    }
}

impl VaeModel for OrtVae {
    fn encode(&self, image: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        self.encoder.run_single(image)
    }

    fn decode(&self, latent: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        self.decoder.run_single(latent)
    }
}

/// Decodes a raw little-endian embedding into `[batch, tokens, channels]`.
pub fn parse_embedding(bytes: &[u8], layout: &EmbeddingFile) -> Result<Array3<f32>> {
    if bytes.len() != layout.byte_len() {
        bail!(
            "embedding has {} bytes, shape {:?} ({:?}) needs {}",
            bytes.len(),
            layout.shape,
            layout.dtype,
            layout.byte_len()
        );
    }
    let values: Vec<f32> = match layout.dtype {
        EmbeddingDtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        EmbeddingDtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
    };
    let [b, t, c] = layout.shape;
    Ok(Array3::from_shape_vec((b, t, c), values)?)
}

pub fn load_embedding(manifest: &ModelManifest, layout: &EmbeddingFile) -> Result<Array3<f32>> {
    let path = manifest.resolve(&layout.file);
    let bytes = std::fs::read(&path).with_context(|| format!("Failed to read embedding: {}", path.display()))?;
    parse_embedding(&bytes, layout).with_context(|| format!("Invalid embedding file: {}", path.display()))
}

/// Loads checkpoints laid out per [`ModelManifest`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtModelLoader;

impl ModelLoader for OrtModelLoader {
    fn load(&self, key: &CheckpointKey, device: &DeviceConfig) -> Result<CcsrModel> {
        let manifest = ModelManifest::load(&key.path)?;
        manifest.verify()?;

        let declared = manifest.declared_precision();
        if declared != Precision::Auto && declared != key.precision {
            info!(
                model = %manifest.name,
                declared = %declared,
                requested = %key.precision,
                "Requested precision differs from checkpoint; graph I/O types decide conversions"
            );
        }

        let context = load_embedding(&manifest, &manifest.embedding)?;
        let mut conditioning = Conditioning::new(context);
        if let Some(uncond) = &manifest.uncond_embedding {
            conditioning = conditioning.with_uncond(load_embedding(&manifest, uncond)?);
        }

        let denoiser = OrtDenoiser::open(&manifest.denoiser_path(), device, key.precision)?;
        let vae = OrtVae::open(
            &manifest.vae_encoder_path(),
            &manifest.vae_decoder_path(),
            device,
            key.precision,
        )?;

        Ok(CcsrModel {
            denoiser: Box::new(denoiser),
            vae: Box::new(vae),
            conditioning,
        })
    }
}
