use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use ndarray::{s, Array4, ArrayView3};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use ccsr_core::color::ColorFixMode;
use ccsr_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use ccsr_core::logging::{self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER};
use ccsr_core::model::manifest::ModelCatalog;
use ccsr_core::model::onnx::OrtModelLoader;
use ccsr_core::model::{InferenceBackend, ModelHandle, Precision};
use ccsr_core::observer::{ProgressCallback, WatchObserver};
use ccsr_core::pipeline::{upscale, Collaborators, UpscaleOutput, UpscaleParams};
use ccsr_core::resample::ResampleKernel;
use ccsr_core::runtime::{log_runtime_lib_status, setup_runtime_libs};
use ccsr_core::sampler::SamplingStrategy;
use ccsr_core::CcsrError;

const OUTPUT_SUFFIX: &str = "_ccsr";

#[derive(Parser)]
#[command(name = "ccsr", about = "Tiled diffusion super-resolution with CCSR")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale a batch of same-sized PNG images.
    Upscale(UpscaleArgs),
    /// List known checkpoints and whether they are installed.
    Models(ModelsArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(required = true, help = "Input images; all must share one size")]
    inputs: Vec<PathBuf>,
    #[arg(short = 'o', long, help = "Output directory")]
    output: PathBuf,
    #[arg(long, help = "Catalog name or checkpoint directory (defaults to paths.default_model)")]
    model: Option<String>,
    #[arg(long, help = "Execution backend: cuda, tensorrt or cpu")]
    backend: Option<String>,
    #[arg(long, help = "Graph precision: auto, fp16 or fp32")]
    precision: Option<String>,
    #[command(flatten)]
    sampling: SamplingOverrides,
}

/// Per-run overrides on top of the `[sampling]` config section.
#[derive(Args, Debug, Default)]
struct SamplingOverrides {
    #[arg(long)]
    scale_by: Option<f64>,
    #[arg(long)]
    resize_method: Option<ResampleKernel>,
    #[arg(long)]
    steps: Option<usize>,
    #[arg(long)]
    t_max: Option<f64>,
    #[arg(long)]
    t_min: Option<f64>,
    #[arg(long)]
    sampling_method: Option<SamplingStrategy>,
    #[arg(long)]
    tile_size: Option<usize>,
    #[arg(long)]
    tile_stride: Option<usize>,
    #[arg(long)]
    vae_tile_size_encode: Option<usize>,
    #[arg(long)]
    vae_tile_size_decode: Option<usize>,
    #[arg(long)]
    color_fix: Option<ColorFixMode>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    guidance_scale: Option<f32>,
    #[arg(long, help = "Keep weights resident after the run")]
    keep_model_loaded: bool,
}

impl SamplingOverrides {
    fn apply(&self, mut params: UpscaleParams) -> UpscaleParams {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field.clone() {
                    params.$field = value;
                })*
            };
        }
        set!(
            scale_by,
            resize_method,
            steps,
            t_max,
            t_min,
            sampling_method,
            tile_size,
            tile_stride,
            vae_tile_size_encode,
            vae_tile_size_decode,
            color_fix,
            seed,
            guidance_scale
        );
        if self.keep_model_loaded {
            params.keep_model_loaded = true;
        }
        params
    }
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, help = "Print the catalog as JSON")]
    json: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = setup_runtime_libs(Some(&resolved_data_dir));
    init_logging(Some(resolved_data_dir.as_path()), cli.verbose, cli.log_filter.as_deref());
    log_startup_metadata(&resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&resolved_data_dir);

    match cli.command {
        Commands::Upscale(args) => {
            let backend = args
                .backend
                .as_deref()
                .map(InferenceBackend::from_str_lossy)
                .unwrap_or_else(|| config.device.backend.clone());
            log_runtime_lib_status(&runtime_libs, &backend);
            run_upscale(args, config, backend, resolved_data_dir).await
        }
        Commands::Models(args) => list_models(&config, &resolved_data_dir, args.json),
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&console_filter, "console"));

    let result = match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&file_filter, "file"));
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(console_layer).with(file_layer),
            )
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            eprintln!(
                "Warning: file logging disabled (path: {attempted_log_dir}; reason: {reason}). Logging to console only."
            );
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(console_layer))
        }
    };

    if let Err(error) = result {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn catalog(config: &AppConfig, data_dir: &Path) -> Result<ModelCatalog> {
    let mut catalog = ModelCatalog::with_builtin_models(config.models_dir(data_dir));
    catalog.discover()?;
    Ok(catalog)
}

fn list_models(config: &AppConfig, data_dir: &Path, json: bool) -> Result<()> {
    let catalog = catalog(config, data_dir)?;
    if json {
        println!("{}", catalog.to_json()?);
        return Ok(());
    }

    println!("Models in {}", catalog.models_dir().display());
    for entry in catalog.list() {
        let marker = if catalog.is_installed(&entry.name) {
            "installed"
        } else {
            "missing"
        };
        let default = if entry.name == config.paths.default_model {
            " (default)"
        } else {
            ""
        };
        println!(
            "  {:<28} {:<5} {:<9} {}{}",
            entry.name,
            entry.precision.to_string(),
            marker, entry.description, default
        );
    }
    Ok(())
}

async fn run_upscale(
    args: UpscaleArgs,
    config: AppConfig,
    backend: InferenceBackend,
    data_dir: PathBuf,
) -> Result<()> {
    let params = args.sampling.apply(config.sampling.clone());
    params.validate().context("Invalid sampling parameters")?;

    let mut device = config.device_config(&data_dir);
    device.backend = backend;
    if let Some(precision) = args.precision.as_deref() {
        device.precision = Precision::from_str_lossy(precision);
    }

    let model_name = args
        .model
        .clone()
        .unwrap_or_else(|| config.paths.default_model.clone());
    let checkpoint = catalog(&config, &data_dir)?.resolve(&model_name)?;

    let images = load_batch(&args.inputs)?;
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create output directory: {}", args.output.display()))?;

    info!(
        model = %checkpoint.display(),
        backend = %device.backend,
        images = args.inputs.len(),
        strategy = %params.sampling_method,
        steps = params.steps,
        "Upscaling"
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current image");
            let _ = cancel_tx.send(true);
        }
    });
    let observer = WatchObserver::new(cancel_rx).with_progress(make_progress_callback());

    let started = Instant::now();
    let output: UpscaleOutput = tokio::task::spawn_blocking(move || -> Result<UpscaleOutput> {
        let handle = ModelHandle::load(Arc::new(OrtModelLoader), &checkpoint, device)?;
        Ok(upscale(&handle, images.view(), &params, &Collaborators::default(), &observer)?)
    })
    .await
    .context("Upscale task failed to complete")??;
    eprintln!();

    for (i, input) in args.inputs.iter().take(output.completed).enumerate() {
        let path = output_path(&args.output, input);
        save_image(output.images.slice(s![i, .., .., ..]), &path)?;
        info!(path = %path.display(), "Wrote image");
    }

    if output.interrupted {
        return Err(CcsrError::Interrupted {
            completed: output.completed,
            total: output.total,
        }
        .into());
    }
    info!(
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Upscale completed successfully"
    );
    Ok(())
}

/// Loads PNGs into one `[B, 3, H, W]` batch in `[0, 1]`.
fn load_batch(paths: &[PathBuf]) -> Result<Array4<f32>> {
    let mut decoded = Vec::with_capacity(paths.len());
    for path in paths {
        let img = image::open(path)
            .with_context(|| format!("Failed to read image: {}", path.display()))?
            .to_rgb8();
        decoded.push(img);
    }
    let Some(first) = decoded.first() else {
        bail!("No input images given");
    };
    let (width, height) = first.dimensions();
    for (img, path) in decoded.iter().zip(paths) {
        if img.dimensions() != (width, height) {
            bail!(
                "Batch images must share one size: {} is {}x{}, expected {}x{}",
                path.display(),
                img.width(),
                img.height(),
                width,
                height
            );
        }
    }

    let mut batch = Array4::zeros((decoded.len(), 3, height as usize, width as usize));
    for (n, img) in decoded.iter().enumerate() {
        for (x, y, pixel) in img.enumerate_pixels() {
            for c in 0..3 {
                batch[[n, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }
    }
    Ok(batch)
}

fn save_image(image: ArrayView3<'_, f32>, path: &Path) -> Result<()> {
    let (channels, height, width) = image.dim();
    if channels != 3 {
        bail!("Expected 3 channels, got {channels}");
    }
    let mut raw = Vec::with_capacity(height * width * 3);
    for y in 0..height {
        for x in 0..width {
            for c in 0..3 {
                raw.push((image[[c, y, x]].clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
    }
    let rgb = image::RgbImage::from_raw(width as u32, height as u32, raw)
        .context("Output buffer does not match image dimensions")?;
    rgb.save(path)
        .with_context(|| format!("Failed to write image: {}", path.display()))
}

fn output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    output_dir.join(format!("{stem}{OUTPUT_SUFFIX}.png"))
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn progress_line(completed: usize, total: usize, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (completed as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar: String = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));

    let eta = if completed > 0 && completed < total {
        let per_image = elapsed / completed as f64;
        format!(" | ETA: {}", format_duration(per_image * (total - completed) as f64))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Image {}/{} | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        completed,
        total,
        format_duration(elapsed),
        eta
    )
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    Box::new(move |completed, total| {
        let elapsed = start.elapsed().as_secs_f64();
        eprint!("\r{}    ", progress_line(completed, total, elapsed));
    })
}
