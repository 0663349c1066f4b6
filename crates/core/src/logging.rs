//! Tracing setup pieces shared by binaries: filter selection, the rolling
//! file sink and the panic hook that leaves crash artifacts on disk.
//!
//! Everything here returns a *plan* instead of installing a subscriber, so
//! the binary decides how layers are composed.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime is chatty at info; keep it quiet unless asked.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
/// The file sink keeps ORT warnings (EP fallbacks, TensorRT rebuilds).
pub const FILE_NOISE_FILTER: &str = "ort=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "ccsr";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl LoggingInitOptions {
    /// Noise directives are only prepended when the user did not pick a
    /// level explicitly.
    fn is_implicit(&self) -> bool {
        self.cli_log_filter.is_none() && self.verbose == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed { crash_dir: PathBuf },
    AlreadyInstalled { crash_dir: PathBuf },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Filter priority: CLI filter, then `-v` count, then `RUST_LOG`, then the
/// default.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else {
        match options.verbose {
            0 => options
                .rust_log_env
                .clone()
                .unwrap_or_else(|| options.default_log_filter.clone()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    let (console_filter, file_filter) = if options.is_implicit() {
        (
            format!("{DEFAULT_NOISE_FILTER},{user_filter}"),
            format!("{FILE_NOISE_FILTER},{user_filter}"),
        )
    } else {
        (user_filter.clone(), user_filter.clone())
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(DEFAULT_LOG_DIR_NAME)
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(DEFAULT_CRASH_DIR_NAME)
}

/// Daily-rotating `ccsr.*.log` files under `<data_dir>/logs`.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = log_dir(data_dir);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Chains a hook that writes `panic-*.log` into `<data_dir>/logs/crash`
/// before the previous hook runs. Installs at most once per process.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = crash_dir(data_dir);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)",
                "<disabled by backtrace policy>".to_string(),
            ),
            _ => ("unsupported", "<backtrace unavailable>".to_string()),
        };

        Self {
            timestamp: chrono::Utc::now(),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: panic_payload_to_string(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));

        let mut file = fs::File::create(&path)?;
        writeln!(file, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(file, "version={}", env!("CARGO_PKG_VERSION"))?;
        writeln!(file, "thread={}", self.thread_name)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "payload={}", self.payload)?;
        writeln!(file, "backtrace_policy={}", self.backtrace_policy)?;
        writeln!(file, "backtrace:")?;
        writeln!(file, "{}", self.backtrace)?;
        file.flush()?;
        Ok(path)
    }
}

fn record_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic inside the hook must not recurse into it.
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let written = panic::catch_unwind(panic::AssertUnwindSafe(|| CrashReport::capture(info).write_to(crash_dir)));
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_filter_overrides_verbose_and_env() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("ccsr_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };
        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "ccsr_core=trace");
        assert_eq!(filters.console_filter, "ccsr_core=trace");
        assert_eq!(filters.file_filter, "ccsr_core=trace");
    }

    #[test]
    fn verbose_count_maps_to_levels() {
        for (verbose, expected) in [(1, "debug"), (2, "trace"), (5, "trace")] {
            let options = LoggingInitOptions {
                verbose,
                rust_log_env: Some("warn".to_string()),
                ..Default::default()
            };
            let filters = compose_logging_filters(&options);
            assert_eq!(filters.user_filter, expected);
            assert_eq!(filters.console_filter, expected);
        }
    }

    #[test]
    fn implicit_selection_adds_noise_filters() {
        let filters = compose_logging_filters(&LoggingInitOptions::default());
        assert_eq!(filters.user_filter, "info");
        assert_eq!(filters.console_filter, "ort=error,info");
        assert_eq!(filters.file_filter, "ort=warn,info");

        let from_env = compose_logging_filters(&LoggingInitOptions {
            rust_log_env: Some("warn,ccsr_core=debug".to_string()),
            ..Default::default()
        });
        assert_eq!(from_env.console_filter, "ort=error,warn,ccsr_core=debug");
    }

    #[test]
    fn file_sink_lives_under_data_dir() {
        let dir = tempdir().unwrap();
        let plan = build_file_sink_plan(&LoggingInitOptions {
            data_dir: Some(dir.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        });
        assert!(plan.is_ready());
        assert_eq!(plan.log_dir(), Some(dir.path().join("logs").as_path()));
        assert!(plan.fallback_reason().is_none());
    }

    #[test]
    fn file_sink_falls_back_without_data_dir() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());
        assert!(plan.fallback_reason().unwrap().contains("data_dir"));
    }

    #[test]
    fn file_sink_falls_back_when_log_dir_is_a_file() {
        let blocker = NamedTempFile::new().unwrap();
        let plan = build_file_sink_plan(&LoggingInitOptions {
            data_dir: Some(blocker.path().to_path_buf()),
            ..Default::default()
        });
        assert!(!plan.is_ready());
        assert!(plan.fallback_reason().unwrap().contains("log directory"));
    }

    #[test]
    fn crash_report_file_has_all_sections() {
        let dir = tempdir().unwrap();
        let report = CrashReport {
            timestamp: chrono::Utc::now(),
            thread_name: "rayon-worker-3".to_string(),
            location: "src/sampler.rs:10:5".to_string(),
            payload: "tile blend failed".to_string(),
            backtrace_policy: "captured",
            backtrace: "frame-0".to_string(),
        };
        let path = report.write_to(&crash_dir(dir.path())).unwrap();
        let contents = fs::read_to_string(path).unwrap();
        for needle in [
            "timestamp_utc=",
            "version=",
            "thread=rayon-worker-3",
            "location=src/sampler.rs:10:5",
            "payload=tile blend failed",
            "backtrace_policy=captured",
            "backtrace:\nframe-0",
        ] {
            assert!(contents.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn crash_report_write_fails_on_unwritable_dir() {
        let blocker = NamedTempFile::new().unwrap();
        let report = CrashReport {
            timestamp: chrono::Utc::now(),
            thread_name: "main".to_string(),
            location: "<unknown>".to_string(),
            payload: "x".to_string(),
            backtrace_policy: "unsupported",
            backtrace: String::new(),
        };
        assert!(report.write_to(&blocker.path().join("crash")).is_err());
    }

    #[test]
    fn panic_payload_to_string_handles_common_payloads() {
        let static_str: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_payload_to_string(static_str.as_ref()), "static");
        assert_eq!(panic_payload_to_string(owned.as_ref()), "owned");
        assert_eq!(panic_payload_to_string(other.as_ref()), "<non-string panic payload>");
    }
}
