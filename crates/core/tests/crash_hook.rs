//! The panic hook is process-global, so each scenario re-runs this test binary
//! as a child with `CCSR_CRASH_CHILD` selecting what the child does.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use ccsr_core::logging::{crash_dir, install_panic_hook, PanicHookInstallPlan};

const CHILD_MODE_ENV: &str = "CCSR_CRASH_CHILD";
const CHILD_DATA_ENV: &str = "CCSR_CRASH_CHILD_DATA_DIR";

fn spawn_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .args(["crash_child", "--exact", "--nocapture"])
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_ENV, data_dir)
        .output()
        .expect("spawn crash child")
}

fn crash_logs(dir: &Path) -> Vec<PathBuf> {
    let mut logs: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| entries.flatten().map(|e| e.path()).collect())
        .unwrap_or_default();
    logs.retain(|p| p.extension().is_some_and(|ext| ext == "log"));
    logs.sort();
    logs
}

/// Child entry point; a no-op when run as part of the normal test pass.
#[test]
fn crash_child() {
    let (Ok(mode), Ok(data_dir)) = (std::env::var(CHILD_MODE_ENV), std::env::var(CHILD_DATA_ENV)) else {
        return;
    };
    let data_dir = PathBuf::from(data_dir);

    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::Installed { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(&data_dir)),
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "panic" => panic!("denoiser returned NaN for tile 3"),
        "blocked" => {
            let dir = crash_dir(&data_dir);
            fs::remove_dir_all(&dir).expect("remove crash dir");
            fs::write(&dir, b"file in the way").expect("block crash dir");
            panic!("panic with blocked crash dir");
        }
        other => panic!("unknown crash child mode: {other}"),
    }
}

#[test]
fn panic_writes_crash_artifact() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let output = spawn_child("panic", data_dir.path());
    assert!(!output.status.success(), "child should have panicked");

    let logs = crash_logs(&crash_dir(data_dir.path()));
    let newest = logs.last().expect("crash artifact written");
    let contents = fs::read_to_string(newest).expect("read crash artifact");
    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("version="));
    assert!(contents.contains("location="));
    assert!(contents.contains("payload=denoiser returned NaN for tile 3"));
    assert!(contents.contains("backtrace_policy="));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("panicked while panicking"));
}

#[test]
fn blocked_crash_dir_warns_without_double_panic() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let output = spawn_child("blocked", data_dir.path());
    assert!(!output.status.success(), "child should have panicked");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("panic with blocked crash dir"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("panicked while panicking"));
}
