//! Per-test JSONL logs.
//!
//! With `IPM_TEST_LOGGING=1` (or `CI` set) every [`test_guard!`] writes its
//! test's phases to `target/test-logs/<test>.jsonl`; engine tracing output is
//! captured by the test harness either way.

use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
}

static INIT: Once = Once::new();

/// Route engine tracing through the test writer. Idempotent.
///
/// `IPM_TEST_LOG_LEVEL` sets the level for the ipm crates (default `info`).
pub fn init_global_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var("IPM_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "ipm_engine={level},ipmd={level},ipm_common={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .compact()
            .try_init();
    });
}

fn enabled() -> bool {
    match std::env::var("IPM_TEST_LOGGING").as_deref() {
        Ok("1" | "true") => true,
        Ok("0" | "false") => false,
        _ => std::env::var("CI").is_ok(),
    }
}

fn log_dir() -> PathBuf {
    std::env::var("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target"))
        .join("test-logs")
}

struct Sink {
    test: String,
    started: Instant,
    file: Mutex<File>,
}

/// Logs the test's phases; records pass or fail when dropped.
pub struct TestGuard {
    sink: Option<Sink>,
}

impl TestGuard {
    pub fn new(test: &str) -> Self {
        let sink = enabled()
            .then(|| {
                let dir = log_dir();
                std::fs::create_dir_all(&dir).ok()?;
                let file = File::create(dir.join(format!("{test}.jsonl"))).ok()?;
                Some(Sink {
                    test: test.to_string(),
                    started: Instant::now(),
                    file: Mutex::new(file),
                })
            })
            .flatten();
        let guard = Self { sink };
        guard.log(TestPhase::Setup, "TEST START");
        guard
    }

    pub fn log(&self, phase: TestPhase, message: &str) {
        self.write(phase, message, None);
    }

    pub fn log_with_data(&self, phase: TestPhase, message: &str, data: serde_json::Value) {
        self.write(phase, message, Some(data));
    }

    fn write(&self, phase: TestPhase, message: &str, data: Option<serde_json::Value>) {
        let Some(sink) = &self.sink else {
            return;
        };
        let elapsed_ms = sink.started.elapsed().as_millis() as u64;
        let line = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "test": sink.test,
            "phase": phase,
            "message": message,
            "elapsed_ms": elapsed_ms,
            "data": data,
        });
        if let Ok(mut file) = sink.file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        let verdict = if std::thread::panicking() { "TEST FAIL" } else { "TEST PASS" };
        self.log(TestPhase::Verify, verdict);
    }
}

/// Create a [`TestGuard`] named after the enclosing function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}
