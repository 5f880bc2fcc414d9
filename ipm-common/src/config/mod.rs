//! Configuration system for IPM.
//!
//! Configuration is read once per process from an optional TOML file, then
//! overridden by `IPM_*` environment variables. Every phase has its own
//! timeout knob; there is no single global deadline.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser, expand_path};
pub use source::{ConfigSource, Sourced};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default SSH connect timeout when the configured one is outside (0, 120).
pub const DEFAULT_SSH_CONNECT_SECS: u64 = 50;
const MAX_SSH_CONNECT_SECS: u64 = 119;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid pattern in {field}: '{pattern}': {source}")]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpmConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub postcheck: PostcheckConfig,
    #[serde(default)]
    pub mock: MockModeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// SSH connect timeout; values outside (0, 120) fall back to 50.
    #[serde(default = "default_ssh_connect_secs")]
    pub ssh_connect_secs: u64,
    /// Per-command timeout for remote shell commands.
    #[serde(default = "default_shell_command_secs")]
    pub shell_command_secs: u64,
    /// Overall deadline for polling one external tool session.
    #[serde(default = "default_session_poll_secs")]
    pub session_poll_secs: u64,
    /// Sleep between console reads.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ssh_connect_secs: default_ssh_connect_secs(),
            shell_command_secs: default_shell_command_secs(),
            session_poll_secs: default_session_poll_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn ssh_connect(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_secs)
    }

    pub fn shell_command(&self) -> Duration {
        Duration::from_secs(self.shell_command_secs)
    }

    pub fn session_poll(&self) -> Duration {
        Duration::from_secs(self.session_poll_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts for transport operations, including the first.
    #[serde(default = "default_transport_max_attempts")]
    pub transport_max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Checks for the tool's notifications directory after launch.
    #[serde(default = "default_notification_check_attempts")]
    pub notification_check_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transport_max_attempts: default_transport_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            notification_check_attempts: default_notification_check_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Concurrent version probes per request.
    #[serde(default = "default_probe_parallelism")]
    pub probe_parallelism: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            probe_parallelism: default_probe_parallelism(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Remote directory holding the unpacked patch bundle and tool.
    #[serde(default = "default_patch_base")]
    pub patch_base: String,
    /// Local directory for idempotency markers and error records.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Public key on the launch node installed on targets for transient trust.
    #[serde(default = "default_trust_key_path")]
    pub trust_key_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            patch_base: default_patch_base(),
            state_dir: default_state_dir(),
            trust_key_path: default_trust_key_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostcheckConfig {
    /// Alert lines matching any of these patterns are ignored.
    #[serde(default)]
    pub known_alerts: Vec<String>,
    /// Service-check lines matching any of these patterns are ignored.
    #[serde(default)]
    pub known_issues: Vec<String>,
}

impl PostcheckConfig {
    /// Compile `known_alerts` and `known_issues` into one ignore list.
    pub fn ignore_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        let alerts = self.known_alerts.iter().map(|p| ("postcheck.known_alerts", p));
        let issues = self.known_issues.iter().map(|p| ("postcheck.known_issues", p));
        alerts
            .chain(issues)
            .map(|(field, pattern)| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    field,
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockModeConfig {
    /// Route every request through the mock overlay.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level used when neither `--verbose` nor `RUST_LOG` is given.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl IpmConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let parsed: IpmConfig =
                    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                debug!("Loaded configuration from {:?}", path);
                parsed
            }
            None => IpmConfig::default(),
        };
        config.normalize();
        config.postcheck.ignore_patterns()?;
        Ok(config)
    }

    /// Load, then apply `IPM_*` overrides. Env errors are returned rather
    /// than failing so they can all be reported together.
    pub fn load_with_env(path: Option<&Path>) -> Result<(Self, Vec<EnvError>), ConfigError> {
        let mut config = Self::load(path)?;
        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        config.normalize();
        Ok((config, parser.take_errors()))
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        let t = &mut self.timeouts;
        t.ssh_connect_secs = parser
            .get_duration_range(
                "SSH_CONNECT_TIMEOUT",
                t.ssh_connect(),
                Duration::from_secs(1),
                Duration::from_secs(MAX_SSH_CONNECT_SECS),
            )
            .value
            .as_secs();
        t.shell_command_secs = parser
            .get_duration_range(
                "SHELL_TIMEOUT",
                t.shell_command(),
                Duration::from_secs(1),
                Duration::from_secs(24 * 3600),
            )
            .value
            .as_secs();
        t.session_poll_secs = parser
            .get_duration_range(
                "SESSION_TIMEOUT",
                t.session_poll(),
                Duration::from_secs(1),
                Duration::from_secs(7 * 24 * 3600),
            )
            .value
            .as_secs();
        t.poll_interval_secs = parser
            .get_duration_range(
                "POLL_INTERVAL",
                t.poll_interval(),
                Duration::from_secs(1),
                Duration::from_secs(3600),
            )
            .value
            .as_secs();

        self.retry.transport_max_attempts = parser
            .get_u32_range("TRANSPORT_ATTEMPTS", self.retry.transport_max_attempts, 1, 20)
            .value;
        self.mock.enabled = parser.get_bool("MOCK", self.mock.enabled).value;

        let state_dir = parser.get_path("STATE_DIR", &self.paths.state_dir.to_string_lossy());
        if state_dir.is_from_env() {
            self.paths.state_dir = state_dir.value;
        }
        if let Some(base) = parser.get_optional_string("PATCH_BASE").value {
            self.paths.patch_base = base;
        }
        self.logging.level = parser.get_log_level("LOG_LEVEL", &self.logging.level).value;
    }

    /// Clamp values into their accepted ranges.
    pub fn normalize(&mut self) {
        let ssh = self.timeouts.ssh_connect_secs;
        if ssh == 0 || ssh > MAX_SSH_CONNECT_SECS {
            warn!(
                configured = ssh,
                fallback = DEFAULT_SSH_CONNECT_SECS,
                "ssh_connect_secs outside (0, 120), using default"
            );
            self.timeouts.ssh_connect_secs = DEFAULT_SSH_CONNECT_SECS;
        }
        if self.timeouts.poll_interval_secs == 0 {
            self.timeouts.poll_interval_secs = 1;
        }
        self.retry.transport_max_attempts = self.retry.transport_max_attempts.max(1);
        self.retry.jitter = self.retry.jitter.clamp(0.0, 1.0);
        self.filter.probe_parallelism = self.filter.probe_parallelism.max(1);
        self.paths.patch_base = self.paths.patch_base.trim_end_matches('/').to_string();
        if self.paths.patch_base.is_empty() {
            self.paths.patch_base = default_patch_base();
        }
    }
}

fn default_ssh_connect_secs() -> u64 {
    DEFAULT_SSH_CONNECT_SECS
}

fn default_shell_command_secs() -> u64 {
    600
}

fn default_session_poll_secs() -> u64 {
    3 * 3600
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_transport_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_notification_check_attempts() -> u32 {
    5
}

fn default_probe_parallelism() -> usize {
    8
}

fn default_patch_base() -> String {
    "/EXAVMIMAGES/ipm/patch".to_string()
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ipm")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_trust_key_path() -> String {
    "~/.ssh/id_rsa.pub".to_string()
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
