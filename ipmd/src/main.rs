//! Infra Patch Manager - request runner
//!
//! Loads configuration, builds the handler registry once, runs one patch
//! request read from a JSON file and prints the outcome as JSON on stdout.
//! Logs go to stderr.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use ipm_common::config::IpmConfig;
use ipm_common::errors::ErrorCode;
use ipm_common::remote::RemoteExecutor;
use ipm_common::remote::RemoteOptions;
use ipm_common::remote::ssh::SshExecutor;
use ipm_common::types::PatchRequest;
use ipm_engine::recorder::{Recorder, Recording};
use ipm_engine::registry::{EngineServices, HandlerRegistry};
use ipm_engine::reporter::EventBus;
use ipm_engine::store::FileStore;
use ipm_engine::version::VersionComparator;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "ipmd")]
#[command(author, version, about = "Infra Patch Manager - patch orchestration runner")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "IPM_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one patch request
    Run {
        /// JSON file holding the PatchRequest
        #[arg(short, long)]
        request: PathBuf,

        /// Route the request through the mock overlay
        #[arg(long)]
        mock: bool,

        /// Override the marker store directory
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Record every remote interaction to this file
        #[arg(long, conflicts_with = "replay")]
        record: Option<PathBuf>,

        /// Serve remote interactions from a recording instead of the network
        #[arg(long)]
        replay: Option<PathBuf>,
    },

    /// Compare two versions; prints -1, 0 or 1
    Compare { a: String, b: String },

    /// Print the JSON schema of a PatchRequest
    Schema,

    /// Describe an error code, e.g. 0x0301003B
    Explain { code: String },
}

fn init_logging(cli: &Cli, config: &IpmConfig) -> WorkerGuard {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("IPM_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(writer))
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(writer))
            .with(filter)
            .init(),
    }
    guard
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (config, env_errors) = IpmConfig::load_with_env(cli.config.as_deref())
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;
    let _log_guard = init_logging(&cli, &config);
    for err in &env_errors {
        warn!("Ignoring environment override: {}", err);
    }

    match &cli.command {
        Commands::Run {
            request,
            mock,
            state_dir,
            record,
            replay,
        } => {
            let mut config = config;
            if *mock {
                config.mock.enabled = true;
            }
            if let Some(dir) = state_dir {
                config.paths.state_dir = dir.clone();
            }
            run(Arc::new(config), request, record.as_deref(), replay.as_deref()).await
        }
        Commands::Compare { a, b } => {
            let ordering = VersionComparator.compare(a, b)?;
            println!(
                "{}",
                match ordering {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schema => {
            let schema = schemars::schema_for!(PatchRequest);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Explain { code } => {
            let Some(code) = ErrorCode::from_code_str(code) else {
                bail!("unknown error code {code}");
            };
            println!("{}", code.entry().format_full());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_request(path: &Path) -> Result<PatchRequest> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading request {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing request {}", path.display()))
}

async fn run(config: Arc<IpmConfig>, request: &Path, record: Option<&Path>, replay: Option<&Path>) -> Result<ExitCode> {
    let request = load_request(request)?;
    info!(
        request_id = %request.request_id,
        target = %request.target_kind,
        operation = %request.operation,
        nodes = request.nodes.len(),
        "Loaded patch request"
    );

    let ssh: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(RemoteOptions::from(&config.timeouts)));
    let recorder = match (record, replay) {
        (Some(_), _) => Some(Arc::new(Recorder::record(ssh.clone()))),
        (None, Some(path)) => Some(Arc::new(Recorder::replay(Recording::load(path)?))),
        (None, None) => None,
    };
    let executor: Arc<dyn RemoteExecutor> = match &recorder {
        Some(recorder) => recorder.clone(),
        None => ssh,
    };

    let store = FileStore::open(&config.paths.state_dir)
        .with_context(|| format!("opening state dir {}", config.paths.state_dir.display()))?;
    debug!(state_dir = %config.paths.state_dir.display(), "Opened marker store");
    let bus = Arc::new(EventBus::default());
    let services = EngineServices {
        executor,
        store: Arc::new(store),
        progress: bus.clone(),
        sink: bus,
    };
    let registry = HandlerRegistry::new(config, services)?;

    let outcome = registry.execute(&request).await;

    if let (Some(path), Some(recorder)) = (record, &recorder) {
        recorder.recording().save(path)?;
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn setup() {
        ipm_common::testing::init_global_test_logging();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "ipmd", "--verbose", "run", "--request", "req.json", "--mock", "--state-dir", "/tmp/ipm",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Commands::Run {
                request,
                mock,
                state_dir,
                record,
                replay,
            } => {
                assert_eq!(request, PathBuf::from("req.json"));
                assert!(mock);
                assert_eq!(state_dir, Some(PathBuf::from("/tmp/ipm")));
                assert!(record.is_none() && replay.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_record_and_replay_are_exclusive() {
        assert!(
            Cli::try_parse_from(["ipmd", "run", "-r", "req.json", "--record", "a.json", "--replay", "b.json"])
                .is_err()
        );
    }

    #[test]
    fn test_json_log_format() {
        let cli = Cli::try_parse_from(["ipmd", "compare", "1.0", "2.0", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_load_request_reads_fixtures() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("req.json");
        let request = PatchRequest::new(
            ipm_common::types::TargetKind::Cell,
            ipm_common::types::Operation::Patch,
            "21.2.11.0.0.220414.1",
            vec!["db01".into()],
            vec!["cel01".into()],
        )
        .with_fixtures(Default::default());
        std::fs::write(&path, serde_json::to_string(&request).unwrap()).unwrap();

        let loaded = load_request(&path).unwrap();
        assert_eq!(loaded.request_id, request.request_id);
        assert!(loaded.is_mock);
    }
}
