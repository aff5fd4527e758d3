//! # navisound
//!
//! Runs the orchestration endpoint, the client relay, or both in one process,
//! and reads back persisted warn+ logs.

#![deny(unsafe_code)]

mod backend;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use navi_engine::{EngineConfig, NavigationOrchestrator, Orchestrator};
use navi_settings::{expand_home, load_settings, load_settings_from_path, NaviSettings};
use navi_store::{Database, NavigationStore, SqliteStore};
use navi_telemetry::{init_telemetry, LogQuery, SqliteLogSink, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "navisound", about = "NaviSound multi-agent navigation core")]
struct Cli {
    /// Settings file (defaults to `~/.navisound/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Serve the orchestration endpoint (`/agent/stream`).
    Orchestrator,
    /// Serve the client relay.
    Relay,
    /// Both, in one process.
    All,
    /// Print persisted warn+ log records as JSON lines, newest first.
    Logs(LogsArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
struct LogsArgs {
    #[arg(long)]
    level: Option<String>,
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    role: Option<String>,
    /// RFC 3339 lower bound on the record timestamp.
    #[arg(long)]
    since: Option<String>,
    #[arg(long, default_value_t = 100)]
    limit: u32,
}

impl LogsArgs {
    fn query(&self) -> LogQuery {
        LogQuery {
            level: self.level.clone(),
            target: None,
            session_id: self.session.clone(),
            role: self.role.clone(),
            since: self.since.clone(),
            limit: Some(self.limit),
        }
    }
}

fn print_logs(settings: &NaviSettings, args: &LogsArgs) -> Result<usize> {
    let path = expand_home(&settings.logging.log_db_path);
    let sink = SqliteLogSink::new(&path)
        .with_context(|| format!("failed to open log database at {}", path.display()))?;
    let records = sink.query(&args.query()).context("failed to query logs")?;
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(records.len())
}

fn telemetry_config(settings: &NaviSettings) -> TelemetryConfig {
    TelemetryConfig {
        json: settings.logging.json,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: expand_home(&settings.logging.log_db_path),
        ..TelemetryConfig::default()
    }
    .with_level_name(&settings.logging.level)
}

async fn start_orchestrator(
    settings: &NaviSettings,
) -> Result<(Arc<Orchestrator>, navi_server::ServerHandle)> {
    let backend = backend::build(&settings.backend)?;

    let db_path = expand_home(&settings.store.db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open store at {}", db_path.display()))?;
    let store: Arc<dyn NavigationStore> = Arc::new(SqliteStore::new(db));

    let orchestrator = Arc::new(Orchestrator::new(backend, store, EngineConfig::from(settings)));
    let handle = navi_server::start(
        navi_server::ServerConfig::from(&settings.orchestrator),
        Arc::clone(&orchestrator) as Arc<dyn NavigationOrchestrator>,
    )
    .await
    .context("failed to start orchestration endpoint")?;
    Ok((orchestrator, handle))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;

    if let Command::Logs(args) = &cli.command {
        print_logs(&settings, args)?;
        return Ok(());
    }

    let _telemetry = init_telemetry(telemetry_config(&settings));
    tracing::info!(command = ?cli.command, "starting navisound");

    let orchestrator = if matches!(cli.command, Command::Orchestrator | Command::All) {
        Some(start_orchestrator(&settings).await?)
    } else {
        None
    };

    let relay = if matches!(cli.command, Command::Relay | Command::All) {
        Some(
            navi_relay::start(navi_relay::RelayConfig::from(&settings.relay))
                .await
                .context("failed to start relay")?,
        )
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    if let Some(relay) = relay {
        relay.shutdown().await;
    }
    if let Some((orchestrator, handle)) = orchestrator {
        handle.shutdown().await;
        orchestrator.shutdown().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_and_settings() {
        let cli = Cli::parse_from(["navisound", "relay", "--settings", "/tmp/navi.json"]);
        assert_eq!(cli.command, Command::Relay);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/navi.json")));

        let cli = Cli::parse_from(["navisound", "all"]);
        assert_eq!(cli.command, Command::All);
        assert!(cli.settings.is_none());
    }

    #[test]
    fn logs_filters_become_a_query() {
        let cli = Cli::parse_from(["navisound", "logs", "--level", "warn", "--session", "nav_x", "--limit", "5"]);
        let Command::Logs(args) = cli.command else {
            panic!("expected logs subcommand");
        };
        let query = args.query();
        assert_eq!(query.level.as_deref(), Some("warn"));
        assert_eq!(query.session_id.as_deref(), Some("nav_x"));
        assert_eq!(query.limit, Some(5));
        assert!(query.role.is_none());
    }

    #[test]
    fn logs_read_an_empty_database() {
        let mut settings = NaviSettings::default();
        let path = std::env::temp_dir().join(format!("navisound-logs-{}.db", std::process::id()));
        settings.logging.log_db_path = path.to_string_lossy().into_owned();
        let cli = Cli::parse_from(["navisound", "logs"]);
        let Command::Logs(args) = cli.command else {
            panic!("expected logs subcommand");
        };
        assert_eq!(print_logs(&settings, &args).unwrap(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn logging_settings_reach_telemetry() {
        let mut settings = NaviSettings::default();
        settings.logging.level = "debug".into();
        settings.logging.log_to_sqlite = false;
        let config = telemetry_config(&settings);
        assert_eq!(config.log_level, tracing::Level::DEBUG);
        assert!(!config.log_to_sqlite);
    }
}
