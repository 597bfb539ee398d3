mod render;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cdash_core::{Reconcile, Run, RunUpdate, TestRecord};
use cdash_stream::{
    DetailsSession, HttpTransport, LogSourceInfo, ResourceKind, RetryAction, SessionBootstrap,
    StreamConfig,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::render::Printer;

#[derive(Parser)]
#[command(name = "cdash")]
#[command(about = "Follow CI builds and jobs as they run", long_about = None)]
struct Cli {
    /// Dashboard base URL (overrides CDASH_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live updates for a build or job
    Watch {
        kind: KindArg,
        id: String,
        /// JSON snapshot of the details view to start from
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Log window per source, in characters
        #[arg(long)]
        log_buffer_chars: Option<usize>,
        #[arg(long, default_value_t = false)]
        no_logs: bool,
        #[arg(long, default_value_t = false)]
        no_reconnect: bool,
    },
    /// Retry a build or job and print the new build's link
    Retry { kind: KindArg, id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Build,
    Job,
}

impl From<KindArg> for ResourceKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Build => ResourceKind::Build,
            KindArg::Job => ResourceKind::Job,
        }
    }
}

/// Shape of the details endpoint payload.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    build: Run,
    #[serde(default)]
    test_groups: Vec<TestRecord>,
    #[serde(default)]
    test_failures: Vec<TestRecord>,
    #[serde(default)]
    logs: Vec<LogSourceInfo>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = StreamConfig::from_env();
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url.clone());
    }

    match cli.command {
        Commands::Watch {
            kind,
            id,
            snapshot,
            log_buffer_chars,
            no_logs,
            no_reconnect,
        } => {
            if let Some(chars) = log_buffer_chars {
                config.log_buffer_chars = chars.max(1);
            }
            if no_reconnect {
                config.reconnect = false;
            }
            let bootstrap = load_bootstrap(kind.into(), &id, snapshot.as_ref())?;
            watch(bootstrap, &config, !no_logs).await
        }
        Commands::Retry { kind, id } => {
            let action = RetryAction::new(config.base_url.clone());
            let navigation = action
                .retry(kind.into(), &id)
                .await
                .with_context(|| format!("Failed to retry {} {id}", ResourceKind::from(kind)))?;
            println!("{}", navigation.link);
            Ok(())
        }
    }
}

fn load_bootstrap(
    kind: ResourceKind,
    id: &str,
    snapshot: Option<&PathBuf>,
) -> Result<SessionBootstrap> {
    let Some(path) = snapshot else {
        let record = Run::from_update(&RunUpdate {
            id: id.to_string(),
            ..RunUpdate::default()
        });
        return Ok(SessionBootstrap::new(kind, record));
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
    if snapshot.build.id != id {
        bail!(
            "snapshot is for {} {}, not {id}",
            kind.noun(),
            snapshot.build.id
        );
    }

    let mut bootstrap = SessionBootstrap::new(kind, snapshot.build);
    bootstrap.test_groups = snapshot.test_groups;
    bootstrap.test_failures = snapshot.test_failures;
    bootstrap.log_sources = snapshot.logs;
    Ok(bootstrap)
}

async fn watch(bootstrap: SessionBootstrap, config: &StreamConfig, show_logs: bool) -> Result<()> {
    let (mut session, mut changes) =
        DetailsSession::start(bootstrap, Arc::new(HttpTransport::new()), config);
    let mut diagnostics = session.diagnostics();
    let mut printer = Printer::new(show_logs);
    info!(event = "watch_started", url = %session.url());

    loop {
        tokio::select! {
            change = changes.recv() => {
                let Some(change) = change else { break };
                for line in printer.lines(&change) {
                    println!("{line}");
                }
            }
            diagnostic = diagnostics.recv() => {
                if let Ok(diagnostic) = diagnostic {
                    warn!(event = "watch_diagnostic", url = %diagnostic.url(), detail = ?diagnostic);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(event = "watch_interrupted");
                break;
            }
        }
    }

    session.teardown();
    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CDASH_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
