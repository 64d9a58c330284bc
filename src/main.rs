use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use settlement_engine::application::engine::SettlementEngine;
use settlement_engine::clock::ManualClock;
use settlement_engine::config::SettlementConfig;
use settlement_engine::domain::ports::KvBackendBox;
use settlement_engine::infrastructure::gateway::RedirectGateway;
use settlement_engine::infrastructure::in_memory::{InMemoryBackend, InMemoryIdentity};
use settlement_engine::interfaces::csv::history_writer::HistoryWriter;
use settlement_engine::interfaces::csv::wallet_writer::WalletWriter;
use settlement_engine::interfaces::scenario::{Scenario, ScenarioRunner};
use settlement_engine::telemetry;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario JSON file to replay
    input: PathBuf,

    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Also export every ledger entry as CSV to this file
    #[arg(long)]
    ledger: Option<PathBuf>,
}

fn open_backend(db_path: Option<PathBuf>) -> Result<KvBackendBox> {
    let Some(db_path) = db_path else {
        return Ok(Box::new(InMemoryBackend::new()));
    };

    #[cfg(feature = "storage-rocksdb")]
    {
        let backend = settlement_engine::infrastructure::rocksdb::RocksDbBackend::open(db_path)
            .into_diagnostic()?;
        Ok(Box::new(backend))
    }
    #[cfg(not(feature = "storage-rocksdb"))]
    {
        tracing::warn!(
            path = %db_path.display(),
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
        Ok(Box::new(InMemoryBackend::new()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SettlementConfig::load_file(path).into_diagnostic()?,
        None => SettlementConfig::default(),
    };
    telemetry::init(&config.log_level);

    let backend = open_backend(cli.db_path)?;
    let identity = InMemoryIdentity::new();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = SettlementEngine::open(
        &config,
        backend,
        Box::new(identity.clone()),
        Box::new(RedirectGateway::new(config.gateway.clone())),
        clock.clone(),
    )
    .await
    .into_diagnostic()?;

    let scenario =
        Scenario::from_reader(File::open(&cli.input).into_diagnostic()?).into_diagnostic()?;
    let mut runner = ScenarioRunner::new(&engine, identity, clock);
    runner.seed(&scenario.seed).await.into_diagnostic()?;

    for command in scenario.commands {
        let op = command.name();
        if let Err(e) = runner.run(command).await {
            tracing::error!(op, kind = ?e.kind(), "Error processing command: {e}");
        }
    }

    if let Some(path) = cli.ledger {
        let mut writer = HistoryWriter::new(File::create(path).into_diagnostic()?);
        writer
            .write_entries(runner.ledger_records().await.into_diagnostic()?)
            .into_diagnostic()?;
    }

    let stdout = io::stdout();
    let mut writer = WalletWriter::new(stdout.lock());
    writer
        .write_wallets(runner.wallet_records().await.into_diagnostic()?)
        .into_diagnostic()?;

    Ok(())
}
