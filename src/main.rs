use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use race_signals::extract::extract_batch;
use race_signals::loader::{load_history, write_extraction};
use race_signals::scorer::assess;
use race_signals::server::{build_index, serve, AppState};
use race_signals::source::JsonSessionDir;
use race_signals::{AppConfig, SignalKind};

#[derive(Parser, Debug)]
#[command(name = "race_signals", version, about = "Tire cliff, undercut and overtake risk signals")]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true, env = "RACE_SIGNALS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the streaming and query server
    Serve {
        /// Load each signal's historical CSVs from this directory before serving
        #[arg(long)]
        preload: Option<PathBuf>,
    },
    /// Detect events in recorded sessions and write per-year CSVs
    Extract {
        kind: SignalKind,
        #[arg(long, default_value = "./sessions")]
        data_dir: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Normalize per-year CSVs and upload them to the index
    Load {
        kind: SignalKind,
        #[arg(long, default_value = ".")]
        input_dir: PathBuf,
    },
    /// Score one vector against the index
    Query {
        kind: SignalKind,
        #[arg(long, value_delimiter = ',', num_args = 1.., required = true)]
        vector: Vec<f32>,
        #[arg(long, default_value = "MY_CAR")]
        driver: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Load historical CSVs first (useful with the in-memory index)
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("race_signals=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::resolve(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Serve { preload } => {
            let state = AppState::from_config(config)?;
            if let Some(dir) = preload {
                for kind in SignalKind::ALL {
                    let years = &state.config.signal(kind).years;
                    match load_history(state.indexes.get(kind), &dir, years).await {
                        Ok(r) => tracing::info!("preloaded {} {kind} vectors in {} batches", r.records, r.batches),
                        Err(e) => tracing::warn!("no {kind} history preloaded: {e}"),
                    }
                }
            }
            serve(state).await
        }
        Command::Extract { kind, data_dir, out_dir } => run_extract(&config, kind, &data_dir, &out_dir),
        Command::Load { kind, input_dir } => {
            let index = build_index(&config, kind)?;
            let report = load_history(&index, &input_dir, &config.signal(kind).years)
                .await
                .with_context(|| format!("failed to load {kind} history from {}", input_dir.display()))?;
            println!(
                "uploaded {} {kind} vectors from {} files in {} batches",
                report.records, report.files_read, report.batches
            );
            Ok(())
        }
        Command::Query { kind, vector, driver, top_k, history } => {
            let index = build_index(&config, kind)?;
            if let Some(dir) = history {
                load_history(&index, &dir, &config.signal(kind).years)
                    .await
                    .with_context(|| format!("failed to load {kind} history from {}", dir.display()))?;
            }
            let top_k = top_k.unwrap_or(config.signal(kind).top_k);
            let result = assess(&index, &vector, top_k, &driver, &config.scoring.params())
                .await
                .with_context(|| format!("{kind} query failed"))?;

            println!("Top {} similar {kind} scenarios:", result.matches.len());
            for m in &result.matches {
                match &m.metadata {
                    Some(meta) => println!(
                        "  {} score={:.3} {} {} {} lap {}",
                        m.id, m.score, meta.driver, meta.track_name, meta.year, meta.lap_number
                    ),
                    None => println!("  {} score={:.3}", m.id, m.score),
                }
            }
            println!("{}", serde_json::to_string_pretty(&result.summary)?);
            Ok(())
        }
    }
}

fn run_extract(config: &AppConfig, kind: SignalKind, data_dir: &Path, out_dir: &Path) -> anyhow::Result<()> {
    let sig = config.signal(kind);
    let source = JsonSessionDir::new(data_dir);
    let report = extract_batch(
        &source,
        kind,
        &sig.years,
        &sig.tracks,
        &config.extraction.track_encoder(),
        &config.extraction.params(),
    );
    let written = write_extraction(&report, kind, out_dir)
        .with_context(|| format!("failed to write {kind} CSVs to {}", out_dir.display()))?;
    println!(
        "{} {kind} events, {} sessions skipped, {} files written",
        report.records.len(),
        report.skipped(),
        written.len()
    );
    Ok(())
}
