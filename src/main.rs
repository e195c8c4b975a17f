mod analysis;
mod analyzer;
mod error;
mod events;
mod indicators;
mod market_data;
mod presets;
mod rate_limiter;
mod report;
mod scheduler;
mod storage_utils;
mod tui;
mod universe;
mod yahoo;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use storage_utils::{AppConfig, AsyncStorageManager};
use tracing_subscriber::EnvFilter;
use universe::UniverseKind;

#[derive(Parser)]
#[command(name = "drop-screener", version)]
#[command(about = "Screen a stock universe for large day-over-day price drops")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Command {
    /// Run the analysis and print the report (default)
    Run,
    /// List the rate limit presets
    Presets,
    /// Interactive dashboard with preset picker and saved results
    Tui,
}

/// Flags layered over `storage/config.json`.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Rate limit preset: aggressive, balanced, conservative, ultra_conservative
    #[arg(short, long, global = true)]
    preset: Option<String>,

    /// Fail on an unknown preset instead of falling back to balanced
    #[arg(long, global = true)]
    strict_preset: bool,

    /// Flag stocks whose change is at or below this percent
    #[arg(short = 't', long, global = true, allow_negative_numbers = true)]
    threshold: Option<f64>,

    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Total attempts per request, including the first
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Headlines per detailed stock
    #[arg(long, global = true)]
    max_news: Option<usize>,

    /// Number of biggest drops that get a detailed section and news
    #[arg(long, global = true)]
    top_n: Option<usize>,

    #[arg(short, long, global = true, value_enum)]
    universe: Option<UniverseKind>,

    /// Ticker CSV with a `Symbol` column, for `--universe csv`
    #[arg(long, global = true)]
    tickers_file: Option<PathBuf>,

    /// Comma-separated symbols, implies `--universe symbols`
    #[arg(short, long, global = true, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Price history to request, e.g. 5d, 1mo, 3mo
    #[arg(long, global = true)]
    history_range: Option<String>,

    /// Directory for the CSV export
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut AppConfig) {
        if let Some(preset) = self.preset {
            config.preset = preset;
        }
        config.strict_preset |= self.strict_preset;
        if let Some(threshold) = self.threshold {
            config.drop_threshold = threshold;
        }
        if self.max_workers.is_some() {
            config.max_workers = self.max_workers;
        }
        if self.max_retries.is_some() {
            config.max_retries = self.max_retries;
        }
        if let Some(max_news) = self.max_news {
            config.max_news = max_news;
        }
        if let Some(top_n) = self.top_n {
            config.top_n = top_n;
        }
        if !self.symbols.is_empty() {
            config.symbols = self.symbols;
            config.universe = UniverseKind::Symbols;
        }
        if let Some(universe) = self.universe {
            config.universe = universe;
        }
        if let Some(path) = self.tickers_file {
            config.tickers_file = path;
        }
        if let Some(range) = self.history_range {
            config.history_range = range;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(secs) = self.timeout {
            config.request_timeout_secs = secs;
        }
    }
}

fn init_tracing(interactive: bool) {
    // Log lines would tear the alternate screen, so the dashboard only logs when asked to.
    if interactive && std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);
    init_tracing(matches!(command, Command::Tui));

    if let Command::Presets = command {
        println!("{}", report::presets_table());
        return Ok(());
    }

    let storage = AsyncStorageManager::new_relative("storage").await?;
    let mut config: AppConfig = storage.load_optional("config").await?.unwrap_or_default();
    cli.overrides.apply(&mut config);

    match command {
        Command::Tui => tui::run_tui(config).await,
        _ => {
            if let Err(e) = run_report(&config, &storage).await {
                tracing::error!(error = %format!("{e:#}"), "analysis aborted");
                return Err(e);
            }
            Ok(())
        }
    }
}

async fn run_report(config: &AppConfig, storage: &AsyncStorageManager) -> anyhow::Result<()> {
    let run = analysis::run_analysis_pipeline(config, storage).await?;
    print!("{}", report::render(&run, config.top_n)?);
    if let Some(path) = report::write_csv(&run, &config.output_dir)? {
        println!("\nResults saved to: {}", path.display());
    }
    Ok(())
}
