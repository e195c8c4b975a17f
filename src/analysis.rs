//! The end-to-end run: config -> universe -> analysis -> saved results.

use crate::analyzer::{AnalysisParams, AnalysisRun, DropAnalyzer};
use crate::error::ConfigError;
use crate::events::TracingSink;
use crate::presets::{Preset, RateLimitConfig};
use crate::storage_utils::{AppConfig, AsyncStorageManager};
use crate::universe::{SymbolList, TickerCsv, UniverseKind, UniverseSource, WikipediaSp500, load_universe};
use crate::yahoo::YahooClient;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

pub const RESULTS_FILE: &str = "results";

/// Picks the preset named in the config, applies overrides and validates.
/// The drop threshold is checked here too, since a NaN would flag nothing.
pub fn resolve_limits(config: &AppConfig) -> Result<(Preset, RateLimitConfig), ConfigError> {
    if !config.drop_threshold.is_finite() {
        return Err(ConfigError::Threshold(config.drop_threshold));
    }
    let preset = if config.strict_preset {
        Preset::parse_strict(&config.preset)?
    } else {
        Preset::parse_lenient(&config.preset)
    };
    let limits = preset
        .config()
        .with_max_workers(config.max_workers)
        .with_max_retries(config.max_retries);
    limits.validate()?;
    Ok((preset, limits))
}

fn universe_source(config: &AppConfig, timeout: Duration) -> Result<Box<dyn UniverseSource>> {
    Ok(match config.universe {
        UniverseKind::Sp500 => {
            let client = reqwest::Client::builder()
                .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
                .timeout(timeout)
                .build()?;
            Box::new(WikipediaSp500::new(client))
        }
        UniverseKind::Csv => Box::new(TickerCsv::new(&config.tickers_file)),
        UniverseKind::Symbols => Box::new(SymbolList::new(&config.symbols)),
    })
}

/// Runs the full analysis and saves it to `storage/results.json`.
///
/// Configuration and universe problems abort before any market data is
/// requested. Per-symbol failures never abort; they end up in the run summary.
pub async fn run_analysis_pipeline(config: &AppConfig, storage: &AsyncStorageManager) -> Result<AnalysisRun> {
    let (preset, limits) = resolve_limits(config)?;
    tracing::info!(
        preset = %preset,
        workers = limits.max_workers,
        batch_size = limits.batch_size,
        retries = limits.max_retries,
        "rate limits resolved"
    );

    let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
    let source = universe_source(config, timeout)?;
    let symbols = load_universe(source.as_ref()).await?;

    let yahoo = Arc::new(YahooClient::new(&config.history_range, timeout)?);
    let params = AnalysisParams {
        drop_threshold: config.drop_threshold,
        max_news: config.max_news,
        top_n: config.top_n,
        preset: preset.name().to_string(),
        universe: source.label().to_string(),
    };
    let analyzer = DropAnalyzer::new(yahoo.clone(), yahoo, limits, params, Arc::new(TracingSink));

    let run = analyzer.run(&symbols).await;
    storage.save(RESULTS_FILE, &run).await?;
    Ok(run)
}
