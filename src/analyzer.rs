//! Turns fetched market data into the ranked list of significant drops.

use crate::error::ErrorKind;
use crate::events::{EventSink, RunEvent};
use crate::indicators::TechnicalIndicators;
use crate::market_data::{
    Fundamentals, MarketDataProvider, MarketSnapshot, NewsFetcher, NewsItem, NewsProvider, PriceSeries,
    SnapshotFetcher,
};
use crate::presets::RateLimitConfig;
use crate::rate_limiter::{FetchResult, RetryingFetcher};
use crate::scheduler::BatchScheduler;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingCurrentPrice,
    MissingPreviousClose,
    ZeroPreviousClose,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MissingCurrentPrice => "current price unavailable",
            Self::MissingPreviousClose => "previous close missing",
            Self::ZeroPreviousClose => "previous close is zero",
        })
    }
}

/// `(previous_close, current_close, percent_change)` from the last two closes.
pub fn day_over_day(series: &PriceSeries) -> Result<(f64, f64, f64), SkipReason> {
    let closes = series.closes();
    let (previous, current) = match closes.as_slice() {
        [] => return Err(SkipReason::MissingCurrentPrice),
        [only] if !only.is_finite() => return Err(SkipReason::MissingCurrentPrice),
        [_] => return Err(SkipReason::MissingPreviousClose),
        [.., previous, current] => (*previous, *current),
    };
    if !current.is_finite() {
        return Err(SkipReason::MissingCurrentPrice);
    }
    if !previous.is_finite() {
        return Err(SkipReason::MissingPreviousClose);
    }
    if previous == 0.0 {
        return Err(SkipReason::ZeroPreviousClose);
    }
    Ok((previous, current, (current - previous) / previous * 100.0))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StockRecord {
    pub symbol: String,
    pub company_name: String,
    pub sector: String,
    pub industry: Option<String>,
    pub previous_close: f64,
    pub current_price: f64,
    pub percent_change: f64,
    pub market_cap: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
    pub fifty_two_week_low: Option<f64>,
    pub distance_from_high: Option<f64>,
    pub volume: Option<u64>,
    pub avg_volume: Option<f64>,
    pub indicators: TechnicalIndicators,
    pub fundamentals: Fundamentals,
    #[serde(default)]
    pub news: Vec<NewsItem>,
}

impl StockRecord {
    pub fn from_snapshot(symbol: &str, snapshot: MarketSnapshot) -> Result<Self, SkipReason> {
        let (previous_close, current_price, percent_change) = day_over_day(&snapshot.series)?;
        let profile = snapshot.profile;
        let distance_from_high = profile
            .fifty_two_week_high
            .filter(|high| *high > 0.0)
            .map(|high| (current_price - high) / high * 100.0);

        Ok(Self {
            symbol: symbol.to_string(),
            company_name: profile.long_name.unwrap_or_else(|| symbol.to_string()),
            sector: profile.sector.unwrap_or_else(|| "Unknown".to_string()),
            industry: profile.industry,
            previous_close,
            current_price,
            percent_change,
            market_cap: profile.market_cap,
            fifty_two_week_high: profile.fifty_two_week_high,
            fifty_two_week_low: profile.fifty_two_week_low,
            distance_from_high,
            volume: snapshot.series.latest_volume(),
            avg_volume: snapshot.series.average_volume(),
            indicators: TechnicalIndicators::from_series(&snapshot.series),
            fundamentals: profile.fundamentals,
            news: Vec::new(),
        })
    }

    pub fn with_news(self, news: Vec<NewsItem>) -> Self {
        Self { news, ..self }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SkippedSymbol {
    pub symbol: String,
    pub reason: SkipReason,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub universe_size: usize,
    pub analyzed: usize,
    pub flagged: usize,
    /// Symbols whose fetch failed, grouped by the final error kind.
    pub failures: BTreeMap<ErrorKind, Vec<String>>,
    /// Failures that ended because a retryable error outlived the retry cap.
    pub retries_exhausted: usize,
    pub skipped: Vec<SkippedSymbol>,
    pub news_failures: Vec<String>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.failures.values().map(Vec::len).sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnalysisRun {
    pub started_at: DateTime<Local>,
    pub drop_threshold: f64,
    pub preset: String,
    pub universe: String,
    pub rate_limits: RateLimitConfig,
    /// Flagged stocks, biggest drop first.
    pub records: Vec<StockRecord>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone)]
pub struct AnalysisParams {
    pub drop_threshold: f64,
    pub max_news: usize,
    pub top_n: usize,
    pub preset: String,
    pub universe: String,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            drop_threshold: -10.0,
            max_news: 3,
            top_n: 3,
            preset: "balanced".to_string(),
            universe: "custom".to_string(),
        }
    }
}

pub struct DropAnalyzer<P, N> {
    market: Arc<P>,
    news: Arc<N>,
    limits: RateLimitConfig,
    params: AnalysisParams,
    sink: Arc<dyn EventSink>,
}

impl<P: MarketDataProvider, N: NewsProvider> DropAnalyzer<P, N> {
    pub fn new(
        market: Arc<P>,
        news: Arc<N>,
        limits: RateLimitConfig,
        params: AnalysisParams,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            market,
            news,
            limits,
            params,
            sink,
        }
    }

    pub async fn run(&self, universe: &[String]) -> AnalysisRun {
        let started_at = Local::now();
        let mut summary = RunSummary {
            universe_size: universe.len(),
            ..Default::default()
        };

        let fetcher = RetryingFetcher::new(
            SnapshotFetcher(self.market.clone()),
            self.limits.clone(),
            self.sink.clone(),
        );
        let fetched = BatchScheduler::new(&fetcher).run(universe).await;

        let mut records = Vec::new();
        for item in fetched {
            match item.result {
                FetchResult::Success(snapshot) => match StockRecord::from_snapshot(&item.symbol, snapshot) {
                    Ok(record) => {
                        summary.analyzed += 1;
                        if record.percent_change <= self.params.drop_threshold {
                            records.push(record);
                        }
                    }
                    Err(reason) => {
                        self.sink.record(RunEvent::ComputationSkipped {
                            symbol: item.symbol.clone(),
                            reason,
                        });
                        summary.skipped.push(SkippedSymbol {
                            symbol: item.symbol,
                            reason,
                        });
                    }
                },
                FetchResult::Failure {
                    kind,
                    attempts,
                    message,
                } => {
                    tracing::debug!(symbol = %item.symbol, attempts, %message, "fetch failed");
                    if kind.is_retryable() {
                        summary.retries_exhausted += 1;
                    }
                    summary.failures.entry(kind).or_default().push(item.symbol);
                }
            }
        }

        records.sort_by(|a, b| {
            a.percent_change
                .total_cmp(&b.percent_change)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        summary.flagged = records.len();

        let records = self.attach_news(records, &mut summary).await;

        tracing::info!(
            analyzed = summary.analyzed,
            flagged = summary.flagged,
            failed = summary.failed(),
            skipped = summary.skipped.len(),
            "analysis complete"
        );

        AnalysisRun {
            started_at,
            drop_threshold: self.params.drop_threshold,
            preset: self.params.preset.clone(),
            universe: self.params.universe.clone(),
            rate_limits: self.limits.clone(),
            records,
            summary,
        }
    }

    async fn attach_news(&self, records: Vec<StockRecord>, summary: &mut RunSummary) -> Vec<StockRecord> {
        let top_n = self.params.top_n.min(records.len());
        if top_n == 0 || self.params.max_news == 0 {
            return records;
        }

        let top: Vec<String> = records[..top_n].iter().map(|r| r.symbol.clone()).collect();
        let fetcher = RetryingFetcher::new(
            NewsFetcher {
                provider: self.news.clone(),
                max_items: self.params.max_news,
            },
            self.limits.clone(),
            self.sink.clone(),
        );
        let mut news: Vec<Vec<NewsItem>> = Vec::with_capacity(top_n);
        for item in BatchScheduler::new(&fetcher).run(&top).await {
            match item.result {
                FetchResult::Success(items) => news.push(items),
                FetchResult::Failure { kind, .. } => {
                    tracing::warn!(symbol = %item.symbol, %kind, "news unavailable");
                    summary.news_failures.push(item.symbol);
                    news.push(Vec::new());
                }
            }
        }

        let mut news = news.into_iter();
        records
            .into_iter()
            .map(|record| match news.next() {
                Some(items) => record.with_news(items),
                None => record,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::events::MemorySink;
    use crate::market_data::{CompanyProfile, PriceBar};
    use crate::presets::{DelayRange, Preset};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeYahoo {
        snapshots: HashMap<String, Result<MarketSnapshot, FetchError>>,
        news: HashMap<String, Result<Vec<NewsItem>, FetchError>>,
        news_calls: Mutex<Vec<String>>,
    }

    impl FakeYahoo {
        fn with(mut self, symbol: &str, response: Result<MarketSnapshot, FetchError>) -> Self {
            self.snapshots.insert(symbol.to_string(), response);
            self
        }

        fn with_news(mut self, symbol: &str, response: Result<Vec<NewsItem>, FetchError>) -> Self {
            self.news.insert(symbol.to_string(), response);
            self
        }
    }

    #[async_trait]
    impl MarketDataProvider for FakeYahoo {
        async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, FetchError> {
            self.snapshots.get(symbol).cloned().unwrap_or(Err(FetchError::NotFound))
        }
    }

    #[async_trait]
    impl NewsProvider for FakeYahoo {
        async fn news(&self, symbol: &str, _max_items: usize) -> Result<Vec<NewsItem>, FetchError> {
            self.news_calls.lock().unwrap().push(symbol.to_string());
            self.news.get(symbol).cloned().unwrap_or(Ok(Vec::new()))
        }
    }

    fn snapshot(previous: f64, current: f64) -> Result<MarketSnapshot, FetchError> {
        Ok(MarketSnapshot {
            series: PriceSeries::new(vec![
                PriceBar::close(1_700_000_000, previous, 1_000),
                PriceBar::close(1_700_086_400, current, 3_000),
            ]),
            profile: CompanyProfile {
                long_name: Some("Test Corp".to_string()),
                sector: Some("Technology".to_string()),
                fifty_two_week_high: Some(200.0),
                ..Default::default()
            },
        })
    }

    fn headline(text: &str) -> NewsItem {
        NewsItem {
            headline: text.to_string(),
            summary: None,
            publisher: Some("Wire".to_string()),
            link: None,
            published_at: Some(1_700_000_000),
        }
    }

    fn limits() -> RateLimitConfig {
        RateLimitConfig {
            batch_size: 2,
            max_workers: 2,
            delay_range: DelayRange::new(0.0, 0.0),
            inter_batch_delay: DelayRange::new(0.0, 0.0),
            ..Preset::Balanced.config()
        }
    }

    fn analyzer(fake: FakeYahoo, params: AnalysisParams) -> (Arc<FakeYahoo>, DropAnalyzer<FakeYahoo, FakeYahoo>) {
        let fake = Arc::new(fake);
        let analyzer = DropAnalyzer::new(
            fake.clone(),
            fake.clone(),
            limits(),
            params,
            Arc::new(MemorySink::default()),
        );
        (fake, analyzer)
    }

    fn universe(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn percent_change_uses_last_two_closes() {
        let series = PriceSeries::new(vec![
            PriceBar::close(0, 50.0, 1),
            PriceBar::close(1, 100.0, 1),
            PriceBar::close(2, 85.0, 1),
        ]);
        let (prev, cur, pct) = day_over_day(&series).unwrap();
        assert_eq!((prev, cur), (100.0, 85.0));
        assert!((pct + 15.0).abs() < 1e-9);
    }

    #[test]
    fn bad_closes_are_classified() {
        let empty = PriceSeries::default();
        assert_eq!(day_over_day(&empty), Err(SkipReason::MissingCurrentPrice));

        let single = PriceSeries::new(vec![PriceBar::close(0, 10.0, 1)]);
        assert_eq!(day_over_day(&single), Err(SkipReason::MissingPreviousClose));

        let zero = PriceSeries::new(vec![PriceBar::close(0, 0.0, 1), PriceBar::close(1, 10.0, 1)]);
        assert_eq!(day_over_day(&zero), Err(SkipReason::ZeroPreviousClose));
    }

    #[test]
    fn record_carries_distance_from_high() {
        let record = StockRecord::from_snapshot("T", snapshot(100.0, 90.0).unwrap()).unwrap();
        assert_eq!(record.company_name, "Test Corp");
        assert_eq!(record.volume, Some(3_000));
        assert_eq!(record.avg_volume, Some(2_000.0));
        assert!((record.distance_from_high.unwrap() + 55.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_rate_limited_and_below_threshold_scenario() {
        let fake = FakeYahoo::default()
            .with("A", snapshot(100.0, 85.0))
            .with("B", snapshot(100.0, 95.0))
            .with("C", Err(FetchError::RateLimited));
        let (_, analyzer) = analyzer(fake, AnalysisParams::default());

        let run = analyzer.run(&universe(&["A", "B", "C"])).await;

        let flagged: Vec<&str> = run.records.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(flagged, ["A"]);
        assert_eq!(run.summary.analyzed, 2);
        assert_eq!(run.summary.flagged, 1);
        assert_eq!(run.summary.failed(), 1);
        assert_eq!(run.summary.retries_exhausted, 1);
        assert_eq!(run.summary.failures.get(&ErrorKind::RateLimited), Some(&vec!["C".to_string()]));
        assert!(run.summary.skipped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_previous_close_is_a_skip_not_a_failure() {
        let fake = FakeYahoo::default()
            .with("ZERO", snapshot(0.0, 5.0))
            .with("A", snapshot(100.0, 50.0));
        let (_, analyzer) = analyzer(fake, AnalysisParams::default());

        let run = analyzer.run(&universe(&["ZERO", "A"])).await;

        assert_eq!(run.records.len(), 1);
        assert_eq!(run.summary.failed(), 0);
        assert_eq!(
            run.summary.skipped,
            vec![SkippedSymbol {
                symbol: "ZERO".to_string(),
                reason: SkipReason::ZeroPreviousClose,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn records_sorted_by_drop_then_symbol() {
        let fake = FakeYahoo::default()
            .with("MMM", snapshot(100.0, 80.0))
            .with("BBB", snapshot(100.0, 70.0))
            .with("AAA", snapshot(100.0, 80.0))
            .with("ZZZ", snapshot(100.0, 89.0));
        let (_, analyzer) = analyzer(fake, AnalysisParams::default());

        let run = analyzer.run(&universe(&["MMM", "ZZZ", "AAA", "BBB"])).await;

        let order: Vec<&str> = run.records.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(order, ["BBB", "AAA", "MMM", "ZZZ"]);
        assert!(run.records.iter().all(|r| r.percent_change <= -10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_inclusive() {
        let fake = FakeYahoo::default()
            .with("EDGE", snapshot(100.0, 90.0))
            .with("NEAR", snapshot(100.0, 90.5));
        let (_, analyzer) = analyzer(fake, AnalysisParams::default());

        let run = analyzer.run(&universe(&["EDGE", "NEAR"])).await;

        assert_eq!(run.records.len(), 1);
        assert_eq!(run.records[0].symbol, "EDGE");
    }

    #[tokio::test(start_paused = true)]
    async fn news_only_for_top_n_and_failures_yield_empty_lists() {
        let fake = FakeYahoo::default()
            .with("A", snapshot(100.0, 50.0))
            .with("B", snapshot(100.0, 60.0))
            .with("C", snapshot(100.0, 70.0))
            .with_news("A", Ok(vec![headline("A1"), headline("A2"), headline("A3")]))
            .with_news("B", Err(FetchError::NotFound))
            .with_news("C", Ok(vec![headline("C1")]));
        let params = AnalysisParams {
            top_n: 2,
            max_news: 2,
            ..Default::default()
        };
        let (fake, analyzer) = analyzer(fake, params);

        let run = analyzer.run(&universe(&["A", "B", "C"])).await;

        assert_eq!(run.records.len(), 3);
        assert_eq!(run.records[0].news.len(), 2, "truncated to max_news");
        assert!(run.records[1].news.is_empty());
        assert!(run.records[2].news.is_empty(), "outside top-n");
        assert_eq!(run.summary.news_failures, vec!["B".to_string()]);
        let mut calls = fake.news_calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_responses_give_identical_runs() {
        let build = || {
            FakeYahoo::default()
                .with("A", snapshot(100.0, 85.0))
                .with("B", snapshot(0.0, 1.0))
                .with("C", Err(FetchError::ServerError(503)))
                .with("D", Err(FetchError::Malformed("bad".into())))
                .with_news("A", Ok(vec![headline("A1")]))
        };
        let symbols = universe(&["A", "B", "C", "D", "E"]);

        let (_, first) = analyzer(build(), AnalysisParams::default());
        let (_, second) = analyzer(build(), AnalysisParams::default());
        let first = first.run(&symbols).await;
        let second = second.run(&symbols).await;

        assert_eq!(first.records, second.records);
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.summary.failed(), 3);
        assert_eq!(first.summary.retries_exhausted, 1);
    }
}
