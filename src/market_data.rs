use crate::error::FetchError;
use crate::rate_limiter::Fetcher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PriceBar {
    /// Unix seconds of the session open.
    pub timestamp: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
}

#[cfg(test)]
impl PriceBar {
    /// A flat bar where every price equals `close`.
    pub fn close(timestamp: i64, close: f64, volume: u64) -> Self {
        Self {
            timestamp,
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            volume: Some(volume),
        }
    }
}

/// Daily bars, oldest first.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PriceSeries {
    pub bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn new(bars: Vec<PriceBar>) -> Self {
        Self { bars }
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().filter_map(|b| b.close).collect()
    }

    pub fn latest_volume(&self) -> Option<u64> {
        self.bars.iter().rev().find(|b| b.close.is_some()).and_then(|b| b.volume)
    }

    pub fn average_volume(&self) -> Option<f64> {
        let volumes: Vec<u64> = self.bars.iter().filter_map(|b| b.volume).collect();
        if volumes.is_empty() {
            return None;
        }
        Some(volumes.iter().map(|&v| v as f64).sum::<f64>() / volumes.len() as f64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Fundamentals {
    pub pe_ratio: Option<f64>,
    pub forward_pe: Option<f64>,
    pub peg_ratio: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub free_cash_flow: Option<f64>,
    /// Percent.
    pub dividend_yield: Option<f64>,
    pub book_value: Option<f64>,
    pub price_to_book: Option<f64>,
    /// Percent.
    pub return_on_equity: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CompanyProfile {
    pub long_name: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub market_cap: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
    pub fifty_two_week_low: Option<f64>,
    pub fundamentals: Fundamentals,
}

/// Everything the provider returns for one symbol.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MarketSnapshot {
    pub series: PriceSeries,
    pub profile: CompanyProfile,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewsItem {
    pub headline: String,
    pub summary: Option<String>,
    pub publisher: Option<String>,
    pub link: Option<String>,
    /// Unix seconds.
    pub published_at: Option<i64>,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, FetchError>;
}

#[async_trait]
pub trait NewsProvider: Send + Sync {
    async fn news(&self, symbol: &str, max_items: usize) -> Result<Vec<NewsItem>, FetchError>;
}

pub struct SnapshotFetcher<P>(pub Arc<P>);

#[async_trait]
impl<P: MarketDataProvider> Fetcher for SnapshotFetcher<P> {
    type Output = MarketSnapshot;

    async fn fetch(&self, symbol: &str) -> Result<MarketSnapshot, FetchError> {
        self.0.snapshot(symbol).await
    }
}

pub struct NewsFetcher<N> {
    pub provider: Arc<N>,
    pub max_items: usize,
}

#[async_trait]
impl<N: NewsProvider> Fetcher for NewsFetcher<N> {
    type Output = Vec<NewsItem>;

    async fn fetch(&self, symbol: &str) -> Result<Vec<NewsItem>, FetchError> {
        let mut items = self.provider.news(symbol, self.max_items).await?;
        items.truncate(self.max_items);
        Ok(items)
    }
}
