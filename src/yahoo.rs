//! Yahoo Finance market data and news over plain HTTPS.
//!
//! History comes from the chart endpoint and needs no session. Company
//! metadata comes from quoteSummary, which wants a cookie plus a "crumb"
//! token. The crumb is fetched once, cached, and dropped on a 401 so the next
//! attempt re-authenticates.

use crate::error::FetchError;
use crate::market_data::{
    CompanyProfile, Fundamentals, MarketDataProvider, MarketSnapshot, NewsItem, NewsProvider, PriceBar,
    PriceSeries,
};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::REFERER;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const SUMMARY_URL: &str = "https://query2.finance.yahoo.com/v10/finance/quoteSummary";
const SEARCH_URL: &str = "https://query2.finance.yahoo.com/v1/finance/search";
const COOKIE_URL: &str = "https://fc.yahoo.com";
const CRUMB_URL: &str = "https://query1.finance.yahoo.com/v1/test/getcrumb";
const SUMMARY_MODULES: &str = "price,assetProfile,summaryDetail,defaultKeyStatistics,financialData";
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Where each kind of request goes. Defaults to the public Yahoo hosts.
#[derive(Debug, Clone)]
pub struct YahooEndpoints {
    pub chart: String,
    pub summary: String,
    pub search: String,
    pub cookie: String,
    pub crumb: String,
}

impl Default for YahooEndpoints {
    fn default() -> Self {
        Self {
            chart: CHART_URL.to_string(),
            summary: SUMMARY_URL.to_string(),
            search: SEARCH_URL.to_string(),
            cookie: COOKIE_URL.to_string(),
            crumb: CRUMB_URL.to_string(),
        }
    }
}

pub struct YahooClient {
    client: Client,
    endpoints: YahooEndpoints,
    history_range: String,
    crumb: Mutex<Option<String>>,
}

impl YahooClient {
    pub fn new(history_range: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Self::with_endpoints(history_range, timeout, YahooEndpoints::default())
    }

    pub fn with_endpoints(
        history_range: impl Into<String>,
        timeout: Duration,
        endpoints: YahooEndpoints,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .timeout(timeout)
            .pool_max_idle_per_host(50)
            .build()?;
        Ok(Self {
            client,
            endpoints,
            history_range: history_range.into(),
            crumb: Mutex::new(None),
        })
    }

    async fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .header(REFERER, "https://finance.yahoo.com/")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16()));
        }
        Ok(response.text().await?)
    }

    async fn crumb(&self) -> Result<String, FetchError> {
        let mut cached = self.crumb.lock().await;
        if let Some(crumb) = cached.as_ref() {
            return Ok(crumb.clone());
        }

        // The cookie endpoint answers 404 but still sets the session cookie.
        if let Err(err) = self.client.get(self.endpoints.cookie.as_str()).send().await {
            tracing::debug!(%err, "cookie request failed");
        }

        let body = self.get_text(&self.endpoints.crumb, &[]).await?;
        let crumb = body.trim();
        if crumb.is_empty() || crumb.len() > 100 || crumb.contains(' ') || crumb.contains('<') {
            return Err(FetchError::Unauthorized);
        }
        tracing::debug!("obtained yahoo crumb");
        *cached = Some(crumb.to_string());
        Ok(crumb.to_string())
    }

    async fn profile(&self, symbol: &str) -> Result<CompanyProfile, FetchError> {
        let crumb = self.crumb().await?;
        let url = format!("{}/{symbol}", self.endpoints.summary);
        match self
            .get_text(&url, &[("modules", SUMMARY_MODULES), ("crumb", crumb.as_str())])
            .await
        {
            Ok(body) => parse_summary(&body),
            Err(FetchError::Unauthorized) => {
                *self.crumb.lock().await = None;
                Err(FetchError::Unauthorized)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl MarketDataProvider for YahooClient {
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, FetchError> {
        validate_symbol(symbol)?;

        let url = format!("{}/{symbol}", self.endpoints.chart);
        let body = self
            .get_text(&url, &[("range", self.history_range.as_str()), ("interval", "1d")])
            .await?;
        let (series, fallback) = parse_chart(&body)?;

        // Funds and some ADRs have no summary modules; chart metadata is enough for them.
        let profile = match self.profile(symbol).await {
            Ok(profile) => profile.or(fallback),
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => {
                tracing::debug!(symbol, %err, "quote summary unavailable, using chart metadata");
                fallback
            }
        };

        Ok(MarketSnapshot { series, profile })
    }
}

#[async_trait]
impl NewsProvider for YahooClient {
    async fn news(&self, symbol: &str, max_items: usize) -> Result<Vec<NewsItem>, FetchError> {
        validate_symbol(symbol)?;
        let count = max_items.to_string();
        let body = self
            .get_text(
                &self.endpoints.search,
                &[("q", symbol), ("quotesCount", "0"), ("newsCount", count.as_str())],
            )
            .await?;
        parse_news(&body, max_items)
    }
}

fn validate_symbol(symbol: &str) -> Result<(), FetchError> {
    let valid = !symbol.is_empty()
        && symbol.len() <= 12
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '^' | '='));
    if valid {
        Ok(())
    } else {
        Err(FetchError::InvalidSymbol(symbol.to_string()))
    }
}

impl CompanyProfile {
    /// Fills gaps in `self` from `other`.
    fn or(self, other: CompanyProfile) -> CompanyProfile {
        CompanyProfile {
            long_name: self.long_name.or(other.long_name),
            sector: self.sector.or(other.sector),
            industry: self.industry.or(other.industry),
            market_cap: self.market_cap.or(other.market_cap),
            fifty_two_week_high: self.fifty_two_week_high.or(other.fifty_two_week_high),
            fifty_two_week_low: self.fifty_two_week_low.or(other.fifty_two_week_low),
            fundamentals: self.fundamentals,
        }
    }
}

// --- Wire formats ---

#[derive(Deserialize, Debug)]
struct ChartResponse {
    chart: ChartEnvelope,
}

#[derive(Deserialize, Debug)]
struct ChartEnvelope {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    #[serde(default)]
    meta: Option<ChartMeta>,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    long_name: Option<String>,
    short_name: Option<String>,
    fifty_two_week_high: Option<f64>,
    fifty_two_week_low: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Deserialize, Debug, Default)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Deserialize, Debug)]
struct SummaryResponse {
    #[serde(rename = "quoteSummary")]
    quote_summary: SummaryEnvelope,
}

#[derive(Deserialize, Debug)]
struct SummaryEnvelope {
    #[serde(default)]
    result: Option<Vec<SummaryResult>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct SummaryResult {
    price: Option<PriceModule>,
    asset_profile: Option<AssetProfile>,
    summary_detail: Option<SummaryDetail>,
    default_key_statistics: Option<KeyStatistics>,
    financial_data: Option<FinancialData>,
}

/// Yahoo wraps numbers as `{"raw": 1.0, "fmt": "1.00"}`, or `{}` when absent.
#[derive(Deserialize, Debug, Default, Clone, Copy)]
struct Raw {
    #[serde(default)]
    raw: Option<f64>,
}

fn raw(value: Option<Raw>) -> Option<f64> {
    value.and_then(|v| v.raw).filter(|v| v.is_finite())
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct PriceModule {
    long_name: Option<String>,
    short_name: Option<String>,
    market_cap: Option<Raw>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct AssetProfile {
    sector: Option<String>,
    industry: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct SummaryDetail {
    fifty_two_week_high: Option<Raw>,
    fifty_two_week_low: Option<Raw>,
    #[serde(rename = "trailingPE")]
    trailing_pe: Option<Raw>,
    #[serde(rename = "forwardPE")]
    forward_pe: Option<Raw>,
    dividend_yield: Option<Raw>,
    market_cap: Option<Raw>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct KeyStatistics {
    peg_ratio: Option<Raw>,
    book_value: Option<Raw>,
    price_to_book: Option<Raw>,
    #[serde(rename = "forwardPE")]
    forward_pe: Option<Raw>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct FinancialData {
    debt_to_equity: Option<Raw>,
    free_cashflow: Option<Raw>,
    return_on_equity: Option<Raw>,
}

#[derive(Deserialize, Debug)]
struct SearchResponse {
    #[serde(default)]
    news: Vec<SearchNews>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SearchNews {
    title: Option<String>,
    publisher: Option<String>,
    link: Option<String>,
    provider_publish_time: Option<i64>,
    #[serde(default)]
    summary: Option<String>,
}

fn api_error(error: &Value) -> FetchError {
    let code = error.get("code").and_then(Value::as_str).unwrap_or_default();
    let description = error
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if code.eq_ignore_ascii_case("not found") {
        FetchError::NotFound
    } else {
        FetchError::Malformed(format!("{code}: {description}"))
    }
}

fn parse_chart(body: &str) -> Result<(PriceSeries, CompanyProfile), FetchError> {
    let response: ChartResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(format!("chart: {e}")))?;

    if let Some(error) = response.chart.error.as_ref().filter(|e| !e.is_null()) {
        return Err(api_error(error));
    }

    let result = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| FetchError::Malformed("no chart data in response".to_string()))?;
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let bars = result
        .timestamp
        .iter()
        .enumerate()
        .map(|(i, &timestamp)| PriceBar {
            timestamp,
            open: quote.open.get(i).copied().flatten(),
            high: quote.high.get(i).copied().flatten(),
            low: quote.low.get(i).copied().flatten(),
            close: quote.close.get(i).copied().flatten(),
            volume: quote
                .volume
                .get(i)
                .copied()
                .flatten()
                .filter(|v| *v >= 0.0)
                .map(|v| v as u64),
        })
        .collect();

    let meta = result.meta.unwrap_or_default();
    let profile = CompanyProfile {
        long_name: meta.long_name.or(meta.short_name),
        fifty_two_week_high: meta.fifty_two_week_high,
        fifty_two_week_low: meta.fifty_two_week_low,
        ..Default::default()
    };

    Ok((PriceSeries::new(bars), profile))
}

fn parse_summary(body: &str) -> Result<CompanyProfile, FetchError> {
    let response: SummaryResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(format!("quoteSummary: {e}")))?;

    if let Some(error) = response.quote_summary.error.as_ref().filter(|e| !e.is_null()) {
        return Err(api_error(error));
    }

    let result = response
        .quote_summary
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| FetchError::Malformed("no quote summary in response".to_string()))?;

    let price = result.price.unwrap_or_default();
    let asset = result.asset_profile.unwrap_or_default();
    let detail = result.summary_detail.unwrap_or_default();
    let stats = result.default_key_statistics.unwrap_or_default();
    let financial = result.financial_data.unwrap_or_default();

    let fundamentals = Fundamentals {
        pe_ratio: raw(detail.trailing_pe),
        forward_pe: raw(detail.forward_pe).or(raw(stats.forward_pe)),
        peg_ratio: raw(stats.peg_ratio),
        // Yahoo reports debt/equity as a percentage
        debt_to_equity: raw(financial.debt_to_equity).map(|v| v / 100.0),
        free_cash_flow: raw(financial.free_cashflow),
        dividend_yield: raw(detail.dividend_yield).map(|v| v * 100.0),
        book_value: raw(stats.book_value),
        price_to_book: raw(stats.price_to_book),
        return_on_equity: raw(financial.return_on_equity).map(|v| v * 100.0),
    };

    Ok(CompanyProfile {
        long_name: price.long_name.or(price.short_name),
        sector: asset.sector,
        industry: asset.industry,
        market_cap: raw(price.market_cap).or(raw(detail.market_cap)),
        fifty_two_week_high: raw(detail.fifty_two_week_high),
        fifty_two_week_low: raw(detail.fifty_two_week_low),
        fundamentals,
    })
}

fn parse_news(body: &str, max_items: usize) -> Result<Vec<NewsItem>, FetchError> {
    let response: SearchResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(format!("search: {e}")))?;

    Ok(response
        .news
        .into_iter()
        .take(max_items)
        .map(|n| NewsItem {
            headline: n.title.unwrap_or_else(|| "No title".to_string()),
            summary: n.summary,
            publisher: n.publisher,
            link: n.link,
            published_at: n.provider_publish_time,
        })
        .collect())
}
