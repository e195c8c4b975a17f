//! Where the list of symbols to screen comes from.

use crate::error::UniverseError;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const SP500_URL: &str = "https://en.wikipedia.org/wiki/List_of_S%26P_500_companies";
const SP500_ATTEMPTS: u32 = 3;
const SP500_RETRY_PAUSE: Duration = Duration::from_secs(2);
const MAX_TICKER_LEN: usize = 6;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UniverseKind {
    /// S&P 500 constituents from Wikipedia.
    Sp500,
    /// Every common stock in a listed-company CSV.
    Csv,
    /// An explicit list of symbols.
    Symbols,
}

impl fmt::Display for UniverseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sp500 => "sp500",
            Self::Csv => "csv",
            Self::Symbols => "symbols",
        })
    }
}

#[async_trait]
pub trait UniverseSource: Send + Sync {
    /// Short name used as the CSV report prefix.
    fn label(&self) -> &'static str;

    async fn symbols(&self) -> Result<Vec<String>, UniverseError>;
}

/// Loads a source and rejects an empty result.
pub async fn load_universe(source: &dyn UniverseSource) -> Result<Vec<String>, UniverseError> {
    let symbols = source.symbols().await?;
    if symbols.is_empty() {
        return Err(UniverseError::Empty);
    }
    tracing::info!(source = source.label(), count = symbols.len(), "loaded ticker universe");
    Ok(symbols)
}

// --- S&P 500 ---

pub struct WikipediaSp500 {
    client: Client,
    url: String,
}

impl WikipediaSp500 {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            url: SP500_URL.to_string(),
        }
    }

    async fn fetch_page(&self) -> Result<String, reqwest::Error> {
        self.client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl UniverseSource for WikipediaSp500 {
    fn label(&self) -> &'static str {
        "sp500"
    }

    async fn symbols(&self) -> Result<Vec<String>, UniverseError> {
        let mut attempt = 1;
        let page = loop {
            match self.fetch_page().await {
                Ok(page) => break page,
                Err(err) if attempt < SP500_ATTEMPTS => {
                    tracing::warn!(attempt, %err, "S&P 500 list request failed, retrying");
                    tokio::time::sleep(SP500_RETRY_PAUSE).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        };
        parse_constituents(&page)
    }
}

/// Pulls the first-column symbols out of the `constituents` table.
fn parse_constituents(html: &str) -> Result<Vec<String>, UniverseError> {
    let start = html
        .find("id=\"constituents\"")
        .ok_or(UniverseError::TableNotFound)?;
    let table = &html[start..];
    let table = table.find("</table>").map_or(table, |end| &table[..end]);

    let row = Regex::new(r"<tr[^>]*>\s*<td[^>]*>\s*(?:<a[^>]*>)?\s*([A-Za-z][A-Za-z0-9.\-]*)\s*(?:</a>)?")?;

    Ok(row
        .captures_iter(table)
        .map(|caps| caps[1].replace('.', "-"))
        .collect())
}

// --- Listed-company CSV ---

pub struct TickerCsv {
    path: PathBuf,
}

impl TickerCsv {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn csv_error(&self, source: csv::Error) -> UniverseError {
        UniverseError::Csv {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl UniverseSource for TickerCsv {
    fn label(&self) -> &'static str {
        "fortune5000"
    }

    async fn symbols(&self) -> Result<Vec<String>, UniverseError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.csv_error(e.into()))?;

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let column = reader
            .headers()
            .map_err(|e| self.csv_error(e))?
            .iter()
            .position(|h| h.trim() == "Symbol")
            .ok_or(UniverseError::MissingColumn("Symbol"))?;

        let mut total = 0usize;
        let mut kept = BTreeSet::new();
        for record in reader.records() {
            let record = record.map_err(|e| self.csv_error(e))?;
            total += 1;
            if let Some(ticker) = record.get(column).and_then(common_stock_ticker) {
                kept.insert(ticker);
            }
        }

        tracing::info!(total, kept = kept.len(), "filtered ticker file to common stock");
        Ok(kept.into_iter().collect())
    }
}

/// Normalises a listed symbol, or rejects warrants, units, preferreds and
/// other non-common-stock listings.
fn common_stock_ticker(raw: &str) -> Option<String> {
    let ticker = raw.trim();
    if ticker.is_empty() || ticker == "nan" || ticker.len() > MAX_TICKER_LEN {
        return None;
    }
    if ticker.contains(['$', '#']) {
        return None;
    }
    // ".W", ".U", ".A" and friends mark share classes, warrants and units
    let bytes = ticker.as_bytes();
    if let [.., b'.', last] = bytes {
        if last.is_ascii_uppercase() {
            return None;
        }
    }

    let ticker = if ticker.contains('.') && !ticker.ends_with('.') {
        ticker.replace('.', "-")
    } else {
        ticker.to_string()
    };

    let mut core = ticker.chars().filter(|c| !matches!(c, '-' | '.')).peekable();
    let starts_alpha = ticker.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    let alphanumeric = core.peek().is_some() && core.all(|c| c.is_ascii_alphanumeric());

    (starts_alpha && alphanumeric).then_some(ticker)
}

// --- Explicit list ---

pub struct SymbolList {
    symbols: Vec<String>,
}

impl SymbolList {
    /// Upper-cases and de-duplicates, keeping first occurrence order.
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let symbols = symbols
            .into_iter()
            .map(|s| s.as_ref().trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        Self { symbols }
    }
}

#[async_trait]
impl UniverseSource for SymbolList {
    fn label(&self) -> &'static str {
        "custom"
    }

    async fn symbols(&self) -> Result<Vec<String>, UniverseError> {
        Ok(self.symbols.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PAGE: &str = r#"
<table class="wikitable sortable" id="constituents">
<tbody><tr>
<th>Symbol</th><th>Security</th>
</tr>
<tr>
<td><a rel="nofollow" class="external text" href="https://www.nyse.com/quote/XNYS:MMM">MMM</a>
</td><td><a href="/wiki/3M">3M</a></td>
</tr>
<tr>
<td><a rel="nofollow" class="external text" href="https://www.nyse.com/quote/XNYS:BRK.B">BRK.B</a>
</td><td><a href="/wiki/Berkshire_Hathaway">Berkshire Hathaway</a></td>
</tr>
<tr>
<td>ZTS
</td><td>Zoetis</td>
</tr>
</tbody></table>
<table id="changes"><tr><td>OLD</td></tr></table>
"#;

    #[test]
    fn constituents_table_symbols_are_normalised() {
        assert_eq!(parse_constituents(PAGE).unwrap(), ["MMM", "BRK-B", "ZTS"]);
    }

    #[test]
    fn page_without_table_is_an_error() {
        assert!(matches!(
            parse_constituents("<html><body>maintenance</body></html>"),
            Err(UniverseError::TableNotFound)
        ));
    }

    #[test]
    fn common_stock_filter() {
        assert_eq!(common_stock_ticker(" AAPL "), Some("AAPL".to_string()));
        assert_eq!(common_stock_ticker("BF.b"), Some("BF-b".to_string()));
        assert_eq!(common_stock_ticker("ABCDEFG"), None);
        assert_eq!(common_stock_ticker("ACAHW.W"), None);
        assert_eq!(common_stock_ticker("BRK.A"), None);
        assert_eq!(common_stock_ticker("PBR$A"), None);
        assert_eq!(common_stock_ticker("AB#"), None);
        assert_eq!(common_stock_ticker("1ABC"), None);
        assert_eq!(common_stock_ticker("nan"), None);
        assert_eq!(common_stock_ticker(""), None);
        assert_eq!(common_stock_ticker("A^B"), None);
    }

    #[tokio::test]
    async fn csv_source_filters_dedupes_and_sorts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Name,Symbol,Exchange").unwrap();
        for (name, symbol) in [
            ("Zeta", "ZETA"),
            ("Apple", "AAPL"),
            ("Apple dup", "AAPL"),
            ("Warrant", "XYZ.W"),
            ("Missing", ""),
            ("Pref", "ABC$B"),
        ] {
            writeln!(file, "{name},{symbol},NYSE").unwrap();
        }

        let source = TickerCsv::new(file.path());
        assert_eq!(source.symbols().await.unwrap(), ["AAPL", "ZETA"]);
    }

    #[tokio::test]
    async fn csv_without_symbol_column_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Ticker,Name\nAAPL,Apple").unwrap();

        let err = TickerCsv::new(file.path()).symbols().await.unwrap_err();
        assert!(matches!(err, UniverseError::MissingColumn("Symbol")));
    }

    #[tokio::test]
    async fn missing_csv_file_is_an_error() {
        let err = TickerCsv::new("/definitely/not/here.csv").symbols().await.unwrap_err();
        assert!(matches!(err, UniverseError::Csv { .. }));
    }

    #[tokio::test]
    async fn empty_universe_is_fatal() {
        let list = SymbolList::new([" ", ""]);
        assert!(matches!(load_universe(&list).await, Err(UniverseError::Empty)));
    }

    #[tokio::test]
    async fn symbol_list_normalises() {
        let list = SymbolList::new(["aapl", "MSFT", " aapl"]);
        assert_eq!(load_universe(&list).await.unwrap(), ["AAPL", "MSFT"]);
    }
}
