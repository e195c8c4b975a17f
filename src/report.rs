use crate::analyzer::{AnalysisRun, StockRecord};
use crate::presets::Preset;
use anyhow::Result;
use chrono::{DateTime, Local};
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const HEADLINE_WIDTH: usize = 80;

pub fn format_market_cap(market_cap: Option<f64>) -> String {
    let Some(cap) = market_cap else {
        return "N/A".to_string();
    };
    if cap >= 1e12 {
        format!("${:.2}T", cap / 1e12)
    } else if cap >= 1e9 {
        format!("${:.2}B", cap / 1e9)
    } else if cap >= 1e6 {
        format!("${:.2}M", cap / 1e6)
    } else {
        format!("${}", group_thousands(cap.round() as i64))
    }
}

/// Like [`format_market_cap`] but signed and with a thousands step, for cash flows.
pub fn format_large_number(number: Option<f64>) -> String {
    let Some(n) = number else {
        return "N/A".to_string();
    };
    let abs = n.abs();
    if abs >= 1e12 {
        format!("${:.2}T", n / 1e12)
    } else if abs >= 1e9 {
        format!("${:.2}B", n / 1e9)
    } else if abs >= 1e6 {
        format!("${:.2}M", n / 1e6)
    } else if abs >= 1e3 {
        format!("${:.2}K", n / 1e3)
    } else {
        format!("${}", group_thousands(n.round() as i64))
    }
}

fn group_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn or_na(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{v:.decimals$}"))
}

fn format_published(ts: Option<i64>) -> String {
    ts.and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let cut: String = text.chars().take(width).collect();
        format!("{cut}...")
    }
}

/// Brightness for a row, 0.4 for a barely-flagged stock up to 1.0 for the worst drop.
pub fn intensity(pct: f64, worst_pct: f64) -> f64 {
    if worst_pct == 0.0 {
        return 1.0;
    }
    (0.4 + 0.6 * (pct / worst_pct)).clamp(0.4, 1.0)
}

pub fn drops_table(records: &[StockRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Symbol").add_attribute(Attribute::Bold),
            Cell::new("Company").add_attribute(Attribute::Bold),
            Cell::new("Sector").add_attribute(Attribute::Bold),
            Cell::new("Change").add_attribute(Attribute::Bold).set_alignment(CellAlignment::Right),
            Cell::new("Price").add_attribute(Attribute::Bold).set_alignment(CellAlignment::Right),
            Cell::new("Mkt Cap").add_attribute(Attribute::Bold).set_alignment(CellAlignment::Right),
            Cell::new("From 52W High")
                .add_attribute(Attribute::Bold)
                .set_alignment(CellAlignment::Right),
        ]);

    let worst = records.first().map_or(0.0, |r| r.percent_change);
    for record in records {
        let red = (255.0 * intensity(record.percent_change, worst)) as u8;
        table.add_row(vec![
            Cell::new(&record.symbol).fg(Color::Cyan),
            Cell::new(truncate(&record.company_name, 29)),
            Cell::new(truncate(&record.sector, 19)).fg(Color::DarkGrey),
            Cell::new(format!("{:.2}%", record.percent_change))
                .fg(Color::Rgb { r: red, g: 0, b: 0 })
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("${:.2}", record.current_price)).set_alignment(CellAlignment::Right),
            Cell::new(format_market_cap(record.market_cap)).set_alignment(CellAlignment::Right),
            Cell::new(
                record
                    .distance_from_high
                    .map_or_else(|| "N/A".to_string(), |d| format!("{d:.1}%")),
            )
            .set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

fn write_detail(out: &mut String, rank: usize, record: &StockRecord) -> std::fmt::Result {
    writeln!(out, "\n{rank}. {} - {}", record.symbol, record.company_name)?;
    writeln!(out, "   Sector: {}", record.sector)?;
    if let Some(industry) = &record.industry {
        writeln!(out, "   Industry: {industry}")?;
    }
    writeln!(
        out,
        "   Price Change: ${:.2} -> ${:.2} ({:.2}%)",
        record.previous_close, record.current_price, record.percent_change
    )?;
    writeln!(out, "   Market Cap: {}", format_market_cap(record.market_cap))?;
    if let (Some(low), Some(high)) = (record.fifty_two_week_low, record.fifty_two_week_high) {
        writeln!(out, "   52-Week Range: ${low:.2} - ${high:.2}")?;
    }
    writeln!(
        out,
        "   Volume: {} (Avg: {})",
        record.volume.map_or_else(|| "N/A".to_string(), |v| group_thousands(v as i64)),
        record
            .avg_volume
            .map_or_else(|| "N/A".to_string(), |v| group_thousands(v.round() as i64)),
    )?;

    let f = &record.fundamentals;
    writeln!(out, "\n   FUNDAMENTAL METRICS:")?;
    writeln!(out, "   - P/E Ratio: {}", or_na(f.pe_ratio, 2))?;
    writeln!(out, "   - Forward P/E: {}", or_na(f.forward_pe, 2))?;
    writeln!(out, "   - PEG Ratio: {}", or_na(f.peg_ratio, 2))?;
    writeln!(out, "   - Debt-to-Equity: {}", or_na(f.debt_to_equity, 2))?;
    writeln!(
        out,
        "   - Dividend Yield: {}",
        f.dividend_yield.map_or_else(|| "N/A".to_string(), |y| format!("{y:.2}%"))
    )?;
    writeln!(out, "   - Free Cash Flow: {}", format_large_number(f.free_cash_flow))?;
    writeln!(out, "   - Price-to-Book: {}", or_na(f.price_to_book, 2))?;
    writeln!(
        out,
        "   - Return on Equity: {}",
        f.return_on_equity.map_or_else(|| "N/A".to_string(), |r| format!("{r:.2}%"))
    )?;

    let t = &record.indicators;
    writeln!(out, "\n   TECHNICAL INDICATORS:")?;
    writeln!(out, "   - RSI (14): {}", or_na(t.rsi, 2))?;
    writeln!(out, "   - MACD: {}", or_na(t.macd, 4))?;
    writeln!(out, "   - MACD Signal: {}", or_na(t.macd_signal, 4))?;
    writeln!(
        out,
        "   - OBV: {}",
        t.obv.map_or_else(|| "N/A".to_string(), |v| group_thousands(v.round() as i64))
    )?;
    if let Some(reading) = t.rsi_reading() {
        writeln!(out, "     -> RSI indicates {reading} conditions")?;
    }

    if record.news.is_empty() {
        writeln!(out, "\n   No recent news available")?;
    } else {
        writeln!(out, "\n   RECENT NEWS:")?;
        for item in &record.news {
            writeln!(out, "     - {}", truncate(&item.headline, HEADLINE_WIDTH))?;
            writeln!(
                out,
                "       {} - {}",
                item.publisher.as_deref().unwrap_or("Unknown"),
                format_published(item.published_at)
            )?;
        }
    }
    Ok(())
}

/// The full console report for a run.
pub fn render(run: &AnalysisRun, top_n: usize) -> Result<String> {
    let mut out = String::new();
    let limits = &run.rate_limits;
    let summary = &run.summary;

    writeln!(out, "\nStock drop analysis ({} universe)", run.universe)?;
    writeln!(out, "Analysis date: {}", run.started_at.format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out, "Drop threshold: {:.2}%", run.drop_threshold)?;
    writeln!(out, "Symbols: {}", summary.universe_size)?;
    writeln!(
        out,
        "Rate limits: {} ({} workers, batch {}, delay {}, {} retries)",
        run.preset, limits.max_workers, limits.batch_size, limits.delay_range, limits.max_retries
    )?;

    if run.records.is_empty() {
        writeln!(out, "\nNo stocks found with drops at or below {:.2}%.", run.drop_threshold)?;
    } else {
        writeln!(out, "\nFound {} stocks with significant drops:", run.records.len())?;
        writeln!(out, "{}", drops_table(&run.records))?;

        let shown = top_n.min(run.records.len());
        if shown > 0 {
            writeln!(out, "\nDETAILED ANALYSIS - Top {shown} Drops:")?;
            writeln!(out, "{}", "=".repeat(80))?;
            for (i, record) in run.records.iter().take(shown).enumerate() {
                write_detail(&mut out, i + 1, record)?;
                writeln!(out, "{}", "-".repeat(80))?;
            }
        }
    }

    writeln!(
        out,
        "\nAnalyzed {} of {} symbols, flagged {}, failed {}, skipped {}.",
        summary.analyzed,
        summary.universe_size,
        summary.flagged,
        summary.failed(),
        summary.skipped.len()
    )?;
    for (kind, symbols) in &summary.failures {
        let preview: Vec<&str> = symbols.iter().take(10).map(String::as_str).collect();
        let more = if symbols.len() > preview.len() { ", ..." } else { "" };
        writeln!(out, "  {kind}: {} ({}{more})", symbols.len(), preview.join(", "))?;
    }
    if summary.retries_exhausted > 0 {
        writeln!(out, "  {} symbols exhausted their retries", summary.retries_exhausted)?;
    }
    if !summary.news_failures.is_empty() {
        writeln!(out, "  news unavailable for: {}", summary.news_failures.join(", "))?;
    }

    Ok(out)
}

/// Every preset with its settings and a rough runtime estimate.
pub fn presets_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Preset").add_attribute(Attribute::Bold),
            Cell::new("Workers").add_attribute(Attribute::Bold),
            Cell::new("Batch").add_attribute(Attribute::Bold),
            Cell::new("Delay").add_attribute(Attribute::Bold),
            Cell::new("Batch pause").add_attribute(Attribute::Bold),
            Cell::new("Retries").add_attribute(Attribute::Bold),
            Cell::new("Min / 1000").add_attribute(Attribute::Bold).set_alignment(CellAlignment::Right),
            Cell::new("Notes").add_attribute(Attribute::Bold),
        ]);

    for preset in Preset::ALL {
        let c = preset.config();
        table.add_row(vec![
            Cell::new(preset.name()).fg(Color::Cyan),
            Cell::new(c.max_workers),
            Cell::new(c.batch_size),
            Cell::new(c.delay_range),
            Cell::new(c.inter_batch_delay),
            Cell::new(c.max_retries),
            Cell::new(format!("{:.1}", c.estimated_minutes_per_1000())).set_alignment(CellAlignment::Right),
            Cell::new(preset.blurb()).fg(Color::DarkGrey),
        ]);
    }
    table
}

pub fn csv_filename(prefix: &str, at: DateTime<Local>) -> String {
    format!("{prefix}_drops_{}.csv", at.format("%Y%m%d_%H%M%S"))
}

#[derive(Serialize)]
struct CsvRow<'a> {
    symbol: &'a str,
    company_name: &'a str,
    sector: &'a str,
    industry: Option<&'a str>,
    previous_close: f64,
    current_price: f64,
    percent_change: f64,
    market_cap: Option<f64>,
    fifty_two_week_high: Option<f64>,
    fifty_two_week_low: Option<f64>,
    distance_from_high: Option<f64>,
    volume: Option<u64>,
    avg_volume: Option<f64>,
    rsi: Option<f64>,
    macd: Option<f64>,
    macd_signal: Option<f64>,
    macd_histogram: Option<f64>,
    obv: Option<f64>,
    pe_ratio: Option<f64>,
    forward_pe: Option<f64>,
    peg_ratio: Option<f64>,
    debt_to_equity: Option<f64>,
    free_cash_flow: Option<f64>,
    dividend_yield: Option<f64>,
    book_value: Option<f64>,
    price_to_book: Option<f64>,
    return_on_equity: Option<f64>,
}

impl<'a> From<&'a StockRecord> for CsvRow<'a> {
    fn from(r: &'a StockRecord) -> Self {
        let f = &r.fundamentals;
        let t = &r.indicators;
        Self {
            symbol: &r.symbol,
            company_name: &r.company_name,
            sector: &r.sector,
            industry: r.industry.as_deref(),
            previous_close: r.previous_close,
            current_price: r.current_price,
            percent_change: r.percent_change,
            market_cap: r.market_cap,
            fifty_two_week_high: r.fifty_two_week_high,
            fifty_two_week_low: r.fifty_two_week_low,
            distance_from_high: r.distance_from_high,
            volume: r.volume,
            avg_volume: r.avg_volume,
            rsi: t.rsi,
            macd: t.macd,
            macd_signal: t.macd_signal,
            macd_histogram: t.macd_histogram,
            obv: t.obv,
            pe_ratio: f.pe_ratio,
            forward_pe: f.forward_pe,
            peg_ratio: f.peg_ratio,
            debt_to_equity: f.debt_to_equity,
            free_cash_flow: f.free_cash_flow,
            dividend_yield: f.dividend_yield,
            book_value: f.book_value,
            price_to_book: f.price_to_book,
            return_on_equity: f.return_on_equity,
        }
    }
}

/// Writes flagged stocks to a timestamped CSV in `dir`. Returns `None` when
/// nothing was flagged.
pub fn write_csv(run: &AnalysisRun, dir: &Path) -> Result<Option<PathBuf>> {
    if run.records.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join(csv_filename(&run.universe, run.started_at));

    let mut writer = csv::Writer::from_path(&path)?;
    for record in &run.records {
        writer.serialize(CsvRow::from(record))?;
    }
    writer.flush()?;

    tracing::info!(path = %path.display(), rows = run.records.len(), "saved results");
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::RunSummary;
    use crate::error::ErrorKind;
    use crate::indicators::TechnicalIndicators;
    use crate::market_data::{Fundamentals, NewsItem};
    use chrono::TimeZone;

    fn record(symbol: &str, pct: f64) -> StockRecord {
        StockRecord {
            symbol: symbol.to_string(),
            company_name: format!("{symbol} Holdings"),
            sector: "Technology".to_string(),
            industry: None,
            previous_close: 100.0,
            current_price: 100.0 + pct,
            percent_change: pct,
            market_cap: Some(2.5e9),
            fifty_two_week_high: Some(150.0),
            fifty_two_week_low: Some(70.0),
            distance_from_high: Some(-40.0),
            volume: Some(1_234_567),
            avg_volume: Some(900_000.0),
            indicators: TechnicalIndicators {
                rsi: Some(25.0),
                ..Default::default()
            },
            fundamentals: Fundamentals {
                free_cash_flow: Some(-3.4e8),
                ..Default::default()
            },
            news: Vec::new(),
        }
    }

    fn run(records: Vec<StockRecord>) -> AnalysisRun {
        let mut summary = RunSummary {
            universe_size: 10,
            analyzed: 8,
            flagged: records.len(),
            ..Default::default()
        };
        summary
            .failures
            .insert(ErrorKind::RateLimited, vec!["X".to_string(), "Y".to_string()]);
        AnalysisRun {
            started_at: Local.with_ymd_and_hms(2024, 3, 5, 16, 7, 9).unwrap(),
            drop_threshold: -10.0,
            preset: "balanced".to_string(),
            universe: "sp500".to_string(),
            rate_limits: Preset::Balanced.config(),
            records,
            summary,
        }
    }

    #[test]
    fn market_cap_units() {
        assert_eq!(format_market_cap(Some(2.5e12)), "$2.50T");
        assert_eq!(format_market_cap(Some(3.21e9)), "$3.21B");
        assert_eq!(format_market_cap(Some(4.5e6)), "$4.50M");
        assert_eq!(format_market_cap(Some(950_000.0)), "$950,000");
        assert_eq!(format_market_cap(None), "N/A");
    }

    #[test]
    fn large_numbers_keep_sign() {
        assert_eq!(format_large_number(Some(-3.4e8)), "$-340.00M");
        assert_eq!(format_large_number(Some(12_500.0)), "$12.50K");
        assert_eq!(format_large_number(Some(999.0)), "$999");
        assert_eq!(format_large_number(None), "N/A");
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
        assert_eq!(group_thousands(-1000), "-1,000");
    }

    #[test]
    fn presets_table_lists_every_preset() {
        let text = presets_table().to_string();
        for preset in Preset::ALL {
            assert!(text.contains(preset.name()), "{}", preset.name());
        }
    }

    #[test]
    fn filename_is_timestamped() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 16, 7, 9).unwrap();
        assert_eq!(csv_filename("fortune5000", at), "fortune5000_drops_20240305_160709.csv");
    }

    #[test]
    fn intensity_scales_with_drop() {
        assert_eq!(intensity(-20.0, -20.0), 1.0);
        assert_eq!(intensity(0.0, -20.0), 0.4);
        assert_eq!(intensity(-5.0, 0.0), 1.0);
    }

    #[test]
    fn report_lists_details_only_for_top_n() {
        let mut first = record("AAA", -25.0);
        first.news = vec![NewsItem {
            headline: "AAA plunges after guidance cut".to_string(),
            summary: None,
            publisher: Some("Wire".to_string()),
            link: None,
            published_at: None,
        }];
        let text = render(&run(vec![first, record("BBB", -12.0)]), 1).unwrap();

        assert!(text.contains("Found 2 stocks"));
        assert!(text.contains("1. AAA - AAA Holdings"));
        assert!(!text.contains("2. BBB"));
        assert!(text.contains("RSI indicates oversold conditions"));
        assert!(text.contains("AAA plunges after guidance cut"));
        assert!(text.contains("Free Cash Flow: $-340.00M"));
        assert!(text.contains("rate limited: 2 (X, Y)"));
    }

    #[test]
    fn report_without_drops_says_so() {
        let text = render(&run(Vec::new()), 3).unwrap();
        assert!(text.contains("No stocks found"));
        assert!(!text.contains("DETAILED ANALYSIS"));
    }

    #[test]
    fn csv_written_only_when_something_flagged() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(write_csv(&run(Vec::new()), dir.path()).unwrap(), None);

        let path = write_csv(&run(vec![record("AAA", -25.0), record("BBB", -12.0)]), dir.path())
            .unwrap()
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "sp500_drops_20240305_160709.csv");

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "symbol");
        assert!(headers.iter().any(|h| h == "free_cash_flow"));
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "AAA");
        assert_eq!(&rows[1][6], "-12.0");
    }
}
