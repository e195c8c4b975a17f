use crate::market_data::PriceSeries;
use serde::{Deserialize, Serialize};
use ta::indicators::{MovingAverageConvergenceDivergence, OnBalanceVolume, RelativeStrengthIndex};
use ta::{DataItem, Next};

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TechnicalIndicators {
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub obv: Option<f64>,
}

impl TechnicalIndicators {
    pub fn from_series(series: &PriceSeries) -> Self {
        let closes = series.closes();
        if closes.len() < RSI_PERIOD {
            return Self::default();
        }
        let (macd, macd_signal, macd_histogram) = match calculate_macd(&closes) {
            Some((m, s, h)) => (Some(m), Some(s), Some(h)),
            None => (None, None, None),
        };
        Self {
            rsi: calculate_rsi(&closes, RSI_PERIOD),
            macd,
            macd_signal,
            macd_histogram,
            obv: calculate_obv(series),
        }
    }

    pub fn rsi_reading(&self) -> Option<&'static str> {
        self.rsi.map(|rsi| {
            if rsi < 30.0 {
                "oversold"
            } else if rsi > 70.0 {
                "overbought"
            } else {
                "neutral"
            }
        })
    }
}

pub fn calculate_rsi(closes: &[f64], period: usize) -> Option<f64> {
    let mut rsi_indicator = RelativeStrengthIndex::new(period).ok()?;

    if closes.len() < period {
        return None;
    }

    let mut last_rsi: Option<f64> = None;
    for &price in closes {
        last_rsi = Some(rsi_indicator.next(price));
    }
    last_rsi.map(|v| round_to(v, 2))
}

/// `(macd, signal, histogram)` of the last close.
pub fn calculate_macd(closes: &[f64]) -> Option<(f64, f64, f64)> {
    if closes.len() < MACD_SLOW {
        return None;
    }
    let mut macd = MovingAverageConvergenceDivergence::new(MACD_FAST, MACD_SLOW, MACD_SIGNAL).ok()?;
    let out = closes.iter().map(|&c| macd.next(c)).last()?;
    Some((round_to(out.macd, 4), round_to(out.signal, 4), round_to(out.histogram, 4)))
}

pub fn calculate_obv(series: &PriceSeries) -> Option<f64> {
    let mut obv = OnBalanceVolume::new();
    let mut last = None;
    for bar in &series.bars {
        let (Some(close), Some(volume)) = (bar.close, bar.volume) else {
            continue;
        };
        // OBV only reads close and volume; a flat bar keeps the builder's range checks happy.
        let item = DataItem::builder()
            .open(close)
            .high(close)
            .low(close)
            .close(close)
            .volume(volume as f64)
            .build()
            .ok()?;
        last = Some(obv.next(&item));
    }
    last
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::PriceBar;

    fn series(closes: &[f64], volume: u64) -> PriceSeries {
        PriceSeries::new(
            closes
                .iter()
                .enumerate()
                .map(|(i, &c)| PriceBar::close(i as i64 * 86_400, c, volume))
                .collect(),
        )
    }

    #[test]
    fn short_history_has_no_indicators() {
        let s = series(&[10.0, 11.0, 12.0], 100);
        assert_eq!(TechnicalIndicators::from_series(&s), TechnicalIndicators::default());
    }

    #[test]
    fn rising_closes_read_overbought() {
        let closes: Vec<f64> = (1..=20).map(f64::from).collect();
        let indicators = TechnicalIndicators::from_series(&series(&closes, 1_000));
        let rsi = indicators.rsi.unwrap();
        assert!(rsi > 70.0, "{rsi}");
        assert_eq!(indicators.rsi_reading(), Some("overbought"));
        assert!(indicators.macd.is_none(), "fewer than 26 closes");
    }

    #[test]
    fn obv_accumulates_on_up_days_and_drains_on_down_days() {
        // the first bar counts as an up day from zero
        let s = series(&[10.0, 11.0, 12.0, 11.0], 100);
        assert_eq!(calculate_obv(&s), Some(200.0));
    }

    #[test]
    fn macd_available_with_long_history() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 - i as f64).collect();
        let (macd, _signal, _hist) = calculate_macd(&closes).unwrap();
        assert!(macd < 0.0, "falling prices give a negative MACD line, got {macd}");
    }
}
