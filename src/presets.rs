//! Named rate limiting bundles.
//!
//! A preset trades speed for safety against provider throttling. Lookups never
//! fail: anything unrecognised resolves to `balanced`. Use [`Preset::parse_strict`]
//! when an unknown name should stop the run instead.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Inclusive `(low, high)` bounds in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DelayRange {
    pub low: f64,
    pub high: f64,
}

impl DelayRange {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn mean(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    /// Uniform draw from the range. A degenerate range yields `low` exactly.
    pub fn sample(&self) -> Duration {
        let seconds = if self.low >= self.high {
            self.low
        } else {
            rand::random_range(self.low..=self.high)
        };
        Duration::from_secs_f64(seconds.max(0.0))
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        let ok = self.low.is_finite() && self.high.is_finite() && self.low >= 0.0 && self.low <= self.high;
        if ok {
            Ok(())
        } else {
            Err(ConfigError::DelayRange {
                field,
                low: self.low,
                high: self.high,
            })
        }
    }
}

impl fmt::Display for DelayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}s", self.low, self.high)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub max_workers: usize,
    pub batch_size: usize,
    pub delay_range: DelayRange,
    pub inter_batch_delay: DelayRange,
    /// Total attempts per call, including the first. Zero behaves like one.
    pub max_retries: u32,
    pub backoff_base: f64,
    pub conservative: bool,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ZeroCount { field: "max_workers" });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroCount { field: "batch_size" });
        }
        if !(self.backoff_base.is_finite() && self.backoff_base > 0.0) {
            return Err(ConfigError::BackoffBase(self.backoff_base));
        }
        self.delay_range.validate("delay_range")?;
        self.inter_batch_delay.validate("inter_batch_delay")?;
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Wait before retrying after `attempt` (1-based) failed.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(self.backoff_base.powi(exponent)).unwrap_or(Duration::MAX)
    }

    pub fn with_max_workers(mut self, max_workers: Option<usize>) -> Self {
        if let Some(workers) = max_workers {
            self.max_workers = workers;
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        if let Some(retries) = max_retries {
            self.max_retries = retries;
        }
        self
    }

    /// Rough wall-clock minutes needed for 1000 symbols.
    pub fn estimated_minutes_per_1000(&self) -> f64 {
        let batch_size = self.batch_size.max(1) as f64;
        let workers = self.max_workers.max(1) as f64;
        let per_batch = batch_size * self.delay_range.mean() / workers;
        let batches = 1000.0 / batch_size;
        (per_batch + self.inter_batch_delay.mean()) * batches / 60.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Aggressive,
    Balanced,
    Conservative,
    UltraConservative,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::Aggressive,
        Preset::Balanced,
        Preset::Conservative,
        Preset::UltraConservative,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Aggressive => "aggressive",
            Self::Balanced => "balanced",
            Self::Conservative => "conservative",
            Self::UltraConservative => "ultra_conservative",
        }
    }

    pub fn blurb(self) -> &'static str {
        match self {
            Self::Aggressive => "fastest, higher risk of rate limiting",
            Self::Balanced => "recommended",
            Self::Conservative => "slower, safer",
            Self::UltraConservative => "slowest, safest",
        }
    }

    fn lookup(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|p| p.name() == normalized)
    }

    /// Resolves a preset name, falling back to `balanced` for unknown names.
    pub fn parse_lenient(name: &str) -> Self {
        Self::lookup(name).unwrap_or_else(|| {
            tracing::warn!(preset = name, "unknown rate limit preset, using balanced");
            Self::Balanced
        })
    }

    pub fn parse_strict(name: &str) -> Result<Self, ConfigError> {
        Self::lookup(name).ok_or_else(|| ConfigError::UnknownPreset(name.to_string()))
    }

    pub fn config(self) -> RateLimitConfig {
        let (max_workers, batch_size, delay, inter_batch, conservative) = match self {
            Self::Aggressive => (5, 100, DelayRange::new(0.2, 1.0), DelayRange::new(1.0, 3.0), false),
            Self::Balanced => (3, 50, DelayRange::new(0.5, 2.0), DelayRange::new(2.0, 5.0), false),
            Self::Conservative => (1, 20, DelayRange::new(1.0, 3.0), DelayRange::new(5.0, 10.0), true),
            Self::UltraConservative => (1, 10, DelayRange::new(2.0, 5.0), DelayRange::new(10.0, 20.0), true),
        };
        RateLimitConfig {
            max_workers,
            batch_size,
            delay_range: delay,
            inter_batch_delay: inter_batch,
            max_retries: 3,
            backoff_base: 2.0,
            conservative,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
