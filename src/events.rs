//! Run events and the sinks that observe them.
//!
//! The fetch layer never logs directly; it reports what happened to an
//! [`EventSink`] handed in by the caller.

use crate::analyzer::SkipReason;
use crate::error::ErrorKind;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RetryScheduled {
        symbol: String,
        attempt: u32,
        wait: Duration,
        kind: ErrorKind,
    },
    GaveUp {
        symbol: String,
        attempts: u32,
        kind: ErrorKind,
    },
    BatchStarted {
        index: usize,
        total: usize,
        size: usize,
    },
    BatchFinished {
        index: usize,
        total: usize,
        failures: usize,
    },
    InterBatchPause {
        wait: Duration,
    },
    Progress {
        completed: usize,
        total: usize,
    },
    ComputationSkipped {
        symbol: String,
        reason: SkipReason,
    },
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: RunEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: RunEvent) {
        match event {
            RunEvent::RetryScheduled {
                symbol,
                attempt,
                wait,
                kind,
            } => tracing::warn!(
                %symbol,
                attempt,
                wait_secs = wait.as_secs_f64(),
                %kind,
                "attempt failed, backing off"
            ),
            RunEvent::GaveUp { symbol, attempts, kind } => {
                tracing::error!(%symbol, attempts, %kind, "giving up")
            }
            RunEvent::BatchStarted { index, total, size } => {
                tracing::info!("Processing batch {}/{} ({} tickers)", index + 1, total, size)
            }
            RunEvent::BatchFinished { index, total, failures } => {
                tracing::info!(failures, "Batch {}/{} complete", index + 1, total)
            }
            RunEvent::InterBatchPause { wait } => {
                tracing::info!("Waiting {:.1}s before next batch", wait.as_secs_f64())
            }
            RunEvent::Progress { completed, total } => {
                tracing::info!("Processed {}/{} symbols", completed, total)
            }
            RunEvent::ComputationSkipped { symbol, reason } => {
                tracing::warn!(%symbol, %reason, "skipping symbol")
            }
        }
    }
}

#[cfg(test)]
pub use memory::MemorySink;

#[cfg(test)]
mod memory {
    use super::{EventSink, RunEvent};
    use std::sync::Mutex;

    /// Keeps every event so tests can assert on them.
    #[derive(Debug, Default)]
    pub struct MemorySink {
        events: Mutex<Vec<RunEvent>>,
    }

    impl MemorySink {
        pub fn events(&self) -> Vec<RunEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, pred: impl Fn(&RunEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }

    impl EventSink for MemorySink {
        fn record(&self, event: RunEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
