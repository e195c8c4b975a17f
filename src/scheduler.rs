//! Batched, bounded-concurrency dispatch of per-symbol fetches.

use crate::events::RunEvent;
use crate::rate_limiter::{FetchResult, Fetcher, RetryingFetcher};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};

const PROGRESS_INTERVAL: usize = 50;

/// Result for one input symbol, in the order the symbols were given.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub symbol: String,
    pub result: FetchResult<T>,
}

pub struct BatchScheduler<'a, F> {
    fetcher: &'a RetryingFetcher<F>,
}

impl<'a, F: Fetcher> BatchScheduler<'a, F> {
    pub fn new(fetcher: &'a RetryingFetcher<F>) -> Self {
        Self { fetcher }
    }

    pub async fn run(&self, symbols: &[String]) -> Vec<Fetched<F::Output>> {
        let config = self.fetcher.config();
        let sink = self.fetcher.sink();
        let batch_size = config.batch_size.max(1);
        let max_workers = config.max_workers.max(1);
        let total = symbols.len();
        let total_batches = total.div_ceil(batch_size);
        let completed = AtomicUsize::new(0);

        let mut all_results = Vec::with_capacity(total);

        for (i, batch) in symbols.chunks(batch_size).enumerate() {
            sink.record(RunEvent::BatchStarted {
                index: i,
                total: total_batches,
                size: batch.len(),
            });

            let pending: Vec<_> = batch
                .iter()
                .enumerate()
                .map(|(idx, symbol)| {
                    let completed = &completed;
                    async move {
                        let result = self.fetcher.fetch(symbol).await;
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        if done % PROGRESS_INTERVAL == 0 {
                            sink.record(RunEvent::Progress { completed: done, total });
                        }
                        (
                            idx,
                            Fetched {
                                symbol: symbol.clone(),
                                result,
                            },
                        )
                    }
                })
                .collect();
            let mut batch_results: Vec<(usize, Fetched<F::Output>)> = futures::stream::iter(pending)
                .buffer_unordered(max_workers)
                .collect()
                .await;

            batch_results.sort_unstable_by_key(|(idx, _)| *idx);
            let failures = batch_results.iter().filter(|(_, f)| !f.result.is_success()).count();
            all_results.extend(batch_results.into_iter().map(|(_, fetched)| fetched));

            sink.record(RunEvent::BatchFinished {
                index: i,
                total: total_batches,
                failures,
            });

            if i + 1 < total_batches {
                let wait = config.inter_batch_delay.sample();
                sink.record(RunEvent::InterBatchPause { wait });
                tokio::time::sleep(wait).await;
            }
        }

        all_results
    }
}
