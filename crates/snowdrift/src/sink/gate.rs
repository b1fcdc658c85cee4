//! Rate gate: at most `count_limit` records per window reach the inner sink.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use snowdrift_core::emit;
use snowdrift_core::metrics::events::GateReleased;
use tokio::time::Instant;

use super::BatchSink;
use crate::decode::{Batch, Record};
use crate::error::SinkError;

pub struct RateGate<S> {
    inner: S,
    count_limit: usize,
    window: Duration,
    queue: VecDeque<Record>,
    window_start: Option<Instant>,
    released: usize,
    target: String,
}

impl<S: BatchSink> RateGate<S> {
    pub fn new(inner: S, count_limit: usize, window: Duration, target: impl Into<String>) -> Self {
        Self {
            inner,
            count_limit: count_limit.max(1),
            window,
            queue: VecDeque::new(),
            window_start: None,
            released: 0,
            target: target.into(),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Release queued records, waiting out full windows. Returns once the
    /// queue is empty.
    async fn drain(&mut self) -> Result<(), SinkError> {
        while !self.queue.is_empty() {
            match self.window_start {
                Some(start) if Instant::now() < start + self.window => {
                    if self.released >= self.count_limit {
                        tokio::time::sleep_until(start + self.window).await;
                        self.window_start = None;
                        continue;
                    }
                }
                _ => {
                    self.window_start = Some(Instant::now());
                    self.released = 0;
                }
            }

            let take = (self.count_limit - self.released).min(self.queue.len());
            let batch: Batch = self.queue.drain(..take).collect();
            self.released += take;
            emit!(GateReleased {
                count: take as u64,
                target: self.target.clone(),
            });
            self.inner.write(batch).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: BatchSink> BatchSink for RateGate<S> {
    async fn write(&mut self, batch: Batch) -> Result<(), SinkError> {
        self.queue.extend(batch);
        self.drain().await
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.drain().await?;
        self.inner.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the arrival time and size of every batch.
    #[derive(Default)]
    struct Timeline {
        origin: Option<Instant>,
        arrivals: Vec<(Duration, usize)>,
        finished: bool,
    }

    #[async_trait]
    impl BatchSink for Timeline {
        async fn write(&mut self, batch: Batch) -> Result<(), SinkError> {
            let origin = *self.origin.get_or_insert_with(Instant::now);
            self.arrivals.push((origin.elapsed(), batch.len()));
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), SinkError> {
            self.finished = true;
            Ok(())
        }
    }

    fn records(n: usize) -> Batch {
        (0..n).map(|i| Record::from(i.to_string().as_str())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_items_in_windows_of_three() {
        let mut gate = RateGate::new(Timeline::default(), 3, Duration::from_millis(1000), "test");

        gate.write(records(10)).await.unwrap();
        gate.finish().await.unwrap();

        let timeline = gate.into_inner();
        assert!(timeline.finished);
        let sizes: Vec<usize> = timeline.arrivals.iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, [3, 3, 3, 1]);
        for pair in timeline.arrivals.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_millis(1000), "{pair:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_writes_share_a_window() {
        let mut gate = RateGate::new(Timeline::default(), 3, Duration::from_millis(500), "test");

        gate.write(records(2)).await.unwrap();
        gate.write(records(2)).await.unwrap();
        gate.finish().await.unwrap();

        let arrivals = gate.into_inner().arrivals;
        assert_eq!(
            arrivals,
            [
                (Duration::ZERO, 2),
                (Duration::ZERO, 1),
                (Duration::from_millis(500), 1)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_window_after_idle_period() {
        let mut gate = RateGate::new(Timeline::default(), 2, Duration::from_millis(100), "test");

        gate.write(records(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        gate.write(records(2)).await.unwrap();

        let arrivals = gate.into_inner().arrivals;
        assert_eq!(
            arrivals,
            [(Duration::ZERO, 2), (Duration::from_millis(250), 2)]
        );
    }
}
