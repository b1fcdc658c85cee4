//! Bounded queue sink.
//!
//! Every write becomes a task that holds one of `max_size` slots until its
//! consume operation has finished, so `write` only returns once there is
//! room. `parallel` workers pull tasks in arrival order; with a single worker
//! the consumer sees batches in write order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use snowdrift_core::emit;
use snowdrift_core::metrics::events::{QueueDepth, RunningConsumers};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::debug;

use super::BatchSink;
use crate::decode::Batch;
use crate::error::SinkError;

/// The per-task operation plugged into a [`QueueSink`].
///
/// Retries, if any, belong here.
#[async_trait]
pub trait Consume: Send + Sync + 'static {
    async fn consume(&self, batch: Batch) -> Result<(), SinkError>;

    /// Runs once after the last task has finished.
    async fn finalize(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

type Task = (Batch, OwnedSemaphorePermit);

pub struct QueueSink<C> {
    consumer: Arc<C>,
    slots: Arc<Semaphore>,
    max_size: usize,
    tx: Option<mpsc::UnboundedSender<Task>>,
    workers: JoinSet<Result<(), SinkError>>,
    target: String,
}

impl<C: Consume> QueueSink<C> {
    /// `parallel` is clamped to at least 1 and `max_size` to at least
    /// `parallel`.
    pub fn new(consumer: C, parallel: usize, max_size: usize, target: impl Into<String>) -> Self {
        let parallel = parallel.max(1);
        let max_size = max_size.max(parallel);
        let target = target.into();
        let consumer = Arc::new(consumer);
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let running = Arc::new(AtomicUsize::new(0));

        let mut workers = JoinSet::new();
        for _ in 0..parallel {
            workers.spawn(work(
                consumer.clone(),
                rx.clone(),
                running.clone(),
                target.clone(),
            ));
        }

        Self {
            consumer,
            slots: Arc::new(Semaphore::new(max_size)),
            max_size,
            tx: Some(tx),
            workers,
            target,
        }
    }

    /// Tasks currently waiting or running.
    pub fn depth(&self) -> usize {
        self.max_size - self.slots.available_permits()
    }

    fn emit_depth(&self) {
        emit!(QueueDepth {
            count: self.depth(),
            target: self.target.clone(),
        });
    }

    /// Surface a worker that stopped early.
    fn reap(&mut self) -> Result<(), SinkError> {
        while let Some(joined) = self.workers.try_join_next() {
            worker_exit(joined)?;
        }
        Ok(())
    }

    /// The queue stopped taking tasks: report why the workers went away.
    async fn stopped(&mut self) -> Result<(), SinkError> {
        while let Some(joined) = self.workers.join_next().await {
            worker_exit(joined)?;
        }
        Err(SinkError::Closed)
    }
}

async fn work<C: Consume>(
    consumer: Arc<C>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    running: Arc<AtomicUsize>,
    target: String,
) -> Result<(), SinkError> {
    loop {
        let next = rx.lock().await.recv().await;
        let Some((batch, slot)) = next else {
            return Ok(());
        };

        let count = running.fetch_add(1, Ordering::SeqCst) + 1;
        emit!(RunningConsumers {
            count,
            target: target.clone(),
        });
        let result = consumer.consume(batch).await;
        let count = running.fetch_sub(1, Ordering::SeqCst) - 1;
        emit!(RunningConsumers {
            count,
            target: target.clone(),
        });
        drop(slot);
        result?;
    }
}

/// A worker only returns early on error; a clean early return means the
/// queue was torn down underneath the writer.
fn worker_exit(joined: Result<Result<(), SinkError>, tokio::task::JoinError>) -> Result<(), SinkError> {
    match joined {
        Ok(Ok(())) => Err(SinkError::Closed),
        Ok(Err(e)) => Err(e),
        Err(source) => Err(SinkError::SinkJoin { source }),
    }
}

#[async_trait]
impl<C: Consume> BatchSink for QueueSink<C> {
    async fn write(&mut self, batch: Batch) -> Result<(), SinkError> {
        self.reap()?;

        let slot = tokio::select! {
            slot = self.slots.clone().acquire_owned() => slot.ok(),
            Some(joined) = self.workers.join_next() => return worker_exit(joined),
        };
        let Some(slot) = slot else {
            return self.stopped().await;
        };

        let tx = self.tx.as_ref().ok_or(SinkError::Closed)?;
        if tx.send((batch, slot)).is_err() {
            return self.stopped().await;
        }
        self.emit_depth();
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        drop(self.tx.take());
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(result) => result?,
                Err(source) => return Err(SinkError::SinkJoin { source }),
            }
        }
        self.emit_depth();
        debug!(target = %self.target, "Queue drained, finalizing");
        self.consumer.finalize().await
    }
}
