//! Sink fan-out.
//!
//! Each sink runs on its own task behind a channel of capacity one, so the
//! read side can be at most one batch ahead of the slowest sink.

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::decode::Batch;
use crate::error::PipelineError;
use crate::sink::BatchSink;

pub(super) struct Fanout {
    senders: Vec<mpsc::Sender<Batch>>,
    tasks: JoinSet<Result<(), PipelineError>>,
}

impl Fanout {
    pub fn spawn(sinks: Vec<(String, Box<dyn BatchSink>)>) -> Self {
        let mut senders = Vec::with_capacity(sinks.len());
        let mut tasks = JoinSet::new();
        for (name, sink) in sinks {
            let (tx, rx) = mpsc::channel(1);
            senders.push(tx);
            tasks.spawn(drive(name, sink, rx));
        }
        Self { senders, tasks }
    }

    /// Hand `batch` to every sink. Returns `false` once any sink has stopped
    /// taking batches; its error comes out of [`Fanout::finish`].
    pub async fn send(&self, batch: Batch) -> bool {
        let Some((last, rest)) = self.senders.split_last() else {
            return true;
        };
        for tx in rest {
            if tx.send(batch.clone()).await.is_err() {
                return false;
            }
        }
        last.send(batch).await.is_ok()
    }

    /// Close the inputs and wait for every sink to finish. The first failure
    /// wins and the remaining sinks are abandoned.
    pub async fn finish(mut self) -> Result<(), PipelineError> {
        self.senders.clear();
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined.map_err(|source| PipelineError::TaskJoin { source });
            if let Err(e) = outcome.and_then(|result| result) {
                self.tasks.abort_all();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop every sink without letting it finish.
    pub fn abort(mut self) {
        self.senders.clear();
        self.tasks.abort_all();
    }
}

async fn drive(
    name: String,
    mut sink: Box<dyn BatchSink>,
    mut rx: mpsc::Receiver<Batch>,
) -> Result<(), PipelineError> {
    let result = async {
        while let Some(batch) = rx.recv().await {
            sink.write(batch).await?;
        }
        sink.finish().await
    }
    .await;

    match result {
        Ok(()) => {
            debug!("Sink '{name}' finished");
            Ok(())
        }
        Err(source) => {
            warn!("Sink '{name}' failed: {source}");
            Err(PipelineError::Sink { sink: name, source })
        }
    }
}
