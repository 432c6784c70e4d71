//! Application Services
//!
//! - `run_ingestion`: the single path from the feed connector's receive
//!   loop into the cache and the broadcaster.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::TickSink;
use crate::domain::streaming::TickBatch;
use crate::infrastructure::metrics;

/// Drain tick batches from the connector into `sink`, in arrival order.
///
/// Runs until the channel closes or `shutdown` fires. Returns the number
/// of batches ingested.
pub async fn run_ingestion(
    mut batches: mpsc::Receiver<TickBatch>,
    sink: Arc<dyn TickSink>,
    shutdown: CancellationToken,
) -> u64 {
    let mut ingested = 0u64;

    loop {
        let batch = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        if batch.is_empty() {
            continue;
        }

        let started = Instant::now();
        let ticks = batch.len();
        let queued = sink.ingest(batch);
        metrics::record_ingest_duration(started.elapsed());
        metrics::record_messages_sent(queued as u64);
        ingested += 1;

        tracing::trace!(ticks, queued, "Ingested tick batch");
    }

    tracing::debug!(ingested, "Ingestion loop stopped");
    ingested
}
