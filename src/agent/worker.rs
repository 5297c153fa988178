use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::batch::{BatchAggregator, FlushOutcome, FlushReason};
use crate::collector::stats::{ErrorKind, PipelineStats};
use crate::collector::BatchCommand;
use crate::remote::{RemoteError, RemoteStore};

/// How often the worker checks the batch time trigger.
pub const DUE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Consumes collector commands and drives the batch aggregator.
///
/// Returns once every sender is dropped and the channel is drained, so the
/// caller can force a final flush knowing nothing is still in flight.
pub async fn run_batch_worker<R: RemoteStore>(
    batch: Arc<BatchAggregator<R>>,
    stats: Arc<PipelineStats>,
    mut rx: mpsc::Receiver<BatchCommand>,
) {
    let mut ticker = tokio::time::interval(DUE_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("batch worker channel closed");
                    return;
                };
                handle(&batch, &stats, cmd).await;
            }

            _ = ticker.tick() => {
                if let Some(result) = batch.flush_if_due().await {
                    note_result(&stats, result);
                }
            }
        }
    }
}

async fn handle<R: RemoteStore>(
    batch: &BatchAggregator<R>,
    stats: &PipelineStats,
    cmd: BatchCommand,
) {
    match cmd {
        BatchCommand::Add(record) => {
            if let Some(result) = batch.add(record).await.flush {
                note_result(stats, result);
            }
        }
        BatchCommand::AddAndForceFlush(record, kind) => {
            if let Some(result) = batch.add(record).await.flush {
                note_result(stats, result);
            }
            debug!(kind = kind.as_str(), "anomaly flush");
            note_result(stats, batch.force_flush(FlushReason::Anomaly).await);
        }
        BatchCommand::Flush(reason) => {
            note_result(stats, batch.force_flush(reason).await);
        }
    }
}

fn note_result(stats: &PipelineStats, result: Result<FlushOutcome, RemoteError>) {
    if let Err(e) = result {
        stats.record_error(ErrorKind::Remote);
        warn!(error = %e, "batch delivery failed");
    }
}
