use crate::canonical::{CanonicalLog, RawRecord};
use crate::config::store::ConfigStore;
use crate::config::types::Source;
use crate::engine::{aggregate_batch, should_drop};
use crate::metrics::SourceMetrics;
use crate::sink::{Backoff, RetryBuffer, Sink, SinkError};
use crate::template::{extract_fields, TemplateStore};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub source: Arc<Source>,
    pub receiver: flume::Receiver<RawRecord>,
    pub metrics: Arc<SourceMetrics>,
    pub config: Arc<ConfigStore>,
    pub templates: Arc<TemplateStore>,
    pub sink: Arc<dyn Sink>,
    pub retry_buffer: Arc<Mutex<RetryBuffer>>,
    pub max_batch_latency: Duration,
}

/// One worker: form batches, run filters and aggregation, deliver.
///
/// Cancellation is cooperative: a cancelled worker closes and delivers
/// its in-flight batch, then exits. Records within a batch keep their
/// dequeue order all the way to the sink.
pub async fn run_worker(ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    loop {
        let Some(batch) = collect_batch(&ctx, &cancel).await else {
            break;
        };

        if !batch.is_empty() {
            process_batch(&ctx, &cancel, batch).await;
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    debug!(source = %ctx.source.name, "Worker exited");
}

/// Accumulate records until `batch_size` is reached or the batch's
/// first record is `max_batch_latency` old, whichever comes first.
/// Returns `None` when cancelled with no batch in flight.
async fn collect_batch(
    ctx: &WorkerContext,
    cancel: &CancellationToken,
) -> Option<Vec<RawRecord>> {
    let batch_size = ctx.source.batch_size();

    let first = tokio::select! {
        _ = cancel.cancelled() => return None,
        result = ctx.receiver.recv_async() => match result {
            Ok(record) => record,
            Err(_) => return None,
        },
    };

    let deadline = Instant::now() + ctx.max_batch_latency;
    let mut batch = Vec::with_capacity(batch_size.min(4096));
    batch.push(first);

    while batch.len() < batch_size {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            result = ctx.receiver.recv_async() => match result {
                Ok(record) => batch.push(record),
                Err(_) => break,
            },
        }
    }

    Some(batch)
}

async fn process_batch(
    ctx: &Arc<WorkerContext>,
    cancel: &CancellationToken,
    records: Vec<RawRecord>,
) {
    // One policy snapshot per batch; rule edits land at the next batch
    let policies = ctx.config.policies(ctx.source.id);

    let mut entries: Vec<(CanonicalLog, Vec<(String, String)>)> =
        Vec::with_capacity(records.len());

    for record in records {
        let fields = extract_fields(&record.payload);

        if !fields.is_empty() {
            if let Err(e) = ctx.templates.learn_if_absent(ctx.source.id, &fields) {
                warn!(source = %ctx.source.name, error = %e, "Template learning failed");
            }
        }

        if should_drop(&policies.filters, &fields) {
            ctx.metrics
                .events_dropped_filter
                .fetch_add(1, Ordering::Relaxed);
            continue;
        }

        entries.push((CanonicalLog::from_raw(&record, &ctx.source.name), fields));
    }

    if entries.is_empty() {
        return;
    }

    let batch = match &policies.aggregation {
        Some(policy) => aggregate_batch(policy, entries),
        None => entries.into_iter().map(|(log, _)| log).collect(),
    };

    deliver_with_retry(ctx, cancel, batch).await;
}

/// Deliver with exponential backoff on transient failures. Exhausted or
/// interrupted retries park the batch in the source's retry buffer;
/// permanent failures drop it.
async fn deliver_with_retry(
    ctx: &WorkerContext,
    cancel: &CancellationToken,
    batch: Vec<CanonicalLog>,
) {
    let mut backoff = Backoff::standard();

    loop {
        match ctx.sink.deliver(&batch).await {
            Ok(bytes) => {
                record_delivery(ctx, &batch, bytes);
                retry_one_parked(ctx).await;
                return;
            }
            Err(SinkError::Permanent(message)) => {
                drop_batch(ctx, &batch, &message);
                return;
            }
            Err(SinkError::Transient(message)) => {
                ctx.metrics.set_last_error(&message);

                let Some(delay) = backoff.next_delay() else {
                    park_batch(ctx, batch);
                    return;
                };

                ctx.metrics.sink_retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    source = %ctx.source.name,
                    delay_secs = delay.as_secs(),
                    error = %message,
                    "Transient sink failure, backing off"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Shutdown mustn't wait out the backoff schedule
                        park_batch(ctx, batch);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// After a successful delivery, give one parked batch another chance.
async fn retry_one_parked(ctx: &WorkerContext) {
    let Some(batch) = ctx.retry_buffer.lock().pop() else {
        return;
    };

    match ctx.sink.deliver(&batch).await {
        Ok(bytes) => {
            record_delivery(ctx, &batch, bytes);
            debug!(source = %ctx.source.name, "Delivered parked batch");
        }
        Err(SinkError::Permanent(message)) => {
            drop_batch(ctx, &batch, &message);
        }
        Err(SinkError::Transient(_)) => {
            ctx.retry_buffer.lock().requeue_front(batch);
        }
    }
}

fn record_delivery(ctx: &WorkerContext, batch: &[CanonicalLog], bytes: u64) {
    ctx.metrics
        .events_delivered
        .fetch_add(represented_events(batch), Ordering::Relaxed);
    ctx.metrics.bytes_delivered.fetch_add(bytes, Ordering::Relaxed);
}

fn drop_batch(ctx: &WorkerContext, batch: &[CanonicalLog], message: &str) {
    error!(source = %ctx.source.name, error = %message, "Dropping batch after permanent sink failure");
    ctx.metrics.set_last_error(message);
    ctx.metrics
        .events_dropped_sink
        .fetch_add(represented_events(batch), Ordering::Relaxed);
}

fn park_batch(ctx: &WorkerContext, batch: Vec<CanonicalLog>) {
    let events = represented_events(&batch);
    let discarded = ctx.retry_buffer.lock().park(batch);

    ctx.metrics.batches_parked.fetch_add(1, Ordering::Relaxed);
    warn!(source = %ctx.source.name, events, "Parked batch after exhausting retries");

    if let Some(old) = discarded {
        ctx.metrics
            .batches_discarded
            .fetch_add(1, Ordering::Relaxed);
        ctx.metrics
            .events_dropped_sink
            .fetch_add(represented_events(&old), Ordering::Relaxed);
    }
}

/// Number of original events a canonical batch stands for; aggregated
/// records carry their group size.
fn represented_events(batch: &[CanonicalLog]) -> u64 {
    batch
        .iter()
        .map(|log| {
            log.event
                .get("aggregated_count")
                .and_then(Value::as_u64)
                .unwrap_or(1)
        })
        .sum()
}
