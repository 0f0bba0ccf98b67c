use crate::pipeline::queue::SourceQueue;
use crate::pipeline::worker::{run_worker, WorkerContext};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Consecutive low-pressure ticks required before a worker retires.
pub const SCALE_DOWN_TICKS: u32 = 30;

struct WorkerSlot {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-source supervisor: owns the worker set and scales it on a 1 Hz
/// tick.
///
/// Scale up one worker when queue depth exceeds `queue_limit` (until
/// `max_workers`); scale down one after `SCALE_DOWN_TICKS` consecutive
/// ticks below a quarter of `queue_limit` (never below one worker). A
/// retiring worker finishes its current batch before exiting.
///
/// On cancellation the supervisor drains: workers get the drain
/// deadline to finish in-flight batches, anything still queued after
/// that is counted as lost.
pub async fn run_supervisor(
    ctx: Arc<WorkerContext>,
    queue: Arc<SourceQueue>,
    drain_deadline: Duration,
    cancel: CancellationToken,
) {
    let mut workers: Vec<WorkerSlot> = vec![spawn_worker(&ctx)];
    let mut retiring: Vec<JoinHandle<()>> = Vec::new();
    let mut low_ticks = 0u32;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                workers.retain(|slot| !slot.handle.is_finished());
                retiring.retain(|handle| !handle.is_finished());

                // A worker that died (closed channel) must not leave the
                // source unserved
                if workers.is_empty() {
                    workers.push(spawn_worker(&ctx));
                }

                let depth = queue.depth();
                ctx.metrics.queue_depth.store(depth as u64, Ordering::Relaxed);
                ctx.metrics.workers_active.store(workers.len() as u64, Ordering::Relaxed);

                if depth > ctx.source.queue_limit && workers.len() < ctx.source.max_workers {
                    workers.push(spawn_worker(&ctx));
                    low_ticks = 0;
                    info!(
                        source = %ctx.source.name,
                        depth,
                        workers = workers.len(),
                        "Scaled up workers"
                    );
                } else if depth < ctx.source.queue_limit / 4 {
                    low_ticks += 1;
                    if low_ticks >= SCALE_DOWN_TICKS && workers.len() > 1 {
                        if let Some(slot) = workers.pop() {
                            slot.cancel.cancel();
                            retiring.push(slot.handle);
                        }
                        low_ticks = 0;
                        info!(
                            source = %ctx.source.name,
                            workers = workers.len(),
                            "Scaled down workers"
                        );
                    }
                } else {
                    low_ticks = 0;
                }
            }
        }
    }

    drain(&ctx, &queue, workers, retiring, drain_deadline).await;
}

fn spawn_worker(ctx: &Arc<WorkerContext>) -> WorkerSlot {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_worker(ctx.clone(), cancel.clone()));
    WorkerSlot { cancel, handle }
}

async fn drain(
    ctx: &WorkerContext,
    queue: &SourceQueue,
    workers: Vec<WorkerSlot>,
    retiring: Vec<JoinHandle<()>>,
    drain_deadline: Duration,
) {
    for slot in &workers {
        slot.cancel.cancel();
    }

    let deadline = Instant::now() + drain_deadline;
    let handles = workers
        .into_iter()
        .map(|slot| slot.handle)
        .chain(retiring);

    for mut handle in handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, &mut handle).await.is_err() {
            warn!(source = %ctx.source.name, "Worker exceeded drain deadline, aborting");
            handle.abort();
        }
    }

    let lost = queue.depth() as u64;
    if lost > 0 {
        warn!(source = %ctx.source.name, lost, "Records lost at shutdown");
        ctx.metrics
            .events_lost_shutdown
            .fetch_add(lost, Ordering::Relaxed);
    }

    ctx.metrics.queue_depth.store(lost, Ordering::Relaxed);
    ctx.metrics.workers_active.store(0, Ordering::Relaxed);
    info!(source = %ctx.source.name, "Processor pool stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{CanonicalLog, RawRecord};
    use crate::config::store::ConfigStore;
    use crate::config::types::{Compression, Protocol, SourceSpec, Target};
    use crate::metrics::SourceMetrics;
    use crate::sink::{RetryBuffer, Sink, SinkError};
    use crate::template::TemplateStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Sink that takes a fixed amount of (virtual) time per batch.
    struct SlowSink {
        delay: Duration,
    }

    #[async_trait]
    impl Sink for SlowSink {
        async fn deliver(&self, batch: &[CanonicalLog]) -> Result<u64, SinkError> {
            tokio::time::sleep(self.delay).await;
            Ok(batch.len() as u64)
        }
    }

    fn slow_pool(
        dir: &TempDir,
        queue_limit: usize,
        max_workers: usize,
        delay: Duration,
    ) -> (Arc<WorkerContext>, Arc<SourceQueue>) {
        let config = Arc::new(ConfigStore::open(dir.path()).unwrap());
        let templates = Arc::new(TemplateStore::open(dir.path()).unwrap());

        let source = config
            .add_source(SourceSpec {
                name: "scaling".to_string(),
                source_ips: vec!["10.0.0.1".parse().unwrap()],
                port: 7000,
                protocol: Protocol::Udp,
                target: Target::Folder {
                    path: PathBuf::from("/tmp/unused"),
                    batch_size: 1,
                    compression: Compression::None,
                },
                queue_limit,
                max_workers,
            })
            .unwrap();

        let queue = Arc::new(SourceQueue::new(queue_limit));
        let ctx = Arc::new(WorkerContext {
            source,
            receiver: queue.receiver(),
            metrics: Arc::new(SourceMetrics::default()),
            config,
            templates,
            sink: Arc::new(SlowSink { delay }),
            retry_buffer: Arc::new(Mutex::new(RetryBuffer::new(100))),
            max_batch_latency: Duration::from_millis(10),
        });

        (ctx, queue)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_under_backlog() {
        let dir = TempDir::new().unwrap();
        let (ctx, queue) = slow_pool(&dir, 5, 3, Duration::from_secs(1));

        let handle = queue.handle(ctx.metrics.clone());
        for i in 0..100 {
            handle.enqueue(RawRecord::new(format!("r{}", i)));
        }

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(run_supervisor(
            ctx.clone(),
            queue.clone(),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        // Backlog stays above queue_limit; one worker added per tick
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ctx.metrics.workers_active.load(Ordering::Relaxed), 3);

        cancel.cancel();
        supervisor.await.unwrap();
        assert_eq!(ctx.metrics.workers_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_after_sustained_low_pressure() {
        let dir = TempDir::new().unwrap();
        let (ctx, queue) = slow_pool(&dir, 5, 2, Duration::from_secs(1));

        let handle = queue.handle(ctx.metrics.clone());
        for i in 0..30 {
            handle.enqueue(RawRecord::new(format!("r{}", i)));
        }

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(run_supervisor(
            ctx.clone(),
            queue.clone(),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(ctx.metrics.workers_active.load(Ordering::Relaxed), 2);

        // Drain the backlog, then sit below the low-pressure threshold
        // for the required consecutive ticks
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.depth(), 0);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(ctx.metrics.workers_active.load(Ordering::Relaxed), 1);

        cancel.cancel();
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_counts_lost_records() {
        let dir = TempDir::new().unwrap();
        // A sink slow enough that the backlog cannot drain in time
        let (ctx, queue) = slow_pool(&dir, 5, 1, Duration::from_secs(60));

        let handle = queue.handle(ctx.metrics.clone());
        for i in 0..10 {
            handle.enqueue(RawRecord::new(format!("r{}", i)));
        }

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(run_supervisor(
            ctx.clone(),
            queue.clone(),
            Duration::from_millis(200),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        supervisor.await.unwrap();

        assert!(ctx.metrics.events_lost_shutdown.load(Ordering::Relaxed) > 0);
        assert_eq!(ctx.metrics.workers_active.load(Ordering::Relaxed), 0);
    }
}
