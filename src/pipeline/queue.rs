use crate::canonical::RawRecord;
use crate::metrics::SourceMetrics;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Queue capacity is a multiple of the scale-up threshold; records
/// arriving beyond it are dropped, which is the backpressure mechanism.
pub const QUEUE_CAPACITY_FACTOR: usize = 4;

/// The bounded MPMC queue between an endpoint and a source's workers.
pub struct SourceQueue {
    tx: flume::Sender<RawRecord>,
    rx: flume::Receiver<RawRecord>,
}

impl SourceQueue {
    pub fn new(queue_limit: usize) -> Self {
        let capacity = queue_limit.saturating_mul(QUEUE_CAPACITY_FACTOR).max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    pub fn depth(&self) -> usize {
        self.rx.len()
    }

    pub fn receiver(&self) -> flume::Receiver<RawRecord> {
        self.rx.clone()
    }

    /// Producer-side handle given to listeners via the routing table.
    pub fn handle(&self, metrics: Arc<SourceMetrics>) -> QueueHandle {
        QueueHandle {
            tx: self.tx.clone(),
            metrics,
        }
    }
}

/// Non-blocking enqueue capability for one source. The ingest path never
/// waits: a full queue drops the record and bumps the drop counter.
#[derive(Clone)]
pub struct QueueHandle {
    tx: flume::Sender<RawRecord>,
    metrics: Arc<SourceMetrics>,
}

impl QueueHandle {
    pub fn enqueue(&self, record: RawRecord) {
        self.metrics.events_in.fetch_add(1, Ordering::Relaxed);
        if self.tx.try_send(record).is_err() {
            self.metrics
                .events_dropped_queue_full
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn metrics(&self) -> &Arc<SourceMetrics> {
        &self.metrics
    }
}
