pub mod queue;
pub mod supervisor;
pub mod worker;

pub use queue::{QueueHandle, SourceQueue, QUEUE_CAPACITY_FACTOR};
pub use worker::WorkerContext;

use crate::config::store::ConfigStore;
use crate::config::types::{PipelineConfig, Source};
use crate::metrics::SourceMetrics;
use crate::sink::retry::DEFAULT_RETRY_BUFFER_CAP;
use crate::sink::{build_sink, RetryBuffer, SinkError};
use crate::template::TemplateStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A running per-source pool: the bounded queue, one supervisor, and
/// its dynamically scaled workers.
pub struct ProcessorPool {
    source: Arc<Source>,
    queue: Arc<SourceQueue>,
    metrics: Arc<SourceMetrics>,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl ProcessorPool {
    /// Build the sink, queue, and worker context for a source and start
    /// its supervisor.
    pub fn spawn(
        source: Arc<Source>,
        config: Arc<ConfigStore>,
        templates: Arc<TemplateStore>,
        metrics: Arc<SourceMetrics>,
        pipeline: &PipelineConfig,
    ) -> Result<Self, SinkError> {
        let sink = build_sink(&source)?;
        let queue = Arc::new(SourceQueue::new(source.queue_limit));

        let ctx = Arc::new(WorkerContext {
            source: source.clone(),
            receiver: queue.receiver(),
            metrics: metrics.clone(),
            config,
            templates,
            sink,
            retry_buffer: Arc::new(Mutex::new(RetryBuffer::new(DEFAULT_RETRY_BUFFER_CAP))),
            max_batch_latency: pipeline.max_batch_latency,
        });

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervisor::run_supervisor(
            ctx,
            queue.clone(),
            pipeline.drain_deadline,
            cancel.clone(),
        ));

        info!(source = %source.name, "Processor pool started");

        Ok(Self {
            source,
            queue,
            metrics,
            cancel,
            supervisor,
        })
    }

    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    /// Enqueue capability handed to listeners via the routing table.
    pub fn route_handle(&self) -> QueueHandle {
        self.queue.handle(self.metrics.clone())
    }

    /// Stop the pool: workers finish in-flight batches within the drain
    /// deadline, then the supervisor exits.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.supervisor.await;
    }
}
