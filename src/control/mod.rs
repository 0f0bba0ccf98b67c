pub mod api;
pub mod server;

use crate::config::store::{ConfigError, ConfigStore};
use crate::config::types::{
    AggregationPolicy, AppConfig, FilterRule, Source, SourceSpec,
};
use crate::listener::{canonical_ip, EndpointKey, ListenerMux, Route, RouteTable};
use crate::metrics::{MetricsRegistry, MetricsReport};
use crate::pipeline::ProcessorPool;
use crate::sink::SinkError;
use crate::template::{LogTemplate, TemplateError, TemplateStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("bind failure: {0}")]
    Bind(String),
}

#[derive(Debug, Default, Serialize)]
pub struct ReloadReport {
    pub pools_started: usize,
    pub pools_stopped: usize,
    pub endpoints_active: usize,
    pub bind_failures: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: String,
    pub running: bool,
    pub uptime_seconds: u64,
    pub sources: usize,
    pub endpoints: usize,
}

struct RuntimeState {
    mux: ListenerMux,
    pools: HashMap<Uuid, ProcessorPool>,
    running: bool,
}

/// Wires the stores, listeners, and processor pools together and owns
/// their lifecycle. `reload()` is the single reconciliation point: it
/// diffs the desired source set against running pools and endpoints and
/// applies the difference.
pub struct ControlPlane {
    app: AppConfig,
    config: Arc<ConfigStore>,
    templates: Arc<TemplateStore>,
    metrics: Arc<MetricsRegistry>,
    runtime: Mutex<RuntimeState>,
    started_at: std::time::Instant,
}

impl ControlPlane {
    pub fn new(app: AppConfig) -> Result<Self, ControlError> {
        let config = Arc::new(ConfigStore::open(&app.data_dir)?);
        let templates = Arc::new(TemplateStore::open(&app.data_dir)?);
        let metrics = Arc::new(MetricsRegistry::new());
        let mux = ListenerMux::new(
            metrics.clone(),
            app.pipeline.effective_idle_timeout(),
            app.pipeline.drain_deadline,
        );

        Ok(Self {
            app,
            config,
            templates,
            metrics,
            runtime: Mutex::new(RuntimeState {
                mux,
                pools: HashMap::new(),
                running: false,
            }),
            started_at: std::time::Instant::now(),
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Bring the pipeline up. Unlike a reload, a bind failure here is
    /// fatal so the launcher can exit with the dedicated code.
    pub async fn start(&self) -> Result<(), ControlError> {
        {
            let mut state = self.runtime.lock().await;
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        info!("Starting pipeline");
        let report = self.reload().await?;
        if !report.bind_failures.is_empty() {
            self.stop().await;
            return Err(ControlError::Bind(report.bind_failures.join("; ")));
        }
        Ok(())
    }

    /// Stop listeners first so no new records arrive, then drain every
    /// pool. After this returns no socket is open and no worker runs.
    pub async fn stop(&self) {
        let mut state = self.runtime.lock().await;
        if !state.running {
            return;
        }

        info!("Stopping pipeline");
        state.mux.shutdown().await;

        let pools: Vec<ProcessorPool> = state.pools.drain().map(|(_, pool)| pool).collect();
        futures::future::join_all(pools.into_iter().map(|pool| pool.shutdown())).await;

        state.running = false;
        info!("Pipeline stopped");
    }

    /// Reconcile running state with the configured source set: stop
    /// pools whose source changed or vanished, start missing ones, then
    /// diff endpoints and swap routing tables. A no-op configuration
    /// change causes no socket reopen and no worker restart.
    pub async fn reload(&self) -> Result<ReloadReport, ControlError> {
        let mut state = self.runtime.lock().await;
        if !state.running {
            return Ok(ReloadReport::default());
        }

        let sources = self.config.sources();
        let desired: HashMap<Uuid, Arc<Source>> =
            sources.iter().map(|s| (s.id, s.clone())).collect();

        // Pools whose source record changed are replaced whole; a source
        // is immutable once created
        let stale: Vec<Uuid> = state
            .pools
            .iter()
            .filter(|(id, pool)| {
                desired
                    .get(id)
                    .map(|source| source.as_ref() != pool.source().as_ref())
                    .unwrap_or(true)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut report = ReloadReport::default();
        for id in stale {
            if let Some(pool) = state.pools.remove(&id) {
                pool.shutdown().await;
                report.pools_stopped += 1;
            }
            if !desired.contains_key(&id) {
                self.metrics.remove(id);
            }
        }

        for source in sources.iter() {
            if state.pools.contains_key(&source.id) {
                continue;
            }
            let pool = ProcessorPool::spawn(
                source.clone(),
                self.config.clone(),
                self.templates.clone(),
                self.metrics.source(source.id),
                &self.app.pipeline,
            )?;
            state.pools.insert(source.id, pool);
            report.pools_started += 1;
        }

        let mut endpoints: HashMap<EndpointKey, RouteTable> = HashMap::new();
        for source in sources.iter() {
            let Some(pool) = state.pools.get(&source.id) else {
                continue;
            };
            let table = endpoints.entry(source.endpoint()).or_default();
            for ip in &source.source_ips {
                table.insert(
                    canonical_ip(*ip),
                    Route {
                        source_id: source.id,
                        queue: pool.route_handle(),
                    },
                );
            }
        }

        for failure in state.mux.reconcile(endpoints).await {
            let message = format!(
                "bind {}/{} failed: {}",
                failure.endpoint.0, failure.endpoint.1, failure.error
            );
            for source in sources.iter().filter(|s| s.endpoint() == failure.endpoint) {
                self.metrics.source(source.id).set_last_error(&message);
            }
            report.bind_failures.push(message);
        }

        report.endpoints_active = state.mux.endpoint_count();
        Ok(report)
    }

    pub fn metrics(&self) -> MetricsReport {
        self.metrics.report(&self.config.sources())
    }

    pub async fn status(&self) -> StatusReport {
        let state = self.runtime.lock().await;
        StatusReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            running: state.running,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            sources: self.config.sources().len(),
            endpoints: state.mux.endpoint_count(),
        }
    }

    pub async fn add_source(&self, spec: SourceSpec) -> Result<Arc<Source>, ControlError> {
        let source = self.config.add_source(spec)?;
        self.reload().await?;
        Ok(source)
    }

    pub async fn update_source(
        &self,
        id: Uuid,
        spec: SourceSpec,
    ) -> Result<Arc<Source>, ControlError> {
        let source = self.config.update_source(id, spec)?;
        self.reload().await?;
        Ok(source)
    }

    /// Delete a source: its pool drains, its queue and learned template
    /// go with it.
    pub async fn delete_source(&self, id: Uuid) -> Result<(), ControlError> {
        self.config.delete_source(id)?;
        self.templates.delete(id)?;
        self.reload().await?;
        Ok(())
    }

    pub fn template(&self, id: Uuid) -> Option<Arc<LogTemplate>> {
        self.templates.get(id)
    }

    pub fn delete_template(&self, id: Uuid) -> Result<bool, ControlError> {
        Ok(self.templates.delete(id)?)
    }

    /// Policy updates are hot: workers pick them up at the next batch
    /// without a pool restart.
    pub fn set_filters(&self, id: Uuid, rules: Vec<FilterRule>) -> Result<(), ControlError> {
        Ok(self.config.set_filters(id, rules)?)
    }

    pub fn set_aggregation(
        &self,
        id: Uuid,
        policy: Option<AggregationPolicy>,
    ) -> Result<(), ControlError> {
        Ok(self.config.set_aggregation(id, policy)?)
    }
}
