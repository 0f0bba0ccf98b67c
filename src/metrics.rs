use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::System;
use uuid::Uuid;

use crate::config::types::Source;

/// Per-source counters. Increment-only atomics except the two gauges
/// (`queue_depth`, `workers_active`) which the supervisor refreshes on
/// its tick, and `last_error` which records the most recent failure.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    pub events_in: AtomicU64,
    pub events_dropped_queue_full: AtomicU64,
    pub events_dropped_filter: AtomicU64,
    pub events_dropped_parse: AtomicU64,
    pub events_dropped_sink: AtomicU64,
    pub events_delivered: AtomicU64,
    pub bytes_delivered: AtomicU64,
    pub events_lost_shutdown: AtomicU64,
    pub sink_retries: AtomicU64,
    pub batches_parked: AtomicU64,
    pub batches_discarded: AtomicU64,
    pub queue_depth: AtomicU64,
    pub workers_active: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SourceMetrics {
    pub fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn report(&self, id: Uuid, name: &str) -> SourceReport {
        SourceReport {
            id,
            name: name.to_string(),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            workers_active: self.workers_active.load(Ordering::Relaxed),
            events_in: self.events_in.load(Ordering::Relaxed),
            events_dropped_queue_full: self.events_dropped_queue_full.load(Ordering::Relaxed),
            events_dropped_filter: self.events_dropped_filter.load(Ordering::Relaxed),
            events_dropped_parse: self.events_dropped_parse.load(Ordering::Relaxed),
            events_dropped_sink: self.events_dropped_sink.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            events_lost_shutdown: self.events_lost_shutdown.load(Ordering::Relaxed),
            sink_retries: self.sink_retries.load(Ordering::Relaxed),
            batches_parked: self.batches_parked.load(Ordering::Relaxed),
            batches_discarded: self.batches_discarded.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub id: Uuid,
    pub name: String,
    pub queue_depth: u64,
    pub workers_active: u64,
    pub events_in: u64,
    pub events_dropped_queue_full: u64,
    pub events_dropped_filter: u64,
    pub events_dropped_parse: u64,
    pub events_dropped_sink: u64,
    pub events_delivered: u64,
    pub bytes_delivered: u64,
    pub events_lost_shutdown: u64,
    pub sink_retries: u64,
    pub batches_parked: u64,
    pub batches_discarded: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_available_bytes: u64,
    pub disk_total_bytes: u64,
    pub network_received_bytes: u64,
    pub network_transmitted_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub sources: Vec<SourceReport>,
    pub unknown_peer_drops: u64,
    pub system: SystemSnapshot,
}

/// Registry of per-source metrics plus the sysinfo handle used for
/// system-wide snapshots.
pub struct MetricsRegistry {
    sources: RwLock<HashMap<Uuid, Arc<SourceMetrics>>>,
    pub unknown_peer_drops: AtomicU64,
    system: Mutex<System>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();

        Self {
            sources: RwLock::new(HashMap::new()),
            unknown_peer_drops: AtomicU64::new(0),
            system: Mutex::new(system),
        }
    }

    /// Get or create the metrics handle for a source.
    pub fn source(&self, id: Uuid) -> Arc<SourceMetrics> {
        if let Some(metrics) = self.sources.read().get(&id) {
            return metrics.clone();
        }
        self.sources
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(SourceMetrics::default()))
            .clone()
    }

    pub fn remove(&self, id: Uuid) {
        self.sources.write().remove(&id);
    }

    /// Build the full report: one entry per known source (ordered as
    /// given) plus a fresh system snapshot.
    pub fn report(&self, sources: &[Arc<Source>]) -> MetricsReport {
        let handles = self.sources.read().clone();
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            if let Some(metrics) = handles.get(&source.id) {
                reports.push(metrics.report(source.id, &source.name));
            }
        }

        MetricsReport {
            sources: reports,
            unknown_peer_drops: self.unknown_peer_drops.load(Ordering::Relaxed),
            system: self.system_snapshot(),
        }
    }

    fn system_snapshot(&self) -> SystemSnapshot {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .iter()
            .fold((0u64, 0u64), |(total, avail), disk| {
                (total + disk.total_space(), avail + disk.available_space())
            });

        let networks = sysinfo::Networks::new_with_refreshed_list();
        let (net_rx, net_tx) = networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });

        SystemSnapshot {
            cpu_percent: system.global_cpu_info().cpu_usage(),
            memory_used_bytes: system.used_memory(),
            memory_total_bytes: system.total_memory(),
            disk_available_bytes: disk_available,
            disk_total_bytes: disk_total,
            network_received_bytes: net_rx,
            network_transmitted_bytes: net_tx,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
