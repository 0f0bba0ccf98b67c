use crate::config::types::{
    AggregationPolicy, FilterRule, Source, SourceSpec, validate_source,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown source: {0}")]
    UnknownSource(Uuid),
}

/// Per-source processing policies, read by workers as one snapshot at
/// batch start so rule updates land without a processor restart.
#[derive(Debug, Default, Clone)]
pub struct SourcePolicies {
    pub aggregation: Option<AggregationPolicy>,
    pub filters: Vec<FilterRule>,
}

/// Loads, validates, and persists the source set and per-source policies.
///
/// On-disk layout under the data directory:
///   sources.json               — the full source list
///   aggregation/<id>.json      — optional aggregation policy
///   filters/<id>.json          — filter rule list
///
/// All writes go through a tmp-file rename so readers never observe a
/// partially written file. The in-memory source set is an Arc snapshot
/// replaced under a write lock; readers clone the Arc and never block
/// writers for long.
pub struct ConfigStore {
    data_dir: PathBuf,
    sources: RwLock<Arc<Vec<Arc<Source>>>>,
    policies: RwLock<HashMap<Uuid, Arc<SourcePolicies>>>,
}

impl ConfigStore {
    /// Open the store, creating the data directory layout if missing and
    /// loading any persisted state.
    pub fn open(data_dir: &Path) -> Result<Self, ConfigError> {
        fs::create_dir_all(data_dir)?;
        fs::create_dir_all(data_dir.join("aggregation"))?;
        fs::create_dir_all(data_dir.join("filters"))?;

        let store = Self {
            data_dir: data_dir.to_path_buf(),
            sources: RwLock::new(Arc::new(Vec::new())),
            policies: RwLock::new(HashMap::new()),
        };

        store.load()?;
        Ok(store)
    }

    fn sources_path(&self) -> PathBuf {
        self.data_dir.join("sources.json")
    }

    fn aggregation_path(&self, id: Uuid) -> PathBuf {
        self.data_dir.join("aggregation").join(format!("{}.json", id))
    }

    fn filters_path(&self, id: Uuid) -> PathBuf {
        self.data_dir.join("filters").join(format!("{}.json", id))
    }

    fn load(&self) -> Result<(), ConfigError> {
        let path = self.sources_path();
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&path)?;
        let loaded: Vec<Source> = serde_json::from_str(&content)?;
        let sources: Vec<Arc<Source>> = loaded.into_iter().map(Arc::new).collect();

        let mut policies = HashMap::new();
        for source in &sources {
            policies.insert(source.id, Arc::new(self.load_policies(source.id)));
        }

        info!(count = sources.len(), "Loaded source configuration");
        *self.sources.write() = Arc::new(sources);
        *self.policies.write() = policies;
        Ok(())
    }

    fn load_policies(&self, id: Uuid) -> SourcePolicies {
        let aggregation = read_json_opt(&self.aggregation_path(id));
        let filters: Option<Vec<FilterRule>> = read_json_opt(&self.filters_path(id));

        SourcePolicies {
            aggregation,
            filters: filters.unwrap_or_default(),
        }
    }

    /// Current source set snapshot.
    pub fn sources(&self) -> Arc<Vec<Arc<Source>>> {
        self.sources.read().clone()
    }

    pub fn source(&self, id: Uuid) -> Option<Arc<Source>> {
        self.sources.read().iter().find(|s| s.id == id).cloned()
    }

    /// Policy snapshot for one source; empty policies if none configured.
    pub fn policies(&self, id: Uuid) -> Arc<SourcePolicies> {
        self.policies
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Validate and add a new source. Rejection leaves all state
    /// untouched.
    pub fn add_source(&self, spec: SourceSpec) -> Result<Arc<Source>, ConfigError> {
        let source = Arc::new(Source::from_spec(spec));

        let mut sources = self.sources.write();
        validate_source(&source, &sources).map_err(ConfigError::Validation)?;

        let mut next: Vec<Arc<Source>> = sources.as_ref().clone();
        next.push(source.clone());
        self.persist_sources(&next)?;

        *sources = Arc::new(next);
        self.policies
            .write()
            .insert(source.id, Arc::new(SourcePolicies::default()));

        info!(source = %source.name, id = %source.id, "Added source");
        Ok(source)
    }

    /// Replace an existing source record atomically.
    pub fn update_source(&self, id: Uuid, spec: SourceSpec) -> Result<Arc<Source>, ConfigError> {
        let mut sources = self.sources.write();
        let index = sources
            .iter()
            .position(|s| s.id == id)
            .ok_or(ConfigError::UnknownSource(id))?;

        let updated = Arc::new(Source {
            id,
            name: spec.name,
            source_ips: spec.source_ips,
            port: spec.port,
            protocol: spec.protocol,
            target: spec.target,
            queue_limit: spec.queue_limit,
            max_workers: spec.max_workers,
        });

        let others: Vec<Arc<Source>> = sources
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        validate_source(&updated, &others).map_err(ConfigError::Validation)?;

        let mut next: Vec<Arc<Source>> = sources.as_ref().clone();
        next[index] = updated.clone();
        self.persist_sources(&next)?;

        *sources = Arc::new(next);
        info!(source = %updated.name, id = %id, "Updated source");
        Ok(updated)
    }

    /// Remove a source and its persisted policies.
    pub fn delete_source(&self, id: Uuid) -> Result<Arc<Source>, ConfigError> {
        let mut sources = self.sources.write();
        let index = sources
            .iter()
            .position(|s| s.id == id)
            .ok_or(ConfigError::UnknownSource(id))?;

        let mut next: Vec<Arc<Source>> = sources.as_ref().clone();
        let removed = next.remove(index);
        self.persist_sources(&next)?;

        *sources = Arc::new(next);
        self.policies.write().remove(&id);

        for path in [self.aggregation_path(id), self.filters_path(id)] {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove policy file");
                }
            }
        }

        info!(source = %removed.name, id = %id, "Deleted source");
        Ok(removed)
    }

    /// Set or clear the aggregation policy for a source. Takes effect at
    /// the next batch.
    pub fn set_aggregation(
        &self,
        id: Uuid,
        policy: Option<AggregationPolicy>,
    ) -> Result<(), ConfigError> {
        self.source(id).ok_or(ConfigError::UnknownSource(id))?;

        match &policy {
            Some(p) => write_json_atomic(&self.aggregation_path(id), p)?,
            None => {
                let path = self.aggregation_path(id);
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
        }

        let mut policies = self.policies.write();
        let current = policies.get(&id).cloned().unwrap_or_default();
        policies.insert(
            id,
            Arc::new(SourcePolicies {
                aggregation: policy,
                filters: current.filters.clone(),
            }),
        );
        Ok(())
    }

    /// Replace the filter rule set for a source. Takes effect at the next
    /// batch.
    pub fn set_filters(&self, id: Uuid, filters: Vec<FilterRule>) -> Result<(), ConfigError> {
        self.source(id).ok_or(ConfigError::UnknownSource(id))?;

        for rule in &filters {
            if rule.field_name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "filter field_name must not be empty".to_string(),
                ));
            }
        }

        write_json_atomic(&self.filters_path(id), &filters)?;

        let mut policies = self.policies.write();
        let current = policies.get(&id).cloned().unwrap_or_default();
        policies.insert(
            id,
            Arc::new(SourcePolicies {
                aggregation: current.aggregation.clone(),
                filters,
            }),
        );
        Ok(())
    }

    fn persist_sources(&self, sources: &[Arc<Source>]) -> Result<(), ConfigError> {
        let plain: Vec<&Source> = sources.iter().map(|s| s.as_ref()).collect();
        write_json_atomic(&self.sources_path(), &plain)
    }
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(value)?;
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable policy file");
            None
        }
    }
}
