use crate::template::extract::{infer_type, FieldType};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// A learned field schema for one source: the ordered field names and
/// inferred types from the first successfully parsed record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTemplate {
    pub fields: Vec<TemplateField>,
    pub created_at: DateTime<Utc>,
}

/// Holds one lazily learned template per source, persisted as
/// `templates/<source_id>.json` under the data directory.
///
/// Learning is first-writer-wins: once a template exists for a source it
/// is never overwritten implicitly; deletion is an explicit operation.
pub struct TemplateStore {
    dir: PathBuf,
    templates: RwLock<HashMap<Uuid, Arc<LogTemplate>>>,
}

impl TemplateStore {
    pub fn open(data_dir: &Path) -> Result<Self, TemplateError> {
        let dir = data_dir.join("templates");
        fs::create_dir_all(&dir)?;

        let mut templates = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            match fs::read_to_string(&path)
                .map_err(TemplateError::Io)
                .and_then(|c| serde_json::from_str(&c).map_err(TemplateError::Serde))
            {
                Ok(template) => {
                    templates.insert(id, Arc::new(template));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable template");
                }
            }
        }

        Ok(Self {
            dir,
            templates: RwLock::new(templates),
        })
    }

    pub fn get(&self, source_id: Uuid) -> Option<Arc<LogTemplate>> {
        self.templates.read().get(&source_id).cloned()
    }

    /// Learn a template from extracted fields if none exists yet for the
    /// source. Returns the template now in effect.
    pub fn learn_if_absent(
        &self,
        source_id: Uuid,
        fields: &[(String, String)],
    ) -> Result<Arc<LogTemplate>, TemplateError> {
        if let Some(existing) = self.get(source_id) {
            return Ok(existing);
        }

        let template = Arc::new(LogTemplate {
            fields: fields
                .iter()
                .map(|(name, value)| TemplateField {
                    name: name.clone(),
                    field_type: infer_type(value),
                })
                .collect(),
            created_at: Utc::now(),
        });

        let mut templates = self.templates.write();
        // Another worker may have raced us here; first writer wins
        if let Some(existing) = templates.get(&source_id) {
            return Ok(existing.clone());
        }

        self.persist(source_id, &template)?;
        templates.insert(source_id, template.clone());
        info!(source_id = %source_id, fields = template.fields.len(), "Learned template");
        Ok(template)
    }

    pub fn delete(&self, source_id: Uuid) -> Result<bool, TemplateError> {
        let existed = self.templates.write().remove(&source_id).is_some();
        let path = self.path(source_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(existed)
    }

    fn path(&self, source_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", source_id))
    }

    fn persist(&self, source_id: Uuid, template: &LogTemplate) -> Result<(), TemplateError> {
        let path = self.path(source_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(template)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::extract::extract_fields;
    use tempfile::TempDir;

    #[test]
    fn test_learn_once_and_persist() {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::open(dir.path()).unwrap();
        let id = Uuid::new_v4();

        let fields = extract_fields("level=INFO count=42 ok=true");
        let template = store.learn_if_absent(id, &fields).unwrap();
        assert_eq!(template.fields.len(), 3);
        assert_eq!(template.fields[0].name, "level");
        assert_eq!(template.fields[0].field_type, FieldType::String);
        assert_eq!(template.fields[1].field_type, FieldType::Int);
        assert_eq!(template.fields[2].field_type, FieldType::Bool);

        // A second sample with a different shape does not replace it
        let other = extract_fields("totally different payload");
        let unchanged = store.learn_if_absent(id, &other).unwrap();
        assert_eq!(unchanged.fields.len(), 3);

        // Reopen sees the persisted template
        let reopened = TemplateStore::open(dir.path()).unwrap();
        let loaded = reopened.get(id).unwrap();
        assert_eq!(loaded.fields.len(), 3);
    }

    #[test]
    fn test_delete_is_explicit() {
        let dir = TempDir::new().unwrap();
        let store = TemplateStore::open(dir.path()).unwrap();
        let id = Uuid::new_v4();

        let fields = extract_fields("a=1");
        store.learn_if_absent(id, &fields).unwrap();
        assert!(store.delete(id).unwrap());
        assert!(store.get(id).is_none());
        assert!(!store.delete(id).unwrap());

        // After deletion a new template may be learned
        let relearned = store
            .learn_if_absent(id, &extract_fields("b=2 c=3"))
            .unwrap();
        assert_eq!(relearned.fields.len(), 2);
    }
}
