pub mod store;
pub mod types;

use std::path::{Path, PathBuf};
use thiserror::Error;

pub use store::{ConfigError, ConfigStore, SourcePolicies};
pub use types::{
    AggregationPolicy, AppConfig, Compression, FilterRule, Protocol, Source, SourceSpec, Target,
};

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Load the app-level YAML config, or defaults when no file exists.
pub fn load_app_config(path: Option<&Path>) -> Result<AppConfig, AppConfigError> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&content)?)
        }
        None => Ok(AppConfig::default()),
    }
}

/// Resolves the config file path based on explicit argument or default
/// locations. Returns the first existing path from:
/// 1. Explicit path (if provided)
/// 2. ~/.config/siphon/siphon.yml
/// 3. /etc/siphon/siphon.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/siphon/siphon.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/siphon/siphon.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// A commented default config, emitted by `siphon config init`.
pub fn default_config_template() -> &'static str {
    r#"# siphon configuration
#
# Directory holding persisted state: sources.json, templates/,
# aggregation/, filters/.
data_dir: ./siphon-data

control:
  # Address the control API listens on.
  listen: "127.0.0.1:8686"

pipeline:
  # A batch closes when it reaches the target batch_size or when its
  # first record is this old, whichever comes first.
  max_batch_latency: 1s
  # How long workers get to finish in-flight batches on shutdown.
  drain_deadline: 10s
  # TCP connections idle longer than this are closed (minimum 60s).
  idle_timeout: 60s
"#
}
