use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Process-level settings loaded from the YAML config file.
///
/// An explicit `AppConfig` value is passed into control plane
/// construction; there is no process-global configuration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            control: ControlConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./siphon-data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_listen")]
    pub listen: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
        }
    }
}

fn default_control_listen() -> String {
    "127.0.0.1:8686".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Oldest a batch's first record may get before the batch closes.
    #[serde(with = "humantime_serde", default = "default_max_batch_latency")]
    pub max_batch_latency: Duration,
    /// How long workers get to finish in-flight batches on shutdown.
    #[serde(with = "humantime_serde", default = "default_drain_deadline")]
    pub drain_deadline: Duration,
    /// Inactivity window after which TCP connections are closed. Clamped
    /// to at least 60s.
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

impl PipelineConfig {
    pub fn effective_idle_timeout(&self) -> Duration {
        self.idle_timeout.max(MIN_IDLE_TIMEOUT)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_latency: default_max_batch_latency(),
            drain_deadline: default_drain_deadline(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_max_batch_latency() -> Duration {
    Duration::from_secs(1)
}

fn default_drain_deadline() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// An ingest source. Immutable once created; edits replace the whole
/// record atomically via the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub source_ips: Vec<IpAddr>,
    pub port: u16,
    pub protocol: Protocol,
    pub target: Target,
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

pub fn default_queue_limit() -> usize {
    10_000
}

pub fn default_max_workers() -> usize {
    8
}

impl Source {
    pub fn from_spec(spec: SourceSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            source_ips: spec.source_ips,
            port: spec.port,
            protocol: spec.protocol,
            target: spec.target,
            queue_limit: spec.queue_limit,
            max_workers: spec.max_workers,
        }
    }

    pub fn batch_size(&self) -> usize {
        match &self.target {
            Target::Folder { batch_size, .. } => *batch_size,
            Target::Hec { batch_size, .. } => *batch_size,
        }
    }

    /// The listening endpoint this source is served from.
    pub fn endpoint(&self) -> (Protocol, u16) {
        (self.protocol, self.port)
    }
}

/// Creation payload for a source; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub source_ips: Vec<IpAddr>,
    pub port: u16,
    pub protocol: Protocol,
    pub target: Target,
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Delivery target, one variant per sink adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    Folder {
        path: PathBuf,
        batch_size: usize,
        #[serde(default)]
        compression: Compression,
    },
    Hec {
        url: String,
        token: String,
        batch_size: usize,
        #[serde(default = "default_verify_tls")]
        verify_tls: bool,
    },
}

fn default_verify_tls() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip { level: u32 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

/// Within-batch duplicate collapse configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    pub key_fields: Vec<String>,
    pub enabled: bool,
}

/// A single exclusion rule. A record is dropped only when every enabled
/// rule for its source matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub field_name: String,
    pub match_value: String,
    #[serde(default = "default_rule_enabled")]
    pub enabled: bool,
}

fn default_rule_enabled() -> bool {
    true
}

/// Validate a single source record against the rest of the set.
///
/// `others` must not contain the source being validated (updates pass the
/// set minus the edited record).
pub fn validate_source(source: &Source, others: &[std::sync::Arc<Source>]) -> Result<(), String> {
    if source.name.trim().is_empty() {
        return Err("source name must not be empty".to_string());
    }
    if source.source_ips.is_empty() {
        return Err("source_ips must not be empty".to_string());
    }
    if source.port == 0 {
        return Err("port must be in 1..=65535".to_string());
    }

    let unique: BTreeSet<&IpAddr> = source.source_ips.iter().collect();
    if unique.len() != source.source_ips.len() {
        return Err("source_ips contains duplicates".to_string());
    }

    match &source.target {
        Target::Folder {
            batch_size,
            compression,
            path,
        } => {
            if *batch_size == 0 {
                return Err("batch_size must be at least 1".to_string());
            }
            if path.as_os_str().is_empty() {
                return Err("folder target path must not be empty".to_string());
            }
            if let Compression::Gzip { level } = compression {
                if !(1..=9).contains(level) {
                    return Err(format!("gzip level {} outside 1..=9", level));
                }
            }
        }
        Target::Hec {
            batch_size, url, ..
        } => {
            if *batch_size == 0 {
                return Err("batch_size must be at least 1".to_string());
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("HEC url '{}' is not http(s)", url));
            }
        }
    }

    if source.queue_limit == 0 {
        return Err("queue_limit must be at least 1".to_string());
    }
    if source.max_workers == 0 {
        return Err("max_workers must be at least 1".to_string());
    }

    // (port, protocol, source_ip) must be unique across all sources
    for other in others {
        if other.endpoint() != source.endpoint() {
            continue;
        }
        for ip in &source.source_ips {
            if other.source_ips.contains(ip) {
                return Err(format!(
                    "peer {} on {}/{} already claimed by source '{}'",
                    ip, source.protocol, source.port, other.name
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn folder_source(name: &str, ip: &str, port: u16) -> Source {
        Source {
            id: Uuid::new_v4(),
            name: name.to_string(),
            source_ips: vec![ip.parse().unwrap()],
            port,
            protocol: Protocol::Udp,
            target: Target::Folder {
                path: PathBuf::from("/tmp/out"),
                batch_size: 100,
                compression: Compression::None,
            },
            queue_limit: default_queue_limit(),
            max_workers: default_max_workers(),
        }
    }

    #[test]
    fn test_valid_source_passes() {
        let source = folder_source("s1", "10.0.0.1", 5140);
        assert!(validate_source(&source, &[]).is_ok());
    }

    #[test]
    fn test_rejects_empty_ip_set() {
        let mut source = folder_source("s1", "10.0.0.1", 5140);
        source.source_ips.clear();
        assert!(validate_source(&source, &[]).is_err());
    }

    #[test]
    fn test_rejects_duplicate_peer_on_shared_endpoint() {
        let existing = Arc::new(folder_source("s1", "10.0.0.1", 5140));
        let new = folder_source("s2", "10.0.0.1", 5140);
        let err = validate_source(&new, &[existing]).unwrap_err();
        assert!(err.contains("already claimed"));
    }

    #[test]
    fn test_same_peer_different_port_is_fine() {
        let existing = Arc::new(folder_source("s1", "10.0.0.1", 5140));
        let new = folder_source("s2", "10.0.0.1", 5141);
        assert!(validate_source(&new, &[existing]).is_ok());
    }

    #[test]
    fn test_same_peer_different_protocol_is_fine() {
        let existing = Arc::new(folder_source("s1", "10.0.0.1", 5140));
        let mut new = folder_source("s2", "10.0.0.1", 5140);
        new.protocol = Protocol::Tcp;
        assert!(validate_source(&new, &[existing]).is_ok());
    }

    #[test]
    fn test_rejects_gzip_level_out_of_range() {
        let mut source = folder_source("s1", "10.0.0.1", 5140);
        source.target = Target::Folder {
            path: PathBuf::from("/tmp/out"),
            batch_size: 1,
            compression: Compression::Gzip { level: 10 },
        };
        assert!(validate_source(&source, &[]).is_err());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut source = folder_source("s1", "10.0.0.1", 5140);
        source.target = Target::Hec {
            url: "https://hec.local/services/collector".to_string(),
            token: "t".to_string(),
            batch_size: 0,
            verify_tls: true,
        };
        assert!(validate_source(&source, &[]).is_err());
    }

    #[test]
    fn test_target_serde_round_trip() {
        let target = Target::Hec {
            url: "https://hec.local".to_string(),
            token: "abc".to_string(),
            batch_size: 50,
            verify_tls: false,
        };
        let json = serde_json::to_string(&target).unwrap();
        assert!(json.contains(r#""type":"hec""#));
        let back: Target = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);
    }

    #[test]
    fn test_app_config_defaults_from_empty_yaml() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.pipeline.max_batch_latency, Duration::from_secs(1));
        assert_eq!(config.pipeline.drain_deadline, Duration::from_secs(10));
        assert_eq!(config.pipeline.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_app_config_humantime_durations() {
        let yaml = r#"
data_dir: /var/lib/siphon
pipeline:
  max_batch_latency: 500ms
  drain_deadline: 30s
  idle_timeout: 2m
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline.max_batch_latency, Duration::from_millis(500));
        assert_eq!(config.pipeline.idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_idle_timeout_clamped_to_minimum() {
        let yaml = "pipeline:\n  idle_timeout: 5s\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.pipeline.effective_idle_timeout(),
            Duration::from_secs(60)
        );
    }
}
