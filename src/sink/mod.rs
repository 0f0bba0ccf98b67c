pub mod folder;
pub mod hec;
pub mod retry;

use crate::canonical::CanonicalLog;
use crate::config::types::{Source, Target};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use folder::FolderSink;
pub use hec::HecSink;
pub use retry::{Backoff, RetryBuffer};

#[derive(Debug, Error)]
pub enum SinkError {
    /// Worth retrying with backoff: network failures, 5xx, ENOSPC-style
    /// I/O errors.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// Not worth retrying: bad credentials, unknown endpoint, unwritable
    /// path. The batch is dropped and surfaced via last_error.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// A delivery adapter. `deliver` returns the number of bytes written to
/// the target on success; the batch must not be considered delivered on
/// any error.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, batch: &[CanonicalLog]) -> Result<u64, SinkError>;
}

/// Construct the sink adapter for a source's target.
pub fn build_sink(source: &Source) -> Result<Arc<dyn Sink>, SinkError> {
    match &source.target {
        Target::Folder {
            path, compression, ..
        } => Ok(Arc::new(FolderSink::new(
            &source.name,
            path.clone(),
            *compression,
        ))),
        Target::Hec {
            url,
            token,
            verify_tls,
            ..
        } => Ok(Arc::new(HecSink::new(url.clone(), token.clone(), *verify_tls)?)),
    }
}
