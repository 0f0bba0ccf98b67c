use crate::canonical::{encode_ndjson, CanonicalLog};
use crate::config::types::Compression;
use crate::sink::{Sink, SinkError};
use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Writes batches as newline-delimited CanonicalLog JSON files, one file
/// per batch, optionally gzip-compressed.
///
/// Files land as `<source_name>_<UTC ms>_<sequence>.json[.gz]`. Writes
/// are atomic: the content goes to a `.tmp` sibling, is fsynced, then
/// renamed; the batch is only acknowledged after the rename.
pub struct FolderSink {
    source_name: String,
    dir: PathBuf,
    compression: Compression,
    sequence: AtomicU64,
}

impl FolderSink {
    pub fn new(source_name: &str, dir: PathBuf, compression: Compression) -> Self {
        Self {
            source_name: sanitize_name(source_name),
            dir,
            compression,
            sequence: AtomicU64::new(0),
        }
    }

    fn next_file_name(&self) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let suffix = match self.compression {
            Compression::None => "json",
            Compression::Gzip { .. } => "json.gz",
        };
        format!(
            "{}_{}_{}.{}",
            self.source_name,
            Utc::now().timestamp_millis(),
            sequence,
            suffix
        )
    }

    fn encode(&self, batch: &[CanonicalLog]) -> Result<Vec<u8>, SinkError> {
        let mut body = encode_ndjson(batch)
            .map_err(|e| SinkError::Permanent(format!("encode failed: {}", e)))?;
        body.push('\n');

        match self.compression {
            Compression::None => Ok(body.into_bytes()),
            Compression::Gzip { level } => {
                let mut encoder =
                    GzEncoder::new(Vec::new(), flate2::Compression::new(level));
                encoder
                    .write_all(body.as_bytes())
                    .and_then(|_| encoder.finish())
                    .map_err(|e| SinkError::Transient(format!("gzip failed: {}", e)))
            }
        }
    }

    fn write_file(&self, content: &[u8]) -> Result<(PathBuf, u64), std::io::Error> {
        fs::create_dir_all(&self.dir)?;

        let final_path = self.dir.join(self.next_file_name());
        let tmp_path = final_path.with_extension("tmp");

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;
        Ok((final_path, content.len() as u64))
    }
}

#[async_trait]
impl Sink for FolderSink {
    async fn deliver(&self, batch: &[CanonicalLog]) -> Result<u64, SinkError> {
        let content = self.encode(batch)?;

        match self.write_file(&content) {
            Ok((path, bytes)) => {
                debug!(path = %path.display(), records = batch.len(), "Wrote batch file");
                Ok(bytes)
            }
            Err(e) => Err(classify_io_error(e)),
        }
    }
}

fn classify_io_error(e: std::io::Error) -> SinkError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            SinkError::Permanent(format!("folder not writable: {}", e))
        }
        _ => SinkError::Transient(format!("folder write failed: {}", e)),
    }
}

/// Keep filenames portable: path separators and whitespace in the source
/// name are replaced.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_whitespace() {
                '-'
            } else {
                c
            }
        })
        .collect()
}
