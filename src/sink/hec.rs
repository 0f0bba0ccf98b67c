use crate::canonical::{encode_ndjson, CanonicalLog};
use crate::sink::{Sink, SinkError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_POOLED_CONNECTIONS: usize = 4;

/// Delivers batches to an HTTP Event Collector endpoint: one POST per
/// batch, body = newline-joined CanonicalLog JSON, Splunk token auth.
/// The client keeps connections alive and pools at most four per
/// endpoint.
pub struct HecSink {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl HecSink {
    pub fn new(url: String, token: String, verify_tls: bool) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .pool_max_idle_per_host(MAX_POOLED_CONNECTIONS)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| SinkError::Permanent(format!("HEC client build failed: {}", e)))?;

        Ok(Self { url, token, client })
    }
}

#[async_trait]
impl Sink for HecSink {
    async fn deliver(&self, batch: &[CanonicalLog]) -> Result<u64, SinkError> {
        let body = encode_ndjson(batch)
            .map_err(|e| SinkError::Permanent(format!("encode failed: {}", e)))?;
        let bytes = body.len() as u64;

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Splunk {}", self.token))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("HEC request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %self.url, records = batch.len(), bytes, "Delivered batch to HEC");
            return Ok(bytes);
        }

        Err(classify_status(status))
    }
}

/// 408 and 429 are the only retryable client errors; everything else in
/// 4xx means the request itself is bad. 5xx and network failures are
/// transient.
fn classify_status(status: StatusCode) -> SinkError {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SinkError::Transient(format!("HEC responded {}", status))
        }
        s if s.is_client_error() => SinkError::Permanent(format!("HEC responded {}", status)),
        s => SinkError::Transient(format!("HEC responded {}", s)),
    }
}
