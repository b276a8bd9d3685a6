//! Direct-to-storage transfer of a single file.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Bytes handed to the HTTP body per progress step
const CHUNK_SIZE: usize = 64 * 1024;

/// Marker S3 puts in the body of a 403 for an expired presigned URL
const EXPIRED_MARKER: &str = "Request has expired";

/// Errors from a single transfer attempt
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Network error during upload: {0}")]
    Network(String),

    #[error("Upload was aborted")]
    Aborted,

    #[error("Upload failed with status {0}")]
    Status(u16),

    #[error("Upload URL has expired")]
    Expired,
}

impl TransferError {
    /// Whether another attempt with the same credential can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferError::Expired)
    }
}

/// Moves file bytes to a presigned URL
#[async_trait]
pub trait Transport: Send + Sync {
    /// PUT `body` to `url` with the signed `headers`, reporting progress
    /// as a percentage
    async fn put(
        &self,
        url: &str,
        content_type: &str,
        headers: &BTreeMap<String, String>,
        body: Bytes,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<(), TransferError>;
}

/// `Transport` over HTTPS with reqwest
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn put(
        &self,
        url: &str,
        content_type: &str,
        headers: &BTreeMap<String, String>,
        body: Bytes,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<(), TransferError> {
        let total = body.len() as u64;
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<u64>();

        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(CHUNK_SIZE)
            .map(|start| body.slice(start..(start + CHUNK_SIZE).min(body.len())))
            .collect();

        let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            let _ = sent_tx.send(chunk.len() as u64);
            Ok::<_, std::io::Error>(chunk)
        }));

        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, total);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let request = request.body(reqwest::Body::wrap_stream(stream)).send();
        tokio::pin!(request);

        let mut tracker = ProgressTracker::new(total, progress);
        let result = loop {
            tokio::select! {
                result = &mut request => break result,
                Some(sent) = sent_rx.recv() => tracker.advance(sent),
            }
        };
        while let Ok(sent) = sent_rx.try_recv() {
            tracker.advance(sent);
        }

        let response = result.map_err(|e| {
            if e.is_body() {
                TransferError::Aborted
            } else {
                TransferError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), bytes = total, "Transfer complete");
            return Ok(());
        }

        if status == StatusCode::FORBIDDEN {
            let text = response.text().await.unwrap_or_default();
            if text.contains(EXPIRED_MARKER) {
                return Err(TransferError::Expired);
            }
        }

        Err(TransferError::Status(status.as_u16()))
    }
}

/// Turns byte counts into de-duplicated, non-decreasing percentages
struct ProgressTracker<'a> {
    total: u64,
    sent: u64,
    last: Option<u8>,
    report: &'a (dyn Fn(u8) + Send + Sync),
}

impl<'a> ProgressTracker<'a> {
    fn new(total: u64, report: &'a (dyn Fn(u8) + Send + Sync)) -> Self {
        Self {
            total,
            sent: 0,
            last: None,
            report,
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.sent = (self.sent + bytes).min(self.total);
        let percent = percent_complete(self.sent, self.total);
        if self.last.map_or(true, |last| percent > last) {
            self.last = Some(percent);
            (self.report)(percent);
        }
    }
}

fn percent_complete(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent as f64 / total as f64) * 100.0).round() as u8
}
