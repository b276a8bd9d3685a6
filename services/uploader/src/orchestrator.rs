//! Sequential upload of a batch of files to their presigned URLs.
//!
//! Files are transferred one at a time in batch order. A transient failure
//! is retried with capped exponential backoff; a file that still fails
//! aborts the batch and later files are never attempted.

use crate::transport::{TransferError, Transport};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// A file ready to be uploaded
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

/// Upload credential as returned by the presign service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCredential {
    pub upload_url: String,
    pub file_key: String,
    pub expires_in: u64,
    /// Content type the URL was signed with, when the service reports it
    #[serde(default)]
    pub content_type: Option<String>,
    /// Further signed headers the PUT must carry
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Result of uploading one file
#[derive(Debug)]
pub enum UploadOutcome {
    Succeeded(String),
    Failed { error: TransferError, attempts: u32 },
}

/// Errors surfaced to the caller of the uploader
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Got {credentials} upload URLs for {files} files")]
    BatchMismatch { files: usize, credentials: usize },

    #[error("Failed to upload {file_name} after {retries} retries: {source}")]
    RetriesExhausted {
        file_name: String,
        retries: u32,
        source: TransferError,
        /// Keys of earlier files that already landed in storage
        uploaded: Vec<String>,
    },

    #[error("Upload URL for {file_name} expired; request new upload URLs")]
    CredentialExpired {
        file_name: String,
        uploaded: Vec<String>,
    },

    #[error("Upload URL request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Upload URL request failed: {0}")]
    Request(String),

    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
}

impl UploadError {
    /// Storage keys written before the batch failed. They are not cleaned
    /// up; the caller decides whether to reconcile them.
    pub fn orphaned_keys(&self) -> &[String] {
        match self {
            UploadError::RetriesExhausted { uploaded, .. }
            | UploadError::CredentialExpired { uploaded, .. } => uploaded,
            _ => &[],
        }
    }
}

/// Retry policy for failed transfers
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `retry` (1-indexed): `min(base * 2^(retry-1), max)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Backoff schedule yielding `delay_for(1)`, `delay_for(2)`, ... without jitter
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Uploads batches of files through a `Transport`
pub struct UploadOrchestrator<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> UploadOrchestrator<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Upload `files[i]` to `credentials[i]` for every `i`, in order.
    ///
    /// Returns the storage keys in input order, or the first unrecoverable
    /// failure. `on_progress` receives `(file_index, percent)`; the last
    /// value reported for a file that succeeded is always 100.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn upload_all<F>(
        &self,
        files: &[UploadFile],
        credentials: &[UploadCredential],
        on_progress: F,
    ) -> Result<Vec<String>, UploadError>
    where
        F: Fn(usize, u8) + Send + Sync,
    {
        if files.len() != credentials.len() {
            return Err(UploadError::BatchMismatch {
                files: files.len(),
                credentials: credentials.len(),
            });
        }

        let mut keys = Vec::with_capacity(files.len());

        for (index, (file, credential)) in files.iter().zip(credentials).enumerate() {
            match self.upload_one(index, file, credential, &on_progress).await {
                UploadOutcome::Succeeded(key) => keys.push(key),
                UploadOutcome::Failed { error, attempts } => {
                    metrics::counter!("uploader.files.failed").increment(1);
                    error!(
                        file_name = %file.name,
                        attempts = attempts,
                        error = %error,
                        "Upload failed, aborting batch"
                    );

                    return Err(if error.is_retryable() {
                        UploadError::RetriesExhausted {
                            file_name: file.name.clone(),
                            retries: attempts.saturating_sub(1),
                            source: error,
                            uploaded: keys,
                        }
                    } else {
                        UploadError::CredentialExpired {
                            file_name: file.name.clone(),
                            uploaded: keys,
                        }
                    });
                }
            }
        }

        Ok(keys)
    }

    async fn upload_one<F>(
        &self,
        index: usize,
        file: &UploadFile,
        credential: &UploadCredential,
        on_progress: &F,
    ) -> UploadOutcome
    where
        F: Fn(usize, u8) + Send + Sync,
    {
        let content_type = credential
            .content_type
            .as_deref()
            .unwrap_or(&file.content_type);
        // Highest percentage reported for this file, across attempts
        let high_water = AtomicI16::new(-1);
        let report = |percent: u8| {
            let value = i16::from(percent);
            if value > high_water.fetch_max(value, Ordering::Relaxed) {
                on_progress(index, percent);
            }
        };

        let mut backoff = self.policy.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let error = match self
                .transport
                .put(
                    &credential.upload_url,
                    content_type,
                    &credential.headers,
                    file.bytes.clone(),
                    &report,
                )
                .await
            {
                Ok(()) => {
                    report(100);
                    metrics::counter!("uploader.files.uploaded").increment(1);
                    info!(
                        file_name = %file.name,
                        file_key = %credential.file_key,
                        attempts = attempts,
                        "File uploaded"
                    );
                    return UploadOutcome::Succeeded(credential.file_key.clone());
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempts > self.policy.max_retries {
                return UploadOutcome::Failed { error, attempts };
            }

            let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
            warn!(
                file_name = %file.name,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transfer failed, retrying"
            );
            metrics::counter!("uploader.transfer.retries").increment(1);
            tokio::time::sleep(delay).await;
        }
    }
}
