//! RFQ Uploader
//!
//! Client side of the presigned upload flow: asks the presign service for
//! one upload URL per file, then PUTs each file straight to storage.
//!
//! ```text
//!  files ──▶ PresignClient ──POST──▶ presign service
//!                 │
//!                 ▼ credentials
//!         UploadOrchestrator ──PUT (retry/backoff)──▶ S3
//!                 │
//!                 ▼
//!           storage keys, in input order
//! ```
//!
//! Uploads are sequential and fail-fast: the first file that cannot be
//! delivered stops the batch.

pub mod client;
pub mod config;
pub mod orchestrator;
pub mod transport;

pub use client::{
    content_type_for, read_upload_file, upload_files, upload_paths, PresignClient,
    UploadDescriptor,
};
pub use config::UploaderConfig;
pub use orchestrator::{RetryPolicy, UploadCredential, UploadError, UploadFile, UploadOrchestrator};
pub use transport::{HttpTransport, TransferError, Transport};
