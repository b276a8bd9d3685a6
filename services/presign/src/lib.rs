//! RFQ Presign Service
//!
//! Issues short-lived, single-object upload URLs for the drawings and CAD
//! files attached to a request for quote. Browsers upload straight to S3
//! with those URLs; file bytes never pass through this service.
//!
//! ## Request flow
//!
//! ```text
//!  Browser                 Presign Service                       S3
//! ┌──────────┐  POST      ┌──────────────┐
//! │ Quote    │──────────▶ │ Upload       │
//! │ Form     │            │ Policy       │ size / extension / type
//! └──────────┘            └──────────────┘
//!      ▲                         │
//!      │                         ▼
//!      │                  ┌──────────────┐
//!      │  presigned URLs  │ Credential   │ PUT URL, 15 min,
//!      └──────────────────│ Issuer       │ SSE + exact length
//!      │                  └──────────────┘
//!      │                                                     ┌──────────────┐
//!      └────────────────────── PUT file bytes ─────────────▶ │ rfq-uploads/ │
//!                                                            └──────────────┘
//! ```

pub mod config;
pub mod credential_issuer;
pub mod presigned_urls;
pub mod upload_policy;

pub use config::Config;
pub use credential_issuer::{CredentialIssuer, IssueError, UploadCredential};
pub use presigned_urls::{create_router, start_api_server, ApiError, AppState};
pub use upload_policy::{validate_batch, validate_descriptor, PolicyViolation, UploadDescriptor};
