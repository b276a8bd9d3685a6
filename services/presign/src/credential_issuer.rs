use crate::config::S3Config;
use crate::upload_policy::{canonical_content_type, UploadDescriptor};
use anyhow::Result;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Logical prefix every RFQ upload is stored under
pub const STORAGE_KEY_PREFIX: &str = "rfq-uploads/";

/// Signed headers the HTTP client sets on its own
const CLIENT_MANAGED_HEADERS: &[&str] = &["content-length", "content-type", "host"];

/// Lifetime of an upload URL. Not configurable per request.
pub const CREDENTIAL_TTL: Duration = Duration::from_secs(15 * 60);

/// Server-side failures while issuing upload URLs
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Destination bucket is not configured")]
    MissingBucket,

    #[error("Failed to presign upload URL: {0}")]
    Presign(String),
}

/// Single-object, time-limited write credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCredential {
    /// Presigned PUT URL
    pub upload_url: String,
    /// Storage key the URL writes to
    pub file_key: String,
    /// Seconds until the URL stops working
    pub expires_in: u64,
    /// Content type the URL was signed with; the PUT must send the same
    pub content_type: String,
    /// Further signed headers the PUT must carry verbatim (SSE, metadata)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Issues presigned PUT URLs against one shared S3 client
pub struct CredentialIssuer {
    client: S3Client,
    bucket: Option<String>,
}

impl CredentialIssuer {
    /// Create an issuer from service configuration
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = config.bucket.as_deref().unwrap_or("<unset>"),
            region = %config.region,
            "Credential issuer initialized"
        );

        Ok(Self::from_client(client, config.bucket.clone()))
    }

    /// Create an issuer around an existing client
    pub fn from_client(client: S3Client, bucket: Option<String>) -> Self {
        Self { client, bucket }
    }

    /// Issue one upload credential for an already validated descriptor
    #[instrument(skip(self, descriptor), fields(file_name = %descriptor.file_name, file_size = descriptor.file_size))]
    pub async fn issue(&self, descriptor: &UploadDescriptor) -> Result<UploadCredential, IssueError> {
        let bucket = self.bucket.as_deref().ok_or(IssueError::MissingBucket)?;

        let content_type = canonical_content_type(&descriptor.file_name)
            .map(str::to_string)
            .unwrap_or_else(|| descriptor.file_type.clone());

        let file_key = generate_storage_key(&descriptor.file_name);
        let issued_at = Utc::now();

        let presigning_config = PresigningConfig::expires_in(CREDENTIAL_TTL)
            .map_err(|e| IssueError::Presign(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(&file_key)
            .content_type(&content_type)
            .content_length(descriptor.file_size as i64)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .metadata("original-file-name", header_safe(&descriptor.file_name))
            .metadata("uploaded-at", issued_at.to_rfc3339())
            .presigned(presigning_config)
            .await
            .map_err(|e| IssueError::Presign(DisplayErrorContext(&e).to_string()))?;

        debug!(file_key = %file_key, content_type = %content_type, "Upload URL issued");
        metrics::counter!("presign.credentials.issued").increment(1);

        Ok(UploadCredential {
            upload_url: presigned.uri().to_string(),
            file_key,
            expires_in: CREDENTIAL_TTL.as_secs(),
            content_type,
            headers: required_headers(presigned.headers()),
        })
    }

    /// Issue credentials for a batch, in input order
    pub async fn issue_batch(
        &self,
        descriptors: &[UploadDescriptor],
    ) -> Result<Vec<UploadCredential>, IssueError> {
        let mut credentials = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            credentials.push(self.issue(descriptor).await?);
        }
        Ok(credentials)
    }
}

/// Headers from a presigned request that the uploader has to replay
fn required_headers<'a>(
    headers: impl Iterator<Item = (&'a str, &'a str)>,
) -> BTreeMap<String, String> {
    headers
        .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
        .filter(|(name, _)| !CLIENT_MANAGED_HEADERS.contains(&name.as_str()))
        .collect()
}

/// Generate a unique storage key for an uploaded file.
/// Format: rfq-uploads/{unix_millis}-{random_token}-{sanitized_file_name}
pub fn generate_storage_key(file_name: &str) -> String {
    format!(
        "{prefix}{timestamp}-{token}-{name}",
        prefix = STORAGE_KEY_PREFIX,
        timestamp = Utc::now().timestamp_millis(),
        token = Uuid::new_v4().simple(),
        name = sanitize_file_name(file_name)
    )
}

/// Sanitize a file name so it stays inside a single key segment
pub fn sanitize_file_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c,
            _ => '_',
        })
        .collect()
}

// S3 user metadata travels as HTTP headers
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use aws_sdk_s3::config::Credentials;
    use std::collections::HashSet;

    /// Client with static credentials; presigning never touches the network
    pub(crate) fn offline_client() -> S3Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                "AKIDEXAMPLE",
                "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
                None,
                None,
                "test",
            ))
            .build();
        S3Client::from_conf(config)
    }

    fn descriptor(name: &str, file_type: &str, size: u64) -> UploadDescriptor {
        UploadDescriptor {
            file_name: name.to_string(),
            file_type: file_type.to_string(),
            file_size: size,
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("a.pdf"), "a.pdf");
        assert_eq!(sanitize_file_name("bracket rev-B.step"), "bracket_rev-B.step");
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name("pièce.dxf"), "pi_ce.dxf");
    }

    #[test]
    fn test_storage_key_format() {
        let key = generate_storage_key("my part.pdf");
        assert!(key.starts_with(STORAGE_KEY_PREFIX));
        assert!(key.ends_with("-my_part.pdf"));

        let rest = &key[STORAGE_KEY_PREFIX.len()..];
        let mut parts = rest.splitn(3, '-');
        let timestamp = parts.next().unwrap();
        let token = parts.next().unwrap();
        assert!(timestamp.parse::<i64>().is_ok());
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!rest.contains('/'));
    }

    #[test]
    fn test_storage_keys_unique_for_same_name() {
        let keys: HashSet<_> = (0..100).map(|_| generate_storage_key("a.pdf")).collect();
        assert_eq!(keys.len(), 100);
    }

    #[tokio::test]
    async fn test_issue_presigns_put() {
        let issuer = CredentialIssuer::from_client(offline_client(), Some("rfq-bucket".into()));
        let credential = issuer
            .issue(&descriptor("a.pdf", "application/pdf", 1000))
            .await
            .unwrap();

        assert!(credential.file_key.starts_with("rfq-uploads/"));
        assert!(credential.file_key.ends_with("-a.pdf"));
        assert_eq!(credential.expires_in, 900);
        assert_eq!(credential.content_type, "application/pdf");
        assert!(credential.upload_url.contains("rfq-bucket"));
        assert!(credential.upload_url.contains(&credential.file_key));
        assert!(credential.upload_url.contains("X-Amz-Expires=900"));
        assert!(credential.upload_url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_issue_signs_length_encryption_and_metadata() {
        let issuer = CredentialIssuer::from_client(offline_client(), Some("rfq-bucket".into()));
        let credential = issuer
            .issue(&descriptor("bracket-rev-B.step", "application/step", 2048))
            .await
            .unwrap();

        let signed_headers = credential
            .upload_url
            .split(['?', '&'])
            .find_map(|pair| pair.strip_prefix("X-Amz-SignedHeaders="))
            .unwrap();
        assert!(signed_headers.contains("content-length"));
        assert!(signed_headers.contains("x-amz-server-side-encryption"));
        assert!(signed_headers.contains("x-amz-meta-original-file-name"));
        assert!(signed_headers.contains("x-amz-meta-uploaded-at"));

        assert_eq!(
            credential.headers.get("x-amz-server-side-encryption").map(String::as_str),
            Some("AES256")
        );
        assert_eq!(
            credential.headers.get("x-amz-meta-original-file-name").map(String::as_str),
            Some("bracket-rev-B.step")
        );
        let uploaded_at = credential.headers.get("x-amz-meta-uploaded-at").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(uploaded_at).is_ok());

        assert!(!credential.headers.contains_key("content-length"));
        assert!(!credential.headers.contains_key("content-type"));
        assert!(!credential.headers.contains_key("host"));
    }

    #[test]
    fn test_required_headers_drops_client_managed() {
        let headers = required_headers(
            [
                ("Content-Length", "10"),
                ("content-type", "image/png"),
                ("host", "rfq-bucket.s3.amazonaws.com"),
                ("X-Amz-Server-Side-Encryption", "AES256"),
            ]
            .into_iter(),
        );

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-amz-server-side-encryption"], "AES256");
    }

    #[tokio::test]
    async fn test_issue_uses_canonical_content_type() {
        let issuer = CredentialIssuer::from_client(offline_client(), Some("rfq-bucket".into()));
        let credential = issuer
            .issue(&descriptor("housing.STEP", "application/octet-stream", 2048))
            .await
            .unwrap();
        assert_eq!(credential.content_type, "application/step");
    }

    #[tokio::test]
    async fn test_missing_bucket_is_server_error() {
        let issuer = CredentialIssuer::from_client(offline_client(), None);
        let err = issuer
            .issue(&descriptor("a.pdf", "application/pdf", 1000))
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::MissingBucket));
    }

    #[tokio::test]
    async fn test_issue_batch_preserves_order_and_uniqueness() {
        let issuer = CredentialIssuer::from_client(offline_client(), Some("rfq-bucket".into()));
        let batch = vec![
            descriptor("same.pdf", "application/pdf", 10),
            descriptor("drawing.dxf", "application/dxf", 20),
            descriptor("same.pdf", "application/pdf", 30),
        ];

        let credentials = issuer.issue_batch(&batch).await.unwrap();

        assert_eq!(credentials.len(), 3);
        assert!(credentials[0].file_key.ends_with("-same.pdf"));
        assert!(credentials[1].file_key.ends_with("-drawing.dxf"));
        assert!(credentials[2].file_key.ends_with("-same.pdf"));
        assert_ne!(credentials[0].file_key, credentials[2].file_key);
    }

    #[test]
    fn test_credential_serializes_camel_case() {
        let credential = UploadCredential {
            upload_url: "https://example.com/put".into(),
            file_key: "rfq-uploads/1-abc-a.pdf".into(),
            expires_in: 900,
            content_type: "application/pdf".into(),
            headers: BTreeMap::from([(
                "x-amz-server-side-encryption".to_string(),
                "AES256".to_string(),
            )]),
        };
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["uploadUrl"], "https://example.com/put");
        assert_eq!(json["fileKey"], "rfq-uploads/1-abc-a.pdf");
        assert_eq!(json["expiresIn"], 900);
        assert_eq!(json["headers"]["x-amz-server-side-encryption"], "AES256");
    }
}
