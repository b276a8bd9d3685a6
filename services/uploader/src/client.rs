//! Client for the presign service and the end-to-end upload flow.

use crate::orchestrator::{UploadCredential, UploadError, UploadFile, UploadOrchestrator};
use crate::transport::Transport;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Content type sent when the extension gives no better answer
pub const GENERIC_BINARY_TYPE: &str = "application/octet-stream";

/// File as declared to the presign service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
}

impl From<&UploadFile> for UploadDescriptor {
    fn from(file: &UploadFile) -> Self {
        Self {
            file_name: file.name.clone(),
            file_type: file.content_type.clone(),
            file_size: file.bytes.len() as u64,
        }
    }
}

#[derive(Serialize)]
struct PresignRequest<'a> {
    files: &'a [UploadDescriptor],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignResponse {
    presigned_urls: Vec<UploadCredential>,
}

#[derive(Deserialize)]
struct PresignErrorBody {
    message: Option<String>,
}

/// HTTP client for the presigned URL endpoint
#[derive(Clone)]
pub struct PresignClient {
    http: reqwest::Client,
    endpoint: String,
}

impl PresignClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    /// Request one upload credential per descriptor. Rejections are
    /// deterministic and never retried.
    #[instrument(skip(self, descriptors), fields(files = descriptors.len()))]
    pub async fn request_credentials(
        &self,
        descriptors: &[UploadDescriptor],
    ) -> Result<Vec<UploadCredential>, UploadError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&PresignRequest { files: descriptors })
            .send()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<PresignErrorBody>()
                .await
                .ok()
                .and_then(|body| body.message)
                .unwrap_or_else(|| "Failed to get upload URLs".to_string());
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: PresignResponse = response
            .json()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;

        if body.presigned_urls.len() != descriptors.len() {
            return Err(UploadError::BatchMismatch {
                files: descriptors.len(),
                credentials: body.presigned_urls.len(),
            });
        }

        debug!(credentials = body.presigned_urls.len(), "Received upload URLs");
        Ok(body.presigned_urls)
    }
}

/// Content type for a file name, by extension
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => "application/pdf",
        "dwg" => "application/acad",
        "dxf" => "application/dxf",
        "step" | "stp" => "application/step",
        "iges" | "igs" => "application/iges",
        "stl" => "model/stl",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => GENERIC_BINARY_TYPE,
    }
}

/// Read a file from disk into an `UploadFile`
pub async fn read_upload_file(path: &Path) -> Result<UploadFile, UploadError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| UploadError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Ok(UploadFile {
        content_type: content_type_for(&name).to_string(),
        name,
        bytes: Bytes::from(bytes),
    })
}

/// Request credentials for `files` and upload them, returning storage keys
/// in input order
pub async fn upload_files<T, F>(
    client: &PresignClient,
    orchestrator: &UploadOrchestrator<T>,
    files: &[UploadFile],
    on_progress: F,
) -> Result<Vec<String>, UploadError>
where
    T: Transport,
    F: Fn(usize, u8) + Send + Sync,
{
    let descriptors: Vec<UploadDescriptor> = files.iter().map(UploadDescriptor::from).collect();
    let credentials = client.request_credentials(&descriptors).await?;

    let keys = orchestrator
        .upload_all(files, &credentials, on_progress)
        .await?;

    info!(files = keys.len(), "All files uploaded");
    Ok(keys)
}

/// Read `paths` from disk and upload them, returning storage keys in
/// input order
pub async fn upload_paths<T, F, P>(
    client: &PresignClient,
    orchestrator: &UploadOrchestrator<T>,
    paths: &[P],
    on_progress: F,
) -> Result<Vec<String>, UploadError>
where
    T: Transport,
    F: Fn(usize, u8) + Send + Sync,
    P: AsRef<Path>,
{
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(read_upload_file(path.as_ref()).await?);
    }

    upload_files(client, orchestrator, &files, on_progress).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::RetryPolicy;
    use crate::transport::HttpTransport;
    use mockito::Matcher;

    fn client(server: &mockito::Server) -> PresignClient {
        PresignClient::new(
            format!("{}/api/presigned-url", server.url()),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn descriptor(name: &str) -> UploadDescriptor {
        UploadDescriptor {
            file_name: name.to_string(),
            file_type: content_type_for(name).to_string(),
            file_size: 1000,
        }
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("part.STEP"), "application/step");
        assert_eq!(content_type_for("scan.jpg"), "image/jpeg");
        assert_eq!(content_type_for("drawing.dwg"), "application/acad");
        assert_eq!(content_type_for("README"), GENERIC_BINARY_TYPE);
    }

    #[tokio::test]
    async fn test_request_credentials_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/presigned-url")
            .match_body(Matcher::PartialJsonString(
                r#"{"files":[{"fileName":"a.pdf","fileType":"application/pdf","fileSize":1000}]}"#
                    .to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"success":true,"presignedUrls":[{"uploadUrl":"https://s3/put","fileKey":"rfq-uploads/1-x-a.pdf","expiresIn":900}]}"#,
            )
            .create_async()
            .await;

        let credentials = client(&server)
            .request_credentials(&[descriptor("a.pdf")])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].file_key, "rfq-uploads/1-x-a.pdf");
        assert_eq!(credentials[0].content_type, None);
    }

    #[tokio::test]
    async fn test_rejection_carries_server_message() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/presigned-url")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"Bad request","message":"Maximum 5 files allowed per upload"}"#)
            .create_async()
            .await;

        let err = client(&server)
            .request_credentials(&[descriptor("a.pdf")])
            .await
            .unwrap_err();

        match err {
            UploadError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Maximum 5 files allowed per upload");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_short_credential_list_is_mismatch() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/presigned-url")
            .with_status(200)
            .with_body(r#"{"success":true,"presignedUrls":[]}"#)
            .create_async()
            .await;

        let err = client(&server)
            .request_credentials(&[descriptor("a.pdf")])
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::BatchMismatch { files: 1, credentials: 0 }));
    }

    #[tokio::test]
    async fn test_upload_files_end_to_end() {
        let mut server = mockito::Server::new_async().await;
        let put_url = format!("{}/bucket/rfq-uploads/1-x-a.pdf", server.url());

        let _presign = server
            .mock("POST", "/api/presigned-url")
            .with_status(200)
            .with_body(format!(
                r#"{{"success":true,"presignedUrls":[{{"uploadUrl":"{put_url}","fileKey":"rfq-uploads/1-x-a.pdf","expiresIn":900,"contentType":"application/pdf","headers":{{"x-amz-meta-original-file-name":"a.pdf","x-amz-meta-uploaded-at":"2026-10-17T09:30:00+00:00","x-amz-server-side-encryption":"AES256"}}}}]}}"#
            ))
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/bucket/rfq-uploads/1-x-a.pdf")
            .match_header("content-type", "application/pdf")
            .match_header("x-amz-server-side-encryption", "AES256")
            .match_header("x-amz-meta-uploaded-at", "2026-10-17T09:30:00+00:00")
            .with_status(200)
            .create_async()
            .await;

        let orchestrator = UploadOrchestrator::new(
            HttpTransport::new(Duration::from_secs(10)).unwrap(),
            RetryPolicy::default(),
        );
        let files = [UploadFile {
            name: "a.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            bytes: Bytes::from_static(b"%PDF-1.7"),
        }];

        let keys = upload_files(&client(&server), &orchestrator, &files, |_, _| {})
            .await
            .unwrap();

        put.assert_async().await;
        assert_eq!(keys, vec!["rfq-uploads/1-x-a.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let err = read_upload_file(Path::new("/nonexistent/drawing.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ReadFile { .. }));
    }

    #[tokio::test]
    async fn test_unreadable_path_stops_before_requesting_urls() {
        let mut server = mockito::Server::new_async().await;
        let presign = server
            .mock("POST", "/api/presigned-url")
            .expect(0)
            .create_async()
            .await;

        let orchestrator = UploadOrchestrator::new(
            HttpTransport::new(Duration::from_secs(10)).unwrap(),
            RetryPolicy::default(),
        );
        let err = upload_paths(
            &client(&server),
            &orchestrator,
            &["/nonexistent/a.pdf"],
            |_, _| {},
        )
        .await
        .unwrap_err();

        presign.assert_async().await;
        assert!(matches!(err, UploadError::ReadFile { .. }));
    }
}
