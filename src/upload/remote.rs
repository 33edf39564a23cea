use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOUDINARY_API_ROOT: &str = "https://api.cloudinary.com/v1_1";

/// Where an uploaded image ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAsset {
    pub public_id: String,
    pub secure_url: String,
}

/// One upload request: fetch `source_url` into `folder/public_id`,
/// replacing whatever is stored there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUpload {
    pub source_url: String,
    pub folder: String,
    pub public_id: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("source returned HTTP {0}")]
    ClientError(u16),
    #[error("source returned HTTP {0}")]
    ServerError(u16),
    #[error("source unreachable: {0}")]
    Network(String),
}

impl ProbeError {
    /// 4xx means the image is gone; retrying will not bring it back.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProbeError::ClientError(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("asset store rate limit: {0}")]
    RateLimited(String),
    #[error("asset store returned HTTP {status}: {message}")]
    Server { status: u16, message: String },
    #[error("asset store unreachable: {0}")]
    Network(String),
    #[error("asset store rejected upload: {0}")]
    Rejected(String),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UploadError::Rejected(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, UploadError::RateLimited(_))
    }
}

/// Existence check of a source image before it is uploaded.
#[async_trait]
pub trait SourceProbe: Send + Sync {
    async fn check(&self, url: &str) -> Result<(), ProbeError>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn upload(&self, request: &AssetUpload) -> Result<RemoteAsset, UploadError>;
}

/// HEAD request with redirects followed.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(build_client())
    }
}

impl HttpProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceProbe for HttpProbe {
    async fn check(&self, url: &str) -> Result<(), ProbeError> {
        let response = self
            .client
            .head(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|err| ProbeError::Network(err.to_string()))?;
        classify_probe_status(response.status())
    }
}

fn classify_probe_status(status: StatusCode) -> Result<(), ProbeError> {
    if status.is_client_error() {
        Err(ProbeError::ClientError(status.as_u16()))
    } else if status.is_server_error() {
        Err(ProbeError::ServerError(status.as_u16()))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl CloudinaryConfig {
    pub fn from_env() -> Option<Self> {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Some(Self {
            cloud_name: read("CLOUDINARY_CLOUD_NAME")?,
            api_key: read("CLOUDINARY_API_KEY")?,
            api_secret: read("CLOUDINARY_API_SECRET")?,
        })
    }
}

/// Signed uploads against a Cloudinary-compatible endpoint.
#[derive(Clone)]
pub struct CloudinaryStore {
    client: Client,
    config: CloudinaryConfig,
    endpoint: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    public_id: String,
    secure_url: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl CloudinaryStore {
    pub fn new(config: CloudinaryConfig) -> Self {
        let endpoint = format!("{CLOUDINARY_API_ROOT}/{}/image/upload", config.cloud_name);
        Self {
            client: build_client(),
            config,
            endpoint,
        }
    }

    pub fn from_env() -> Option<Self> {
        CloudinaryConfig::from_env().map(Self::new)
    }

    fn signed_params(&self, request: &AssetUpload, timestamp: i64) -> Vec<(String, String)> {
        let params = signable_params(request, timestamp);
        let signature = sign(&params, &self.config.api_secret);
        let mut form: Vec<(String, String)> = params.into_iter().collect();
        form.push(("file".into(), request.source_url.clone()));
        form.push(("api_key".into(), self.config.api_key.clone()));
        form.push(("signature".into(), signature));
        form
    }
}

#[async_trait]
impl AssetStore for CloudinaryStore {
    async fn upload(&self, request: &AssetUpload) -> Result<RemoteAsset, UploadError> {
        let form = self.signed_params(request, chrono::Utc::now().timestamp());
        let response = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|err| UploadError::Network(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| UploadError::Network(err.to_string()))?;
        debug!(
            target = "catalog.upload",
            status = status.as_u16(),
            public_id = %request.public_id,
            "asset store responded"
        );
        interpret_upload_response(status, &body)
    }
}

fn signable_params(request: &AssetUpload, timestamp: i64) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("folder".to_string(), request.folder.clone());
    params.insert("public_id".to_string(), request.public_id.clone());
    params.insert("overwrite".to_string(), "true".to_string());
    params.insert("invalidate".to_string(), "true".to_string());
    params.insert("unique_filename".to_string(), "false".to_string());
    params.insert("use_filename".to_string(), "false".to_string());
    params.insert("timestamp".to_string(), timestamp.to_string());
    if !request.tags.is_empty() {
        params.insert("tags".to_string(), request.tags.join(","));
    }
    params
}

/// Hex SHA-256 of `k=v` pairs joined with `&` in key order, followed by the
/// API secret.
fn sign(params: &BTreeMap<String, String>, secret: &str) -> String {
    let joined = params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn interpret_upload_response(status: StatusCode, body: &str) -> Result<RemoteAsset, UploadError> {
    if status.is_success() {
        let payload: UploadResponse = serde_json::from_str(body)
            .map_err(|err| UploadError::Rejected(format!("unexpected response: {err}")))?;
        return Ok(RemoteAsset {
            public_id: payload.public_id,
            secure_url: payload.secure_url,
        });
    }
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let lowered = message.to_lowercase();
    if status.as_u16() == 420
        || status == StatusCode::TOO_MANY_REQUESTS
        || lowered.contains("rate limit")
    {
        return Err(UploadError::RateLimited(message));
    }
    if status.is_server_error() {
        return Err(UploadError::Server {
            status: status.as_u16(),
            message,
        });
    }
    Err(UploadError::Rejected(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AssetUpload {
        AssetUpload {
            source_url: "https://images.puma.com/a.jpg".into(),
            folder: "products/abc-1".into(),
            public_id: "1".into(),
            tags: vec!["sku:ABC_1".into()],
        }
    }

    #[test]
    fn signature_covers_sorted_params_and_secret() {
        let params = signable_params(&request(), 1_700_000_000);
        let keys: Vec<&str> = params.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "folder",
                "invalidate",
                "overwrite",
                "public_id",
                "tags",
                "timestamp",
                "unique_filename",
                "use_filename"
            ]
        );
        assert_eq!(
            sign(&params, "secret"),
            "860a2bb1d18f9812f2507e252401cda55a18130c058cdd2653608ef087c3d88c"
        );
    }

    #[test]
    fn form_carries_file_key_and_signature() {
        let store = CloudinaryStore::new(CloudinaryConfig {
            cloud_name: "demo".into(),
            api_key: "key".into(),
            api_secret: "secret".into(),
        });
        assert_eq!(
            store.endpoint,
            "https://api.cloudinary.com/v1_1/demo/image/upload"
        );
        let form = store.signed_params(&request(), 1_700_000_000);
        let lookup = |name: &str| {
            form.iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(lookup("file"), Some("https://images.puma.com/a.jpg"));
        assert_eq!(lookup("api_key"), Some("key"));
        assert_eq!(lookup("overwrite"), Some("true"));
        assert_eq!(
            lookup("signature"),
            Some("860a2bb1d18f9812f2507e252401cda55a18130c058cdd2653608ef087c3d88c")
        );
    }

    #[test]
    fn responses_map_to_upload_errors() {
        let ok = interpret_upload_response(
            StatusCode::OK,
            r#"{"public_id": "products/abc-1/1", "secure_url": "https://res/x.jpg"}"#,
        )
        .unwrap();
        assert_eq!(ok.public_id, "products/abc-1/1");

        let limited = interpret_upload_response(
            StatusCode::from_u16(420).unwrap(),
            r#"{"error": {"message": "Rate Limit Exceeded"}}"#,
        );
        assert!(matches!(limited, Err(UploadError::RateLimited(_))));

        let server = interpret_upload_response(StatusCode::BAD_GATEWAY, "upstream");
        assert_eq!(
            server,
            Err(UploadError::Server {
                status: 502,
                message: "upstream".into()
            })
        );

        let rejected = interpret_upload_response(
            StatusCode::BAD_REQUEST,
            r#"{"error": {"message": "Invalid image file"}}"#,
        );
        assert_eq!(
            rejected,
            Err(UploadError::Rejected("Invalid image file".into()))
        );
        assert!(!rejected.unwrap_err().is_retryable());
    }

    #[test]
    fn probe_status_classes() {
        assert_eq!(classify_probe_status(StatusCode::OK), Ok(()));
        assert_eq!(
            classify_probe_status(StatusCode::NOT_FOUND),
            Err(ProbeError::ClientError(404))
        );
        assert!(ProbeError::ClientError(410).is_permanent());
        assert!(!ProbeError::ServerError(503).is_permanent());
    }
}
