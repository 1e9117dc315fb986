// Registry wire subset: bearer token, manifest by tag, blob by digest.
//
//   GET {scheme}://{host}/token?scope=repository:{repo}:pull&service={host}
//   GET /v2/{repo}/manifests/{tag}
//   GET /v2/{repo}/blobs/{digest}        (Range: bytes=N- to resume)

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, RANGE};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::RegistryConfig;
use crate::registry::error::{PullError, PullResult};
use crate::registry::manifest::{Manifest, DOCKER_MANIFEST_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE};

/// A blob body, possibly starting part-way through.
pub struct BlobStream {
    /// True when the server honoured the requested start offset.
    pub resumed: bool,
    pub stream: BoxStream<'static, PullResult<Bytes>>,
}

#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Obtain a pull token for `repository` (`org/name`).
    async fn fetch_token(&self, repository: &str) -> PullResult<String>;

    /// Fetch the manifest for `tag`, returning it and its content digest.
    async fn fetch_manifest(&self, repository: &str, tag: &str, token: &str) -> PullResult<(Manifest, String)>;

    /// Open a blob, starting at byte `offset` if the server supports ranges.
    async fn open_blob(&self, repository: &str, digest: &str, token: &str, offset: u64) -> PullResult<BlobStream>;

    /// Fetch a small blob (config documents) into memory.
    async fn fetch_blob_bytes(&self, repository: &str, digest: &str, token: &str) -> PullResult<Vec<u8>> {
        let blob = self.open_blob(repository, digest, token, 0).await?;
        let chunks: Vec<Bytes> = blob.stream.try_collect().await?;
        let bytes = chunks.concat();
        verify_digest(digest, &bytes)?;
        Ok(bytes)
    }
}

/// `sha256:<hex>` of `bytes`.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

pub(crate) fn verify_digest(expected: &str, bytes: &[u8]) -> PullResult<()> {
    let actual = sha256_digest(bytes);
    if actual != expected {
        return Err(PullError::layer(
            expected,
            format!("digest mismatch, got {}", actual),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// reqwest-backed transport for a real registry.
pub struct HttpRegistry {
    client: reqwest::Client,
    host: String,
    scheme: &'static str,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> PullResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .read_timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("vmkeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PullError::TokenFetchFailed(format!("HTTP client setup: {}", e)))?;
        Ok(Self {
            client,
            host: config.host.clone(),
            scheme: if config.insecure { "http" } else { "https" },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, path)
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistry {
    async fn fetch_token(&self, repository: &str) -> PullResult<String> {
        let url = self.url(&format!(
            "/token?scope=repository:{}:pull&service={}",
            repository, self.host
        ));
        debug!(url = %url, "Fetching registry token");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PullError::TokenFetchFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PullError::TokenFetchFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PullError::TokenFetchFailed(e.to_string()))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| PullError::TokenFetchFailed("response carries no token".to_string()))
    }

    async fn fetch_manifest(&self, repository: &str, tag: &str, token: &str) -> PullResult<(Manifest, String)> {
        let url = self.url(&format!("/v2/{}/manifests/{}", repository, tag));
        debug!(url = %url, "Fetching manifest");

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(
                ACCEPT,
                format!("{}, {}", OCI_MANIFEST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE),
            )
            .send()
            .await
            .map_err(|e| PullError::ManifestFetchFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PullError::ManifestFetchFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| PullError::ManifestFetchFailed(e.to_string()))?;
        let manifest: Manifest = serde_json::from_slice(&body)
            .map_err(|e| PullError::ManifestFetchFailed(format!("malformed manifest: {}", e)))?;
        let digest = header_digest.unwrap_or_else(|| sha256_digest(&body));
        Ok((manifest, digest))
    }

    async fn open_blob(&self, repository: &str, digest: &str, token: &str, offset: u64) -> PullResult<BlobStream> {
        let url = self.url(&format!("/v2/{}/blobs/{}", repository, digest));
        let mut request = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token));
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(|e| PullError::layer(digest, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PullError::layer(digest, format!("{} returned {}", url, status)));
        }

        let owned = digest.to_string();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| PullError::layer(&owned, e)))
            .boxed();
        Ok(BlobStream {
            resumed: offset > 0 && status == StatusCode::PARTIAL_CONTENT,
            stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest_format() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify_digest_mismatch() {
        let err = verify_digest("sha256:00", b"abc").unwrap_err();
        assert!(matches!(err, PullError::LayerDownloadFailed { .. }));
        verify_digest(&sha256_digest(b"abc"), b"abc").unwrap();
    }

    #[test]
    fn test_http_registry_urls() {
        let mut config = RegistryConfig::default();
        config.host = "localhost:5000".to_string();
        config.insecure = true;
        let registry = HttpRegistry::new(&config).unwrap();
        assert_eq!(
            registry.url("/v2/org/img/manifests/latest"),
            "http://localhost:5000/v2/org/img/manifests/latest"
        );
    }
}
