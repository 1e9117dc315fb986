// In-memory registry with call counters
//
// Serves manifests and blobs from maps, counts every token/manifest/blob
// request and can fail or stall them. `publish_image` splits a disk image
// into gzip parts the same way a pushed image is laid out.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;

use crate::registry::error::{PullError, PullResult};
use crate::registry::manifest::{
    Descriptor, Manifest, DISK_PART_MEDIA_TYPE, NVRAM_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
    UNCOMPRESSED_SIZE_ANNOTATION, VM_CONFIG_MEDIA_TYPE,
};
use crate::registry::transport::{sha256_digest, BlobStream, RegistryTransport};

const CHUNK: usize = 8 * 1024;

/// gzip-compress `data`.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    // writing into a Vec cannot fail
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub nvram: Option<Vec<u8>>,
    pub vm_config: Option<serde_json::Value>,
    /// Leave the uncompressed-size annotation out of the config document.
    pub omit_size_annotation: bool,
    /// Leave part `n` out of the manifest while keeping `part.total`.
    pub omit_part: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PublishedImage {
    pub manifest: Manifest,
    pub manifest_digest: String,
    /// Digests of all parts in order, including an omitted one.
    pub part_digests: Vec<String>,
}

#[derive(Default)]
struct State {
    manifests: HashMap<(String, String), Manifest>,
    blobs: HashMap<String, Vec<u8>>,
    token_fetches: usize,
    manifest_fetches: usize,
    blob_fetches: HashMap<String, usize>,
    resumed_offsets: Vec<u64>,
    fail_token: bool,
    fail_manifest: bool,
    blob_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<State>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a blob and return its digest.
    pub fn add_blob(&self, data: Vec<u8>) -> String {
        let digest = sha256_digest(&data);
        self.state().blobs.insert(digest.clone(), data);
        digest
    }

    /// Serve the bytes of `real` under the digest `claimed`.
    pub fn alias_blob(&self, claimed: &str, real: &str) {
        let mut state = self.state();
        if let Some(data) = state.blobs.get(real).cloned() {
            state.blobs.insert(claimed.to_string(), data);
        }
    }

    pub fn remove_blob(&self, digest: &str) {
        self.state().blobs.remove(digest);
    }

    pub fn add_manifest(&self, repository: &str, tag: &str, manifest: Manifest) {
        self.state()
            .manifests
            .insert((repository.to_string(), tag.to_string()), manifest);
    }

    /// Split `disk` into gzip parts of `part_size` bytes and publish it.
    pub fn publish_image(
        &self,
        repository: &str,
        tag: &str,
        disk: &[u8],
        part_size: usize,
        options: PublishOptions,
    ) -> PublishedImage {
        let chunks: Vec<&[u8]> = if disk.is_empty() {
            vec![disk]
        } else {
            disk.chunks(part_size.max(1)).collect()
        };
        let total = chunks.len();

        let mut layers = Vec::new();
        let mut part_digests = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let number = i as u32 + 1;
            let compressed = gzip(chunk);
            let size = compressed.len() as u64;
            let digest = self.add_blob(compressed);
            part_digests.push(digest.clone());
            if options.omit_part == Some(number) {
                continue;
            }
            layers.push(Descriptor {
                media_type: format!(
                    "{};part.number={};part.total={}",
                    DISK_PART_MEDIA_TYPE, number, total
                ),
                digest,
                size,
                annotations: None,
            });
        }

        if let Some(nvram) = &options.nvram {
            let size = nvram.len() as u64;
            layers.push(Descriptor {
                media_type: NVRAM_MEDIA_TYPE.to_string(),
                digest: self.add_blob(nvram.clone()),
                size,
                annotations: None,
            });
        }
        if let Some(vm_config) = &options.vm_config {
            let bytes = serde_json::to_vec(vm_config).unwrap_or_default();
            let size = bytes.len() as u64;
            layers.push(Descriptor {
                media_type: VM_CONFIG_MEDIA_TYPE.to_string(),
                digest: self.add_blob(bytes),
                size,
                annotations: None,
            });
        }

        let config_document = if options.omit_size_annotation {
            serde_json::json!({ "architecture": "arm64", "os": "linux" })
        } else {
            serde_json::json!({
                "architecture": "arm64",
                "os": "linux",
                "config": { "Labels": { UNCOMPRESSED_SIZE_ANNOTATION: disk.len().to_string() } }
            })
        };
        let config_bytes = serde_json::to_vec(&config_document).unwrap_or_default();
        let config_size = config_bytes.len() as u64;
        let config = Descriptor {
            media_type: "application/vnd.oci.image.config.v1+json".to_string(),
            digest: self.add_blob(config_bytes),
            size: config_size,
            annotations: None,
        };

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config,
            layers,
            annotations: None,
        };
        let manifest_digest = sha256_digest(&serde_json::to_vec(&manifest).unwrap_or_default());
        self.add_manifest(repository, tag, manifest.clone());

        PublishedImage {
            manifest,
            manifest_digest,
            part_digests,
        }
    }

    pub fn fail_token(&self, fail: bool) {
        self.state().fail_token = fail;
    }

    pub fn fail_manifest(&self, fail: bool) {
        self.state().fail_manifest = fail;
    }

    /// Stall every blob request, e.g. to overlap concurrent pulls.
    pub fn set_blob_delay(&self, delay: Option<Duration>) {
        self.state().blob_delay = delay;
    }

    pub fn token_fetches(&self) -> usize {
        self.state().token_fetches
    }

    pub fn manifest_fetches(&self) -> usize {
        self.state().manifest_fetches
    }

    pub fn blob_fetches(&self, digest: &str) -> usize {
        self.state().blob_fetches.get(digest).copied().unwrap_or(0)
    }

    pub fn total_blob_fetches(&self) -> usize {
        self.state().blob_fetches.values().sum()
    }

    /// Offsets of requests that resumed a partial download.
    pub fn resumed_offsets(&self) -> Vec<u64> {
        self.state().resumed_offsets.clone()
    }
}

#[async_trait]
impl RegistryTransport for MockRegistry {
    async fn fetch_token(&self, repository: &str) -> PullResult<String> {
        let mut state = self.state();
        state.token_fetches += 1;
        if state.fail_token {
            return Err(PullError::TokenFetchFailed("injected failure".to_string()));
        }
        Ok(format!("token-for-{}", repository))
    }

    async fn fetch_manifest(&self, repository: &str, tag: &str, _token: &str) -> PullResult<(Manifest, String)> {
        let mut state = self.state();
        state.manifest_fetches += 1;
        if state.fail_manifest {
            return Err(PullError::ManifestFetchFailed("injected failure".to_string()));
        }
        let manifest = state
            .manifests
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
            .ok_or_else(|| {
                PullError::ManifestFetchFailed(format!("{}:{} returned 404 Not Found", repository, tag))
            })?;
        let digest = sha256_digest(&serde_json::to_vec(&manifest).unwrap_or_default());
        Ok((manifest, digest))
    }

    async fn open_blob(&self, _repository: &str, digest: &str, _token: &str, offset: u64) -> PullResult<BlobStream> {
        let (data, delay) = {
            let mut state = self.state();
            *state.blob_fetches.entry(digest.to_string()).or_insert(0) += 1;
            let data = state
                .blobs
                .get(digest)
                .cloned()
                .ok_or_else(|| PullError::layer(digest, "404 Not Found"))?;
            (data, state.blob_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let resumed = offset > 0 && (offset as usize) < data.len();
        if resumed {
            self.state().resumed_offsets.push(offset);
        }
        let start = if resumed { offset as usize } else { 0 };
        let chunks: Vec<PullResult<Bytes>> = data[start..]
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(BlobStream {
            resumed,
            stream: futures::stream::iter(chunks).boxed(),
        })
    }
}
