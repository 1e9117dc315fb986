// Manifest model and image layout
//
// Only the manifest fields the puller needs are modelled. Layers are
// classified by media type:
//   disk part   application/octet-stream+gzip;part.number=N;part.total=M
//   VM config   application/vnd.vmkeeper.vm.config.v1+json
//   NVRAM       application/octet-stream

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::registry::error::PullError;

pub const DISK_PART_MEDIA_TYPE: &str = "application/octet-stream+gzip";
pub const VM_CONFIG_MEDIA_TYPE: &str = "application/vnd.vmkeeper.vm.config.v1+json";
pub const NVRAM_MEDIA_TYPE: &str = "application/octet-stream";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const UNCOMPRESSED_SIZE_ANNOTATION: &str = "org.vmkeeper.uncompressed-size";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// One content-addressed chunk of the disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// 1-based ordinal position
    pub number: u32,
    pub digest: String,
    /// Compressed size in bytes
    pub size: u64,
}

/// The layers of a manifest, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub total_parts: u32,
    pub parts: BTreeMap<u32, Part>,
    pub vm_config: Option<Descriptor>,
    pub nvram: Option<Descriptor>,
}

impl ImageLayout {
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, PullError> {
        let mut parts = BTreeMap::new();
        let mut total_parts: Option<u32> = None;
        let mut vm_config = None;
        let mut nvram = None;

        for layer in &manifest.layers {
            let (base, params) = split_media_type(&layer.media_type);
            match base {
                DISK_PART_MEDIA_TYPE => {
                    let number = params.get("part.number").map(|n| parse_part_param(n)).transpose()?.unwrap_or(1);
                    let total = params.get("part.total").map(|n| parse_part_param(n)).transpose()?.unwrap_or(1);
                    if number == 0 || number > total {
                        return Err(PullError::ManifestFetchFailed(format!(
                            "part number {} outside 1..={}",
                            number, total
                        )));
                    }
                    match total_parts {
                        Some(existing) if existing != total => {
                            return Err(PullError::ManifestFetchFailed(format!(
                                "inconsistent part totals {} and {}",
                                existing, total
                            )));
                        }
                        _ => total_parts = Some(total),
                    }
                    let part = Part {
                        number,
                        digest: layer.digest.clone(),
                        size: layer.size,
                    };
                    if parts.insert(number, part).is_some() {
                        return Err(PullError::ManifestFetchFailed(format!(
                            "part {} listed twice",
                            number
                        )));
                    }
                }
                VM_CONFIG_MEDIA_TYPE => vm_config = Some(layer.clone()),
                NVRAM_MEDIA_TYPE => nvram = Some(layer.clone()),
                other => {
                    tracing::debug!(media_type = %other, digest = %layer.digest, "Ignoring unknown layer");
                }
            }
        }

        let total_parts = total_parts.ok_or_else(|| {
            PullError::ManifestFetchFailed("manifest has no disk layers".to_string())
        })?;

        Ok(Self {
            total_parts,
            parts,
            vm_config,
            nvram,
        })
    }

    /// Parts in ordinal order; gaps are reported by reassembly.
    pub fn ordered_parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.values()
    }

    pub fn compressed_size(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }
}

fn parse_part_param(value: &str) -> Result<u32, PullError> {
    value
        .trim()
        .parse()
        .map_err(|_| PullError::ManifestFetchFailed(format!("invalid part parameter '{}'", value)))
}

/// `type;k=v;k=v` into the bare type and its parameters.
fn split_media_type(media_type: &str) -> (&str, HashMap<&str, &str>) {
    let mut pieces = media_type.split(';');
    let base = pieces.next().unwrap_or("").trim();
    let params = pieces
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();
    (base, params)
}

fn annotation_value(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Uncompressed disk size, looked up in the config document's
/// `config.Labels`, then its `annotations`, then the manifest's config
/// descriptor and manifest annotations.
pub fn uncompressed_size(config_document: &serde_json::Value, manifest: &Manifest) -> Option<u64> {
    let from_doc = config_document
        .pointer("/config/Labels")
        .and_then(|labels| labels.get(UNCOMPRESSED_SIZE_ANNOTATION))
        .and_then(annotation_value)
        .or_else(|| {
            config_document
                .get("annotations")
                .and_then(|a| a.get(UNCOMPRESSED_SIZE_ANNOTATION))
                .and_then(annotation_value)
        });

    from_doc.or_else(|| {
        [&manifest.config.annotations, &manifest.annotations]
            .into_iter()
            .flatten()
            .find_map(|a| a.get(UNCOMPRESSED_SIZE_ANNOTATION))
            .and_then(|v| v.trim().parse().ok())
    })
}
