// VM Configuration Store
//
// Typed, persisted per-VM configuration. Stored as pretty JSON in
// `<vm-dir>/config.json` using the camelCase field names below; the
// platform-identity blobs are base64 strings.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::units::{format_size, MB};
use crate::vm::error::{VmError, VmResult};
use crate::vm::storage::{write_atomic, VmDirectory};

/// Guest operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Linux,
    #[serde(rename = "macOS", alias = "macos", alias = "darwin")]
    MacOs,
}

impl OsKind {
    /// Whether booting needs a hardware model and machine identifier.
    pub fn requires_platform_identity(self) -> bool {
        matches!(self, OsKind::MacOs)
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsKind::Linux => write!(f, "linux"),
            OsKind::MacOs => write!(f, "macOS"),
        }
    }
}

impl FromStr for OsKind {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(OsKind::Linux),
            "macos" | "darwin" => Ok(OsKind::MacOs),
            other => Err(VmError::InvalidConfigValue(format!(
                "unknown OS '{}', expected linux or macOS",
                other
            ))),
        }
    }
}

/// Display resolution, written `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            VmError::InvalidConfigValue(format!(
                "invalid display '{}', expected WIDTHxHEIGHT",
                s
            ))
        };
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generate a random locally administered, unicast MAC address.
pub fn random_mac_address() -> String {
    let mut bytes = [0u8; 6];
    rand::rng().fill(&mut bytes);
    bytes[0] = (bytes[0] & 0xfe) | 0x02;
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn validate_mac_address(mac: &str) -> VmResult<()> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && u8::from_str_radix(o, 16).is_ok());
    if valid {
        Ok(())
    } else {
        Err(VmError::InvalidConfigValue(format!(
            "invalid MAC address '{}'",
            mac
        )))
    }
}

mod base64_opt {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub const MIN_MEMORY: u64 = 512 * MB;

/// Persisted configuration for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub os: OsKind,
    pub cpu_count: u32,
    /// Memory size in bytes
    pub memory_size: u64,
    /// Disk size in bytes
    pub disk_size: u64,
    pub display: Resolution,
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub hardware_model: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub machine_identifier: Option<Vec<u8>>,
}

impl VmConfig {
    /// A fresh configuration with a random MAC address and no platform identity.
    pub fn new(os: OsKind, cpu_count: u32, memory_size: u64, disk_size: u64, display: Resolution) -> Self {
        Self {
            os,
            cpu_count,
            memory_size,
            disk_size,
            display,
            mac_address: random_mac_address(),
            hardware_model: None,
            machine_identifier: None,
        }
    }

    /// True once the platform identity needed to boot this OS is present.
    pub fn has_platform_identity(&self) -> bool {
        !self.os.requires_platform_identity()
            || (self.hardware_model.is_some() && self.machine_identifier.is_some())
    }

    pub fn validate(&self) -> VmResult<()> {
        if self.cpu_count == 0 {
            return Err(VmError::InvalidConfigValue(
                "cpu count must be at least 1".to_string(),
            ));
        }
        if self.memory_size < MIN_MEMORY {
            return Err(VmError::InvalidConfigValue(format!(
                "memory must be at least {}",
                format_size(MIN_MEMORY)
            )));
        }
        if self.disk_size == 0 {
            return Err(VmError::InvalidConfigValue(
                "disk size must be greater than zero".to_string(),
            ));
        }
        validate_mac_address(&self.mac_address)
    }

    /// Load `config.json` from a VM directory.
    pub async fn load(dir: &VmDirectory) -> VmResult<Self> {
        let path = dir.config_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VmError::ConfigNotFound(path));
            }
            Err(e) => return Err(VmError::io(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| VmError::InvalidConfigData {
            path,
            reason: e.to_string(),
        })
    }

    /// Persist to `config.json`; either the whole document lands or nothing changes.
    pub async fn save(&self, dir: &VmDirectory) -> VmResult<()> {
        let path = dir.config_path();
        let json = serde_json::to_vec_pretty(self).map_err(|e| VmError::FileCreationFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &json).await
    }
}

/// Optional changes for `update_settings`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfigUpdate {
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default)]
    pub memory_size: Option<u64>,
    #[serde(default)]
    pub disk_size: Option<u64>,
    #[serde(default)]
    pub display: Option<Resolution>,
}

impl VmConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.cpu_count.is_none()
            && self.memory_size.is_none()
            && self.disk_size.is_none()
            && self.display.is_none()
    }

    /// Apply to `config`, refusing to shrink the disk.
    pub fn apply(&self, config: &mut VmConfig) -> VmResult<()> {
        if let Some(requested) = self.disk_size {
            if requested < config.disk_size {
                return Err(VmError::ResizeTooSmall {
                    current: config.disk_size,
                    requested,
                });
            }
        }

        let mut updated = config.clone();
        if let Some(cpu) = self.cpu_count {
            updated.cpu_count = cpu;
        }
        if let Some(memory) = self.memory_size {
            updated.memory_size = memory;
        }
        if let Some(disk) = self.disk_size {
            updated.disk_size = disk;
        }
        if let Some(display) = self.display {
            updated.display = display;
        }
        updated.validate()?;

        *config = updated;
        Ok(())
    }
}

/// Defaults carried by a pulled image's VM config layer.
///
/// Same field names as `VmConfig`, all optional. Explicit create options win
/// over the template, which wins over host defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfigTemplate {
    #[serde(default)]
    pub os: Option<OsKind>,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default)]
    pub memory_size: Option<u64>,
    #[serde(default)]
    pub disk_size: Option<u64>,
    #[serde(default)]
    pub display: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub hardware_model: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub machine_identifier: Option<Vec<u8>>,
}

impl VmConfigTemplate {
    /// Read a template file; `None` when there is none.
    pub async fn load(path: &Path) -> VmResult<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VmError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VmError::InvalidConfigData {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::GB;
    use crate::vm::storage::StorageLayout;
    use tempfile::TempDir;

    fn sample() -> VmConfig {
        VmConfig::new(OsKind::Linux, 2, 4 * GB, 20 * GB, Resolution::default())
    }

    async fn vm_dir(tmp: &TempDir) -> VmDirectory {
        let dir = StorageLayout::single(tmp.path()).resolve("vm1", None).unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let dir = vm_dir(&tmp).await;
        let mut config = sample();
        config.os = OsKind::MacOs;
        config.hardware_model = Some(vec![1, 2, 3, 255]);
        config.machine_identifier = Some(b"machine".to_vec());

        config.save(&dir).await.unwrap();
        assert_eq!(VmConfig::load(&dir).await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_load_missing_config() {
        let tmp = TempDir::new().unwrap();
        let dir = vm_dir(&tmp).await;
        assert!(matches!(
            VmConfig::load(&dir).await,
            Err(VmError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_invalid_config() {
        let tmp = TempDir::new().unwrap();
        let dir = vm_dir(&tmp).await;
        tokio::fs::write(dir.config_path(), b"{\"os\": \"linux\", \"cpuCount\":")
            .await
            .unwrap();
        assert!(matches!(
            VmConfig::load(&dir).await,
            Err(VmError::InvalidConfigData { .. })
        ));
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["os"], "linux");
        assert_eq!(json["cpuCount"], 2);
        assert_eq!(json["display"], "1024x768");
        assert!(json.get("hardwareModel").is_none());
        assert!(json["macAddress"].as_str().unwrap().len() == 17);
    }

    #[test]
    fn test_identity_fields_are_base64() {
        let mut config = sample();
        config.hardware_model = Some(b"hw".to_vec());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["hardwareModel"], "aHc=");
    }

    #[test]
    fn test_resolution_parse() {
        let r: Resolution = "1920x1080".parse().unwrap();
        assert_eq!(r.width, 1920);
        assert_eq!(r.height, 1080);
        assert_eq!(r.to_string(), "1920x1080");
        assert!("1920".parse::<Resolution>().is_err());
        assert!("0x1080".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_os_kind_parse() {
        assert_eq!("macos".parse::<OsKind>().unwrap(), OsKind::MacOs);
        assert_eq!("Linux".parse::<OsKind>().unwrap(), OsKind::Linux);
        assert!("windows".parse::<OsKind>().is_err());
    }

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = random_mac_address();
            validate_mac_address(&mac).unwrap();
            let first = u8::from_str_radix(&mac[0..2], 16).unwrap();
            assert_eq!(first & 0x01, 0, "multicast bit set in {}", mac);
            assert_eq!(first & 0x02, 0x02, "local bit unset in {}", mac);
        }
    }

    #[test]
    fn test_platform_identity() {
        let mut config = sample();
        assert!(config.has_platform_identity());
        config.os = OsKind::MacOs;
        assert!(!config.has_platform_identity());
        config.hardware_model = Some(vec![1]);
        config.machine_identifier = Some(vec![2]);
        assert!(config.has_platform_identity());
    }

    #[test]
    fn test_update_rejects_shrink_and_leaves_config() {
        let mut config = sample();
        let before = config.clone();
        let update = VmConfigUpdate {
            cpu_count: Some(8),
            disk_size: Some(10 * GB),
            ..Default::default()
        };
        let err = update.apply(&mut config).unwrap_err();
        assert!(matches!(
            err,
            VmError::ResizeTooSmall { current, requested } if current == 20 * GB && requested == 10 * GB
        ));
        assert_eq!(config, before);
    }

    #[test]
    fn test_update_applies_fields() {
        let mut config = sample();
        VmConfigUpdate {
            cpu_count: Some(8),
            memory_size: Some(8 * GB),
            disk_size: Some(40 * GB),
            display: Some("1920x1080".parse().unwrap()),
        }
        .apply(&mut config)
        .unwrap();
        assert_eq!(config.cpu_count, 8);
        assert_eq!(config.memory_size, 8 * GB);
        assert_eq!(config.disk_size, 40 * GB);
        assert_eq!(config.display.to_string(), "1920x1080");
    }

    #[test]
    fn test_update_rejects_invalid_values() {
        let mut config = sample();
        let update = VmConfigUpdate {
            cpu_count: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            update.apply(&mut config),
            Err(VmError::InvalidConfigValue(_))
        ));
        assert_eq!(config.cpu_count, 2);
    }

    #[tokio::test]
    async fn test_template_partial_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        assert_eq!(VmConfigTemplate::load(&path).await.unwrap(), None);

        tokio::fs::write(&path, br#"{"os":"macOS","cpuCount":4,"hardwareModel":"aHc="}"#)
            .await
            .unwrap();
        let template = VmConfigTemplate::load(&path).await.unwrap().unwrap();
        assert_eq!(template.os, Some(OsKind::MacOs));
        assert_eq!(template.cpu_count, Some(4));
        assert_eq!(template.memory_size, None);
        assert_eq!(template.hardware_model, Some(b"hw".to_vec()));

        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(matches!(
            VmConfigTemplate::load(&path).await,
            Err(VmError::InvalidConfigData { .. })
        ));
    }
}
