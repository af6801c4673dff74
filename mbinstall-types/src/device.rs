use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::InstallerError;

/// Device Capabilities
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFlag {
    /// The device uses the same partition for the boot and recovery images
    HasCombinedBootAndRecovery,

    /// exFAT partitions must be mounted through FUSE instead of the kernel driver
    UseFuseExfat,
}

/// Candidate block device paths, in order of preference
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockDevs {
    /// Directories holding the block device nodes
    #[serde(default)]
    pub base_dirs: Vec<PathBuf>,

    /// Boot partition candidates
    #[serde(default)]
    pub boot: Vec<PathBuf>,

    /// Recovery partition candidates
    #[serde(default)]
    pub recovery: Vec<PathBuf>,

    /// System partition candidates
    #[serde(default)]
    pub system: Vec<PathBuf>,

    /// Cache partition candidates
    #[serde(default)]
    pub cache: Vec<PathBuf>,

    /// Data partition candidates
    #[serde(default)]
    pub data: Vec<PathBuf>,

    /// Vendor EFS partition candidates
    #[serde(default)]
    pub efs: Vec<PathBuf>,

    /// External SD card candidates
    #[serde(default)]
    pub extsd: Vec<PathBuf>,
}

impl BlockDevs {
    /// Returns the first candidate that exists on the running system
    #[must_use]
    pub fn first_existing(candidates: &[PathBuf]) -> Option<&Path> {
        candidates
            .iter()
            .map(PathBuf::as_path)
            .find(|p| p.exists())
    }
}

/// Hardware Profile of the device a package has been built for
#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    /// Unique device identifier
    pub id: String,

    /// Codenames reported by the device through `ro.product.device`
    #[serde(default)]
    pub codenames: Vec<String>,

    /// Human readable device name
    pub name: String,

    /// CPU Architecture
    #[serde(default)]
    pub architecture: Option<String>,

    /// Device Capabilities
    #[serde(default)]
    pub flags: Vec<DeviceFlag>,

    /// Block Devices
    #[serde(default)]
    pub block_devs: BlockDevs,
}

impl Device {
    /// Parses a device description from its JSON representation
    ///
    /// # Errors
    ///
    /// If the JSON is malformed or doesn't describe a device
    pub fn from_json(data: &[u8]) -> Result<Self, InstallerError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Returns whether the device has a given capability
    #[must_use]
    pub fn has_flag(&self, flag: DeviceFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Returns whether one of our codenames is the given one
    #[must_use]
    pub fn matches_codename(&self, codename: &str) -> bool {
        self.codenames.iter().any(|c| c == codename)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use tempfile::TempDir;
    use test_log::test;

    use crate::{BlockDevs, Device, DeviceFlag};

    const DEVICE_JSON: &str = r#"{
        "id": "hlte",
        "codenames": ["hlte", "hltexx"],
        "name": "Samsung Galaxy Note 3",
        "architecture": "armeabi-v7a",
        "flags": ["use_fuse_exfat"],
        "block_devs": {
            "base_dirs": ["/dev/block/platform/msm_sdcc.1/by-name"],
            "boot": ["/dev/block/platform/msm_sdcc.1/by-name/boot", "/dev/block/mmcblk0p14"],
            "system": ["/dev/block/platform/msm_sdcc.1/by-name/system"]
        }
    }"#;

    #[test]
    fn parse_device() {
        let device = Device::from_json(DEVICE_JSON.as_bytes()).unwrap();

        assert_eq!(device.id, "hlte");
        assert!(device.matches_codename("hltexx"));
        assert!(!device.matches_codename("jflte"));
        assert!(device.has_flag(DeviceFlag::UseFuseExfat));
        assert!(!device.has_flag(DeviceFlag::HasCombinedBootAndRecovery));
        assert_eq!(device.block_devs.boot.len(), 2);
        assert!(device.block_devs.recovery.is_empty());
    }

    #[test]
    fn parse_device_unknown_block_dev_kind() {
        let json = r#"{ "id": "a", "name": "A", "block_devs": { "modem": [] } }"#;

        Device::from_json(json.as_bytes()).unwrap_err();
    }

    #[test]
    fn first_existing_candidate() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("mmcblk0p14");
        File::create(&present).unwrap();

        let candidates = vec![dir.path().join("boot"), present.clone()];
        assert_eq!(BlockDevs::first_existing(&candidates), Some(present.as_path()));
        assert_eq!(BlockDevs::first_existing(&candidates[..1]), None);
    }
}
