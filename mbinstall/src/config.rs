use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Deserialize;
use types::InstallerError;

const GIB: u64 = 1024 * 1024 * 1024;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mbinstall.toml";

/// Host specific settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    /// Static busybox binary installed in the chroot
    pub busybox: PathBuf,

    /// Property files describing the running recovery
    pub host_property_files: Vec<PathBuf>,

    /// Where the raw partitions are mounted
    pub raw_root: PathBuf,

    /// Host paths made available inside the chroot
    pub host_binds: Vec<PathBuf>,

    /// Size of newly created system images, in bytes
    pub system_image_size: u64,

    /// Size of newly created cache images, in bytes
    pub cache_image_size: u64,

    /// Size of newly created data images, in bytes
    pub data_image_size: u64,

    /// FUSE helper mounting exFAT filesystems
    pub fuse_exfat: PathBuf,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            busybox: PathBuf::from("/sbin/busybox"),
            host_property_files: vec![
                PathBuf::from("/default.prop"),
                PathBuf::from("/system/build.prop"),
            ],
            raw_root: PathBuf::from("/raw"),
            host_binds: vec![PathBuf::from("/sbin/mount.exfat")],
            system_image_size: 4 * GIB,
            cache_image_size: GIB,
            data_image_size: 4 * GIB,
            fuse_exfat: PathBuf::from("/sbin/mount.exfat"),
        }
    }
}

impl InstallerConfig {
    /// Parses a configuration from its TOML representation
    ///
    /// # Errors
    ///
    /// If the TOML is malformed or contains unknown fields
    pub fn from_toml(content: &str) -> Result<Self, InstallerError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads a configuration file
    ///
    /// # Errors
    ///
    /// If the file can't be read or parsed
    pub fn from_path(path: &Path) -> Result<Self, InstallerError> {
        debug!("Loading configuration from {}", path.display());

        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Reads the configuration file from `path`, or from the default location
    /// if it exists. Falls back to the built-in defaults otherwise.
    ///
    /// # Errors
    ///
    /// If a configuration file exists but can't be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self, InstallerError> {
        if let Some(path) = path {
            return Self::from_path(path);
        }

        let default = Path::new(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::from_path(default);
        }

        debug!("No configuration file, using the defaults");
        Ok(Self::default())
    }
}
