use std::path::{Path, PathBuf};

use types::InstallerFlags;

use crate::{config::InstallerConfig, output::Interface};

const DEFAULT_CHROOT_DIR: &str = "/chroot";
const DEFAULT_TEMP_DIR: &str = "/tmp";

/// Parameters of one installer run
#[derive(Clone, Debug)]
pub struct InstallContext {
    zip_file: PathBuf,
    chroot_dir: PathBuf,
    temp_dir: PathBuf,
    interface: Interface,
    flags: InstallerFlags,
    config: InstallerConfig,
}

impl InstallContext {
    /// Starts describing a run installing `zip_file`
    pub fn builder(zip_file: impl AsRef<Path>) -> InstallContextBuilder {
        InstallContextBuilder {
            zip_file: zip_file.as_ref().to_path_buf(),
            chroot_dir: PathBuf::from(DEFAULT_CHROOT_DIR),
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            interface: Interface::default(),
            flags: InstallerFlags::new(),
            config: InstallerConfig::default(),
        }
    }

    /// Package being installed
    #[must_use]
    pub fn zip_file(&self) -> &Path {
        &self.zip_file
    }

    /// Root of the installation environment
    #[must_use]
    pub fn chroot_dir(&self) -> &Path {
        &self.chroot_dir
    }

    /// Scratch space for temporary images
    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Kind of consumer reading our output
    #[must_use]
    pub fn interface(&self) -> Interface {
        self.interface
    }

    /// Behavior switches
    #[must_use]
    pub fn flags(&self) -> InstallerFlags {
        self.flags
    }

    /// Host settings
    #[must_use]
    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Returns where a path of the installation environment lives on the host
    #[must_use]
    pub fn in_chroot(&self, path: &Path) -> PathBuf {
        crate::chroot::in_root(&self.chroot_dir, path)
    }
}

/// Builder for [`InstallContext`]
#[derive(Debug)]
pub struct InstallContextBuilder {
    zip_file: PathBuf,
    chroot_dir: PathBuf,
    temp_dir: PathBuf,
    interface: Interface,
    flags: InstallerFlags,
    config: InstallerConfig,
}

impl InstallContextBuilder {
    /// Sets the root of the installation environment
    #[must_use]
    pub fn chroot_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.chroot_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the scratch space
    #[must_use]
    pub fn temp_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.temp_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets who reads our output
    #[must_use]
    pub fn interface(mut self, interface: Interface) -> Self {
        self.interface = interface;
        self
    }

    /// Sets the behavior switches
    #[must_use]
    pub fn flags(mut self, flags: InstallerFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the host settings
    #[must_use]
    pub fn config(mut self, config: InstallerConfig) -> Self {
        self.config = config;
        self
    }

    /// Finishes the description
    #[must_use]
    pub fn build(self) -> InstallContext {
        InstallContext {
            zip_file: self.zip_file,
            chroot_dir: self.chroot_dir,
            temp_dir: self.temp_dir,
            interface: self.interface,
            flags: self.flags,
            config: self.config,
        }
    }
}
