#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

use std::{io, path::PathBuf};

use bit_field::BitField as _;

mod device;
mod rom;

pub use device::{BlockDevs, Device, DeviceFlag};
pub use rom::{Rom, RomPath};

/// Behavior switches for one installer run
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InstallerFlags {
    bits: u8,
}

impl InstallerFlags {
    /// Creates a set of flags with every switch turned off
    #[must_use]
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Asks the installer to leave the raw partitions alone and assume they are
    /// already mounted.
    #[must_use]
    pub fn skip_mounting_volumes(mut self, val: bool) -> Self {
        self.bits.set_bit(0, val);
        self
    }

    /// Returns whether the raw partitions mounting step must be skipped
    #[must_use]
    pub fn skips_mounting_volumes(self) -> bool {
        self.bits.get_bit(0)
    }
}

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum InstallerError {
    /// An error has occurred when accessing the local filesystem, a device or a process
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    /// An error has occurred when parsing JSON data
    #[error("JSON Parsing Failure: {0}")]
    Json(#[from] serde_json::Error),

    /// An error has occurred when parsing TOML configuration files
    #[error("Configuration File Format Error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An error has occurred when reading the zip package
    #[error("Package Error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The installer has already been run once
    #[error("Installation has already been started")]
    AlreadyStarted,

    /// A mandatory file is missing from the zip package
    #[error("Package doesn't contain {0}")]
    MissingEntry(String),

    /// The package was built for another device
    #[error("Package is for {expected}, but this device is {found}")]
    DeviceMismatch {
        /// Codenames the package supports
        expected: String,

        /// Codename reported by the running system
        found: String,
    },

    /// The requested ROM slot doesn't exist
    #[error("Unknown ROM ID: {0}")]
    UnknownRom(String),

    /// None of the candidate block devices exist
    #[error("Couldn't find the {0} block device")]
    MissingBlockDevice(&'static str),

    /// An external program exited with an error
    #[error("{program} failed: {status}")]
    CommandFailed {
        /// Program that was run
        program: PathBuf,

        /// Human readable exit status
        status: String,
    },

    /// An unknown error occurred
    #[error("Error: {0}")]
    Custom(String),
}
