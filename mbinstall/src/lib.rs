#![allow(clippy::multiple_crate_versions)]
#![doc = include_str!("../../README.md")]

// Only used by the command line front end
use anyhow as _;
use env_logger as _;

mod chroot;
mod command;
mod config;
mod context;
mod image;
mod installer;
mod ledger;
mod mux;
mod output;
mod package;
mod platform;
mod properties;
mod updater;
mod variant;

pub use command::{run_command, run_command_chroot, CommandSpec, StdioMode, Stream};
pub use config::{InstallerConfig, DEFAULT_CONFIG_PATH};
pub use context::{InstallContext, InstallContextBuilder};
pub use installer::{Installer, ProceedState, ResolvedPaths, RunState, Stage, CANCELLED};
pub use output::{Interface, Output};
pub use package::{is_aroma, Package};
pub use platform::{HostPlatform, LoopDevice, NodeKind, Platform};
pub use properties::{
    load_property_files, parse_properties, read_property_file, PropertyTables,
    PROPERTY_WORKSPACE_ENV,
};
pub use types::{BlockDevs, Device, DeviceFlag, InstallerError, InstallerFlags, Rom, RomPath};
pub use updater::{UpdaterCommand, UPDATER_API_VERSION};
pub use variant::{
    DebugShellInstall, InstallVariant, InstallationMode, Run, StandardInstall,
    IGNORE_CODENAME_PROP, INSTALL_LOCATION_PROP,
};
