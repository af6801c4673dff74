//! Customization points of the installation pipeline

use std::collections::HashMap;

use log::info;
use types::{Device, InstallerError, Rom};

use crate::{
    context::InstallContext,
    installer::{ProceedState, ResolvedPaths, RunState},
    output::Output,
    properties::PropertyTables,
};

/// Key of the installation parameters naming the destination ROM
pub const INSTALL_LOCATION_PROP: &str = "mbtool.installer.install-location";

/// Key of the installation parameters disabling the device codename check
pub const IGNORE_CODENAME_PROP: &str = "mbtool.installer.ignore-codename";

/// What runs during the installation stage
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InstallationMode {
    /// The package installation script
    #[default]
    Updater,

    /// An interactive shell inside the installation environment
    DebugShell,
}

/// What a variant can see of the running installation
#[derive(Debug)]
pub struct Run<'a> {
    pub(crate) context: &'a InstallContext,
    pub(crate) state: &'a RunState,
    pub(crate) output: &'a mut Output,
}

impl Run<'_> {
    /// Parameters of the run
    #[must_use]
    pub fn context(&self) -> &InstallContext {
        self.context
    }

    /// Device the package targets, once it has been checked
    #[must_use]
    pub fn device(&self) -> Option<&Device> {
        self.state.device()
    }

    /// Destination ROM, once it has been chosen
    #[must_use]
    pub fn rom(&self) -> Option<&Rom> {
        self.state.rom()
    }

    /// Block devices and ROM paths resolved so far
    #[must_use]
    pub fn paths(&self) -> &ResolvedPaths {
        self.state.paths()
    }

    /// Known system properties
    #[must_use]
    pub fn properties(&self) -> &PropertyTables {
        self.state.properties()
    }

    /// Installation parameters shipped in the package
    #[must_use]
    pub fn info(&self) -> &HashMap<String, String> {
        self.state.info()
    }

    /// Shows a message to the user
    pub fn display_msg(&mut self, msg: &str) {
        self.output.display_msg(msg);
    }
}

/// A flavour of installation
///
/// Every hook runs at the end of the stage it's named after and can stop the
/// pipeline by returning something else than [`ProceedState::Continue`].
#[allow(unused_variables)]
pub trait InstallVariant {
    /// Names the ROM to install to. Returning `"cancelled"` stops the
    /// installation as cancelled.
    ///
    /// # Errors
    ///
    /// If the destination can't be determined
    fn get_install_type(&mut self, run: &mut Run<'_>) -> Result<String, InstallerError>;

    /// Properties exposed to the installation script
    fn get_properties(&mut self, run: &mut Run<'_>) -> HashMap<String, String> {
        run.properties().merged()
    }

    /// What to run during the installation stage
    fn installation_mode(&self) -> InstallationMode {
        InstallationMode::Updater
    }

    /// Called once the package has been opened
    fn on_initialize(&mut self, run: &mut Run<'_>) -> ProceedState {
        ProceedState::Continue
    }

    /// Called once the chroot exists
    fn on_created_chroot(&mut self, run: &mut Run<'_>) -> ProceedState {
        ProceedState::Continue
    }

    /// Called once the device has been validated
    fn on_checked_device(&mut self, run: &mut Run<'_>) -> ProceedState {
        ProceedState::Continue
    }

    /// Called once the chroot is ready for the package
    fn on_set_up_chroot(&mut self, run: &mut Run<'_>) -> ProceedState {
        ProceedState::Continue
    }

    /// Called once the ROM partitions are mounted
    fn on_mounted_filesystems(&mut self, run: &mut Run<'_>) -> ProceedState {
        ProceedState::Continue
    }

    /// Called right before the installation script starts
    fn on_pre_install(&mut self, run: &mut Run<'_>) -> ProceedState {
        ProceedState::Continue
    }

    /// Called once the installation script exited, cancellations excepted
    fn on_post_install(&mut self, run: &mut Run<'_>, succeeded: bool) -> ProceedState {
        ProceedState::Continue
    }

    /// Called once the ROM partitions are unmounted
    fn on_unmounted_filesystems(&mut self, run: &mut Run<'_>) -> ProceedState {
        ProceedState::Continue
    }

    /// Called at the end of a successful pipeline
    fn on_finished(&mut self, run: &mut Run<'_>) -> ProceedState {
        ProceedState::Continue
    }

    /// Called before everything is torn down, whatever the outcome
    fn on_cleanup(&mut self, run: &mut Run<'_>, outcome: ProceedState) {}
}

/// Installs to the ROM named by the package installation parameters
#[derive(Debug, Default)]
pub struct StandardInstall;

impl InstallVariant for StandardInstall {
    fn get_install_type(&mut self, run: &mut Run<'_>) -> Result<String, InstallerError> {
        run.info()
            .get(INSTALL_LOCATION_PROP)
            .filter(|loc| !loc.is_empty())
            .cloned()
            .ok_or(InstallerError::Custom(format!(
                "{INSTALL_LOCATION_PROP} isn't set"
            )))
    }
}

/// Prepares the installation environment like another variant, then hands
/// it over to an interactive shell instead of the installation script
#[derive(Debug, Default)]
pub struct DebugShellInstall<V> {
    inner: V,
}

impl<V: InstallVariant> DebugShellInstall<V> {
    /// Wraps a variant
    pub fn new(inner: V) -> Self {
        Self { inner }
    }
}

impl<V: InstallVariant> InstallVariant for DebugShellInstall<V> {
    fn get_install_type(&mut self, run: &mut Run<'_>) -> Result<String, InstallerError> {
        self.inner.get_install_type(run)
    }

    fn get_properties(&mut self, run: &mut Run<'_>) -> HashMap<String, String> {
        self.inner.get_properties(run)
    }

    fn installation_mode(&self) -> InstallationMode {
        InstallationMode::DebugShell
    }

    fn on_initialize(&mut self, run: &mut Run<'_>) -> ProceedState {
        self.inner.on_initialize(run)
    }

    fn on_created_chroot(&mut self, run: &mut Run<'_>) -> ProceedState {
        self.inner.on_created_chroot(run)
    }

    fn on_checked_device(&mut self, run: &mut Run<'_>) -> ProceedState {
        self.inner.on_checked_device(run)
    }

    fn on_set_up_chroot(&mut self, run: &mut Run<'_>) -> ProceedState {
        self.inner.on_set_up_chroot(run)
    }

    fn on_mounted_filesystems(&mut self, run: &mut Run<'_>) -> ProceedState {
        self.inner.on_mounted_filesystems(run)
    }

    fn on_pre_install(&mut self, run: &mut Run<'_>) -> ProceedState {
        info!("Starting a debug shell instead of the installation script");
        run.display_msg("Exit the shell to continue");

        self.inner.on_pre_install(run)
    }

    fn on_post_install(&mut self, run: &mut Run<'_>, succeeded: bool) -> ProceedState {
        self.inner.on_post_install(run, succeeded)
    }

    fn on_unmounted_filesystems(&mut self, run: &mut Run<'_>) -> ProceedState {
        self.inner.on_unmounted_filesystems(run)
    }

    fn on_finished(&mut self, run: &mut Run<'_>) -> ProceedState {
        self.inner.on_finished(run)
    }

    fn on_cleanup(&mut self, run: &mut Run<'_>, outcome: ProceedState) {
        self.inner.on_cleanup(run, outcome);
    }
}
