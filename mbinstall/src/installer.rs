//! The staged installation pipeline
//!
//! An [`Installer`] walks through a fixed sequence of stages. Every stage can
//! let the installation go on, fail it, or cancel it. Whatever happens, the
//! cleanup stage runs last and releases everything the previous stages
//! acquired, in the reverse order.

use core::fmt;
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    os::fd::AsRawFd as _,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
};

use log::{debug, info, warn};
use nix::{fcntl::OFlag, unistd::pipe2};
use types::{BlockDevs, Device, DeviceFlag, InstallerError, Rom};

use crate::{
    chroot::{create_chroot, set_up_busybox_wrapper},
    command::{check_status, run_command, CommandSpec, StdioMode},
    context::InstallContext,
    image::{create_image, mount_dir_or_image, mount_efs, mount_first_fstype, system_image_copy},
    ledger::{Ledger, Resource},
    output::Output,
    package::{Package, BLOCK_IMAGE_MARKER, DEVICE_JSON, INFO_PROP, UPDATE_BINARY},
    platform::{HostPlatform, Platform},
    properties::{
        load_property_files, parse_properties, LegacyPropertyService, PropertyTables,
        PROPERTY_WORKSPACE_ENV, PROPERTY_WORKSPACE_PATH,
    },
    updater::{updater_fd_reader, UPDATER_API_VERSION},
    variant::{InstallVariant, InstallationMode, Run, IGNORE_CODENAME_PROP},
};

/// Install location, or updater command, meaning the user gave up
pub const CANCELLED: &str = "cancelled";

const UPDATER_PATH: &str = "/mb/updater";
const INSTALL_ZIP_PATH: &str = "/mb/install.zip";
const SHELL_PATH: &str = "/sbin/sh";
const CHROOT_PATH_ENV: &str = "/sbin:/system/bin:/system/xbin";
const TEMP_SYSTEM_IMAGE: &str = "system.img";

// The primary system partition also stores the other slots
const SLOT_STORE: &[&str] = &["multiboot"];

fn slot_entries(rom: &Rom) -> &'static [&'static str] {
    if rom.is_primary() {
        SLOT_STORE
    } else {
        &[]
    }
}

/// What happens after a stage
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProceedState {
    /// Move on to the next stage
    Continue,

    /// Stop, the installation failed
    Fail,

    /// Stop, the installation was cancelled
    Cancel,
}

impl fmt::Display for ProceedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continue => "continue",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
        })
    }
}

/// Steps of an installation, in order
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Package inspection
    Initialize,

    /// Chroot creation
    CreateChroot,

    /// Tools and properties setup
    SetUpEnvironment,

    /// Device validation
    CheckDevice,

    /// Destination selection
    GetInstallType,

    /// Package specific chroot setup
    SetUpChroot,

    /// ROM partitions mounting
    MountFilesystems,

    /// Installation script run
    Installation,

    /// ROM partitions unmounting
    UnmountFilesystems,

    /// Boot image hand over
    Finish,

    /// Teardown, always run
    Cleanup,
}

impl Stage {
    /// Every stage, in execution order
    pub const ALL: [Self; 11] = [
        Self::Initialize,
        Self::CreateChroot,
        Self::SetUpEnvironment,
        Self::CheckDevice,
        Self::GetInstallType,
        Self::SetUpChroot,
        Self::MountFilesystems,
        Self::Installation,
        Self::UnmountFilesystems,
        Self::Finish,
        Self::Cleanup,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initialize => "Initialize",
            Self::CreateChroot => "Create Chroot",
            Self::SetUpEnvironment => "Set Up Environment",
            Self::CheckDevice => "Check Device",
            Self::GetInstallType => "Get Install Type",
            Self::SetUpChroot => "Set Up Chroot",
            Self::MountFilesystems => "Mount Filesystems",
            Self::Installation => "Installation",
            Self::UnmountFilesystems => "Unmount Filesystems",
            Self::Finish => "Finish",
            Self::Cleanup => "Cleanup",
        })
    }
}

/// Block devices and ROM locations found so far
#[derive(Clone, Debug, Default)]
pub struct ResolvedPaths {
    /// Boot partition
    pub boot_block_dev: Option<PathBuf>,

    /// Recovery partition
    pub recovery_block_dev: Option<PathBuf>,

    /// System partition
    pub system_block_dev: Option<PathBuf>,

    /// Where the ROM /system lives
    pub system_path: Option<PathBuf>,

    /// Where the ROM /cache lives
    pub cache_path: Option<PathBuf>,

    /// Where the ROM /data lives
    pub data_path: Option<PathBuf>,
}

/// What the stages learnt so far
#[derive(Debug, Default)]
pub struct RunState {
    device: Option<Device>,
    rom: Option<Arc<Rom>>,
    paths: ResolvedPaths,
    props: PropertyTables,
    info: HashMap<String, String>,
    passthrough: bool,
    has_block_image: bool,
    copy_to_temp_image: bool,
    use_fuse_exfat: bool,
    temp_image: Option<PathBuf>,
    failure: Option<String>,
}

impl RunState {
    /// Device the package targets
    #[must_use]
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Destination ROM
    #[must_use]
    pub fn rom(&self) -> Option<&Rom> {
        self.rom.as_deref()
    }

    /// Resolved block devices and ROM locations
    #[must_use]
    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    /// Known system properties
    #[must_use]
    pub fn properties(&self) -> &PropertyTables {
        &self.props
    }

    /// Installation parameters shipped in the package
    #[must_use]
    pub fn info(&self) -> &HashMap<String, String> {
        &self.info
    }

    /// Whether the updater output is relayed untouched
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Whether the package flashes a block image of /system
    #[must_use]
    pub fn has_block_image(&self) -> bool {
        self.has_block_image
    }

    /// Whether /system is staged through a temporary image
    #[must_use]
    pub fn copies_to_temp_image(&self) -> bool {
        self.copy_to_temp_image
    }
}

#[derive(Debug)]
enum ScriptOutcome {
    Succeeded,
    Failed(ExitStatus),
    Cancelled,
}

/// Installs one package
#[derive(Debug)]
pub struct Installer<V, P = HostPlatform> {
    context: InstallContext,
    variant: V,
    platform: P,
    output: Output,
    state: RunState,
    ledger: Ledger,
    props_service: Option<LegacyPropertyService>,
    image_mark: Option<usize>,
    fs_mark: Option<usize>,
    started: bool,
}

impl<V: InstallVariant> Installer<V> {
    /// Creates an installer acting on the running system
    pub fn new(context: InstallContext, output: Output, variant: V) -> Self {
        Self::with_platform(context, output, variant, HostPlatform)
    }
}

impl<V: InstallVariant, P: Platform> Installer<V, P> {
    /// Creates an installer acting through `platform`
    pub fn with_platform(context: InstallContext, output: Output, variant: V, platform: P) -> Self {
        Self {
            context,
            variant,
            platform,
            output,
            state: RunState::default(),
            ledger: Ledger::new(),
            props_service: None,
            image_mark: None,
            fs_mark: None,
            started: false,
        }
    }

    /// What the stages learnt so far
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// The installation variant
    pub fn variant(&self) -> &V {
        &self.variant
    }

    /// The platform the installer acts through
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Runs the installation. Can only be called once.
    ///
    /// # Errors
    ///
    /// If the installation has already been started. Installation failures
    /// aren't errors, they are reported through the returned state.
    pub fn start_installation(&mut self) -> Result<ProceedState, InstallerError> {
        if self.started {
            warn!("Installation has already been started");
            return Err(InstallerError::AlreadyStarted);
        }
        self.started = true;

        let mut outcome = ProceedState::Continue;
        for stage in Stage::ALL {
            info!("Stage: {stage}");

            outcome = match stage {
                Stage::Initialize => self.stage_initialize(),
                Stage::CreateChroot => self.stage_create_chroot(),
                Stage::SetUpEnvironment => self.stage_set_up_environment(),
                Stage::CheckDevice => self.stage_check_device(),
                Stage::GetInstallType => self.stage_get_install_type(),
                Stage::SetUpChroot => self.stage_set_up_chroot(),
                Stage::MountFilesystems => self.stage_mount_filesystems(),
                Stage::Installation => self.stage_installation(),
                Stage::UnmountFilesystems => self.stage_unmount_filesystems(),
                Stage::Finish => self.stage_finish(),
                Stage::Cleanup => break,
            };

            if outcome != ProceedState::Continue {
                info!("{stage} stage ended with {outcome}");
                info!("Stage: {}", Stage::Cleanup);
                break;
            }
        }

        self.stage_cleanup(outcome);

        Ok(outcome)
    }

    fn hook<R>(&mut self, f: impl FnOnce(&mut V, &mut Run<'_>) -> R) -> R {
        let mut run = Run {
            context: &self.context,
            state: &self.state,
            output: &mut self.output,
        };

        f(&mut self.variant, &mut run)
    }

    fn fail(&mut self, msg: &str, cause: &dyn fmt::Display) -> ProceedState {
        log::error!("{msg}: {cause}");
        self.state.failure = Some(msg.to_owned());

        ProceedState::Fail
    }

    fn in_chroot(&self, path: &str) -> PathBuf {
        self.context.in_chroot(Path::new(path))
    }

    fn stage_initialize(&mut self) -> ProceedState {
        info!("Package: {}", self.context.zip_file().display());
        info!("Chroot: {}", self.context.chroot_dir().display());
        info!("Temporary directory: {}", self.context.temp_dir().display());
        info!("Interface: {}", self.context.interface());

        let pkg = match Package::open(self.context.zip_file()) {
            Ok(pkg) => pkg,
            Err(e) => return self.fail("Couldn't open the package", &e),
        };

        self.state.passthrough = pkg.is_aroma();
        if self.state.passthrough {
            info!("AROMA installer detected, relaying its output");
        }

        self.state.has_block_image = pkg.has_entry(BLOCK_IMAGE_MARKER);
        if self.state.has_block_image {
            info!("Package flashes a block image of /system");
        }

        self.hook(|v, run| v.on_initialize(run))
    }

    fn stage_create_chroot(&mut self) -> ProceedState {
        self.output.display_msg("Creating chroot");

        let res = create_chroot(
            &self.platform,
            &mut self.ledger,
            self.context.chroot_dir(),
            &self.context.config().host_binds,
        );

        if let Err(e) = res {
            return self.fail("Couldn't create the chroot", &e);
        }

        self.hook(|v, run| v.on_created_chroot(run))
    }

    fn extract_multiboot_files(&mut self) -> Result<(), InstallerError> {
        let mut pkg = Package::open(self.context.zip_file())?;

        pkg.extract_entry(UPDATE_BINARY, &self.in_chroot(UPDATER_PATH), 0o755)?;

        match pkg.read_entry(INFO_PROP) {
            Ok(data) => self.state.info = parse_properties(&String::from_utf8_lossy(&data)),
            Err(InstallerError::MissingEntry(_)) => debug!("No installation parameters"),
            Err(e) => return Err(e),
        }

        Ok(())
    }

    fn set_up_legacy_properties(&mut self) -> Result<(), InstallerError> {
        let service = LegacyPropertyService::start(self.context.chroot_dir())?;

        self.ledger
            .push(Resource::PropertyWorkspace(service.workspace().to_path_buf()));
        self.props_service = Some(service);

        Ok(())
    }

    fn stage_set_up_environment(&mut self) -> ProceedState {
        self.state.props.host = load_property_files(&self.context.config().host_property_files);

        if let Err(e) = self.extract_multiboot_files() {
            return self.fail("Couldn't extract the multiboot files", &e);
        }

        let res = set_up_busybox_wrapper(
            &self.platform,
            self.context.chroot_dir(),
            &self.context.config().busybox,
        );
        if let Err(e) = res {
            return self.fail("Couldn't install busybox", &e);
        }

        if let Err(e) = self.set_up_legacy_properties() {
            return self.fail("Couldn't start the property service", &e);
        }

        ProceedState::Continue
    }

    fn read_device(&self) -> Result<Device, InstallerError> {
        let mut pkg = Package::open(self.context.zip_file())?;

        Device::from_json(&pkg.read_entry(DEVICE_JSON)?)
    }

    fn check_codename(&self, device: &Device) -> Result<(), InstallerError> {
        let host = &self.state.props.host;
        let found = host
            .get("ro.product.device")
            .or_else(|| host.get("ro.build.product"));

        match found {
            Some(codename) if device.matches_codename(codename) => Ok(()),
            other => Err(InstallerError::DeviceMismatch {
                expected: device.codenames.join(", "),
                found: other.map_or_else(|| "unknown".to_owned(), Clone::clone),
            }),
        }
    }

    fn stage_check_device(&mut self) -> ProceedState {
        let device = match self.read_device() {
            Ok(device) => device,
            Err(e) => return self.fail("Couldn't read the device description", &e),
        };

        let ignore_codename = self
            .state
            .info
            .get(IGNORE_CODENAME_PROP)
            .is_some_and(|v| v == "true");

        if ignore_codename {
            info!("Not checking the device codename");
        } else if let Err(e) = self.check_codename(&device) {
            return self.fail("The package isn't meant for this device", &e);
        }

        let block_devs = &device.block_devs;

        let Some(boot) = BlockDevs::first_existing(&block_devs.boot) else {
            return self.fail(
                "Couldn't find the boot partition",
                &InstallerError::MissingBlockDevice("boot"),
            );
        };

        let Some(system) = BlockDevs::first_existing(&block_devs.system) else {
            return self.fail(
                "Couldn't find the system partition",
                &InstallerError::MissingBlockDevice("system"),
            );
        };

        let recovery = BlockDevs::first_existing(&block_devs.recovery)
            .or_else(|| {
                device
                    .has_flag(DeviceFlag::HasCombinedBootAndRecovery)
                    .then_some(boot)
            })
            .map(Path::to_path_buf);

        debug!("Boot partition: {}", boot.display());
        debug!("System partition: {}", system.display());

        self.state.paths.boot_block_dev = Some(boot.to_path_buf());
        self.state.paths.system_block_dev = Some(system.to_path_buf());
        self.state.paths.recovery_block_dev = recovery;
        self.state.use_fuse_exfat = device.has_flag(DeviceFlag::UseFuseExfat);

        self.output
            .display_msg(&format!("Detected {} ({})", device.name, device.id));
        self.state.device = Some(device);

        self.hook(|v, run| v.on_checked_device(run))
    }

    fn stage_get_install_type(&mut self) -> ProceedState {
        let install_type = match self.hook(|v, run| v.get_install_type(run)) {
            Ok(install_type) => install_type,
            Err(e) => return self.fail("Couldn't determine where to install", &e),
        };

        if install_type == CANCELLED {
            info!("Installation cancelled while choosing the destination");
            return ProceedState::Cancel;
        }

        let rom = match Rom::from_id(&install_type, &self.context.config().raw_root) {
            Ok(rom) => rom,
            Err(e) => return self.fail("Invalid install location", &e),
        };

        self.output.display_msg(&format!("Installing to {}", rom.id));

        self.state.paths.system_path = Some(rom.system.path.clone());
        self.state.paths.cache_path = Some(rom.cache.path.clone());
        self.state.paths.data_path = Some(rom.data.path.clone());
        self.state.copy_to_temp_image = self.state.has_block_image && !rom.system.is_image;
        self.state.rom = Some(Arc::new(rom));

        ProceedState::Continue
    }

    fn fstab(&self) -> String {
        let cache = self
            .state
            .device
            .as_ref()
            .and_then(|d| BlockDevs::first_existing(&d.block_devs.cache));
        let data = self
            .state
            .device
            .as_ref()
            .and_then(|d| BlockDevs::first_existing(&d.block_devs.data));

        [
            ("/system", self.state.paths.system_block_dev.as_deref()),
            ("/cache", cache),
            ("/data", data),
        ]
        .iter()
        .filter_map(|(mount_point, dev)| {
            dev.map(|dev| format!("{} {mount_point} ext4 rw 0 0\n", dev.display()))
        })
        .collect()
    }

    fn set_up_chroot(&mut self) -> Result<(), InstallerError> {
        let zip_target = self.in_chroot(INSTALL_ZIP_PATH);
        File::create(&zip_target)?;
        self.platform
            .bind_mount(self.context.zip_file(), &zip_target)?;
        self.ledger.push(Resource::Mount(zip_target));

        if let Some(boot) = &self.state.paths.boot_block_dev {
            let placeholder = self.context.in_chroot(boot);
            if let Some(parent) = placeholder.parent() {
                fs::create_dir_all(parent)?;
            }

            File::create(&placeholder)?;
        }

        fs::write(self.in_chroot("/etc/fstab"), self.fstab())?;

        Ok(())
    }

    fn stage_set_up_chroot(&mut self) -> ProceedState {
        if let Err(e) = self.set_up_chroot() {
            return self.fail("Couldn't prepare the chroot", &e);
        }

        self.hook(|v, run| v.on_set_up_chroot(run))
    }

    fn mount_raw_partitions(&mut self) -> Result<(), InstallerError> {
        let device = self
            .state
            .device
            .as_ref()
            .ok_or(InstallerError::Custom("No device description".to_owned()))?;
        let raw = &self.context.config().raw_root;
        let mounted = self.platform.mount_points()?;
        let block_devs = &device.block_devs;

        for (name, candidates) in [
            ("system", &block_devs.system),
            ("cache", &block_devs.cache),
            ("data", &block_devs.data),
        ] {
            let target = raw.join(name);
            if mounted.contains(&target) {
                debug!("{} is already mounted", target.display());
                continue;
            }

            let Some(dev) = BlockDevs::first_existing(candidates) else {
                warn!("No {name} partition, not mounting {}", target.display());
                continue;
            };

            fs::create_dir_all(&target)?;
            mount_first_fstype(&self.platform, dev, &target, &["ext4", "f2fs"])?;
            self.ledger.push(Resource::Mount(target));
        }

        let extsd = raw.join("extsd");
        let needs_extsd = self
            .state
            .rom
            .as_ref()
            .is_some_and(|rom| rom.lives_in(&extsd));

        if needs_extsd && !mounted.contains(&extsd) {
            let dev = BlockDevs::first_existing(&block_devs.extsd)
                .ok_or(InstallerError::MissingBlockDevice("external SD card"))?;

            fs::create_dir_all(&extsd)?;

            if self.state.use_fuse_exfat {
                let helper = &self.context.config().fuse_exfat;
                let output = &self.output;
                let status = run_command(
                    &self.platform,
                    CommandSpec::new(helper).arg(dev).arg(&extsd),
                    |_, line| output.command_output(line),
                )?;

                check_status(helper, status)?;
            } else {
                mount_first_fstype(&self.platform, dev, &extsd, &["vfat", "exfat", "ext4"])?;
            }

            self.ledger.push(Resource::Mount(extsd));
        }

        Ok(())
    }

    fn mount_rom_filesystems(&mut self) -> Result<(), InstallerError> {
        let rom = self
            .state
            .rom
            .clone()
            .ok_or(InstallerError::Custom("No destination ROM".to_owned()))?;
        let config = self.context.config();

        let system_source = if self.state.copy_to_temp_image {
            let image = self.context.temp_dir().join(TEMP_SYSTEM_IMAGE);
            if image.symlink_metadata().is_ok() {
                warn!("Removing stale image {}", image.display());
                fs::remove_file(&image)?;
            }

            self.image_mark = Some(self.ledger.mark());
            create_image(&self.platform, &image, config.system_image_size)?;
            self.ledger.push(Resource::TempFile(image.clone()));
            self.state.temp_image = Some(image.clone());

            system_image_copy(
                &self.platform,
                self.context.temp_dir(),
                &rom.system.path,
                &image,
                false,
                slot_entries(&rom),
            )?;

            image
        } else {
            rom.system.path.clone()
        };

        self.fs_mark = Some(self.ledger.mark());

        mount_dir_or_image(
            &self.platform,
            &mut self.ledger,
            &rom.cache.path,
            &self.context.in_chroot(Path::new("/cache")),
            rom.cache.is_image,
            None,
            config.cache_image_size,
        )?;

        mount_dir_or_image(
            &self.platform,
            &mut self.ledger,
            &rom.data.path,
            &self.context.in_chroot(Path::new("/data")),
            rom.data.is_image,
            None,
            config.data_image_size,
        )?;

        let loop_target = self
            .state
            .paths
            .system_block_dev
            .as_deref()
            .map(|dev| self.context.in_chroot(dev));

        mount_dir_or_image(
            &self.platform,
            &mut self.ledger,
            &system_source,
            &self.context.in_chroot(Path::new("/system")),
            self.state.copy_to_temp_image || rom.system.is_image,
            loop_target.as_deref(),
            config.system_image_size,
        )?;

        Ok(())
    }

    fn stage_mount_filesystems(&mut self) -> ProceedState {
        if self.context.flags().skips_mounting_volumes() {
            info!("Not mounting the raw partitions");
        } else if let Err(e) = self.mount_raw_partitions() {
            return self.fail("Couldn't mount the partitions", &e);
        }

        if let Err(e) = self.mount_rom_filesystems() {
            return self.fail("Couldn't mount the ROM filesystems", &e);
        }

        if let Some(device) = &self.state.device {
            mount_efs(
                &self.platform,
                &mut self.ledger,
                device,
                self.context.chroot_dir(),
            );
        }

        self.state.props.chroot = load_property_files(&[self.in_chroot("/system/build.prop")]);

        self.hook(|v, run| v.on_mounted_filesystems(run))
    }

    fn chroot_command(&self, program: &str) -> CommandSpec {
        let spec = CommandSpec::new(program)
            .root(self.context.chroot_dir())
            .env("PATH", CHROOT_PATH_ENV);

        if self.props_service.is_some() {
            spec.env(PROPERTY_WORKSPACE_ENV, PROPERTY_WORKSPACE_PATH)
        } else {
            spec
        }
    }

    fn run_real_updater(&mut self) -> Result<ScriptOutcome, InstallerError> {
        let (cmd_read, cmd_write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let (out_read, out_write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let cmd_fd = cmd_write.as_raw_fd();

        let spec = self
            .chroot_command(UPDATER_PATH)
            .arg(UPDATER_API_VERSION.to_string())
            .arg(cmd_fd.to_string())
            .arg(INSTALL_ZIP_PATH)
            .keep_fd(cmd_fd)
            .stdio(StdioMode::Redirect(out_write));

        info!("Running {spec}");
        let mut child = self.platform.spawn(&spec)?;

        // Our copies of the write ends must go for the reader to see EOF
        drop(spec);
        drop(cmd_write);

        let res = updater_fd_reader(&mut self.output, out_read, cmd_read, self.state.passthrough);
        let status = child.wait()?;
        let cancelled = res?;

        info!("Updater exited with {status}");

        if cancelled {
            Ok(ScriptOutcome::Cancelled)
        } else if status.success() {
            Ok(ScriptOutcome::Succeeded)
        } else {
            Ok(ScriptOutcome::Failed(status))
        }
    }

    fn run_debug_shell(&mut self) -> Result<ScriptOutcome, InstallerError> {
        let spec = self
            .chroot_command(SHELL_PATH)
            .arg("-i")
            .stdio(StdioMode::Inherit);

        info!("Running {spec}");
        let status = self.platform.spawn(&spec)?.wait()?;

        if status.success() {
            Ok(ScriptOutcome::Succeeded)
        } else {
            Ok(ScriptOutcome::Failed(status))
        }
    }

    fn stage_installation(&mut self) -> ProceedState {
        let ret = self.hook(|v, run| v.on_pre_install(run));
        if ret != ProceedState::Continue {
            return ret;
        }

        let props = self.hook(|v, run| v.get_properties(run));
        let res = self
            .props_service
            .as_ref()
            .map_or(Ok(()), |service| service.publish(&props));
        if let Err(e) = res {
            return self.fail("Couldn't publish the properties", &e);
        }

        let res = match self.variant.installation_mode() {
            InstallationMode::Updater => self.run_real_updater(),
            InstallationMode::DebugShell => self.run_debug_shell(),
        };

        match res {
            Ok(ScriptOutcome::Cancelled) => ProceedState::Cancel,
            Ok(ScriptOutcome::Succeeded) => self.hook(|v, run| v.on_post_install(run, true)),
            Ok(ScriptOutcome::Failed(status)) => {
                let ret = self.hook(|v, run| v.on_post_install(run, false));
                if ret == ProceedState::Cancel {
                    return ret;
                }

                self.fail("The installation script failed", &status)
            }
            Err(e) => self.fail("Couldn't run the installation script", &e),
        }
    }

    fn stage_unmount_filesystems(&mut self) -> ProceedState {
        self.state.props.cached = load_property_files(&[self.in_chroot("/system/build.prop")]);

        if let Some(mark) = self.fs_mark.take() {
            let failures = self.ledger.unwind_to(mark, &self.platform);
            if failures > 0 {
                return self.fail(
                    "Couldn't unmount the ROM filesystems",
                    &format!("{failures} resources couldn't be released"),
                );
            }
        }

        if let Some(image) = self.state.temp_image.take() {
            let Some(rom) = self.state.rom.clone() else {
                return self.fail(
                    "Couldn't copy the system image back",
                    &"No destination ROM",
                );
            };

            let res = system_image_copy(
                &self.platform,
                self.context.temp_dir(),
                &rom.system.path,
                &image,
                true,
                slot_entries(&rom),
            );
            if let Err(e) = res {
                return self.fail("Couldn't copy the system image back", &e);
            }

            if let Some(mark) = self.image_mark.take() {
                self.ledger.unwind_to(mark, &self.platform);
            }
        }

        self.hook(|v, run| v.on_unmounted_filesystems(run))
    }

    fn hand_over_boot_image(&self) -> Result<(), InstallerError> {
        let (Some(boot), Some(rom)) = (&self.state.paths.boot_block_dev, &self.state.rom) else {
            return Ok(());
        };

        let placeholder = self.context.in_chroot(boot);
        let size = match fs::metadata(&placeholder) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if size == 0 {
            info!("The installation script didn't write a boot image");
            return Ok(());
        }

        if rom.is_primary() {
            info!("Flashing the boot image to {}", boot.display());

            let mut src = File::open(&placeholder)?;
            let mut dst = OpenOptions::new().write(true).open(boot)?;
            io::copy(&mut src, &mut dst)?;
            dst.sync_all()?;
        } else if let Some(target) = &rom.boot_image {
            info!("Saving the boot image to {}", target.display());

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::copy(&placeholder, target)?;
        }

        Ok(())
    }

    fn stage_finish(&mut self) -> ProceedState {
        if let Err(e) = self.hand_over_boot_image() {
            return self.fail("Couldn't save the boot image", &e);
        }

        self.hook(|v, run| v.on_finished(run))
    }

    fn stage_cleanup(&mut self, outcome: ProceedState) {
        self.hook(|v, run| v.on_cleanup(run, outcome));

        self.props_service = None;
        self.fs_mark = None;
        self.image_mark = None;
        self.state.temp_image = None;

        let failures = self.ledger.unwind(&self.platform);
        if failures > 0 {
            warn!("{failures} resources couldn't be released");
        }

        let msg = match (outcome, &self.state.failure) {
            (ProceedState::Continue, _) => "Installation was successful".to_owned(),
            (ProceedState::Cancel, _) => "Installation was cancelled".to_owned(),
            (ProceedState::Fail, Some(reason)) => format!("Installation failed: {reason}"),
            (ProceedState::Fail, None) => "Installation failed".to_owned(),
        };

        self.output.display_msg(&msg);
    }

    #[cfg(test)]
    fn held_resources(&self) -> bool {
        !self.ledger.is_empty()
    }
}
