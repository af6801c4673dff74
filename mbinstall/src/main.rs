#![allow(clippy::multiple_crate_versions)]
#![allow(unused_crate_dependencies)]
#![doc = include_str!("../../README.md")]

use std::{
    io,
    os::fd::{FromRawFd as _, OwnedFd, RawFd},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{bail, Context as _};
use clap::{Parser, ValueEnum as _};
use log::info;
use mbinstall::{
    DebugShellInstall, InstallContext, InstallVariant, Installer, InstallerConfig, InstallerFlags,
    Interface, Output, ProceedState, StandardInstall, UPDATER_API_VERSION,
};
use nix::fcntl::{fcntl, FcntlArg};

// Recoveries start update binaries with the updater API version in place of
// the interface name
fn parse_interface(arg: &str) -> Result<Interface, String> {
    if let Ok(version) = arg.parse::<u32>() {
        if version != UPDATER_API_VERSION {
            return Err(format!(
                "Unsupported updater API version {version}, expected {UPDATER_API_VERSION}"
            ));
        }

        return Ok(Interface::Recovery);
    }

    Interface::from_str(arg, true)
}

#[derive(Parser)]
#[command(version, about = "Multiboot ROM Installer")]
struct Cli {
    #[arg(value_parser = parse_interface, help = "Output Interface (stdout, recovery or updater API version)")]
    interface: Interface,

    #[arg(help = "Output File Descriptor")]
    fd: RawFd,

    #[arg(help = "ROM Package")]
    zip: PathBuf,

    #[arg(long, default_value = "/chroot", help = "Installation Environment Root")]
    chroot_dir: PathBuf,

    #[arg(long, default_value = "/tmp", help = "Scratch Directory")]
    temp_dir: PathBuf,

    #[arg(long, help = "Don't mount the raw partitions")]
    skip_mount: bool,

    #[arg(long, help = "Start a shell instead of the installation script")]
    debug_shell: bool,

    #[arg(short, long, help = "Configuration File")]
    config: Option<PathBuf>,
}

fn open_output(interface: Interface, fd: RawFd) -> Result<Output, anyhow::Error> {
    match interface {
        Interface::Stdout => Ok(Output::new(interface, io::stdout())),
        Interface::Recovery => {
            fcntl(fd, FcntlArg::F_GETFD)
                .with_context(|| format!("Invalid output file descriptor {fd}"))?;

            // SAFETY: The recovery hands this descriptor over to us, nothing
            // else in this process uses it and we just checked it's open.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };

            Ok(Output::from_fd(interface, fd))
        }
    }
}

fn install<V: InstallVariant>(
    context: InstallContext,
    output: Output,
    variant: V,
) -> Result<ProceedState, anyhow::Error> {
    let mut installer = Installer::new(context, output, variant);

    Ok(installer.start_installation()?)
}

fn main() -> Result<ExitCode, anyhow::Error> {
    env_logger::init();

    let cli = Cli::parse();

    info!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    info!("Using the {} interface", cli.interface);

    if !cli.zip.is_file() {
        bail!("Package {} doesn't exist", cli.zip.display());
    }

    let config =
        InstallerConfig::load(cli.config.as_deref()).context("Couldn't load the configuration")?;
    let output = open_output(cli.interface, cli.fd)?;

    let context = InstallContext::builder(&cli.zip)
        .chroot_dir(&cli.chroot_dir)
        .temp_dir(&cli.temp_dir)
        .interface(cli.interface)
        .flags(InstallerFlags::new().skip_mounting_volumes(cli.skip_mount))
        .config(config)
        .build();

    let outcome = if cli.debug_shell {
        install(context, output, DebugShellInstall::new(StandardInstall))?
    } else {
        install(context, output, StandardInstall)?
    };

    info!("Installation finished: {outcome}");

    Ok(match outcome {
        ProceedState::Continue => ExitCode::SUCCESS,
        ProceedState::Fail => ExitCode::FAILURE,
        ProceedState::Cancel => ExitCode::from(2),
    })
}
