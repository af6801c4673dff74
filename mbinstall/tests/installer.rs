#![allow(missing_docs)]
#![allow(unused_crate_dependencies)]

use std::{fs, path::PathBuf};

use mbinstall::{
    run_command, CommandSpec, HostPlatform, InstallContext, Installer, InstallerConfig,
    InstallerError, Interface, Output, ProceedState, Rom, StandardInstall, Stream,
    UpdaterCommand, UPDATER_API_VERSION,
};
use tempfile::{NamedTempFile, TempDir};
use test_log::test;

#[test]
fn unreadable_package_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let output = NamedTempFile::new().unwrap();

    let context = InstallContext::builder(dir.path().join("missing.zip"))
        .chroot_dir(dir.path().join("chroot"))
        .temp_dir(dir.path())
        .interface(Interface::Stdout)
        .build();

    let mut installer = Installer::new(
        context,
        Output::new(Interface::Stdout, output.reopen().unwrap()),
        StandardInstall,
    );

    assert_eq!(installer.start_installation().unwrap(), ProceedState::Fail);
    assert!(matches!(
        installer.start_installation(),
        Err(InstallerError::AlreadyStarted)
    ));

    assert!(!dir.path().join("chroot").exists());
    assert_eq!(
        fs::read_to_string(output.path()).unwrap(),
        "Installation failed: Couldn't open the package\n"
    );
}

#[test]
fn host_commands() {
    let mut lines = Vec::new();

    let status = run_command(
        &HostPlatform,
        CommandSpec::new("/bin/sh").args(["-c", "echo out; echo err >&2; exit 3"]),
        |stream, line| lines.push((stream, line.to_owned())),
    )
    .unwrap();

    assert_eq!(status.code(), Some(3));
    assert!(lines.contains(&(Stream::Stdout, "out".to_owned())));
    assert!(lines.contains(&(Stream::Stderr, "err".to_owned())));
}

#[test]
fn config_defaults_and_overrides() {
    let config = InstallerConfig::from_toml("raw_root = \"/mnt/raw\"\n").unwrap();
    assert_eq!(config.raw_root, PathBuf::from("/mnt/raw"));
    assert_eq!(config.busybox, PathBuf::from("/sbin/busybox"));

    let rom = Rom::from_id("secondary", &config.raw_root).unwrap();
    assert!(rom.lives_in(&config.raw_root.join("system")));
}

#[test]
fn updater_protocol() {
    assert_eq!(
        UpdaterCommand::parse("ui_print Flashing boot"),
        UpdaterCommand::UiPrint("Flashing boot")
    );
    assert_eq!(
        UpdaterCommand::parse("progress 0.1 5"),
        UpdaterCommand::Progress {
            fraction: 0.1,
            seconds: 5
        }
    );
    assert_eq!(UpdaterCommand::parse("cancelled"), UpdaterCommand::Cancelled);
    assert_eq!(UPDATER_API_VERSION, 3);
}
