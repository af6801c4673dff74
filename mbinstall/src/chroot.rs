//! Creation and teardown of the isolated root the installation scripts run in

use std::{
    ffi::CStr,
    fs, io,
    os::unix::fs::{symlink, PermissionsExt as _},
    path::{Path, PathBuf},
};

use log::{debug, error, info, warn};
use nix::{
    sys::stat::makedev,
    unistd::{chdir, chroot},
};
use sys_mount::MountFlags;
use types::InstallerError;

use crate::{
    command::{check_status, run_command, CommandSpec, Stream},
    ledger::{Ledger, Resource},
    platform::{NodeKind, Platform},
};

const DIRECTORIES: &[&str] = &[
    "cache", "data", "dev", "efs", "etc", "mb", "proc", "sbin", "storage", "sys", "system", "tmp",
];

const DEVICE_NODES: &[(&str, NodeKind, u64, u64)] = &[
    ("null", NodeKind::Char, 1, 3),
    ("zero", NodeKind::Char, 1, 5),
    ("random", NodeKind::Char, 1, 8),
    ("urandom", NodeKind::Char, 1, 9),
    ("tty", NodeKind::Char, 5, 0),
    ("console", NodeKind::Char, 5, 1),
    ("loop-control", NodeKind::Char, 10, 237),
];

const HOST_SELINUXFS: &str = "/sys/fs/selinux";

const GETPROP_SHIM: &str = r#"#!/sbin/sh
props=/dev/__properties__

if [ "$#" -eq 0 ]; then
    while IFS='=' read -r key value; do
        echo "[$key]: [$value]"
    done < "$props"
    exit 0
fi

while IFS='=' read -r key value; do
    if [ "$key" = "$1" ]; then
        echo "$value"
        exit 0
    fi
done < "$props"

echo "$2"
"#;

/// Returns where a path of the chroot lives on the host
pub(crate) fn in_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

/// Makes the calling process use `root` as its root directory
///
/// # Errors
///
/// If either the chroot or chdir system calls fail
pub(crate) fn change_root(root: &CStr) -> io::Result<()> {
    chroot(root)?;
    chdir("/")?;

    Ok(())
}

fn mount_pseudo(
    platform: &dyn Platform,
    ledger: &mut Ledger,
    fstype: &str,
    target: &Path,
    data: Option<&str>,
) -> Result<(), InstallerError> {
    fs::create_dir_all(target)?;
    platform.mount(
        Path::new(fstype),
        target,
        fstype,
        MountFlags::NOSUID | MountFlags::NODEV,
        data,
    )?;
    ledger.push(Resource::Mount(target.to_path_buf()));

    Ok(())
}

/// Builds the chroot skeleton: a tmpfs root with the usual directories, a
/// minimal /dev, the kernel pseudo filesystems and the configured host
/// directories bound in.
///
/// # Errors
///
/// If any directory, node or mount can't be created. Whatever was set up
/// before the failure is in the ledger.
pub(crate) fn create_chroot(
    platform: &dyn Platform,
    ledger: &mut Ledger,
    root: &Path,
    host_binds: &[PathBuf],
) -> Result<(), InstallerError> {
    if root.exists() {
        warn!("{} already exists, removing it", root.display());

        if !destroy_chroot(platform, root) {
            return Err(InstallerError::Custom(format!(
                "Couldn't remove stale chroot {}",
                root.display()
            )));
        }
    }

    fs::create_dir_all(root)?;
    ledger.push(Resource::Chroot(root.to_path_buf()));

    platform.mount(
        Path::new("tmpfs"),
        root,
        "tmpfs",
        MountFlags::empty(),
        Some("mode=0755"),
    )?;
    ledger.push(Resource::Mount(root.to_path_buf()));

    for dir in DIRECTORIES {
        fs::create_dir_all(root.join(dir))?;
    }

    let dev = root.join("dev");
    platform.mount(
        Path::new("tmpfs"),
        &dev,
        "tmpfs",
        MountFlags::NOSUID,
        Some("mode=0755"),
    )?;
    ledger.push(Resource::Mount(dev.clone()));

    fs::create_dir_all(dev.join("block"))?;

    for (name, kind, major, minor) in DEVICE_NODES {
        let path = dev.join(name);

        platform.make_node(&path, *kind, 0o666, makedev(*major, *minor))?;
        ledger.push(Resource::DeviceNode(path));
    }

    mount_pseudo(platform, ledger, "devpts", &dev.join("pts"), None)?;
    mount_pseudo(platform, ledger, "proc", &root.join("proc"), None)?;
    mount_pseudo(platform, ledger, "sysfs", &root.join("sys"), None)?;

    if Path::new(HOST_SELINUXFS).exists() {
        mount_pseudo(
            platform,
            ledger,
            "selinuxfs",
            &in_root(root, Path::new(HOST_SELINUXFS)),
            None,
        )?;
    }

    for host in host_binds {
        if !host.exists() {
            debug!("{} doesn't exist on the host, not binding it", host.display());
            continue;
        }

        let target = in_root(root, host);
        if host.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::File::create(&target)?;
        }

        platform.bind_mount(host, &target)?;
        ledger.push(Resource::Mount(target));
    }

    info!("Created chroot in {}", root.display());
    Ok(())
}

/// Unmounts anything left below `root`, deepest first, then removes it
///
/// Never fails, every problem is logged. Returns whether the directory is
/// gone. The directory is left alone when something is still mounted below
/// it, so that a failed unmount never leads to deleting the content of a
/// partition.
pub(crate) fn destroy_chroot(platform: &dyn Platform, root: &Path) -> bool {
    match platform.mount_points() {
        Ok(points) => {
            for point in points.iter().rev().filter(|p| p.starts_with(root)) {
                if let Err(e) = platform.unmount(point) {
                    error!("Couldn't unmount {}: {e}", point.display());
                }
            }
        }
        Err(e) => {
            error!("Couldn't list mount points: {e}");
            return false;
        }
    }

    match platform.mount_points() {
        Ok(points) => {
            if let Some(busy) = points.iter().find(|p| p.starts_with(root)) {
                error!(
                    "{} is still mounted, not removing {}",
                    busy.display(),
                    root.display()
                );
                return false;
            }
        }
        Err(e) => {
            error!("Couldn't list mount points: {e}");
            return false;
        }
    }

    match fs::remove_dir_all(root) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            error!("Couldn't remove {}: {e}", root.display());
            false
        }
    }
}

/// Installs busybox into the chroot `/sbin`, along with a symlink for each
/// applet it provides and a getprop replacement reading the legacy property
/// area.
///
/// # Errors
///
/// If busybox can't be copied or run, or the links can't be created
pub(crate) fn set_up_busybox_wrapper(
    platform: &dyn Platform,
    root: &Path,
    busybox: &Path,
) -> Result<(), InstallerError> {
    let sbin = root.join("sbin");
    fs::create_dir_all(&sbin)?;

    let target = sbin.join("busybox");
    fs::copy(busybox, &target)?;
    fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;

    let mut applets = Vec::new();
    let status = run_command(
        platform,
        CommandSpec::new(busybox).arg("--list"),
        |stream, line| match stream {
            Stream::Stdout => applets.push(line.trim().to_owned()),
            Stream::Stderr => debug!("busybox: {line}"),
        },
    )?;
    check_status(busybox, status)?;

    let mut count = 0;
    for applet in applets
        .iter()
        .filter(|a| !a.is_empty() && !a.contains('/') && *a != "busybox")
    {
        let link = sbin.join(applet);
        if link.symlink_metadata().is_ok() {
            continue;
        }

        symlink("busybox", &link)?;
        count += 1;
    }

    debug!("Linked {count} busybox applets");

    let getprop = sbin.join("getprop");
    if getprop.symlink_metadata().is_ok() {
        fs::remove_file(&getprop)?;
    }
    fs::write(&getprop, GETPROP_SHIM)?;
    fs::set_permissions(&getprop, fs::Permissions::from_mode(0o755))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt as _, path::Path};

    use tempfile::TempDir;
    use test_log::test;

    use super::{create_chroot, destroy_chroot, in_root, set_up_busybox_wrapper};
    use crate::{
        ledger::Ledger,
        platform::{fake::FakePlatform, Platform as _},
    };

    #[test]
    fn chroot_path_mapping() {
        let root = Path::new("/tmp/mb");

        assert_eq!(
            in_root(root, Path::new("/dev/block/mmcblk0p1")),
            Path::new("/tmp/mb/dev/block/mmcblk0p1")
        );
        assert_eq!(in_root(root, Path::new("system")), Path::new("/tmp/mb/system"));
    }

    #[test]
    fn create_and_destroy() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("chroot");
        let host_file = dir.path().join("host.txt");
        fs::write(&host_file, b"hello").unwrap();

        let platform = FakePlatform::new();
        let mut ledger = Ledger::new();

        create_chroot(&platform, &mut ledger, &root, &[host_file.clone()]).unwrap();

        for dir in ["dev/block", "mb", "sbin", "system", "tmp"] {
            assert!(root.join(dir).is_dir(), "{dir} is missing");
        }
        assert!(root.join("dev/null").exists(), "dev/null is missing");
        assert!(in_root(&root, &host_file).exists(), "host bind is missing");

        let points = platform.mount_points().unwrap();
        assert!(points.contains(&root.join("proc")));
        assert!(points.contains(&root.join("dev/pts")));

        assert_eq!(ledger.unwind(&platform), 0);
        assert!(platform.is_clean());
        assert!(!root.exists());
    }

    #[test]
    fn destroy_missing_chroot() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();

        assert!(destroy_chroot(&platform, &dir.path().join("nope")));
    }

    #[test]
    fn stale_chroot_is_replaced() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("chroot");
        fs::create_dir_all(root.join("leftover")).unwrap();

        let platform = FakePlatform::new();
        let mut ledger = Ledger::new();

        create_chroot(&platform, &mut ledger, &root, &[]).unwrap();
        assert!(!root.join("leftover").exists());

        ledger.unwind(&platform);
    }

    #[test]
    fn busybox_applets_are_linked() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let busybox = dir.path().join("busybox");
        fs::write(
            &busybox,
            "#!/bin/sh\nif [ \"$1\" = \"--list\" ]; then\n  echo sh\n  echo ls\n  echo busybox\nfi\n",
        )
        .unwrap();
        fs::set_permissions(&busybox, fs::Permissions::from_mode(0o755)).unwrap();

        let platform = FakePlatform::new();
        set_up_busybox_wrapper(&platform, &root, &busybox).unwrap();

        let sh = root.join("sbin/sh");
        assert_eq!(fs::read_link(&sh).unwrap(), Path::new("busybox"));
        assert!(root.join("sbin/ls").symlink_metadata().is_ok());
        assert!(root.join("sbin/busybox").is_file());
        assert!(!root.join("sbin/busybox").is_symlink());
        assert!(fs::read_to_string(root.join("sbin/getprop"))
            .unwrap()
            .contains("__properties__"));
    }
}
