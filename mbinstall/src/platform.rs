//! Kernel facing primitives
//!
//! Everything that needs privileges (mounts, loop devices, device nodes,
//! process spawning with a root change) goes through the [`Platform`] trait so
//! that the installation pipeline can be exercised without touching the host.

use std::{
    ffi::OsString,
    fs, io,
    os::unix::{ffi::OsStringExt as _, fs::MetadataExt as _},
    path::{Path, PathBuf},
    process::{Child, Command},
};

use log::{debug, log_enabled, trace, Level};
use loopdev::{LoopControl, LoopDevice as RawLoopDevice};
use nix::sys::stat::{mknod, Mode, SFlag};
use sys_mount::{Mount, MountFlags, UnmountFlags};

use crate::command::{build_command, CommandSpec, RootMode};

/// A loop device bound to a backing file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoopDevice {
    /// Path to the loop device node
    pub path: PathBuf,

    /// Device number of the loop device
    pub rdev: u64,
}

/// Kind of device special file
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Character Device
    Char,

    /// Block Device
    Block,
}

/// Privileged operations the installer relies on
pub trait Platform {
    /// Mounts `source` on `target` with the given filesystem type
    ///
    /// # Errors
    ///
    /// If the mount syscall fails
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: Option<&str>,
    ) -> io::Result<()>;

    /// Bind mounts `source` on `target`. Both can be directories or files.
    ///
    /// # Errors
    ///
    /// If the mount syscall fails
    fn bind_mount(&self, source: &Path, target: &Path) -> io::Result<()>;

    /// Unmounts whatever is mounted on `target`
    ///
    /// # Errors
    ///
    /// If the umount syscall fails
    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Lists the current mount points, in mount order
    ///
    /// # Errors
    ///
    /// If the mount table can't be read
    fn mount_points(&self) -> io::Result<Vec<PathBuf>>;

    /// Associates a free loop device with `image`
    ///
    /// # Errors
    ///
    /// If no loop device is available or the association fails
    fn attach_loop(&self, image: &Path, read_only: bool) -> io::Result<LoopDevice>;

    /// Disassociates a loop device from its backing file
    ///
    /// # Errors
    ///
    /// If the loop device can't be opened or detached
    fn detach_loop(&self, device: &Path) -> io::Result<()>;

    /// Creates a device special file
    ///
    /// # Errors
    ///
    /// If the node can't be created
    fn make_node(&self, path: &Path, kind: NodeKind, mode: u32, rdev: u64) -> io::Result<()>;

    /// Creates an ext4 filesystem inside an image file
    ///
    /// # Errors
    ///
    /// If the formatting tool can't be run or fails
    fn format_ext4(&self, image: &Path) -> io::Result<()>;

    /// Starts a process. If the command has a root directory, the process
    /// runs with that directory as its root.
    ///
    /// # Errors
    ///
    /// If the process can't be launched
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Child>;
}

fn unescape_mount_path(raw: &str) -> PathBuf {
    let mut out = Vec::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut idx = 0;

    while idx < bytes.len() {
        if bytes[idx] == b'\\' {
            let val = bytes
                .get(idx + 1..idx + 4)
                .filter(|oct| oct.iter().all(|b| (b'0'..=b'7').contains(b)))
                .map(|oct| oct.iter().fold(0_u32, |acc, b| acc * 8 + u32::from(b - b'0')))
                .and_then(|val| u8::try_from(val).ok());

            if let Some(val) = val {
                out.push(val);
                idx += 4;
                continue;
            }
        }

        out.push(bytes[idx]);
        idx += 1;
    }

    PathBuf::from(OsString::from_vec(out))
}

pub(crate) fn parse_mount_table(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .collect()
}

/// The running system
#[derive(Debug, Default)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: Option<&str>,
    ) -> io::Result<()> {
        debug!(
            "Mounting {} ({fstype}) on {}",
            source.display(),
            target.display()
        );

        let mut builder = Mount::builder().fstype(fstype).flags(flags);
        if let Some(data) = data {
            builder = builder.data(data);
        }

        let _mount: Mount = builder.mount(source, target)?;

        trace!("Mount Successful");
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> io::Result<()> {
        debug!("Bind mounting {} on {}", source.display(), target.display());

        let _mount: Mount = Mount::builder()
            .fstype("none")
            .flags(MountFlags::BIND)
            .mount(source, target)?;

        trace!("Bind Mount Successful");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        debug!("Unmounting {}", target.display());

        sys_mount::unmount(target, UnmountFlags::DETACH)
    }

    fn mount_points(&self) -> io::Result<Vec<PathBuf>> {
        let content = fs::read_to_string("/proc/self/mounts")?;

        Ok(parse_mount_table(&content))
    }

    fn attach_loop(&self, image: &Path, read_only: bool) -> io::Result<LoopDevice> {
        let ctrl = LoopControl::open()?;
        let loop_device = ctrl.next_free()?;

        let path = loop_device.path().ok_or(io::Error::new(
            io::ErrorKind::NotFound,
            "Loop Device File Not Found",
        ))?;

        if log_enabled!(Level::Debug) {
            debug!("Using loop device {} for {}", path.display(), image.display());
        }

        loop_device
            .with()
            .read_only(read_only)
            .attach(image)?;

        debug!("Attached the loop device to our file");

        let rdev = fs::metadata(&path)?.rdev();
        Ok(LoopDevice { path, rdev })
    }

    fn detach_loop(&self, device: &Path) -> io::Result<()> {
        debug!("Detaching loop device {}", device.display());

        RawLoopDevice::open(device)?.detach()
    }

    fn make_node(&self, path: &Path, kind: NodeKind, mode: u32, rdev: u64) -> io::Result<()> {
        let (kind, name) = match kind {
            NodeKind::Char => (SFlag::S_IFCHR, "character"),
            NodeKind::Block => (SFlag::S_IFBLK, "block"),
        };

        debug!("Creating {name} device node {} ({rdev:#x})", path.display());

        mknod(path, kind, Mode::from_bits_truncate(mode), rdev)?;
        Ok(())
    }

    fn format_ext4(&self, image: &Path) -> io::Result<()> {
        debug!("Creating ext4 filesystem in {}", image.display());

        let output = Command::new("mke2fs")
            .args(["-F", "-q", "-t", "ext4"])
            .arg(image.as_os_str())
            .output()?;

        if !output.status.success() {
            return Err(io::Error::other(format!(
                "mke2fs failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }

    fn spawn(&self, spec: &CommandSpec) -> io::Result<Child> {
        debug!("Spawning {spec}");

        build_command(spec, RootMode::Chroot)?.spawn()
    }
}
