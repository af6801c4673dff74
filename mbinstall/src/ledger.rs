//! Bookkeeping of everything an installation acquires on the host

use core::fmt;
use std::{fs, io, path::PathBuf};

use log::{debug, error};

use crate::{chroot::destroy_chroot, platform::Platform};

/// A host side effect that has to be undone
#[derive(Debug)]
pub(crate) enum Resource {
    /// The chroot directory and everything below it
    Chroot(PathBuf),

    /// A mount point
    Mount(PathBuf),

    /// A loop device attached to a file
    LoopDevice(PathBuf),

    /// A device special file we created
    DeviceNode(PathBuf),

    /// A scratch file, usually a filesystem image
    TempFile(PathBuf),

    /// The file backing the legacy property area
    PropertyWorkspace(PathBuf),
}

impl Resource {
    fn release(&self, platform: &dyn Platform) -> io::Result<()> {
        match self {
            Self::Chroot(path) => {
                if destroy_chroot(platform, path) {
                    Ok(())
                } else {
                    Err(io::Error::other("Chroot couldn't be fully removed"))
                }
            }
            Self::Mount(path) => platform.unmount(path),
            Self::LoopDevice(path) => platform.detach_loop(path),
            Self::DeviceNode(path) | Self::TempFile(path) | Self::PropertyWorkspace(path) => {
                match fs::remove_file(path) {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    res => res,
                }
            }
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chroot(path) => write!(f, "chroot {}", path.display()),
            Self::Mount(path) => write!(f, "mount point {}", path.display()),
            Self::LoopDevice(path) => write!(f, "loop device {}", path.display()),
            Self::DeviceNode(path) => write!(f, "device node {}", path.display()),
            Self::TempFile(path) => write!(f, "temporary file {}", path.display()),
            Self::PropertyWorkspace(path) => write!(f, "property area {}", path.display()),
        }
    }
}

/// Resources acquired so far, released in the reverse order
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    entries: Vec<Resource>,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, resource: Resource) {
        debug!("Acquired {resource}");
        self.entries.push(resource);
    }

    /// Returns a checkpoint to later unwind to
    pub(crate) fn mark(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases everything acquired after `mark`, most recent first. Releases
    /// that fail are logged and the resource is dropped from the ledger
    /// anyway. Returns how many releases failed.
    pub(crate) fn unwind_to(&mut self, mark: usize, platform: &dyn Platform) -> usize {
        let mut failures = 0;

        while self.entries.len() > mark {
            let Some(resource) = self.entries.pop() else {
                break;
            };

            match resource.release(platform) {
                Ok(()) => debug!("Released {resource}"),
                Err(e) => {
                    error!("Couldn't release {resource}: {e}");
                    failures += 1;
                }
            }
        }

        failures
    }

    /// Releases everything
    pub(crate) fn unwind(&mut self, platform: &dyn Platform) -> usize {
        self.unwind_to(0, platform)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use sys_mount::MountFlags;
    use tempfile::TempDir;
    use test_log::test;

    use super::{Ledger, Resource};
    use crate::platform::{
        fake::{Event, FakePlatform},
        Platform as _,
    };

    #[test]
    fn unwinds_in_reverse() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("a/b");
        fs::create_dir_all(&b).unwrap();

        let platform = FakePlatform::new();
        let mut ledger = Ledger::new();

        platform.bind_mount(dir.path(), &a).unwrap();
        ledger.push(Resource::Mount(a.clone()));
        platform
            .mount(&a, &b, "tmpfs", MountFlags::empty(), None)
            .unwrap();
        ledger.push(Resource::Mount(b.clone()));

        assert_eq!(ledger.unwind(&platform), 0);
        assert!(ledger.is_empty());
        assert!(platform.is_clean());

        let unmounts: Vec<_> = platform
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Unmount(_)))
            .collect();
        assert_eq!(unmounts, vec![Event::Unmount(b), Event::Unmount(a)]);
    }

    #[test]
    fn unwind_to_checkpoint() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("kept");
        let scratch = dir.path().join("scratch");
        fs::write(&kept, b"").unwrap();
        fs::write(&scratch, b"").unwrap();

        let platform = FakePlatform::new();
        let mut ledger = Ledger::new();

        ledger.push(Resource::TempFile(kept.clone()));
        let mark = ledger.mark();
        ledger.push(Resource::TempFile(scratch.clone()));

        assert_eq!(ledger.unwind_to(mark, &platform), 0);
        assert!(kept.exists());
        assert!(!scratch.exists());
        assert_eq!(ledger.mark(), mark);

        ledger.unwind(&platform);
        assert!(!kept.exists());
    }

    #[test]
    fn failures_dont_stop_unwinding() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();

        let platform = FakePlatform::new();
        let mut ledger = Ledger::new();

        ledger.push(Resource::TempFile(file.clone()));
        ledger.push(Resource::Mount(dir.path().join("never-mounted")));
        ledger.push(Resource::LoopDevice("/dev/block/loop42".into()));

        assert_eq!(ledger.unwind(&platform), 2);
        assert!(ledger.is_empty());
        assert!(!file.exists());
    }
}
