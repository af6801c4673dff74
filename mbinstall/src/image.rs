//! Filesystem images, loop devices and the ROM partitions mounts

use std::{
    fs::{self, File},
    io,
    os::unix::fs::{lchown, symlink, MetadataExt as _},
    path::Path,
};

use log::{debug, info, warn};
use sys_mount::MountFlags;
use tempfile::Builder;
use types::{BlockDevs, Device, InstallerError};
use walkdir::WalkDir;

use crate::{
    ledger::{Ledger, Resource},
    platform::{NodeKind, Platform},
};

/// Top level entries of an ext4 filesystem that never hold ROM content
const FILESYSTEM_ENTRIES: &[&str] = &["lost+found"];

/// Removes everything inside `dir` but the top level entries named in `keep`,
/// creating it if needed
pub(crate) fn clear_dir(dir: &Path, keep: &[&str]) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if keep.iter().any(|k| entry.file_name() == *k) {
            debug!("Keeping {}", entry.path().display());
            continue;
        }

        let path = entry.path();

        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

/// Copies the content of `src` into `dst`, preserving permissions, ownership
/// and symlinks. Top level entries named in `skip` are ignored. Special files
/// are ignored as well.
pub(crate) fn copy_tree(src: &Path, dst: &Path, skip: &[&str]) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    let mut dirs = Vec::new();
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() != 1 || !skip.iter().any(|s| e.file_name() == *s)
        });

    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            dirs.push((target.clone(), meta.permissions()));
        } else if file_type.is_symlink() {
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }

            symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            debug!("Skipping special file {}", entry.path().display());
            continue;
        }

        lchown(&target, Some(meta.uid()), Some(meta.gid()))?;
    }

    // Read-only directories would prevent populating them
    for (dir, perms) in dirs.into_iter().rev() {
        fs::set_permissions(dir, perms)?;
    }

    Ok(())
}

/// Creates a sparse ext4 image file of `size` bytes
///
/// # Errors
///
/// If the file already exists, if there isn't enough room for it in its
/// directory, or if it can't be formatted. A half created image is removed.
pub(crate) fn create_image(
    platform: &dyn Platform,
    path: &Path,
    size: u64,
) -> Result<(), InstallerError> {
    let dir = path.parent().unwrap_or(Path::new("/"));
    fs::create_dir_all(dir)?;

    let available = fs2::available_space(dir)?;
    if available < size {
        return Err(InstallerError::Custom(format!(
            "Not enough space in {} for a {size} bytes image ({available} available)",
            dir.display()
        )));
    }

    debug!("Creating {size} bytes image {}", path.display());

    let file = File::create_new(path)?;
    let res = file
        .set_len(size)
        .and_then(|()| file.sync_all())
        .and_then(|()| platform.format_ext4(path));

    if let Err(e) = res {
        drop(file);

        if let Err(rm) = fs::remove_file(path) {
            warn!("Couldn't remove {}: {rm}", path.display());
        }

        return Err(e.into());
    }

    Ok(())
}

/// Makes `source` available at `mount_point`
///
/// Directories are bind mounted. Images are created if needed, attached to a
/// loop device and mounted. For images, `loop_target` (when given) is
/// replaced by a block device node for the loop device so that the scripts
/// writing to the partition end up writing to the image.
///
/// # Errors
///
/// If any step fails. What was set up before the failure is in the ledger.
pub(crate) fn mount_dir_or_image(
    platform: &dyn Platform,
    ledger: &mut Ledger,
    source: &Path,
    mount_point: &Path,
    is_image: bool,
    loop_target: Option<&Path>,
    image_size: u64,
) -> Result<(), InstallerError> {
    fs::create_dir_all(mount_point)?;

    if !is_image {
        fs::create_dir_all(source)?;

        platform.bind_mount(source, mount_point)?;
        ledger.push(Resource::Mount(mount_point.to_path_buf()));

        return Ok(());
    }

    if !source.exists() {
        info!("Creating image {}", source.display());
        create_image(platform, source, image_size)?;
    }

    let loop_device = platform.attach_loop(source, false)?;
    ledger.push(Resource::LoopDevice(loop_device.path.clone()));

    platform.mount(
        &loop_device.path,
        mount_point,
        "ext4",
        MountFlags::empty(),
        None,
    )?;
    ledger.push(Resource::Mount(mount_point.to_path_buf()));

    if let Some(target) = loop_target {
        if target.symlink_metadata().is_ok() {
            fs::remove_file(target)?;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        platform.make_node(target, NodeKind::Block, 0o644, loop_device.rdev)?;
        ledger.push(Resource::DeviceNode(target.to_path_buf()));
    }

    Ok(())
}

/// Mounts a block device, trying each filesystem type in turn
///
/// # Errors
///
/// The error of the last attempt if none of them worked
pub(crate) fn mount_first_fstype(
    platform: &dyn Platform,
    device: &Path,
    target: &Path,
    fstypes: &[&str],
) -> io::Result<()> {
    let mut last = io::Error::new(io::ErrorKind::InvalidInput, "No filesystem type to try");

    for fstype in fstypes {
        match platform.mount(device, target, fstype, MountFlags::empty(), None) {
            Ok(()) => {
                debug!("Mounted {} on {} as {fstype}", device.display(), target.display());
                return Ok(());
            }
            Err(e) => {
                debug!("Mounting {} as {fstype} failed: {e}", device.display());
                last = e;
            }
        }
    }

    Err(last)
}

fn copy_through_image(
    platform: &dyn Platform,
    ledger: &mut Ledger,
    mount_point: &Path,
    dir: &Path,
    image: &Path,
    reverse: bool,
    skip: &[&str],
) -> Result<(), InstallerError> {
    let loop_device = platform.attach_loop(image, reverse)?;
    ledger.push(Resource::LoopDevice(loop_device.path.clone()));

    let flags = if reverse {
        MountFlags::RDONLY
    } else {
        MountFlags::empty()
    };

    platform.mount(&loop_device.path, mount_point, "ext4", flags, None)?;
    ledger.push(Resource::Mount(mount_point.to_path_buf()));

    if reverse {
        let image_skip: Vec<&str> = FILESYSTEM_ENTRIES.iter().chain(skip).copied().collect();

        clear_dir(dir, skip)?;
        copy_tree(mount_point, dir, &image_skip)?;
    } else {
        copy_tree(dir, mount_point, skip)?;
    }

    Ok(())
}

/// Copies a directory into an image, or back when `reverse` is set. In the
/// reverse direction the directory content is replaced by the image content.
/// Top level entries of `dir` named in `skip` are left alone both ways.
///
/// # Errors
///
/// If the image can't be mounted or the copy fails. The scratch mount is
/// always released, and its directory is left behind if that fails.
pub(crate) fn system_image_copy(
    platform: &dyn Platform,
    scratch_parent: &Path,
    dir: &Path,
    image: &Path,
    reverse: bool,
    skip: &[&str],
) -> Result<(), InstallerError> {
    if reverse {
        info!("Copying {} back to {}", image.display(), dir.display());
    } else {
        info!("Copying {} to {}", dir.display(), image.display());
        fs::create_dir_all(dir)?;
    }

    let scratch = Builder::new()
        .prefix("image-copy.")
        .tempdir_in(scratch_parent)?;

    let mut ledger = Ledger::new();
    let res = copy_through_image(
        platform,
        &mut ledger,
        scratch.path(),
        dir,
        image,
        reverse,
        skip,
    );

    if ledger.unwind(platform) > 0 {
        let leftover = scratch.into_path();
        warn!(
            "Leaving {} behind, {} might still be mounted there",
            leftover.display(),
            image.display()
        );

        if res.is_ok() {
            return Err(InstallerError::Custom(format!(
                "Couldn't release {}",
                image.display()
            )));
        }
    }

    res
}

/// Mounts the EFS partition read-only in the chroot, if the device has one
///
/// Missing partitions or mount failures are logged, and reported by returning
/// false.
pub(crate) fn mount_efs(
    platform: &dyn Platform,
    ledger: &mut Ledger,
    device: &Device,
    root: &Path,
) -> bool {
    let Some(efs) = BlockDevs::first_existing(&device.block_devs.efs) else {
        debug!("No EFS partition on {}", device.id);
        return false;
    };

    let target = root.join("efs");
    let res = fs::create_dir_all(&target).and_then(|()| {
        platform.mount(efs, &target, "ext4", MountFlags::RDONLY, None)
    });

    match res {
        Ok(()) => {
            ledger.push(Resource::Mount(target));
            true
        }
        Err(e) => {
            warn!("Couldn't mount EFS partition {}: {e}", efs.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        os::unix::fs::{symlink, PermissionsExt as _},
        path::Path,
    };

    use tempfile::TempDir;
    use test_log::test;
    use types::{Device, InstallerError};

    use super::{
        copy_tree, create_image, mount_dir_or_image, mount_efs, mount_first_fstype,
        system_image_copy,
    };
    use crate::{
        ledger::Ledger,
        platform::fake::{sidecar, Event, FakePlatform},
    };

    const IMAGE_SIZE: u64 = 4 * 1024 * 1024;

    #[test]
    fn copy_tree_preserves_layout() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        fs::create_dir_all(src.join("bin")).unwrap();
        fs::create_dir_all(src.join("lost+found")).unwrap();
        fs::write(src.join("bin/app"), b"binary").unwrap();
        fs::set_permissions(src.join("bin/app"), fs::Permissions::from_mode(0o750)).unwrap();
        symlink("bin/app", src.join("link")).unwrap();

        copy_tree(&src, &dst, &["lost+found"]).unwrap();

        assert_eq!(fs::read(dst.join("bin/app")).unwrap(), b"binary");
        assert_eq!(
            fs::metadata(dst.join("bin/app")).unwrap().permissions().mode() & 0o777,
            0o750
        );
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), Path::new("bin/app"));
        assert!(!dst.join("lost+found").exists());
    }

    #[test]
    fn image_creation() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("images/system.img");
        let platform = FakePlatform::new();

        create_image(&platform, &image, IMAGE_SIZE).unwrap();

        assert_eq!(fs::metadata(&image).unwrap().len(), IMAGE_SIZE);
        assert!(platform.events().contains(&Event::Format(image.clone())));

        // Never overwrite an existing image
        create_image(&platform, &image, IMAGE_SIZE).unwrap_err();
    }

    #[test]
    fn image_creation_needs_space() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("huge.img");
        let platform = FakePlatform::new();

        let res = create_image(&platform, &image, u64::MAX);

        assert!(matches!(res, Err(InstallerError::Custom(_))), "{res:?}");
        assert!(!image.exists());
    }

    #[test]
    fn directory_is_bind_mounted() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("rom/system");
        let mount_point = dir.path().join("chroot/system");
        let loop_target = dir.path().join("chroot/dev/block/system");

        let platform = FakePlatform::new();
        let mut ledger = Ledger::new();

        mount_dir_or_image(
            &platform,
            &mut ledger,
            &source,
            &mount_point,
            false,
            Some(&loop_target),
            IMAGE_SIZE,
        )
        .unwrap();

        assert!(source.is_dir());
        assert_eq!(
            platform.events(),
            vec![Event::Bind {
                source,
                target: mount_point
            }]
        );
        assert!(!loop_target.exists());

        ledger.unwind(&platform);
        assert!(platform.is_clean());
    }

    #[test]
    fn image_is_loop_mounted() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("rom/system.img");
        let mount_point = dir.path().join("chroot/system");
        let loop_target = dir.path().join("chroot/dev/block/system");
        fs::create_dir_all(loop_target.parent().unwrap()).unwrap();
        fs::write(&loop_target, b"").unwrap();

        let platform = FakePlatform::new();
        let mut ledger = Ledger::new();

        mount_dir_or_image(
            &platform,
            &mut ledger,
            &source,
            &mount_point,
            true,
            Some(&loop_target),
            IMAGE_SIZE,
        )
        .unwrap();

        assert_eq!(fs::metadata(&source).unwrap().len(), IMAGE_SIZE);
        let events = platform.events();
        assert!(events.iter().any(|e| matches!(e, Event::Attach { image, .. } if *image == source)));
        assert!(events.contains(&Event::Node(loop_target.clone())));

        assert_eq!(ledger.unwind(&platform), 0);
        assert!(platform.is_clean());
        assert!(!loop_target.exists());
        assert!(source.exists());
    }

    #[test]
    fn image_round_trip() {
        let dir = TempDir::new().unwrap();
        let rom = dir.path().join("rom");
        let image = dir.path().join("temp.img");
        fs::create_dir_all(rom.join("app")).unwrap();
        fs::write(rom.join("build.prop"), b"ro.build.id=OLD\n").unwrap();
        fs::write(rom.join("app/Old.apk"), b"apk").unwrap();

        let platform = FakePlatform::new();
        create_image(&platform, &image, IMAGE_SIZE).unwrap();

        system_image_copy(&platform, dir.path(), &rom, &image, false, &[]).unwrap();
        assert!(platform.is_clean());
        assert!(sidecar(&image).join("app/Old.apk").exists());

        // What a script writing to the block device would do
        let contents = sidecar(&image);
        fs::write(contents.join("build.prop"), b"ro.build.id=NEW\n").unwrap();
        fs::remove_file(contents.join("app/Old.apk")).unwrap();

        system_image_copy(&platform, dir.path(), &rom, &image, true, &[]).unwrap();
        assert!(platform.is_clean());

        assert_eq!(
            fs::read_to_string(rom.join("build.prop")).unwrap(),
            "ro.build.id=NEW\n"
        );
        assert!(!rom.join("app/Old.apk").exists());
        assert!(!rom.join("lost+found").exists());
    }

    #[test]
    fn skipped_entries_stay_out_of_the_image() {
        let dir = TempDir::new().unwrap();
        let system = dir.path().join("system");
        let image = dir.path().join("temp.img");
        let other = system.join("multiboot/secondary/system/build.prop");
        fs::create_dir_all(other.parent().unwrap()).unwrap();
        fs::write(&other, b"ro.build.id=OTHER\n").unwrap();
        fs::write(system.join("build.prop"), b"ro.build.id=OLD\n").unwrap();

        let platform = FakePlatform::new();
        create_image(&platform, &image, IMAGE_SIZE).unwrap();

        system_image_copy(&platform, dir.path(), &system, &image, false, &["multiboot"]).unwrap();
        assert!(sidecar(&image).join("build.prop").exists());
        assert!(!sidecar(&image).join("multiboot").exists());

        fs::write(sidecar(&image).join("build.prop"), b"ro.build.id=NEW\n").unwrap();

        system_image_copy(&platform, dir.path(), &system, &image, true, &["multiboot"]).unwrap();
        assert!(platform.is_clean());
        assert_eq!(
            fs::read_to_string(system.join("build.prop")).unwrap(),
            "ro.build.id=NEW\n"
        );
        assert_eq!(fs::read_to_string(&other).unwrap(), "ro.build.id=OTHER\n");
    }

    #[test]
    fn busy_scratch_mount_is_left_behind() {
        let dir = TempDir::new().unwrap();
        let system = dir.path().join("system");
        let image = dir.path().join("temp.img");
        fs::create_dir_all(&system).unwrap();
        fs::write(system.join("build.prop"), b"ro.build.id=OLD\n").unwrap();

        let platform = FakePlatform::new();
        create_image(&platform, &image, IMAGE_SIZE).unwrap();
        platform.keep_mounts_busy();

        let err = system_image_copy(&platform, dir.path(), &system, &image, false, &[])
            .unwrap_err();
        assert!(matches!(err, InstallerError::Custom(_)));

        let leftover: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("image-copy.")
            })
            .collect();
        assert_eq!(leftover.len(), 1);
        assert!(leftover[0].join("build.prop").exists());
    }

    #[test]
    fn efs_is_optional() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let mut ledger = Ledger::new();

        let device = Device::from_json(br#"{ "id": "a", "name": "A" }"#).unwrap();
        assert!(!mount_efs(&platform, &mut ledger, &device, dir.path()));
        assert!(ledger.is_empty());

        let efs = dir.path().join("efs-blk");
        fs::write(&efs, b"").unwrap();
        let json = format!(
            r#"{{ "id": "a", "name": "A", "block_devs": {{ "efs": ["{}"] }} }}"#,
            efs.display()
        );
        let device = Device::from_json(json.as_bytes()).unwrap();
        assert!(mount_efs(&platform, &mut ledger, &device, dir.path()));

        ledger.unwind(&platform);
        assert!(platform.is_clean());
    }

    #[test]
    fn first_working_fstype() {
        let dir = TempDir::new().unwrap();
        let platform = FakePlatform::new();
        let target = dir.path().join("system");
        fs::create_dir(&target).unwrap();

        mount_first_fstype(&platform, Path::new("/dev/block/sda1"), &target, &["ext4", "f2fs"])
            .unwrap();
        assert_eq!(
            platform.events(),
            [Event::Mount {
                source: Path::new("/dev/block/sda1").to_path_buf(),
                target: target.clone(),
                fstype: "ext4".to_owned(),
            }]
        );

        platform.fail_mounts_on(&target);
        mount_first_fstype(&platform, Path::new("/dev/block/sda1"), &target, &["ext4", "f2fs"])
            .unwrap_err();
        mount_first_fstype(&platform, Path::new("/dev/block/sda1"), &target, &[]).unwrap_err();
    }
}
