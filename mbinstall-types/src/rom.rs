use std::path::{Path, PathBuf};

use crate::InstallerError;

const PRIMARY_ID: &str = "primary";
const SECONDARY_ID: &str = "secondary";
const MULTI_SLOT_PREFIX: &str = "multi-slot-";
const DATA_SLOT_PREFIX: &str = "data-slot-";
const EXTSD_SLOT_PREFIX: &str = "extsd-slot-";

/// A ROM partition location, either a directory or a filesystem image
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RomPath {
    /// Location on the raw partitions
    pub path: PathBuf,

    /// Whether the location is an ext4 image rather than a directory
    pub is_image: bool,
}

impl RomPath {
    fn dir(path: PathBuf) -> Self {
        Self {
            path,
            is_image: false,
        }
    }

    fn image(path: PathBuf) -> Self {
        Self {
            path,
            is_image: true,
        }
    }
}

/// A Multiboot Slot
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rom {
    /// Slot identifier
    pub id: String,

    /// Where the ROM's /system lives
    pub system: RomPath,

    /// Where the ROM's /cache lives
    pub cache: RomPath,

    /// Where the ROM's /data lives
    pub data: RomPath,

    /// Where the ROM's kernel image is kept. The primary ROM boots straight
    /// from the boot partition and doesn't have one.
    pub boot_image: Option<PathBuf>,
}

fn is_valid_slot_suffix(suffix: &str) -> bool {
    !suffix.is_empty()
        && suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Rom {
    /// Creates the slot description for a given slot identifier, with the raw
    /// partitions mounted below `raw_root`
    ///
    /// # Errors
    ///
    /// If the identifier doesn't name a valid slot
    pub fn from_id(id: &str, raw_root: &Path) -> Result<Self, InstallerError> {
        let system = raw_root.join("system");
        let cache = raw_root.join("cache");
        let data = raw_root.join("data");
        let extsd = raw_root.join("extsd");

        let boot_image = Some(data.join("multiboot").join(id).join("boot.img"));

        if id == PRIMARY_ID {
            return Ok(Self {
                id: id.to_owned(),
                system: RomPath::dir(system),
                cache: RomPath::dir(cache),
                data: RomPath::dir(data),
                boot_image: None,
            });
        }

        if id == SECONDARY_ID {
            return Ok(Self {
                id: id.to_owned(),
                system: RomPath::dir(system.join("multiboot").join(id).join("system")),
                cache: RomPath::dir(cache.join("multiboot").join(id).join("cache")),
                data: RomPath::dir(data.join("multiboot").join(id).join("data")),
                boot_image,
            });
        }

        if let Some(suffix) = id.strip_prefix(MULTI_SLOT_PREFIX) {
            if is_valid_slot_suffix(suffix) {
                return Ok(Self {
                    id: id.to_owned(),
                    system: RomPath::dir(cache.join("multiboot").join(id).join("system")),
                    cache: RomPath::dir(cache.join("multiboot").join(id).join("cache")),
                    data: RomPath::dir(data.join("multiboot").join(id).join("data")),
                    boot_image,
                });
            }
        }

        if let Some(suffix) = id.strip_prefix(DATA_SLOT_PREFIX) {
            if is_valid_slot_suffix(suffix) {
                let base = data.join("multiboot").join(id);

                return Ok(Self {
                    id: id.to_owned(),
                    system: RomPath::image(base.join("system.img")),
                    cache: RomPath::dir(base.join("cache")),
                    data: RomPath::dir(base.join("data")),
                    boot_image,
                });
            }
        }

        if let Some(suffix) = id.strip_prefix(EXTSD_SLOT_PREFIX) {
            if is_valid_slot_suffix(suffix) {
                let base = data.join("multiboot").join(id);

                return Ok(Self {
                    id: id.to_owned(),
                    system: RomPath::image(extsd.join("multiboot").join(id).join("system.img")),
                    cache: RomPath::dir(base.join("cache")),
                    data: RomPath::dir(base.join("data")),
                    boot_image,
                });
            }
        }

        Err(InstallerError::UnknownRom(id.to_owned()))
    }

    /// Returns whether this is the ROM the device boots by default
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.id == PRIMARY_ID
    }

    /// Returns whether any part of the ROM lives below the given directory
    #[must_use]
    pub fn lives_in(&self, dir: &Path) -> bool {
        [&self.system, &self.cache, &self.data]
            .iter()
            .any(|p| p.path.starts_with(dir))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use test_log::test;

    use crate::{InstallerError, Rom};

    const RAW: &str = "/raw";

    #[test]
    fn primary() {
        let rom = Rom::from_id("primary", Path::new(RAW)).unwrap();

        assert!(rom.is_primary());
        assert_eq!(rom.system.path, Path::new("/raw/system"));
        assert!(!rom.system.is_image);
        assert_eq!(rom.boot_image, None);
    }

    #[test]
    fn secondary() {
        let rom = Rom::from_id("secondary", Path::new(RAW)).unwrap();

        assert!(!rom.is_primary());
        assert_eq!(
            rom.system.path,
            Path::new("/raw/system/multiboot/secondary/system")
        );
        assert_eq!(
            rom.data.path,
            Path::new("/raw/data/multiboot/secondary/data")
        );
        assert_eq!(
            rom.boot_image.as_deref(),
            Some(Path::new("/raw/data/multiboot/secondary/boot.img"))
        );
    }

    #[test]
    fn multi_slot() {
        let rom = Rom::from_id("multi-slot-3", Path::new(RAW)).unwrap();

        assert_eq!(
            rom.system.path,
            Path::new("/raw/cache/multiboot/multi-slot-3/system")
        );
        assert!(!rom.system.is_image);
    }

    #[test]
    fn data_slot_uses_image() {
        let rom = Rom::from_id("data-slot-lineage_15", Path::new(RAW)).unwrap();

        assert!(rom.system.is_image);
        assert_eq!(
            rom.system.path,
            Path::new("/raw/data/multiboot/data-slot-lineage_15/system.img")
        );
        assert!(!rom.cache.is_image);
    }

    #[test]
    fn extsd_slot_lives_on_sdcard() {
        let rom = Rom::from_id("extsd-slot-aosp", Path::new(RAW)).unwrap();

        assert!(rom.system.is_image);
        assert!(rom.lives_in(Path::new("/raw/extsd")));
        assert!(!Rom::from_id("primary", Path::new(RAW))
            .unwrap()
            .lives_in(Path::new("/raw/extsd")));
    }

    #[test]
    fn invalid_ids() {
        for id in ["", "tertiary", "data-slot-", "data-slot-a/b", "extsd-slot-..", "multi-slot- "] {
            assert!(
                matches!(
                    Rom::from_id(id, Path::new(RAW)),
                    Err(InstallerError::UnknownRom(_))
                ),
                "{id} should be rejected"
            );
        }
    }
}
