use std::{
    fs::{self, File},
    io::{self, BufReader, Read as _},
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use log::debug;
use types::InstallerError;
use zip::{result::ZipError, ZipArchive};

/// Installation script run by the recovery
pub(crate) const UPDATE_BINARY: &str = "META-INF/com/google/android/update-binary";

/// Present in packages using the AROMA graphical installer
pub(crate) const AROMA_CONFIG: &str = "META-INF/com/google/android/aroma-config";

/// Present in packages flashing a block level system image
pub(crate) const BLOCK_IMAGE_MARKER: &str = "system.transfer.list";

/// Description of the device the package was built for
pub(crate) const DEVICE_JSON: &str = "multiboot/device.json";

/// Installation parameters
pub(crate) const INFO_PROP: &str = "multiboot/info.prop";

/// A flashable zip package
#[derive(Debug)]
pub struct Package {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
}

impl Package {
    /// Opens a package
    ///
    /// # Errors
    ///
    /// If the file can't be opened or isn't a zip archive
    pub fn open(path: &Path) -> Result<Self, InstallerError> {
        let file = File::open(path)?;
        let archive = ZipArchive::new(BufReader::new(file))?;

        debug!("Opened {} ({} entries)", path.display(), archive.len());

        Ok(Self {
            path: path.to_path_buf(),
            archive,
        })
    }

    /// Returns whether the package contains a given file
    #[must_use]
    pub fn has_entry(&self, name: &str) -> bool {
        self.archive.file_names().any(|n| n == name)
    }

    /// Returns whether the package uses the AROMA installer
    #[must_use]
    pub fn is_aroma(&self) -> bool {
        self.has_entry(AROMA_CONFIG)
    }

    /// Reads a file of the package in memory
    ///
    /// # Errors
    ///
    /// If the file isn't in the package, or can't be decompressed
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, InstallerError> {
        let mut entry = self.archive.by_name(name).map_err(|e| match e {
            ZipError::FileNotFound => InstallerError::MissingEntry(name.to_owned()),
            other => InstallerError::Zip(other),
        })?;

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        Ok(data)
    }

    /// Extracts a file of the package to `dest`, with the given permissions
    ///
    /// # Errors
    ///
    /// If the file isn't in the package, or can't be written
    pub fn extract_entry(&mut self, name: &str, dest: &Path, mode: u32) -> Result<(), InstallerError> {
        let mut entry = self.archive.by_name(name).map_err(|e| match e {
            ZipError::FileNotFound => InstallerError::MissingEntry(name.to_owned()),
            other => InstallerError::Zip(other),
        })?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(dest)?;
        let size = io::copy(&mut entry, &mut out)?;
        out.set_permissions(fs::Permissions::from_mode(mode))?;

        debug!(
            "Extracted {name} from {} to {} ({size} bytes)",
            self.path.display(),
            dest.display()
        );

        Ok(())
    }
}

/// Returns whether the package at `path` uses the AROMA installer. Packages
/// that can't be read aren't.
#[must_use]
pub fn is_aroma(path: &Path) -> bool {
    Package::open(path).is_ok_and(|pkg| pkg.is_aroma())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        fs::{self, File},
        io::Write as _,
        os::unix::fs::PermissionsExt as _,
        path::Path,
    };

    use tempfile::TempDir;
    use test_log::test;
    use types::InstallerError;
    use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

    use super::{is_aroma, Package, AROMA_CONFIG, UPDATE_BINARY};

    pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }

        zip.finish().unwrap();
    }

    #[test]
    fn read_and_extract() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rom.zip");
        write_zip(
            &path,
            &[
                (UPDATE_BINARY, b"#!/sbin/sh\nexit 0\n"),
                ("multiboot/info.prop", b"mbtool.installer.install-location=primary\n"),
            ],
        );

        let mut pkg = Package::open(&path).unwrap();
        assert!(pkg.has_entry(UPDATE_BINARY));
        assert!(!pkg.is_aroma());
        assert_eq!(
            pkg.read_entry("multiboot/info.prop").unwrap(),
            b"mbtool.installer.install-location=primary\n"
        );

        let dest = dir.path().join("mb/updater");
        pkg.extract_entry(UPDATE_BINARY, &dest, 0o755).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"#!/sbin/sh\nexit 0\n");
        assert_eq!(
            fs::metadata(&dest).unwrap().permissions().mode() & 0o777,
            0o755
        );
    }

    #[test]
    fn missing_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rom.zip");
        write_zip(&path, &[("README", b"")]);

        let mut pkg = Package::open(&path).unwrap();
        assert!(matches!(
            pkg.read_entry("multiboot/device.json"),
            Err(InstallerError::MissingEntry(name)) if name == "multiboot/device.json"
        ));
    }

    #[test]
    fn aroma_detection() {
        let dir = TempDir::new().unwrap();
        let aroma = dir.path().join("aroma.zip");
        write_zip(&aroma, &[(AROMA_CONFIG, b"ini_set(\"rom_name\", \"Test\");")]);

        let garbage = dir.path().join("garbage.zip");
        fs::write(&garbage, b"not a zip").unwrap();

        assert!(is_aroma(&aroma));
        assert!(!is_aroma(&garbage));
        assert!(!is_aroma(&dir.path().join("missing.zip")));
    }
}
