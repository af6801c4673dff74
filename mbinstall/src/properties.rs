//! Android system properties, as seen by the installation scripts

use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::chroot::in_root;

/// Environment variable pointing to the property area
pub const PROPERTY_WORKSPACE_ENV: &str = "ANDROID_PROPERTY_WORKSPACE";

/// Location of the property area inside the chroot
pub(crate) const PROPERTY_WORKSPACE_PATH: &str = "/dev/__properties__";

/// Parses the content of a `build.prop` style file
///
/// Blank lines and comments are ignored, as well as lines without a `=` or
/// with an empty key. Keys and values are trimmed, and later definitions win.
#[must_use]
pub fn parse_properties(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, val)| (key.trim(), val.trim()))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, val)| (key.to_owned(), val.to_owned()))
        .collect()
}

/// Reads and parses a property file
///
/// # Errors
///
/// If the file can't be read
pub fn read_property_file(path: &Path) -> io::Result<HashMap<String, String>> {
    let content = fs::read(path)?;

    Ok(parse_properties(&String::from_utf8_lossy(&content)))
}

/// Reads several property files, later files overriding the earlier ones.
/// Missing or unreadable files are skipped.
#[must_use]
pub fn load_property_files(paths: &[PathBuf]) -> HashMap<String, String> {
    let mut props = HashMap::new();

    for path in paths {
        match read_property_file(path) {
            Ok(found) => {
                debug!("Loaded {} properties from {}", found.len(), path.display());
                props.extend(found);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} doesn't exist", path.display());
            }
            Err(e) => warn!("Couldn't read {}: {e}", path.display()),
        }
    }

    props
}

/// The property sets known during an installation
#[derive(Clone, Debug, Default)]
pub struct PropertyTables {
    /// Properties of the running recovery
    pub host: HashMap<String, String>,

    /// Properties of the ROM being installed, read once its partitions are
    /// mounted
    pub chroot: HashMap<String, String>,

    /// Properties of the installed ROM, read before its partitions are
    /// unmounted
    pub cached: HashMap<String, String>,
}

impl PropertyTables {
    /// Returns a property, preferring the ROM value over the host one
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.chroot
            .get(key)
            .or_else(|| self.host.get(key))
            .map(String::as_str)
    }

    /// Returns the host properties overlaid by the ROM ones
    #[must_use]
    pub fn merged(&self) -> HashMap<String, String> {
        let mut props = self.host.clone();
        props.extend(self.chroot.iter().map(|(k, v)| (k.clone(), v.clone())));
        props
    }
}

/// Property area shared with the installation scripts
///
/// The area is a file in the chroot `/dev`, holding one `key=value` pair per
/// line. Scripts find it through [`PROPERTY_WORKSPACE_ENV`], and the getprop
/// shim reads it.
#[derive(Debug)]
pub(crate) struct LegacyPropertyService {
    workspace: PathBuf,
}

impl LegacyPropertyService {
    pub(crate) fn start(root: &Path) -> io::Result<Self> {
        let workspace = in_root(root, Path::new(PROPERTY_WORKSPACE_PATH));

        fs::File::create_new(&workspace)?;
        debug!("Property area created at {}", workspace.display());

        Ok(Self { workspace })
    }

    pub(crate) fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub(crate) fn publish(&self, props: &HashMap<String, String>) -> io::Result<()> {
        let sorted: BTreeMap<_, _> = props.iter().collect();

        let mut content = String::new();
        for (key, val) in sorted {
            if key.contains(['=', '\n']) || val.contains('\n') {
                warn!("Not publishing malformed property {}", key.escape_debug());
                continue;
            }

            content.push_str(key);
            content.push('=');
            content.push_str(val);
            content.push('\n');
        }

        let tmp = self.workspace.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.workspace)?;

        debug!("Published {} properties", props.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs};

    use tempfile::TempDir;
    use test_log::test;

    use super::{parse_properties, LegacyPropertyService, PropertyTables};

    #[test]
    fn parse_build_prop() {
        let props = parse_properties(
            "# begin build properties\n\
             ro.build.id = LMY48B\n\
             \n\
             ro.product.device=hlte\n\
             no_equal_sign\n\
             =orphan\n\
             ro.build.description=hlte-user 5.1.1 LMY48B release-keys\n\
             ro.product.device=hltexx\n",
        );

        assert_eq!(props.len(), 3);
        assert_eq!(props["ro.build.id"], "LMY48B");
        assert_eq!(props["ro.product.device"], "hltexx");
        assert_eq!(
            props["ro.build.description"],
            "hlte-user 5.1.1 LMY48B release-keys"
        );
    }

    #[test]
    fn parse_keeps_equal_signs_in_values() {
        let props = parse_properties("ro.config=a=b\n");

        assert_eq!(props["ro.config"], "a=b");
    }

    #[test]
    fn tables_prefer_rom_values() {
        let tables = PropertyTables {
            host: HashMap::from([
                ("ro.product.device".to_owned(), "hlte".to_owned()),
                ("ro.build.id".to_owned(), "TWRP".to_owned()),
            ]),
            chroot: HashMap::from([("ro.build.id".to_owned(), "LMY48B".to_owned())]),
            cached: HashMap::new(),
        };

        assert_eq!(tables.get("ro.build.id"), Some("LMY48B"));
        assert_eq!(tables.get("ro.product.device"), Some("hlte"));
        assert_eq!(tables.get("ro.missing"), None);
        assert_eq!(tables.merged()["ro.build.id"], "LMY48B");
    }

    #[test]
    fn property_area() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("dev")).unwrap();

        let service = LegacyPropertyService::start(dir.path()).unwrap();
        assert!(service.workspace().exists());

        service
            .publish(&HashMap::from([
                ("ro.b".to_owned(), "2".to_owned()),
                ("ro.a".to_owned(), "1".to_owned()),
                ("ro.bad".to_owned(), "multi\nline".to_owned()),
            ]))
            .unwrap();

        assert_eq!(
            fs::read_to_string(service.workspace()).unwrap(),
            "ro.a=1\nro.b=2\n"
        );

        // A second service in the same chroot is refused
        LegacyPropertyService::start(dir.path()).unwrap_err();
    }
}
