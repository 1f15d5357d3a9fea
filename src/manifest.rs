//! The `manifest.json` of a patch package.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Name of the manifest inside a package.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory of the patch blobs inside a package.
pub const PATCHES_DIR: &str = "patches";

/// Extension appended to a patched file's path to name its blob.
pub const PATCH_EXTENSION: &str = "patch";

/// Directory of the whole-file copies inside packages built by this crate.
pub const CREATE_DIR: &str = "create";

/// Errors that can occur while loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest does not exist or cannot be read.
    #[error("manifest {} cannot be read: {source}", .path.display())]
    Missing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The manifest is not JSON, or lacks a key, or has a value of the wrong type.
    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),

    /// A listed path would escape the tree it applies to.
    #[error("illegal path `{path}` in manifest: {reason}")]
    IllegalPath { path: String, reason: &'static str },
}

impl ManifestError {
    /// Whether the manifest was absent rather than malformed.
    pub fn is_missing(&self) -> bool {
        matches!(self, ManifestError::Missing { .. })
    }
}

/// File operations turning an old tree into a new one.
///
/// All paths are relative: `delete` and `patch` entries and `create` keys
/// relative to the tree being patched, `create` values relative to the
/// package root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Files to remove.
    pub delete: Vec<String>,
    /// Destination path to the package file it is copied from.
    pub create: BTreeMap<String, String>,
    /// Files to rebuild from `patches/<path>.patch`.
    pub patch: Vec<String>,
}

impl Manifest {
    /// Load `manifest.json` from a package root.
    pub fn load<P: AsRef<Path>>(package_root: P) -> Result<Self, ManifestError> {
        let path = package_root.as_ref().join(MANIFEST_FILE);
        let file = File::open(&path).map_err(|source| ManifestError::Missing {
            path: path.clone(),
            source,
        })?;
        Manifest::from_reader(BufReader::new(file))
    }

    /// Parse and validate a manifest from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_reader(reader)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check that every listed path stays inside its root.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let paths = self
            .delete
            .iter()
            .chain(self.create.keys())
            .chain(self.create.values())
            .chain(self.patch.iter());
        for path in paths {
            check_relative(path)?;
        }
        Ok(())
    }

    /// Whether the manifest asks for nothing at all.
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.create.is_empty() && self.patch.is_empty()
    }

    /// Write the manifest as pretty-printed JSON into a package root.
    pub fn write_to<P: AsRef<Path>>(&self, package_root: P) -> io::Result<()> {
        let path = package_root.as_ref().join(MANIFEST_FILE);
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

impl FromStr for Manifest {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Manifest::from_reader(s.as_bytes())
    }
}

/// Location of the blob patching `name` inside a package.
pub fn patch_blob_path(package_root: &Path, name: &str) -> PathBuf {
    package_root
        .join(PATCHES_DIR)
        .join(format!("{}.{}", name, PATCH_EXTENSION))
}

fn check_relative(path: &str) -> Result<(), ManifestError> {
    let illegal = |reason| ManifestError::IllegalPath {
        path: path.to_string(),
        reason,
    };

    if path.is_empty() {
        return Err(illegal("empty path"));
    }
    let mut named = false;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            Component::ParentDir => return Err(illegal("parent directory reference")),
            Component::RootDir | Component::Prefix(_) => return Err(illegal("absolute path")),
        }
    }
    if !named {
        return Err(illegal("names the root itself"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_sections() {
        let m: Manifest = r#"{
            "delete": ["old.dll"],
            "create": {"data/new.bin": "create/data/new.bin"},
            "patch": ["game.exe", "resources/packed.a"]
        }"#
        .parse()
        .unwrap();
        assert_eq!(m.delete, vec!["old.dll"]);
        assert_eq!(m.create["data/new.bin"], "create/data/new.bin");
        assert_eq!(m.patch.len(), 2);
        assert!(!m.is_empty());
    }

    #[test]
    fn every_key_is_required() {
        let err = r#"{"delete": [], "create": {}}"#.parse::<Manifest>().unwrap_err();
        assert!(matches!(err, ManifestError::Json(_)));
        assert!(!err.is_missing());
    }

    #[test]
    fn wrong_types_are_rejected() {
        for text in [
            r#"{"delete": {}, "create": {}, "patch": []}"#,
            r#"{"delete": [], "create": [], "patch": []}"#,
            r#"{"delete": [], "create": {}, "patch": [1]}"#,
            r#"{"delete": [], "create": {"a": 2}, "patch": []}"#,
            "not json",
        ] {
            assert!(matches!(text.parse::<Manifest>(), Err(ManifestError::Json(_))), "{}", text);
        }
    }

    #[test]
    fn paths_must_stay_inside() {
        for text in [
            r#"{"delete": ["../outside"], "create": {}, "patch": []}"#,
            r#"{"delete": [], "create": {"a": "../../etc/passwd"}, "patch": []}"#,
            r#"{"delete": [], "create": {"/abs": "a"}, "patch": []}"#,
            r#"{"delete": [], "create": {}, "patch": ["dir/../../x"]}"#,
            r#"{"delete": [""], "create": {}, "patch": []}"#,
            r#"{"delete": ["."], "create": {}, "patch": []}"#,
            r#"{"delete": [], "create": {"./": "a"}, "patch": []}"#,
            r#"{"delete": [], "create": {}, "patch": ["./."]}"#,
        ] {
            assert!(
                matches!(text.parse::<Manifest>(), Err(ManifestError::IllegalPath { .. })),
                "{}",
                text
            );
        }
    }

    #[test]
    fn current_dir_prefixes_are_allowed() {
        let m: Manifest = r#"{"delete": ["./old.txt"], "create": {}, "patch": ["a/./b"]}"#
            .parse()
            .unwrap();
        assert_eq!(m.delete, vec!["./old.txt"]);
    }

    #[test]
    fn missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::load(dir.path()).unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn written_manifest_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = Manifest::default();
        m.delete.push("gone.txt".to_string());
        m.create.insert("a/b.txt".to_string(), "create/a/b.txt".to_string());
        m.patch.push("main.bin".to_string());
        m.write_to(dir.path()).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), m);
    }

    #[test]
    fn blob_paths() {
        let p = patch_blob_path(Path::new("pkg"), "bin/game.exe");
        assert_eq!(p, Path::new("pkg").join("patches").join("bin/game.exe.patch"));
    }
}
