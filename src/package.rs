//! Authoring patch packages from an old and a new tree.

use crate::bsdiff::{Bsdiff, Compression};
use crate::manifest::{patch_blob_path, Manifest, CREATE_DIR};
use log::info;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors that can occur while building a package.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("output directory {} already exists", .0.display())]
    OutputExists(PathBuf),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("non UTF-8 path: {}", .0.display())]
    NonUtf8(PathBuf),
}

/// Attach the offending path to an I/O error.
trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T, PackageError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, PackageError> {
        self.map_err(|source| PackageError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Builds a package turning the `source` tree into the `target` tree.
///
/// Files only in `source` are deleted, files only in `target` are shipped
/// whole under `create/`, and files present in both with different contents
/// get a bsdiff blob under `patches/`.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    dry_run: bool,
    overwrite: bool,
    level: Compression,
}

impl Default for PackageBuilder {
    fn default() -> Self {
        PackageBuilder {
            dry_run: false,
            overwrite: false,
            level: Compression::best(),
        }
    }
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only compute the manifest; write nothing.
    pub fn dry_run(mut self, dry: bool) -> Self {
        self.dry_run = dry;
        self
    }

    /// Remove an existing output directory instead of failing.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set the bzip2 level of the patch blobs (default is best).
    pub fn compression_level(mut self, lv: Compression) -> Self {
        self.level = lv;
        self
    }

    /// Compare both trees and write the package into `output`.
    pub fn build<P, Q, R>(&self, source: P, target: Q, output: R) -> Result<Manifest, PackageError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        let (source, target, output) = (source.as_ref(), target.as_ref(), output.as_ref());
        if self.dry_run {
            info!("dry run: nothing will be written");
        }

        self.prepare_output(output)?;

        let old = relative_files(source)?;
        let new = relative_files(target)?;
        let mut manifest = Manifest::default();

        manifest.delete = old.difference(&new).cloned().collect();

        for name in old.intersection(&new) {
            let s = fs::read(source.join(name)).at(&source.join(name))?;
            let t = fs::read(target.join(name)).at(&target.join(name))?;
            if s == t {
                continue;
            }

            info!("generating patch for {}", name);
            if !self.dry_run {
                let blob = patch_blob_path(output, name);
                self.write_blob(&s, &t, &blob)?;
            }
            manifest.patch.push(name.clone());
        }

        for name in new.difference(&old) {
            info!("shipping new file {}", name);
            let shipped = format!("{}/{}", CREATE_DIR, name);
            if !self.dry_run {
                let dest = output.join(&shipped);
                create_parent(&dest)?;
                fs::copy(target.join(name), &dest).at(&dest)?;
            }
            manifest.create.insert(name.clone(), shipped);
        }

        if !self.dry_run {
            manifest.write_to(output).at(output)?;
        }
        info!(
            "package {}: {} deletions, {} creations, {} patches",
            output.display(),
            manifest.delete.len(),
            manifest.create.len(),
            manifest.patch.len()
        );
        Ok(manifest)
    }

    fn prepare_output(&self, output: &Path) -> Result<(), PackageError> {
        if output.exists() {
            if !self.overwrite {
                return Err(PackageError::OutputExists(output.to_path_buf()));
            }
            info!("removing output directory {}", output.display());
            if !self.dry_run {
                fs::remove_dir_all(output).at(output)?;
            }
        }
        if !self.dry_run {
            fs::create_dir_all(output).at(output)?;
        }
        Ok(())
    }

    fn write_blob(&self, s: &[u8], t: &[u8], blob: &Path) -> Result<(), PackageError> {
        create_parent(blob)?;
        let file = fs::File::create(blob).at(blob)?;
        let mut writer = BufWriter::new(file);
        Bsdiff::new(s, t)
            .compression_level(self.level)
            .compare(&mut writer)
            .at(blob)?;
        writer.flush().at(blob)
    }
}

fn create_parent(path: &Path) -> Result<(), PackageError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).at(parent),
        None => Ok(()),
    }
}

/// Collect every regular file below `root` as a `/`-separated relative path.
pub fn relative_files(root: &Path) -> Result<BTreeSet<String>, PackageError> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let name = relative
            .to_str()
            .ok_or_else(|| PackageError::NonUtf8(relative.to_path_buf()))?
            .replace('\\', "/");
        files.insert(name);
    }
    Ok(files)
}
