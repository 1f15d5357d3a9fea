//! Applying a patch package to an installation tree.
//!
//! The manifest is executed in a fixed order: every deletion, then every
//! creation, then every patch. A failing entry is recorded and the run moves
//! on to the next one; only a missing or malformed manifest stops the run
//! before it starts.

use crate::bspatch::{Bspatch, DecodeError, BUFFER_SIZE};
use crate::manifest::{patch_blob_path, Manifest};
use log::{debug, error, info, warn};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Suffix of the sibling file a patched file is rebuilt into.
pub const TEMP_SUFFIX: &str = ".patched";

/// Overall outcome of applying a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFolderResult {
    /// Every entry was applied.
    Ok,
    /// The package has no readable `manifest.json`.
    NoManifest,
    /// `manifest.json` is not a valid manifest.
    InvalidManifest,
    /// At least one entry failed; see the report's errors.
    Fail,
    /// The run was stopped between two entries.
    Cancelled,
}

/// Kind of manifest entry an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOperation {
    Create,
    Delete,
    Patch,
}

impl fmt::Display for PatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchOperation::Create => "create",
            PatchOperation::Delete => "delete",
            PatchOperation::Patch => "patch",
        };
        f.write_str(name)
    }
}

/// A single failed manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchError {
    /// Relative path named by the entry.
    pub name: String,
    pub operation: PatchOperation,
    /// OS error number for I/O failures, or a negative `DecodeError::code`.
    pub code: i32,
    pub message: String,
}

impl PatchError {
    fn io(name: &str, operation: PatchOperation, err: &io::Error) -> Self {
        PatchError {
            name: name.to_string(),
            operation,
            code: err.raw_os_error().unwrap_or(-1),
            message: err.to_string(),
        }
    }

    fn decode(name: &str, err: &DecodeError) -> Self {
        PatchError {
            name: name.to_string(),
            operation: PatchOperation::Patch,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} `{}` failed (code {}): {}",
            self.operation, self.name, self.code, self.message
        )
    }
}

/// Outcome of a run together with every entry that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub result: PatchFolderResult,
    pub errors: Vec<PatchError>,
}

impl PatchReport {
    fn fatal(result: PatchFolderResult) -> Self {
        PatchReport {
            result,
            errors: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == PatchFolderResult::Ok
    }
}

/// Configurable manifest interpreter.
///
/// ```no_run
/// use treepatch::{FolderPatcher, PatchFolderResult};
///
/// let report = FolderPatcher::new().patch("install", "package");
/// if report.result != PatchFolderResult::Ok {
///     for err in &report.errors {
///         eprintln!("{}", err);
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FolderPatcher {
    buffer_size: usize,
    temp_suffix: String,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for FolderPatcher {
    fn default() -> Self {
        FolderPatcher {
            buffer_size: BUFFER_SIZE,
            temp_suffix: TEMP_SUFFIX.to_string(),
            cancel: None,
        }
    }
}

impl FolderPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size used while rebuilding patched files (`bs >= 128`,
    /// default is `BUFFER_SIZE`).
    pub fn buffer_size(mut self, mut bs: usize) -> Self {
        if bs < 128 {
            bs = 128;
        }
        self.buffer_size = bs;
        self
    }

    /// Set the suffix of temporary files (default is `TEMP_SUFFIX`).
    /// An empty suffix is ignored.
    pub fn temp_suffix<S: Into<String>>(mut self, suffix: S) -> Self {
        let suffix = suffix.into();
        if !suffix.is_empty() {
            self.temp_suffix = suffix;
        }
        self
    }

    /// Install a flag that stops the run before the next entry once set.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Apply the package at `package_root` to the tree at `install_root`.
    pub fn patch<P, Q>(&self, install_root: P, package_root: Q) -> PatchReport
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let install = install_root.as_ref();
        let package = package_root.as_ref();

        let manifest = match Manifest::load(package) {
            Ok(manifest) => manifest,
            Err(e) if e.is_missing() => {
                error!("{}", e);
                return PatchReport::fatal(PatchFolderResult::NoManifest);
            }
            Err(e) => {
                error!("{}", e);
                return PatchReport::fatal(PatchFolderResult::InvalidManifest);
            }
        };
        info!(
            "applying {} to {}: {} deletions, {} creations, {} patches",
            package.display(),
            install.display(),
            manifest.delete.len(),
            manifest.create.len(),
            manifest.patch.len()
        );

        let mut errors = Vec::new();

        for name in &manifest.delete {
            if self.is_cancelled() {
                return cancelled(errors);
            }
            info!("deleting {}", name);
            if let Err(e) = delete_file(&install.join(name)) {
                record(&mut errors, PatchError::io(name, PatchOperation::Delete, &e));
            }
        }

        for (name, source) in &manifest.create {
            if self.is_cancelled() {
                return cancelled(errors);
            }
            info!("creating {} from {}", name, source);
            if let Err(e) = create_file(&install.join(name), &package.join(source)) {
                record(&mut errors, PatchError::io(name, PatchOperation::Create, &e));
            }
        }

        for name in &manifest.patch {
            if self.is_cancelled() {
                return cancelled(errors);
            }
            if let Err(e) = self.patch_file(install, package, name) {
                record(&mut errors, e);
            }
        }

        let result = if errors.is_empty() {
            PatchFolderResult::Ok
        } else {
            PatchFolderResult::Fail
        };
        PatchReport { result, errors }
    }

    /// Rebuild `target` from `original` and the patch blob at `blob`.
    ///
    /// The output is written to a temporary sibling of `target` and renamed
    /// over it only once complete, so `target` may be `original` itself. On
    /// any failure the temporary file is removed and `target` is untouched.
    pub fn replace_file<P, Q, R>(&self, original: P, blob: Q, target: R) -> Result<u64, DecodeError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        let target = target.as_ref();
        let temporary = self.temporary_path(target);

        let rebuilt = Bspatch::open(blob).and_then(|p| {
            p.buffer_size(self.buffer_size)
                .apply_file(original, &temporary)
        });
        let size = match rebuilt {
            Ok(size) => size,
            Err(e) => {
                remove_stale(&temporary);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&temporary, target) {
            remove_stale(&temporary);
            return Err(e.into());
        }
        Ok(size)
    }

    /// Patch one manifest entry in place.
    fn patch_file(&self, install: &Path, package: &Path, name: &str) -> Result<(), PatchError> {
        let original = install.join(name);
        let blob = patch_blob_path(package, name);
        info!("patching {} with {}", original.display(), blob.display());

        let size = self
            .replace_file(&original, &blob, &original)
            .map_err(|e| PatchError::decode(name, &e))?;
        debug!("rebuilt {} ({} bytes)", name, size);
        Ok(())
    }

    fn temporary_path(&self, target: &Path) -> PathBuf {
        let mut path = OsString::from(target.as_os_str());
        path.push(&self.temp_suffix);
        PathBuf::from(path)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    }
}

/// Apply a package with the default settings.
pub fn patch_folder<P, Q>(install_root: P, package_root: Q) -> PatchReport
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    FolderPatcher::new().patch(install_root, package_root)
}

fn record(errors: &mut Vec<PatchError>, err: PatchError) {
    error!("{}", err);
    errors.push(err);
}

fn cancelled(errors: Vec<PatchError>) -> PatchReport {
    warn!("patching cancelled");
    PatchReport {
        result: PatchFolderResult::Cancelled,
        errors,
    }
}

/// Remove a file; one that is already gone counts as removed.
fn delete_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Copy `source` over `dest`, creating missing parent directories.
fn create_file(dest: &Path, source: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;
    Ok(())
}

fn remove_stale(path: &Path) {
    if let Err(e) = delete_file(path) {
        warn!("unable to remove temporary file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_is_a_sibling() {
        let patcher = FolderPatcher::new();
        let tmp = patcher.temporary_path(Path::new("root/dir/game.exe"));
        assert_eq!(tmp, Path::new("root/dir/game.exe.patched"));

        let patcher = FolderPatcher::new().temp_suffix(".new").temp_suffix("");
        let tmp = patcher.temporary_path(Path::new("a.bin"));
        assert_eq!(tmp, Path::new("a.bin.new"));
    }

    #[test]
    fn error_codes() {
        let err = PatchError::decode("x", &DecodeError::MalformedHeader("bad magic"));
        assert_eq!(err.code, -2);
        assert_eq!(err.operation, PatchOperation::Patch);
        assert!(err.to_string().starts_with("patch `x` failed (code -2)"));

        let io_err = io::Error::from_raw_os_error(13);
        let err = PatchError::io("y", PatchOperation::Delete, &io_err);
        assert_eq!(err.code, 13);
    }

    #[test]
    fn cancellation_keeps_gathered_errors() {
        let io_err = io::Error::from_raw_os_error(21);
        let gathered = vec![PatchError::io("dir", PatchOperation::Delete, &io_err)];
        let report = cancelled(gathered.clone());
        assert_eq!(report.result, PatchFolderResult::Cancelled);
        assert_eq!(report.errors, gathered);
    }
}
