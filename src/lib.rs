/*!
Bring installation trees up to date with bsdiff 4.x patch packages.

A patch package is a directory holding a `manifest.json` that lists files to
delete, files to create from copies shipped in the package, and files to
patch with the `BSDIFF40` blobs stored under `patches/`. [`patch_folder`]
applies such a package to a tree, [`Bspatch`] reconstructs a single file
while streaming through fixed-size buffers, and [`PackageBuilder`] authors
packages from an old and a new tree.
*/

pub mod bsdiff;
pub mod bspatch;
pub mod folder;
pub mod manifest;
pub mod package;
mod utils;

pub use bsdiff::{Bsdiff, Compression};
pub use bspatch::{apply_delta, Bspatch, DecodeError, PatchFile, PatchSource};
pub use folder::{
    patch_folder, FolderPatcher, PatchError, PatchFolderResult, PatchOperation, PatchReport,
};
pub use manifest::{Manifest, ManifestError};
pub use package::{PackageBuilder, PackageError};

/// Single bsdiff control instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control {
    /// Bytes rebuilt by adding the diff stream to the source.
    pub copy: u64,
    /// Bytes taken verbatim from the extra stream.
    pub extra: u64,
    /// Relative move of the source cursor after both phases.
    pub seek: i64,
}
