//! Immutable, timestamp-ranged fragments.
//!
//! # Array Layout
//!
//! ```text
//! <array>/
//!   __schema/__<ts>_<ts>_<uuid>             bincode-serialized ArraySchema
//!   __fragments/__<lo>_<hi>_<uuid>_<ver>/   one directory per fragment
//!     __fragment_metadata                   checksummed FragmentMetadata
//!     d<i>.tile                             coordinates of dimension i
//!     a<i>.tile                             values (or offsets) of attribute i
//!     a<i>_var.tile                         var-sized payloads of attribute i
//!     t.tile                                per-cell write timestamps
//!   __commits/<fragment>.wrt                commit marker
//!   __commits/<fragment>.vac                fragments superseded by <fragment>
//!   __meta/__<lo>_<hi>_<uuid>               array metadata
//! ```
//!
//! A fragment exists for readers only once its commit marker is in place, so
//! a crash while writing leaves an uncommitted directory that every reader
//! ignores.

pub mod buffer;
pub mod metadata;
pub mod name;
pub mod reader;
pub mod tile;
pub mod writer;

pub use metadata::{FragmentMetadata, TileMeta};
pub use name::FragmentName;
pub use reader::{FragmentReader, Tile};
pub use writer::FragmentWriter;

use crate::error::Result;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Fragments without per-cell timestamps.
pub const LEGACY_FORMAT_VERSION: u32 = 1;
/// Fragments that may carry a per-cell timestamp file.
pub const CURRENT_FORMAT_VERSION: u32 = 2;

pub const SCHEMA_DIR: &str = "__schema";
pub const FRAGMENTS_DIR: &str = "__fragments";
pub const COMMITS_DIR: &str = "__commits";
pub const META_DIR: &str = "__meta";

pub const METADATA_FILE: &str = "__fragment_metadata";
pub const TIMESTAMPS_FILE: &str = "t.tile";
pub const COMMIT_EXTENSION: &str = "wrt";
pub const VACUUM_EXTENSION: &str = "vac";

pub fn supports_timestamps(format_version: u32) -> bool {
    format_version >= CURRENT_FORMAT_VERSION
}

pub fn dimension_file(dim: usize) -> String {
    format!("d{}.tile", dim)
}

pub fn attribute_file(attr: usize) -> String {
    format!("a{}.tile", attr)
}

pub fn attribute_var_file(attr: usize) -> String {
    format!("a{}_var.tile", attr)
}

pub fn fragment_uri(array: &Path, name: &FragmentName) -> PathBuf {
    array.join(FRAGMENTS_DIR).join(name.to_string())
}

pub fn commit_uri(array: &Path, name: &FragmentName) -> PathBuf {
    array
        .join(COMMITS_DIR)
        .join(format!("{}.{}", name, COMMIT_EXTENSION))
}

pub fn vacuum_list_uri(array: &Path, name: &FragmentName) -> PathBuf {
    array
        .join(COMMITS_DIR)
        .join(format!("{}.{}", name, VACUUM_EXTENSION))
}

/// Write `bytes` to `path` so that readers see either nothing or the whole
/// file: write a sibling temp file, sync it, then rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Persist directory entries (created or renamed files).
pub fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// Remove a file or a whole directory, logging any failure other than the
/// path already being gone. Returns whether something was removed.
pub fn remove_best_effort(path: &Path) -> bool {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove");
            false
        }
    }
}
