//! Disk I/O and file lifecycle.
//!
//! Downloads land in `<path>.part`, written at arbitrary offsets (pwrite) by
//! transfer handlers, sliced-allocated by the file-allocation task, read back
//! by the integrity check, and atomically renamed to the final path once the
//! group finishes.

mod allocate;
mod writer;

pub use writer::StorageWriter;

use std::path::{Path, PathBuf};

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the temp file: `file.iso` → `file.iso.part`.
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}
