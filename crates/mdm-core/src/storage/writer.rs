//! Offset reader/writer for temp download files.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Handle to a temp download file. Cheap to clone; every transfer of a group
/// holds one. `write_at`/`read_at` never move a shared cursor.
#[derive(Clone)]
pub struct StorageWriter {
    pub(super) file: Arc<File>,
    temp_path: PathBuf,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter")
            .field("temp_path", &self.temp_path)
            .finish()
    }
}

impl StorageWriter {
    /// Create (or truncate) the temp file, creating parent directories as needed.
    pub fn create(temp_path: &Path) -> Result<Self> {
        if let Some(parent) = temp_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir: {}", parent.display()))?;
            }
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .with_context(|| format!("failed to create temp file: {}", temp_path.display()))?;
        Ok(Self {
            file: Arc::new(file),
            temp_path: temp_path.to_path_buf(),
        })
    }

    /// Open an existing temp file for resume (read+write, no truncation).
    pub fn open_existing(temp_path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(temp_path)
            .with_context(|| format!("failed to open existing temp file: {}", temp_path.display()))?;
        Ok(Self {
            file: Arc::new(file),
            temp_path: temp_path.to_path_buf(),
        })
    }

    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, offset)
            .with_context(|| format!("write {} bytes at {}", data.len(), offset))
    }

    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = (*self.file).try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`; returns 0 at end of file.
    #[cfg(unix)]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file
            .read_at(buf, offset)
            .with_context(|| format!("read at {} from {}", offset, self.temp_path.display()))
    }

    #[cfg(not(unix))]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = (*self.file).try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        Ok(f.read(buf)?)
    }

    /// Current on-disk length of the temp file.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata().context("stat temp file")?.len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("storage sync failed")
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Rename the temp file to `final_path`. Other clones may still hold the
    /// descriptor; the rename does not depend on them being closed.
    pub fn finalize(self, final_path: &Path) -> Result<()> {
        let temp_path = self.temp_path.clone();
        drop(self.file);
        std::fs::rename(&temp_path, final_path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp_path.display(),
                final_path.display()
            )
        })
    }
}
