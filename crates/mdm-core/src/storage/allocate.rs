//! Sliced space reservation for the file-allocation task.

use anyhow::{Context, Result};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use super::StorageWriter;
use crate::config::FileAllocation;

const ZERO_BUF: usize = 64 * 1024;

impl StorageWriter {
    /// Reserve `[offset, offset + len)`. Each call is one bounded step; the
    /// caller chooses `len` so a step stays short.
    pub fn allocate_range(&self, offset: u64, len: u64, mode: FileAllocation) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        match mode {
            FileAllocation::None => self.extend_to(offset + len),
            FileAllocation::Falloc => {
                #[cfg(unix)]
                {
                    let fd = self.file.as_raw_fd();
                    let r = unsafe {
                        libc::posix_fallocate(fd, offset as libc::off_t, len as libc::off_t)
                    };
                    if r == 0 {
                        return Ok(());
                    }
                    tracing::debug!(errno = r, "posix_fallocate failed, falling back to zero fill");
                }
                self.zero_fill(offset, len)
            }
            FileAllocation::Prealloc => self.zero_fill(offset, len),
        }
    }

    fn zero_fill(&self, offset: u64, len: u64) -> Result<()> {
        let zeros = vec![0u8; ZERO_BUF.min(len as usize)];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(zeros.len() as u64) as usize;
            self.write_at(offset + done, &zeros[..n])
                .context("zero fill during allocation")?;
            done += n as u64;
        }
        Ok(())
    }

    fn extend_to(&self, size: u64) -> Result<()> {
        if self.len()? < size {
            self.file.set_len(size).context("extend temp file")?;
        }
        Ok(())
    }
}
