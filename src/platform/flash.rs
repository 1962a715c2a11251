//! File-backed flash slot for hosts.
//!
//! Images are staged in a temporary file next to the target path and only
//! renamed over it on commit, so an aborted or interrupted write never
//! replaces the previous image.

use super::{FlashWriter, PlatformResult};
use crate::error::PlatformError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

struct Staged {
    file: NamedTempFile,
    expected: u64,
    written: u64,
}

/// Flash slot backed by a file.
pub struct FileFlash {
    image_path: PathBuf,
    capacity: u64,
    staged: Option<Staged>,
}

impl FileFlash {
    /// Slot committing to `image_path`, holding at most `capacity` bytes.
    #[must_use]
    pub fn new(image_path: PathBuf, capacity: u64) -> Self {
        Self {
            image_path,
            capacity,
            staged: None,
        }
    }

    /// Path committed images are written to.
    #[must_use]
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Whether an image is currently staged.
    #[must_use]
    pub fn is_staging(&self) -> bool {
        self.staged.is_some()
    }
}

impl FlashWriter for FileFlash {
    fn begin(&mut self, size: u64) -> PlatformResult<()> {
        if size > self.capacity {
            return Err(PlatformError::new(format!(
                "image of {size} bytes exceeds slot capacity of {} bytes",
                self.capacity
            )));
        }

        let dir = match self.image_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        if self.staged.take().is_some() {
            debug!("Discarding previously staged image");
        }
        self.staged = Some(Staged {
            file: NamedTempFile::new_in(&dir)?,
            expected: size,
            written: 0,
        });
        debug!("Staging {} byte image in {}", size, dir.display());
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> PlatformResult<usize> {
        let staged = self
            .staged
            .as_mut()
            .ok_or_else(|| PlatformError::new("no image staged"))?;

        let remaining = staged.expected - staged.written;
        let n = data.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        staged.file.write_all(&data[..n])?;
        staged.written += n as u64;
        Ok(n)
    }

    fn end(&mut self) -> PlatformResult<()> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| PlatformError::new("no image staged"))?;

        if staged.written != staged.expected {
            return Err(PlatformError::new(format!(
                "staged {} of {} bytes",
                staged.written, staged.expected
            )));
        }

        staged.file.as_file().sync_all()?;
        staged
            .file
            .persist(&self.image_path)
            .map_err(|e| PlatformError::from(e.error))?;

        info!(
            "Committed {} byte image to {}",
            staged.written,
            self.image_path.display()
        );
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(staged) = self.staged.take() {
            debug!(
                "Aborted staged image after {} of {} bytes",
                staged.written, staged.expected
            );
        }
    }
}
