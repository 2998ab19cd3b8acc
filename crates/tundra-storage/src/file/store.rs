//! Synchronous positioned I/O over the backing store file.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use super::error::{IoError, IoResult};
use super::options::OpenOptions;

/// The backing store file.
///
/// All operations are positioned and take `&self`, so one handle can be
/// shared by any number of worker threads plus the page provider. The
/// file is typically opened with direct I/O in production; tests run
/// through the page cache so tmpfs-backed temp dirs work.
pub struct StorageFile {
    file: File,
    path: PathBuf,
}

impl StorageFile {
    /// Opens the backing store with the specified options.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> IoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut std_opts = options.to_std_options();

        #[cfg(target_os = "linux")]
        if options.direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            std_opts.custom_flags(libc::O_DIRECT);
        }

        let file = std_opts
            .open(&path)
            .map_err(|e| IoError::from_io_with_path(e, &path))?;

        // macOS has no O_DIRECT; F_NOCACHE after open is the equivalent.
        #[cfg(target_os = "macos")]
        if options.direct_io {
            unsafe {
                libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1);
            }
        }

        let store = Self { file, path };
        if let Some(bytes) = options.preallocate {
            store.allocate(0, bytes)?;
            store.sync_data()?;
        }
        Ok(store)
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current file size.
    pub fn size(&self) -> IoResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Reads data from the file at the specified offset.
    ///
    /// Returns the number of bytes read; zero means EOF.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> IoResult<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    /// Reads exactly `buf.len()` bytes from the file at the offset.
    ///
    /// Returns an error if EOF is reached before the buffer is filled.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> IoResult<()> {
        let mut total_read = 0;
        while total_read < buf.len() {
            let n = self.read_at(&mut buf[total_read..], offset + total_read as u64)?;
            if n == 0 {
                return Err(IoError::short_read(buf.len(), total_read));
            }
            total_read += n;
        }
        Ok(())
    }

    /// Writes data to the file at the specified offset.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> IoResult<usize> {
        Ok(self.file.write_at(buf, offset)?)
    }

    /// Writes all bytes to the file at the specified offset.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> IoResult<()> {
        let mut total_written = 0;
        while total_written < buf.len() {
            let n = self.write_at(&buf[total_written..], offset + total_written as u64)?;
            if n == 0 {
                return Err(IoError::short_write(buf.len(), total_written));
            }
            total_written += n;
        }
        Ok(())
    }

    /// Syncs data (not metadata) to disk.
    pub fn sync_data(&self) -> IoResult<()> {
        Ok(self.file.sync_data()?)
    }

    /// Syncs all data and metadata to disk.
    pub fn sync_all(&self) -> IoResult<()> {
        Ok(self.file.sync_all()?)
    }

    /// Truncates or extends the file to the specified size.
    pub fn set_len(&self, size: u64) -> IoResult<()> {
        Ok(self.file.set_len(size)?)
    }

    /// Pre-allocates contiguous space for the file.
    #[cfg(target_os = "linux")]
    pub fn allocate(&self, offset: u64, len: u64) -> IoResult<()> {
        let ret =
            unsafe { libc::posix_fallocate(self.file.as_raw_fd(), offset as i64, len as i64) };
        if ret != 0 {
            return Err(IoError::Io {
                source: std::io::Error::from_raw_os_error(ret),
            });
        }
        Ok(())
    }

    /// Pre-allocates space by extending the file.
    #[cfg(not(target_os = "linux"))]
    pub fn allocate(&self, offset: u64, len: u64) -> IoResult<()> {
        let end = offset + len;
        if self.size()? < end {
            self.set_len(end)?;
        }
        Ok(())
    }

    /// Returns the raw file descriptor, for the io_uring backend.
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl std::fmt::Debug for StorageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFile")
            .field("path", &self.path)
            .finish()
    }
}
