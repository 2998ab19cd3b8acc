//! File open options.

use std::fs;

/// Options for opening the backing store file.
///
/// This is similar to `std::fs::OpenOptions` but adds the flags a
/// database backing file needs: direct I/O and pre-allocation.
///
/// # Example
///
/// ```rust
/// use tundra_storage::file::OpenOptions;
///
/// let options = OpenOptions::new()
///     .read(true)
///     .write(true)
///     .create(true)
///     .direct_io(true);
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) create: bool,
    pub(crate) truncate: bool,
    /// Use direct I/O (bypass the OS page cache).
    pub(crate) direct_io: bool,
    /// Pre-allocate this many bytes of file space.
    pub(crate) preallocate: Option<u64>,
}

impl OpenOptions {
    /// Creates a new set of options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            read: false,
            write: false,
            create: false,
            truncate: false,
            direct_io: false,
            preallocate: None,
        }
    }

    /// Sets the option for read access.
    #[must_use]
    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    /// Sets the option for write access.
    #[must_use]
    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Sets the option to create the file if it doesn't exist.
    #[must_use]
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Sets the option for truncating an existing file.
    #[must_use]
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Sets the option for direct I/O (bypass the OS page cache).
    ///
    /// # Platform Support
    ///
    /// - **Linux**: `O_DIRECT`
    /// - **macOS**: `F_NOCACHE` after open
    ///
    /// Note that direct I/O requires all buffers and offsets to be
    /// aligned to [`crate::file::IO_ALIGNMENT`], and some filesystems
    /// (tmpfs) reject it entirely.
    #[must_use]
    pub fn direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    /// Requests pre-allocation of the given number of bytes at open.
    #[must_use]
    pub fn preallocate(mut self, bytes: u64) -> Self {
        self.preallocate = Some(bytes);
        self
    }

    /// Preset for the buffer manager's backing store: read/write,
    /// created on demand.
    #[must_use]
    pub fn for_store() -> Self {
        Self::new().read(true).write(true).create(true)
    }

    /// Converts to std::fs::OpenOptions (without platform flags).
    pub(crate) fn to_std_options(&self) -> fs::OpenOptions {
        let mut opts = fs::OpenOptions::new();
        opts.read(self.read)
            .write(self.write)
            .create(self.create)
            .truncate(self.truncate);
        opts
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}
