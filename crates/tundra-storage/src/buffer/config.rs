//! Buffer manager configuration.

use std::path::{Path, PathBuf};

use tundra_common::constants::{
    COOLING_INDEX_SLACK, DEFAULT_ASYNC_BATCH_SIZE, DEFAULT_COOL_PCT, DEFAULT_FREE_PCT,
};

use super::frame::BufferFrame;

/// Configuration for the buffer manager.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// DRAM pool size in bytes; the frame count is this divided by the
    /// size of one frame.
    pub pool_bytes: usize,
    /// Path of the backing store file.
    pub store_path: PathBuf,
    /// Truncate the backing store at open.
    pub truncate: bool,
    /// Pre-allocate this many GiB of backing store at open.
    pub preallocate_gib: u64,
    /// Free-frame watermark in percent of the pool (drives eviction).
    pub free_pct: u8,
    /// Free-plus-cooling watermark in percent of the pool (drives
    /// cooling).
    pub cool_pct: u8,
    /// Maximum outstanding asynchronous page writes.
    pub async_batch_size: usize,
    /// Open the backing store with direct I/O.
    pub direct_io: bool,
    /// Run the background page-provider thread.
    pub page_provider: bool,
    /// Run the diagnostics thread (periodic counter snapshots through
    /// `tracing`).
    pub debug_stats: bool,
}

impl BufferConfig {
    /// Creates a configuration with default policy values for the
    /// given backing store path.
    pub fn new(store_path: impl AsRef<Path>) -> Self {
        Self {
            pool_bytes: 1 << 30,
            store_path: store_path.as_ref().to_path_buf(),
            truncate: false,
            preallocate_gib: 0,
            free_pct: DEFAULT_FREE_PCT,
            cool_pct: DEFAULT_COOL_PCT,
            async_batch_size: DEFAULT_ASYNC_BATCH_SIZE,
            direct_io: true,
            page_provider: true,
            debug_stats: false,
        }
    }

    /// Sets the pool size in GiB.
    #[must_use]
    pub fn with_pool_gib(mut self, gib: usize) -> Self {
        self.pool_bytes = gib << 30;
        self
    }

    /// Sets the pool size as an exact frame count.
    #[must_use]
    pub fn with_pool_frames(mut self, frames: usize) -> Self {
        self.pool_bytes = frames * std::mem::size_of::<BufferFrame>();
        self
    }

    /// Sets the truncate-at-open flag.
    #[must_use]
    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Sets the backing-store pre-allocation, in GiB.
    #[must_use]
    pub fn with_preallocate_gib(mut self, gib: u64) -> Self {
        self.preallocate_gib = gib;
        self
    }

    /// Sets both watermarks, in percent of the pool.
    #[must_use]
    pub fn with_watermarks(mut self, free_pct: u8, cool_pct: u8) -> Self {
        self.free_pct = free_pct;
        self.cool_pct = cool_pct;
        self
    }

    /// Sets the async write batch size.
    #[must_use]
    pub fn with_async_batch_size(mut self, size: usize) -> Self {
        self.async_batch_size = size;
        self
    }

    /// Enables or disables direct I/O on the backing store.
    #[must_use]
    pub fn with_direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    /// Enables or disables the background page provider.
    #[must_use]
    pub fn with_page_provider(mut self, enabled: bool) -> Self {
        self.page_provider = enabled;
        self
    }

    /// Enables or disables the diagnostics thread.
    #[must_use]
    pub fn with_debug_stats(mut self, enabled: bool) -> Self {
        self.debug_stats = enabled;
        self
    }

    /// Number of frames the pool will hold.
    pub fn pool_frames(&self) -> usize {
        self.pool_bytes / std::mem::size_of::<BufferFrame>()
    }

    /// Free-frame watermark as an absolute frame count.
    pub fn free_limit(&self) -> usize {
        self.pool_frames() * self.free_pct as usize / 100
    }

    /// Free-plus-cooling watermark as an absolute frame count.
    pub fn cool_limit(&self) -> usize {
        self.pool_frames() * self.cool_pct as usize / 100
    }

    /// Capacity hint for the cooling index.
    pub fn cooling_capacity(&self) -> usize {
        (COOLING_INDEX_SLACK * self.cool_limit() as f64) as usize + 1
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.pool_frames() == 0 {
            return Err("pool must hold at least one frame");
        }
        if self.free_pct > 100 || self.cool_pct > 100 {
            return Err("watermarks are percentages and must be <= 100");
        }
        if self.free_pct > self.cool_pct {
            return Err("free watermark must not exceed cool watermark");
        }
        if self.async_batch_size == 0 {
            return Err("async_batch_size must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = BufferConfig::new("/tmp/pages.db");
        assert!(config.validate().is_ok());
        assert_eq!(config.free_pct, DEFAULT_FREE_PCT);
        assert_eq!(config.cool_pct, DEFAULT_COOL_PCT);
    }

    #[test]
    fn test_pool_frames() {
        let config = BufferConfig::new("/tmp/pages.db").with_pool_frames(128);
        assert_eq!(config.pool_frames(), 128);
    }

    #[test]
    fn test_watermark_limits() {
        let config = BufferConfig::new("/tmp/pages.db")
            .with_pool_frames(1000)
            .with_watermarks(10, 20);
        assert_eq!(config.free_limit(), 100);
        assert_eq!(config.cool_limit(), 200);
        assert!(config.cooling_capacity() >= 300);
    }

    #[test]
    fn test_validation_rejects_bad_watermarks() {
        let config = BufferConfig::new("/tmp/pages.db")
            .with_pool_frames(10)
            .with_watermarks(30, 20);
        assert!(config.validate().is_err());

        let config = BufferConfig::new("/tmp/pages.db")
            .with_pool_frames(10)
            .with_watermarks(10, 101);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_pool() {
        let config = BufferConfig::new("/tmp/pages.db").with_pool_frames(0);
        assert!(config.validate().is_err());
    }
}
