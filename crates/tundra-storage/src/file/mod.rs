//! Positioned file I/O for the backing page store.
//!
//! The buffer manager talks to one flat file opened (by default) with
//! direct, unbuffered semantics: the pool *is* the cache, so the OS page
//! cache only costs memory. All operations are positioned
//! (`pread`/`pwrite` style) and safe to issue from any thread.
//!
//! [`StorageFile`] is the single synchronous backend; the asynchronous
//! write path of the buffer manager batches on top of it (or on the
//! io_uring backend when the `io-uring` feature is enabled).

mod aligned;
mod error;
mod options;
mod store;

pub use aligned::AlignedBuf;
pub use error::{IoError, IoResult};
pub use options::OpenOptions;
pub use store::StorageFile;

pub use tundra_common::constants::IO_ALIGNMENT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_constant() {
        assert!(IO_ALIGNMENT.is_power_of_two());
    }
}
