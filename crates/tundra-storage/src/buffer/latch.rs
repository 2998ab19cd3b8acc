//! Optimistic version latches.
//!
//! Every buffer frame header carries a [`HybridLatch`]: a version
//! counter whose low bit marks an exclusive holder. Readers never write
//! to the latch; they snapshot the version, read speculatively, and
//! validate with [`OptimisticGuard::recheck`]. Any value derived from an
//! unvalidated guard (including frame pointers pulled out of swips) is
//! only trustworthy after a successful recheck.
//!
//! A failed validation or a lost upgrade race surfaces as
//! [`BufferError::Restart`], which callers propagate to the top of
//! their traversal.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{BufferError, BufferResult};

const EXCLUSIVE_BIT: u64 = 1;

/// A version latch: even value = unlatched, odd = exclusively latched.
///
/// The version only ever grows (it is not reset when a frame is
/// recycled), so a stale optimistic guard can never be revalidated by a
/// later lifetime of the same frame.
#[derive(Debug, Default)]
pub struct HybridLatch {
    version: AtomicU64,
}

impl HybridLatch {
    /// Creates an unlatched latch.
    pub const fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
        }
    }

    #[inline]
    fn load(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Returns the current raw version word.
    #[inline]
    pub fn version(&self) -> u64 {
        self.load()
    }

    /// Returns true if some thread holds the latch exclusively.
    #[inline]
    pub fn is_exclusively_latched(&self) -> bool {
        self.load() & EXCLUSIVE_BIT != 0
    }

    /// Takes an optimistic snapshot, spinning past an exclusive holder.
    pub fn optimistic(&self) -> OptimisticGuard {
        let mut version = self.load();
        while version & EXCLUSIVE_BIT != 0 {
            std::hint::spin_loop();
            version = self.load();
        }
        OptimisticGuard {
            latch: NonNull::from(self),
            version,
        }
    }

    /// Acquires the latch exclusively without a prior optimistic
    /// snapshot, spinning until it succeeds.
    ///
    /// Used where contention is impossible by construction (a frame
    /// just popped from the free list) or where the caller owns the
    /// only path to the frame.
    pub(crate) fn lock_exclusive_raw(&self) -> RawExclusiveGuard<'_> {
        loop {
            let version = self.load();
            if version & EXCLUSIVE_BIT == 0
                && self
                    .version
                    .compare_exchange_weak(
                        version,
                        version + 1,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return RawExclusiveGuard { latch: self };
            }
            std::hint::spin_loop();
        }
    }
}

/// An optimistic snapshot of a latch version.
///
/// The guard holds no lock. `recheck` fails with Restart if any
/// exclusive section completed (or started) since the snapshot.
pub struct OptimisticGuard {
    latch: NonNull<HybridLatch>,
    version: u64,
}

impl OptimisticGuard {
    #[inline]
    pub(crate) fn latch(&self) -> &HybridLatch {
        // Safety: latches live inside buffer frames owned by the
        // manager's arena, which outlives every guard.
        unsafe { self.latch.as_ref() }
    }

    /// Returns the snapshotted version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Validates every read made since the snapshot.
    #[inline]
    pub fn recheck(&self) -> BufferResult<()> {
        if self.latch().version.load(Ordering::Acquire) == self.version {
            Ok(())
        } else {
            Err(BufferError::Restart)
        }
    }

    /// Re-snapshots the latch, discarding the current version.
    pub fn refresh(&mut self) {
        *self = self.latch().optimistic();
    }
}

impl std::fmt::Debug for OptimisticGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticGuard")
            .field("version", &self.version)
            .finish()
    }
}

/// Exclusive upgrade of an [`OptimisticGuard`].
///
/// Releasing bumps the version by two (odd back to even), invalidating
/// every other outstanding optimistic guard; the upgraded guard itself
/// is re-armed with the new version so the caller's snapshot stays
/// valid across the exclusive section.
pub struct ExclusiveGuard<'g> {
    guard: &'g mut OptimisticGuard,
}

impl<'g> ExclusiveGuard<'g> {
    /// Attempts the upgrade; loses with Restart if the version moved.
    pub fn lock(guard: &'g mut OptimisticGuard) -> BufferResult<Self> {
        let version = guard.version;
        guard
            .latch()
            .version
            .compare_exchange(
                version,
                version + EXCLUSIVE_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| BufferError::Restart)?;
        Ok(Self { guard })
    }

    /// The latch this guard holds.
    #[inline]
    pub fn latch(&self) -> &HybridLatch {
        self.guard.latch()
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let new_version = self.guard.version + 2;
        self.guard
            .latch()
            .version
            .store(new_version, Ordering::Release);
        self.guard.version = new_version;
    }
}

/// Exclusive hold acquired without an optimistic snapshot.
pub(crate) struct RawExclusiveGuard<'a> {
    latch: &'a HybridLatch,
}

impl RawExclusiveGuard<'_> {
    /// Releases the latch.
    pub(crate) fn unlock(self) {}
}

impl Drop for RawExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.latch.version.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimistic_recheck_clean() {
        let latch = HybridLatch::new();
        let guard = latch.optimistic();
        assert!(guard.recheck().is_ok());
        assert!(guard.recheck().is_ok());
    }

    #[test]
    fn test_exclusive_invalidates_readers() {
        let latch = HybridLatch::new();
        let reader = latch.optimistic();

        let mut writer = latch.optimistic();
        let x = ExclusiveGuard::lock(&mut writer).unwrap();
        assert!(latch.is_exclusively_latched());
        drop(x);

        assert!(!latch.is_exclusively_latched());
        assert!(matches!(reader.recheck(), Err(BufferError::Restart)));
        // The upgraded guard was re-armed and stays valid.
        assert!(writer.recheck().is_ok());
    }

    #[test]
    fn test_upgrade_race_restarts() {
        let latch = HybridLatch::new();
        let mut a = latch.optimistic();
        let mut b = latch.optimistic();

        let held = ExclusiveGuard::lock(&mut a).unwrap();
        assert!(matches!(
            ExclusiveGuard::lock(&mut b),
            Err(BufferError::Restart)
        ));
        drop(held);

        // b's snapshot is stale now as well.
        assert!(matches!(
            ExclusiveGuard::lock(&mut b),
            Err(BufferError::Restart)
        ));
    }

    #[test]
    fn test_version_monotonic() {
        let latch = HybridLatch::new();
        let v0 = latch.version();
        {
            let mut g = latch.optimistic();
            let _x = ExclusiveGuard::lock(&mut g).unwrap();
        }
        assert_eq!(latch.version(), v0 + 2);
    }

    #[test]
    fn test_raw_exclusive() {
        let latch = HybridLatch::new();
        let g = latch.lock_exclusive_raw();
        assert!(latch.is_exclusively_latched());
        g.unlock();
        assert!(!latch.is_exclusively_latched());
        assert_eq!(latch.version() % 2, 0);
    }

    #[test]
    fn test_optimistic_spins_past_writer() {
        use std::sync::Arc;

        let latch = Arc::new(HybridLatch::new());
        let g = latch.lock_exclusive_raw();

        let latch2 = Arc::clone(&latch);
        let handle = std::thread::spawn(move || {
            let guard = latch2.optimistic();
            guard.recheck().is_ok()
        });

        std::thread::sleep(std::time::Duration::from_millis(10));
        g.unlock();
        assert!(handle.join().unwrap());
    }
}
