//! Partitions: the cooling queue and the in-flight page table.
//!
//! Each partition owns two structures under one mutex: the cooling
//! FIFO of cold-but-resident frames, and the in-flight table mapping a
//! page id to its [`CioFrame`] while the page is being read or is
//! cooling. Partition selection is a pure function of the page id so
//! the partition count can grow without touching callers; today there
//! is one partition.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use hashlink::LinkedHashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use tundra_common::types::PageId;

use super::frame::BufferFrame;

/// Status of an in-flight page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CioState {
    /// A winner thread is loading the page from disk.
    Reading,
    /// The page is resident and parked on the cooling queue.
    Cooling,
}

/// Rendezvous point for threads waiting on a page load.
///
/// The loading winner signals completion once the frame is filled and
/// parked; waiters block here instead of spinning on the partition
/// mutex.
#[derive(Debug, Default)]
pub(crate) struct LoadRendezvous {
    done: Mutex<bool>,
    cv: Condvar,
}

impl LoadRendezvous {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks until the load completes.
    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    /// Marks the load complete and wakes all waiters.
    pub(crate) fn release(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }
}

/// Per-page metadata while the page is read or cooling.
///
/// Created when a load begins or a frame enters cooling; removed when
/// the frame is evicted, or when it is re-swizzled and the last waiter
/// has drained.
pub(crate) struct CioFrame {
    pub(crate) state: CioState,
    /// The load winner's token plus one per waiting reader.
    pub(crate) readers: Arc<AtomicUsize>,
    pub(crate) rendezvous: Arc<LoadRendezvous>,
}

impl CioFrame {
    pub(crate) fn reading() -> Self {
        Self {
            state: CioState::Reading,
            readers: Arc::new(AtomicUsize::new(1)),
            rendezvous: Arc::new(LoadRendezvous::new()),
        }
    }

    pub(crate) fn cooling() -> Self {
        Self {
            state: CioState::Cooling,
            readers: Arc::new(AtomicUsize::new(0)),
            rendezvous: Arc::new(LoadRendezvous::new()),
        }
    }
}

/// The mutex-serialized interior of a partition.
pub(crate) struct PartitionInner {
    /// Cold-but-resident frames in approximate FIFO order; keyed by pid
    /// so arbitrary entries can be erased in O(1).
    pub(crate) cooling: LinkedHashMap<PageId, NonNull<BufferFrame>>,
    /// Pages currently being read or cooling.
    pub(crate) inflight: HashMap<PageId, CioFrame>,
}

// Safety: the NonNull values point into the manager's frame arena,
// which is Sync; the mutex serializes every access to the maps.
unsafe impl Send for PartitionInner {}

/// One shard of the cooling state.
pub(crate) struct Partition {
    inner: Mutex<PartitionInner>,
}

impl Partition {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PartitionInner {
                cooling: LinkedHashMap::with_capacity(capacity),
                inflight: HashMap::with_capacity(capacity),
            }),
        }
    }

    /// Locks the partition's cooling state.
    pub(crate) fn lock(&self) -> MutexGuard<'_, PartitionInner> {
        self.inner.lock()
    }
}

impl PartitionInner {
    /// Parks a frame at the tail of the cooling queue.
    pub(crate) fn park_cooling(&mut self, pid: PageId, frame: &BufferFrame) {
        let prev = self.cooling.insert(pid, NonNull::from(frame));
        debug_assert!(prev.is_none(), "page {pid} already cooling");
    }

    /// Erases a cooling entry; returns the parked frame if present.
    pub(crate) fn unpark_cooling(&mut self, pid: PageId) -> Option<NonNull<BufferFrame>> {
        self.cooling.remove(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn test_rendezvous_wakes_waiters() {
        let rendezvous = Arc::new(LoadRendezvous::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let r = Arc::clone(&rendezvous);
            handles.push(std::thread::spawn(move || r.wait()));
        }

        std::thread::sleep(Duration::from_millis(10));
        rendezvous.release();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_rendezvous_after_release_returns_immediately() {
        let rendezvous = LoadRendezvous::new();
        rendezvous.release();
        rendezvous.wait();
    }

    #[test]
    fn test_cooling_fifo_order_with_point_erasure() {
        let frames: Vec<_> = (0..4).map(|_| BufferFrame::boxed_zeroed()).collect();
        let partition = Partition::new(8);
        let mut inner = partition.lock();

        for (i, frame) in frames.iter().enumerate() {
            inner.park_cooling(PageId::new(i as u64), frame);
        }
        inner.unpark_cooling(PageId::new(1)).unwrap();

        let order: Vec<u64> = inner.cooling.keys().map(|p| p.as_u64()).collect();
        assert_eq!(order, vec![0, 2, 3]);
    }

    #[test]
    fn test_cio_frame_initial_counters() {
        let reading = CioFrame::reading();
        assert_eq!(reading.state, CioState::Reading);
        assert_eq!(reading.readers.load(Ordering::Relaxed), 1);

        let cooling = CioFrame::cooling();
        assert_eq!(cooling.state, CioState::Cooling);
        assert_eq!(cooling.readers.load(Ordering::Relaxed), 0);
    }
}
