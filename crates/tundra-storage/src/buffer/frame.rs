//! Buffer frames: DRAM slots holding one page each.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};

use tundra_common::constants::PAGE_SIZE;
use tundra_common::types::{Lsn, PageId};

use super::latch::HybridLatch;
use crate::page::Page;

/// Lifecycle state of a buffer frame.
///
/// `Free` frames sit on the free list, `Hot` frames are reachable
/// through exactly one swizzled swip, `Cold` frames are resident but
/// unswizzled, parked on a partition's cooling queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// On the free list; payload indeterminate.
    Free = 0,
    /// Swizzled into a data structure.
    Hot = 1,
    /// Resident but cooling; the owning swip holds the page id.
    Cold = 2,
}

impl FrameState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Hot,
            2 => Self::Cold,
            _ => unreachable!("invalid frame state {raw}"),
        }
    }
}

/// Frame metadata preceding the page image.
///
/// All fields are atomics because optimistic readers inspect them
/// without holding any lock; coherence comes from the latch protocol,
/// not from the individual loads.
pub struct FrameHeader {
    latch: HybridLatch,
    state: AtomicU8,
    pid: AtomicU64,
    last_written_lsn: AtomicU64,
    is_wb: AtomicBool,
    cooled_by_read: AtomicBool,
    next_free: AtomicPtr<BufferFrame>,
}

/// A DRAM slot holding one page plus its management header.
///
/// The page image sits at a 512-byte offset so it can be handed to
/// direct I/O without staging.
#[repr(C)]
pub struct BufferFrame {
    header: FrameHeader,
    page: UnsafeCell<Page>,
}

// Header must fit in the pre-page gap created by Page's alignment.
const _: () = assert!(std::mem::size_of::<FrameHeader>() <= 512);
const _: () = assert!(std::mem::size_of::<BufferFrame>() == 512 + PAGE_SIZE);

impl BufferFrame {
    /// Allocates a single zeroed frame on the heap (tests and tools;
    /// the manager carves its frames out of one arena allocation).
    pub fn boxed_zeroed() -> Box<BufferFrame> {
        let layout = std::alloc::Layout::new::<BufferFrame>();
        // Safety: every field of BufferFrame is valid all-zero (atomics
        // at zero, state Free, plain bytes).
        unsafe {
            let raw = std::alloc::alloc_zeroed(layout) as *mut BufferFrame;
            if raw.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            let frame = Box::from_raw(raw);
            frame.reset();
            frame
        }
    }

    /// The frame's version latch.
    #[inline]
    pub fn latch(&self) -> &HybridLatch {
        &self.header.latch
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.header.state.load(Ordering::Acquire))
    }

    /// Sets the lifecycle state.
    ///
    /// Callers must hold the frame's exclusive latch, except for the
    /// Cold → Hot promotion, where the partition mutex plus the parent's
    /// exclusive latch exclude every other observer.
    #[inline]
    pub fn set_state(&self, state: FrameState) {
        self.header.state.store(state as u8, Ordering::Release);
    }

    /// The page id held by this frame; undefined while `Free`.
    #[inline]
    pub fn pid(&self) -> PageId {
        PageId::new(self.header.pid.load(Ordering::Acquire))
    }

    /// Sets the page id. Caller holds the exclusive latch.
    #[inline]
    pub fn set_pid(&self, pid: PageId) {
        self.header.pid.store(pid.as_u64(), Ordering::Release);
    }

    /// The LSN most recently persisted for this page.
    #[inline]
    pub fn last_written_lsn(&self) -> Lsn {
        Lsn::new(self.header.last_written_lsn.load(Ordering::Acquire))
    }

    /// Records a persisted LSN.
    #[inline]
    pub fn set_last_written_lsn(&self, lsn: Lsn) {
        self.header
            .last_written_lsn
            .store(lsn.as_u64(), Ordering::Release);
    }

    /// True while the page is staged in the async writer.
    #[inline]
    pub fn is_write_back(&self) -> bool {
        self.header.is_wb.load(Ordering::Acquire)
    }

    /// Marks or clears write-back staging.
    #[inline]
    pub fn set_write_back(&self, wb: bool) {
        self.header.is_wb.store(wb, Ordering::Release);
    }

    /// True iff the frame entered cooling as the product of a page
    /// load, not a provider cool-down.
    #[inline]
    pub fn cooled_by_read(&self) -> bool {
        self.header.cooled_by_read.load(Ordering::Acquire)
    }

    /// Records how the frame entered cooling.
    #[inline]
    pub fn set_cooled_by_read(&self, value: bool) {
        self.header.cooled_by_read.store(value, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next_free(&self) -> *mut BufferFrame {
        self.header.next_free.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_next_free(&self, next: *mut BufferFrame) {
        self.header.next_free.store(next, Ordering::Release);
    }

    /// The resident page image.
    ///
    /// Reads through this reference are speculative unless the caller
    /// holds a validated guard or the exclusive latch; callers must
    /// recheck before trusting anything derived from them.
    #[inline]
    pub fn page(&self) -> &Page {
        // Safety: the latch protocol (recheck-after-read) makes stale
        // or torn payload reads harmless; the pointer itself is always
        // valid for the arena's lifetime.
        unsafe { &*self.page.get() }
    }

    /// Mutable access to the page image.
    ///
    /// # Safety
    ///
    /// The caller must hold this frame's exclusive latch (or otherwise
    /// be the only thread able to reach the frame, e.g. right after
    /// popping it from the free list).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_mut(&self) -> &mut Page {
        &mut *self.page.get()
    }

    /// The page's current LSN (speculative, like [`Self::page`]).
    #[inline]
    pub fn page_lsn(&self) -> Lsn {
        self.page().lsn
    }

    /// True if the in-memory page is newer than its on-disk image.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.page_lsn() > self.last_written_lsn()
    }

    /// Reinitializes the header to the `Free` default.
    ///
    /// The latch version is deliberately left alone so stale optimistic
    /// guards from the frame's previous life can never revalidate.
    pub fn reset(&self) {
        self.header.state.store(FrameState::Free as u8, Ordering::Release);
        self.header
            .pid
            .store(PageId::INVALID.as_u64(), Ordering::Release);
        self.header.last_written_lsn.store(0, Ordering::Release);
        self.header.is_wb.store(false, Ordering::Release);
        self.header.cooled_by_read.store(false, Ordering::Release);
        self.header.next_free.store(ptr::null_mut(), Ordering::Release);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("state", &self.state())
            .field("pid", &self.pid())
            .field("last_written_lsn", &self.last_written_lsn())
            .field("is_wb", &self.is_write_back())
            .field("cooled_by_read", &self.cooled_by_read())
            .finish()
    }
}

// Safety: all header fields are atomics; page payload access is
// disciplined by the latch protocol documented on `page`/`page_mut`.
unsafe impl Send for BufferFrame {}
unsafe impl Sync for BufferFrame {}

#[cfg(test)]
mod tests {
    use super::*;
    use tundra_common::types::DtId;

    #[test]
    fn test_zeroed_frame_is_free() {
        let frame = BufferFrame::boxed_zeroed();
        assert_eq!(frame.state(), FrameState::Free);
        assert_eq!(frame.pid(), PageId::INVALID);
        assert!(!frame.is_write_back());
        assert!(!frame.cooled_by_read());
        assert!(frame.next_free().is_null());
    }

    #[test]
    fn test_header_fields() {
        let frame = BufferFrame::boxed_zeroed();

        frame.set_state(FrameState::Hot);
        frame.set_pid(PageId::new(11));
        frame.set_last_written_lsn(Lsn::new(5));
        frame.set_write_back(true);
        frame.set_cooled_by_read(true);

        assert_eq!(frame.state(), FrameState::Hot);
        assert_eq!(frame.pid(), PageId::new(11));
        assert_eq!(frame.last_written_lsn(), Lsn::new(5));
        assert!(frame.is_write_back());
        assert!(frame.cooled_by_read());
    }

    #[test]
    fn test_dirty_tracking() {
        let frame = BufferFrame::boxed_zeroed();
        frame.set_pid(PageId::new(1));
        assert!(!frame.is_dirty());

        unsafe { frame.page_mut() }.lsn = Lsn::new(3);
        assert!(frame.is_dirty());

        frame.set_last_written_lsn(Lsn::new(3));
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_reset_preserves_latch_version() {
        let frame = BufferFrame::boxed_zeroed();
        {
            let _x = frame.latch().lock_exclusive_raw();
        }
        let version = frame.latch().version();
        assert!(version > 0);

        unsafe { frame.page_mut() }.init(PageId::new(4), DtId::new(0));
        frame.set_state(FrameState::Hot);
        frame.reset();

        assert_eq!(frame.state(), FrameState::Free);
        assert_eq!(frame.latch().version(), version);
    }

    #[test]
    fn test_page_offset_alignment() {
        let frame = BufferFrame::boxed_zeroed();
        let base = &*frame as *const BufferFrame as usize;
        let page = frame.page() as *const Page as usize;
        assert_eq!(page - base, 512);
        assert_eq!(page % 512, 0);
    }
}
