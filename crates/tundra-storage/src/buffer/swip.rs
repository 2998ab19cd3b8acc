//! Tagged swip words.
//!
//! A swip is a single word that addresses a page in one of two forms:
//! swizzled, holding a pointer to the resident [`BufferFrame`], or
//! unswizzled, holding the on-disk page id with the tag bit set.
//! Readers racing with the page provider may observe either form; the
//! parent frame's latch version decides whether what they read was
//! coherent.
//!
//! Mutation (swizzle/unswizzle) requires the exclusive latch of the
//! frame that *contains* the swip. The word itself is atomic so
//! optimistic readers never perform a torn read.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use tundra_common::types::PageId;

use super::frame::BufferFrame;

/// Tag bit: set when the swip holds a page id instead of a pointer.
const UNSWIZZLED_TAG: u64 = 1 << 63;

/// A word addressing either a resident frame or an on-disk page.
#[repr(transparent)]
pub struct Swip {
    word: AtomicU64,
}

impl Swip {
    /// Creates an unswizzled swip referencing `pid` on disk.
    pub fn to_page(pid: PageId) -> Self {
        debug_assert!(pid.as_u64() <= PageId::MAX.as_u64());
        Self {
            word: AtomicU64::new(pid.as_u64() | UNSWIZZLED_TAG),
        }
    }

    /// Creates a swizzled swip referencing a resident frame.
    pub fn to_frame(frame: NonNull<BufferFrame>) -> Self {
        Self {
            word: AtomicU64::new(frame.as_ptr() as u64),
        }
    }

    #[inline]
    fn load(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Returns the raw word (for diagnostics).
    #[inline]
    pub fn raw(&self) -> u64 {
        self.load()
    }

    /// Returns true if the swip currently holds a frame pointer.
    #[inline]
    pub fn is_swizzled(&self) -> bool {
        self.load() & UNSWIZZLED_TAG == 0
    }

    /// Interprets the swip as a page id.
    ///
    /// Meaningful only when unswizzled; the caller's guard protocol
    /// (recheck after use) makes a stale interpretation harmless.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId::new(self.load() & !UNSWIZZLED_TAG)
    }

    /// Interprets the swip as a resident frame pointer.
    #[inline]
    pub fn frame_ptr(&self) -> NonNull<BufferFrame> {
        debug_assert!(self.is_swizzled());
        // A swizzled swip always holds a pointer into the frame arena.
        NonNull::new(self.load() as *mut BufferFrame).expect("swizzled swip holds null")
    }

    /// Dereferences the swip as a resident frame.
    ///
    /// # Safety
    ///
    /// The caller must either hold a guard chain that it rechecks
    /// before trusting any read made through the reference, or hold the
    /// containing frame's exclusive latch.
    #[inline]
    pub unsafe fn as_frame<'a>(&self) -> &'a BufferFrame {
        &*(self.load() as *const BufferFrame)
    }

    /// Rewrites the swip to point at a resident frame.
    ///
    /// Caller must hold the exclusive latch of the containing frame.
    pub fn swizzle(&self, frame: NonNull<BufferFrame>) {
        self.word.store(frame.as_ptr() as u64, Ordering::Release);
    }

    /// Rewrites the swip to reference the page on disk.
    ///
    /// Caller must hold the exclusive latch of the containing frame.
    pub fn unswizzle(&self, pid: PageId) {
        debug_assert!(pid.as_u64() <= PageId::MAX.as_u64());
        self.word
            .store(pid.as_u64() | UNSWIZZLED_TAG, Ordering::Release);
    }
}

impl std::fmt::Debug for Swip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_swizzled() {
            write!(f, "Swip(frame @ {:#x})", self.raw())
        } else {
            write!(f, "Swip(page {})", self.page_id())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unswizzled_form() {
        let swip = Swip::to_page(PageId::new(42));
        assert!(!swip.is_swizzled());
        assert_eq!(swip.page_id(), PageId::new(42));
    }

    #[test]
    fn test_swizzle_cycle() {
        let frame = BufferFrame::boxed_zeroed();
        let ptr = NonNull::from(frame.as_ref());

        let swip = Swip::to_page(PageId::new(7));
        swip.swizzle(ptr);
        assert!(swip.is_swizzled());
        assert_eq!(swip.frame_ptr(), ptr);

        swip.unswizzle(PageId::new(7));
        assert!(!swip.is_swizzled());
        assert_eq!(swip.page_id(), PageId::new(7));
    }

    #[test]
    fn test_word_size() {
        assert_eq!(std::mem::size_of::<Swip>(), 8);
    }
}
