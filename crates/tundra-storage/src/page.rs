//! The on-disk page image.
//!
//! A page is exactly [`PAGE_SIZE`] bytes: a small header (`lsn`,
//! `magic`, `dt_id`) followed by an opaque payload owned by the data
//! structure the page belongs to. Page `pid` lives at byte offset
//! `pid * PAGE_SIZE` of the backing file.

use tundra_common::constants::{IO_ALIGNMENT, PAGE_SIZE};
use tundra_common::types::{DtId, Lsn, PageId};

/// Bytes of page header preceding the payload.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Payload bytes available to the owning data structure.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// One page image, as stored on disk and held in a buffer frame.
///
/// The struct is 512-aligned so a frame's page can be handed directly
/// to direct I/O.
#[repr(C, align(512))]
pub struct Page {
    /// Logical sequence number of the page's most recent modification.
    pub lsn: Lsn,
    /// Debugging aid: equals the page's id once the page has been
    /// written through the buffer manager.
    pub magic: u64,
    /// Owning data-structure instance.
    pub dt_id: DtId,
    /// Opaque payload.
    pub payload: [u8; PAGE_PAYLOAD_SIZE],
}

// The page image must match the on-disk geometry exactly.
const _: () = assert!(std::mem::size_of::<Page>() == PAGE_SIZE);
const _: () = assert!(std::mem::align_of::<Page>() == IO_ALIGNMENT);

impl Page {
    /// Reinitializes the image for a freshly allocated page.
    pub fn init(&mut self, pid: PageId, dt_id: DtId) {
        self.lsn = Lsn::ZERO;
        self.magic = pid.as_u64();
        self.dt_id = dt_id;
    }

    /// Allocates a zeroed page on the heap.
    pub fn boxed_zeroed() -> Box<Page> {
        let layout = std::alloc::Layout::new::<Page>();
        // Safety: Page is plain data, so the all-zero bit pattern is a
        // valid value; the allocation matches the layout.
        unsafe {
            let ptr = std::alloc::alloc_zeroed(layout) as *mut Page;
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        }
    }

    /// Views the whole image as bytes (for I/O).
    #[inline]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        // Safety: Page is repr(C) with size PAGE_SIZE and no padding
        // requirements beyond u8.
        unsafe { &*(self as *const Page as *const [u8; PAGE_SIZE]) }
    }

    /// Views the whole image as mutable bytes (for I/O).
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        // Safety: as above, plus exclusive access via &mut self.
        unsafe { &mut *(self as *mut Page as *mut [u8; PAGE_SIZE]) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<Page>(), PAGE_SIZE);
        assert_eq!(std::mem::align_of::<Page>(), IO_ALIGNMENT);
        assert_eq!(PAGE_HEADER_SIZE + PAGE_PAYLOAD_SIZE, PAGE_SIZE);
    }

    #[test]
    fn test_init() {
        let mut page = Page::boxed_zeroed();
        page.init(PageId::new(9), DtId::new(2));

        assert_eq!(page.lsn, Lsn::ZERO);
        assert_eq!(page.magic, 9);
        assert_eq!(page.dt_id, DtId::new(2));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut page = Page::boxed_zeroed();
        page.init(PageId::new(3), DtId::new(0));
        page.payload[0] = 0x5A;

        let bytes = *page.as_bytes();
        let mut other = Page::boxed_zeroed();
        other.as_bytes_mut().copy_from_slice(&bytes);

        assert_eq!(other.magic, 3);
        assert_eq!(other.payload[0], 0x5A);
    }
}
