//! Lock-free stack of free buffer frames.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::error::{BufferError, BufferResult};
use super::frame::{BufferFrame, FrameState};

/// A Treiber stack threaded through the frames' `next_free` header
/// field.
///
/// The counter is maintained with relaxed updates and may briefly lag
/// the true length; the watermark checks that consume it only need an
/// approximation.
pub struct FreeList {
    head: AtomicPtr<BufferFrame>,
    counter: AtomicUsize,
}

impl FreeList {
    /// Creates an empty free list.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Pushes a frame.
    ///
    /// The frame must already be reset to the `Free` state and must not
    /// be latched.
    pub fn push(&self, frame: &BufferFrame) {
        debug_assert_eq!(frame.state(), FrameState::Free);
        debug_assert!(!frame.latch().is_exclusively_latched());

        let node = frame as *const BufferFrame as *mut BufferFrame;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            frame.set_next_free(head);
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops a frame, or signals Restart when the list is empty.
    pub fn pop(&self) -> BufferResult<&BufferFrame> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return Err(BufferError::Restart);
            }
            // Safety: frames live in the manager's arena for its whole
            // lifetime; a non-null head always points at one of them.
            let frame = unsafe { &*head };
            let next = frame.next_free();
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                frame.set_next_free(ptr::null_mut());
                self.counter.fetch_sub(1, Ordering::Relaxed);
                debug_assert_eq!(frame.state(), FrameState::Free);
                return Ok(frame);
            }
        }
    }

    /// Approximate number of frames on the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    /// True if the list is (approximately) empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_frames(count: usize) -> Vec<&'static BufferFrame> {
        (0..count)
            .map(|_| &*Box::leak(BufferFrame::boxed_zeroed()))
            .collect()
    }

    #[test]
    fn test_pop_empty_restarts() {
        let list = FreeList::new();
        assert!(matches!(list.pop(), Err(BufferError::Restart)));
    }

    #[test]
    fn test_push_pop_lifo() {
        let frames = leak_frames(3);
        let list = FreeList::new();
        for f in &frames {
            list.push(f);
        }
        assert_eq!(list.len(), 3);

        let a = list.pop().unwrap();
        let b = list.pop().unwrap();
        let c = list.pop().unwrap();
        assert!(std::ptr::eq(a, frames[2]));
        assert!(std::ptr::eq(b, frames[1]));
        assert!(std::ptr::eq(c, frames[0]));
        assert!(a.next_free().is_null());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_concurrent_push_pop() {
        use std::sync::Arc;

        let frames = leak_frames(64);
        let list = Arc::new(FreeList::new());
        for f in &frames {
            list.push(f);
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let list = Arc::clone(&list);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Ok(frame) = list.pop() {
                        list.push(frame);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Every frame must still be reachable exactly once.
        let mut popped = 0;
        while list.pop().is_ok() {
            popped += 1;
        }
        assert_eq!(popped, 64);
    }
}
