//! Batched asynchronous page write-back.
//!
//! The page provider stages dirty cold pages here. [`AsyncWriteBuffer::add`]
//! copies the page image into an aligned staging slot, so the write is
//! decoupled from the frame: a reader may re-swizzle the frame to hot
//! while its old image is still in flight. The `is_wb` header flag
//! keeps the frame out of eviction until the write is acknowledged and
//! drained through [`AsyncWriteBuffer::for_each_written`].
//!
//! The actual submission goes through a [`WriteBackend`]: positioned
//! synchronous writes by default, io_uring when the `io-uring` feature
//! is enabled.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;

use tundra_common::constants::PAGE_SIZE;
use tundra_common::types::{Lsn, PageId};

use super::frame::BufferFrame;
use crate::file::{AlignedBuf, IoResult, StorageFile};

/// One write handed to a backend.
pub(crate) struct WriteRequest {
    /// Staging slot index, echoed back on completion.
    pub(crate) slot: usize,
    /// Source buffer (stable until the slot is recycled).
    pub(crate) ptr: *const u8,
    pub(crate) len: usize,
    /// Byte offset in the backing store.
    pub(crate) offset: u64,
}

/// Submission/completion interface of a write engine.
pub(crate) trait WriteBackend: Send {
    /// Submits the given requests.
    fn submit(&mut self, requests: &[WriteRequest]) -> IoResult<()>;

    /// Returns the slots of writes completed since the last poll,
    /// blocking for at least one completion when `inflight` is
    /// non-zero and the backend is truly asynchronous.
    fn poll(&mut self, inflight: usize) -> IoResult<Vec<usize>>;
}

/// Backend issuing positioned synchronous writes at submit time.
///
/// Completion is immediate, which keeps the buffer's protocol identical
/// to the asynchronous case: submitted slots surface on the next poll.
pub(crate) struct SyncBackend {
    store: Arc<StorageFile>,
    completed: Vec<usize>,
}

impl SyncBackend {
    pub(crate) fn new(store: Arc<StorageFile>) -> Self {
        Self {
            store,
            completed: Vec::new(),
        }
    }
}

impl WriteBackend for SyncBackend {
    fn submit(&mut self, requests: &[WriteRequest]) -> IoResult<()> {
        for request in requests {
            // Safety: the pointer covers a staging slot owned by the
            // AsyncWriteBuffer, untouched while the request is in
            // flight.
            let buf = unsafe { std::slice::from_raw_parts(request.ptr, request.len) };
            self.store.write_all_at(buf, request.offset)?;
            self.completed.push(request.slot);
        }
        Ok(())
    }

    fn poll(&mut self, _inflight: usize) -> IoResult<Vec<usize>> {
        Ok(std::mem::take(&mut self.completed))
    }
}

struct Slot {
    buf: AlignedBuf,
    pid: PageId,
    frame: Option<NonNull<BufferFrame>>,
    lsn: Lsn,
}

/// Fixed-capacity staging area for in-flight page writes.
pub(crate) struct AsyncWriteBuffer {
    slots: Vec<Slot>,
    free: Vec<usize>,
    pending: Vec<usize>,
    inflight: usize,
    ready: VecDeque<usize>,
    backend: Box<dyn WriteBackend>,
}

// Safety: the NonNull frame pointers reference the Sync frame arena;
// the buffer itself is owned by a single thread at a time.
unsafe impl Send for AsyncWriteBuffer {}

impl AsyncWriteBuffer {
    /// Creates a buffer of `batch_size` slots over the synchronous
    /// backend.
    pub(crate) fn new(store: Arc<StorageFile>, batch_size: usize) -> Self {
        Self::with_backend(batch_size, Box::new(SyncBackend::new(store)))
    }

    /// Creates a buffer over an explicit backend.
    pub(crate) fn with_backend(batch_size: usize, backend: Box<dyn WriteBackend>) -> Self {
        assert!(batch_size > 0);
        let slots = (0..batch_size)
            .map(|_| Slot {
                buf: AlignedBuf::zeroed(PAGE_SIZE),
                pid: PageId::INVALID,
                frame: None,
                lsn: Lsn::ZERO,
            })
            .collect();
        Self {
            slots,
            free: (0..batch_size).rev().collect(),
            pending: Vec::with_capacity(batch_size),
            inflight: 0,
            ready: VecDeque::with_capacity(batch_size),
            backend,
        }
    }

    /// Stages a frame's page for write-back.
    ///
    /// Returns false when every slot is occupied. On success the page
    /// image and its LSN are captured and the frame's `is_wb` flag is
    /// set; the caller must ensure the frame stays resident until the
    /// completion is drained.
    pub(crate) fn add(&mut self, frame: &BufferFrame) -> bool {
        debug_assert!(!frame.is_write_back());
        let Some(slot_idx) = self.free.pop() else {
            return false;
        };

        let slot = &mut self.slots[slot_idx];
        slot.buf.copy_from_slice(frame.page().as_bytes());
        slot.pid = frame.pid();
        slot.lsn = frame.page_lsn();
        slot.frame = Some(NonNull::from(frame));
        frame.set_write_back(true);

        self.pending.push(slot_idx);
        true
    }

    /// Hands every staged-but-unsubmitted slot to the backend.
    pub(crate) fn submit_if_necessary(&mut self) -> IoResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let requests: Vec<WriteRequest> = self
            .pending
            .iter()
            .map(|&slot_idx| {
                let slot = &self.slots[slot_idx];
                WriteRequest {
                    slot: slot_idx,
                    ptr: slot.buf.as_ptr(),
                    len: slot.buf.len(),
                    offset: slot.pid.byte_offset(PAGE_SIZE),
                }
            })
            .collect();
        self.backend.submit(&requests)?;
        self.inflight += self.pending.len();
        self.pending.clear();
        Ok(())
    }

    /// Collects completions; returns the number of newly completed
    /// writes.
    pub(crate) fn poll_events_sync(&mut self) -> IoResult<usize> {
        let done = self.backend.poll(self.inflight)?;
        self.inflight -= done.len();
        let count = done.len();
        self.ready.extend(done);
        Ok(count)
    }

    /// Invokes `visitor(frame, lsn_at_copy)` for up to `limit`
    /// completed writes and recycles their slots. Returns the number
    /// visited.
    pub(crate) fn for_each_written(
        &mut self,
        limit: usize,
        mut visitor: impl FnMut(&BufferFrame, Lsn),
    ) -> usize {
        let mut drained = 0;
        while drained < limit {
            let Some(slot_idx) = self.ready.pop_front() else {
                break;
            };
            let slot = &mut self.slots[slot_idx];
            let frame_ptr = slot.frame.take().expect("completed slot without frame");
            let lsn = slot.lsn;
            slot.pid = PageId::INVALID;
            slot.lsn = Lsn::ZERO;
            self.free.push(slot_idx);
            // Safety: eviction is blocked by `is_wb` between add and
            // this visit, so the frame pointer is still live.
            visitor(unsafe { frame_ptr.as_ref() }, lsn);
            drained += 1;
        }
        drained
    }

    /// True when nothing is staged, in flight, or awaiting drain.
    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.inflight == 0 && self.ready.is_empty()
    }
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub(crate) mod uring {
    //! io_uring write backend.

    use std::os::unix::io::RawFd;

    use io_uring::{opcode, types, IoUring};

    use super::{WriteBackend, WriteRequest};
    use crate::file::{IoError, IoResult, StorageFile};

    /// Write backend submitting through a private io_uring instance.
    pub(crate) struct UringBackend {
        ring: IoUring,
        fd: RawFd,
    }

    impl UringBackend {
        pub(crate) fn new(store: &StorageFile, depth: u32) -> IoResult<Self> {
            let ring = IoUring::new(depth).map_err(|e| IoError::UringError {
                message: format!("failed to create ring: {e}"),
            })?;
            Ok(Self {
                ring,
                fd: store.as_raw_fd(),
            })
        }
    }

    impl WriteBackend for UringBackend {
        fn submit(&mut self, requests: &[WriteRequest]) -> IoResult<()> {
            for request in requests {
                let entry = opcode::Write::new(
                    types::Fd(self.fd),
                    request.ptr,
                    request.len as u32,
                )
                .offset(request.offset)
                .build()
                .user_data(request.slot as u64);
                // Safety: the staging buffer outlives the submission;
                // the queue is drained below if full.
                while unsafe { self.ring.submission().push(&entry) }.is_err() {
                    self.ring.submit().map_err(|e| IoError::UringError {
                        message: format!("submit: {e}"),
                    })?;
                }
            }
            self.ring.submit().map_err(|e| IoError::UringError {
                message: format!("submit: {e}"),
            })?;
            Ok(())
        }

        fn poll(&mut self, inflight: usize) -> IoResult<Vec<usize>> {
            if inflight > 0 {
                self.ring
                    .submit_and_wait(1)
                    .map_err(|e| IoError::UringError {
                        message: format!("wait: {e}"),
                    })?;
            }
            let mut done = Vec::new();
            for cqe in self.ring.completion() {
                if cqe.result() < 0 {
                    return Err(IoError::UringError {
                        message: format!(
                            "write failed: {}",
                            std::io::Error::from_raw_os_error(-cqe.result())
                        ),
                    });
                }
                done.push(cqe.user_data() as usize);
            }
            Ok(done)
        }
    }
}
