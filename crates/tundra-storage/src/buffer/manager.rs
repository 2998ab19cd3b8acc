//! The buffer manager facade.
//!
//! Owns the frame arena, the free list, the partitioned cooling state,
//! the backing store, and the background threads. Worker threads come
//! here to allocate pages and to resolve unswizzled swips; the page
//! provider comes here to cool, evict, and flush.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tundra_common::constants::{ALLOC_FREE_HEADROOM, PAGE_SIZE};
use tundra_common::types::{DtId, Lsn, PageId};

use super::config::BufferConfig;
use super::error::{BufferError, BufferResult};
use super::frame::{BufferFrame, FrameState};
use super::free_list::FreeList;
use super::latch::{ExclusiveGuard, OptimisticGuard, RawExclusiveGuard};
use super::partition::{CioFrame, CioState, Partition};
use super::provider::PageProvider;
use super::registry::{DataStructure, DtMeta, DtRegistry, DtType};
use super::swip::Swip;
use super::BufferStats;
use crate::file::{OpenOptions, StorageFile};
use crate::page::Page;

/// The fixed arena of buffer frames.
///
/// Frames never move: swips and free-list links are raw pointers into
/// this allocation, which lives as long as the manager.
struct FrameArena {
    ptr: NonNull<BufferFrame>,
    len: usize,
}

impl FrameArena {
    fn alloc(len: usize) -> Self {
        let layout = std::alloc::Layout::array::<BufferFrame>(len).expect("arena layout");
        // Safety: BufferFrame is valid all-zero; the allocation matches
        // the layout and is reset frame by frame before use.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) as *mut BufferFrame };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self { ptr, len }
    }

    #[inline]
    fn as_slice(&self) -> &[BufferFrame] {
        // Safety: the arena owns `len` initialized frames.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for FrameArena {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::array::<BufferFrame>(self.len).expect("arena layout");
        // Safety: allocated in `alloc` with the same layout; frames are
        // plain data plus atomics, nothing to drop individually.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout) };
    }
}

// Safety: the arena is an immutable span of Sync frames.
unsafe impl Send for FrameArena {}
unsafe impl Sync for FrameArena {}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) allocated_pages: AtomicU64,
    pub(crate) swizzled_pages: AtomicU64,
    pub(crate) unswizzled_pages: AtomicU64,
    pub(crate) flushed_pages: AtomicU64,
    pub(crate) evicted_pages: AtomicU64,
    pub(crate) page_reads: AtomicU64,
    pub(crate) writes_submitted: AtomicU64,
    pub(crate) writes_submit_failed: AtomicU64,
    pub(crate) provider_rounds: AtomicU64,
}

/// A freshly allocated, exclusively latched frame.
///
/// The caller attaches the frame to an index by swizzling some parent
/// swip to [`ExclusiveFrame::as_ptr`] before dropping the handle, which
/// releases the latch.
pub struct ExclusiveFrame<'a> {
    frame: &'a BufferFrame,
    guard: Option<RawExclusiveGuard<'a>>,
}

impl<'a> ExclusiveFrame<'a> {
    /// The underlying frame.
    #[inline]
    pub fn frame(&self) -> &'a BufferFrame {
        self.frame
    }

    /// The frame's page id.
    #[inline]
    pub fn pid(&self) -> PageId {
        self.frame.pid()
    }

    /// Pointer form, for swizzling into a parent swip.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<BufferFrame> {
        NonNull::from(self.frame)
    }

    /// The page image.
    #[inline]
    pub fn page(&self) -> &Page {
        self.frame.page()
    }

    /// Mutable page image; sound because the latch is held.
    #[inline]
    pub fn page_mut(&mut self) -> &mut Page {
        // Safety: self holds the frame's exclusive latch.
        unsafe { self.frame.page_mut() }
    }

    /// Releases the latch and returns the bare frame.
    pub fn release(mut self) -> &'a BufferFrame {
        if let Some(guard) = self.guard.take() {
            guard.unlock();
        }
        self.frame
    }
}

impl Drop for ExclusiveFrame<'_> {
    fn drop(&mut self) {
        // The Option guard drops here, releasing the latch.
        let _ = self.guard.take();
    }
}

impl std::fmt::Debug for ExclusiveFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveFrame")
            .field("pid", &self.pid())
            .finish()
    }
}

/// The buffer manager.
///
/// Create one with [`BufferManager::open`]; share it as an `Arc`. Call
/// [`BufferManager::stop_background_threads`] (or
/// [`BufferManager::persist`]) before dropping the last handle so the
/// provider thread lets go of its clone.
pub struct BufferManager {
    config: BufferConfig,
    arena: FrameArena,
    free_list: FreeList,
    partitions: Vec<Partition>,
    partition_mask: u64,
    store: Arc<StorageFile>,
    registry: DtRegistry,
    next_pid: AtomicU64,
    cooling_count: AtomicUsize,
    counters: Counters,
    keep_running: AtomicBool,
    bg_threads: AtomicUsize,
}

impl BufferManager {
    /// Opens the backing store, builds the frame pool, and starts the
    /// configured background threads.
    pub fn open(config: BufferConfig) -> BufferResult<Arc<Self>> {
        config.validate().map_err(BufferError::config)?;

        let mut options = OpenOptions::for_store()
            .truncate(config.truncate)
            .direct_io(config.direct_io);
        if config.preallocate_gib > 0 {
            options = options.preallocate(config.preallocate_gib << 30);
        }
        let store = Arc::new(StorageFile::open(&config.store_path, &options)?);

        let pool_frames = config.pool_frames();
        let arena = FrameArena::alloc(pool_frames);
        let free_list = FreeList::new();
        for frame in arena.as_slice() {
            frame.reset();
            free_list.push(frame);
        }

        let partitions = vec![Partition::new(config.cooling_capacity())];
        let partition_mask = partitions.len() as u64 - 1;

        let manager = Arc::new(Self {
            config,
            arena,
            free_list,
            partitions,
            partition_mask,
            store,
            registry: DtRegistry::new(),
            next_pid: AtomicU64::new(0),
            cooling_count: AtomicUsize::new(0),
            counters: Counters::default(),
            keep_running: AtomicBool::new(true),
            bg_threads: AtomicUsize::new(0),
        });

        if manager.config.page_provider {
            Self::spawn_page_provider(&manager);
        }
        if manager.config.debug_stats {
            Self::spawn_diagnostics(&manager);
        }

        tracing::info!(
            frames = pool_frames,
            store = %manager.config.store_path.display(),
            "buffer manager online"
        );
        Ok(manager)
    }

    fn spawn_page_provider(manager: &Arc<Self>) {
        manager.bg_threads.fetch_add(1, Ordering::AcqRel);
        let manager = Arc::clone(manager);
        std::thread::Builder::new()
            .name("page_provider".into())
            .spawn(move || PageProvider::new(manager).run())
            .expect("failed to spawn page provider thread");
    }

    fn spawn_diagnostics(manager: &Arc<Self>) {
        manager.bg_threads.fetch_add(1, Ordering::AcqRel);
        let manager = Arc::clone(manager);
        std::thread::Builder::new()
            .name("buffer_diag".into())
            .spawn(move || {
                while manager.keep_running() {
                    std::thread::sleep(std::time::Duration::from_secs(1));
                    let stats = manager.stats();
                    tracing::debug!(?stats, "buffer manager counters");
                }
                manager.bg_threads.fetch_sub(1, Ordering::AcqRel);
            })
            .expect("failed to spawn diagnostics thread");
    }

    // -------------------------------------------------------------------------
    // Page lifecycle
    // -------------------------------------------------------------------------

    /// Allocates a fresh page in an exclusively latched hot frame.
    ///
    /// Signals Restart while the free list is nearly exhausted, which
    /// throttles allocators until the provider replenishes it.
    pub fn allocate_page(&self) -> BufferResult<ExclusiveFrame<'_>> {
        if self.free_list.len() < ALLOC_FREE_HEADROOM {
            return Err(BufferError::Restart);
        }
        let pid = PageId::new(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let frame = self.free_list.pop()?;
        debug_assert_eq!(frame.state(), FrameState::Free);

        let guard = frame.latch().lock_exclusive_raw();
        frame.set_pid(pid);
        frame.set_state(FrameState::Hot);
        frame.set_last_written_lsn(Lsn::ZERO);
        // Safety: the exclusive latch was just acquired.
        let page = unsafe { frame.page_mut() };
        page.lsn = Lsn::ZERO;
        page.magic = pid.as_u64();

        self.counters.allocated_pages.fetch_add(1, Ordering::Relaxed);
        Ok(ExclusiveFrame {
            frame,
            guard: Some(guard),
        })
    }

    /// Returns a frame to the free list.
    ///
    /// The page id slot is not recycled; id reuse is future work.
    pub fn reclaim_page(&self, frame: ExclusiveFrame<'_>) {
        let bf = frame.frame;
        bf.reset();
        drop(frame); // releases the latch
        self.free_list.push(bf);
    }

    /// Resolves a child swip to a resident frame.
    ///
    /// `parent` must guard the frame containing `swip`. On the fast
    /// path the swip is already swizzled and the frame is returned
    /// after validating the parent. Otherwise the page is staged
    /// through the reading/cooling protocol and the call signals
    /// Restart so the caller repeats its traversal; the reference is
    /// only valid while the parent guard validates.
    pub fn resolve_swip(
        &self,
        parent: &mut OptimisticGuard,
        swip: &Swip,
    ) -> BufferResult<&BufferFrame> {
        if swip.is_swizzled() {
            // Safety: validated by the parent recheck below.
            let frame = unsafe { swip.as_frame() };
            parent.recheck()?;
            return Ok(frame);
        }

        let pid = swip.page_id();
        let partition = self.partition_for(pid);
        let mut part = partition.lock();
        parent.recheck()?;
        debug_assert!(!swip.is_swizzled());

        if !part.inflight.contains_key(&pid) {
            // Case A: page miss; this thread becomes the load winner.
            if self.free_list.len() < ALLOC_FREE_HEADROOM {
                drop(part);
                for _ in 0..1024 {
                    if self.free_list.len() >= ALLOC_FREE_HEADROOM {
                        break;
                    }
                    std::thread::yield_now();
                }
                return Err(BufferError::Restart);
            }
            let frame = self.free_list.pop()?;
            let frame_guard = frame.latch().lock_exclusive_raw();

            let cio = CioFrame::reading();
            let rendezvous = Arc::clone(&cio.rendezvous);
            part.inflight.insert(pid, cio);
            drop(part);

            // The read happens without the partition mutex; only the
            // fresh frame's private latch is held.
            // Safety: the exclusive latch was just acquired.
            let page = unsafe { frame.page_mut() };
            if let Err(error) = self.read_page_sync(pid, page) {
                tracing::error!(%pid, %error, "page read failed mid-resolve");
                panic!("fatal I/O error reading page {pid}: {error}");
            }
            debug_assert_eq!(page.magic, pid.as_u64(), "magic mismatch for page {pid}");

            frame.set_pid(pid);
            frame.set_last_written_lsn(page.lsn);
            frame.set_write_back(false);
            frame.set_state(FrameState::Cold);

            let mut part = partition.lock();
            let entry = part.inflight.get_mut(&pid).expect("load entry vanished");
            entry.state = CioState::Cooling;
            part.park_cooling(pid, frame);
            self.cooling_count.fetch_add(1, Ordering::Relaxed);
            frame.set_cooled_by_read(true);
            frame_guard.unlock();
            drop(part);
            rendezvous.release();

            return Err(BufferError::Restart);
        }

        let inner = &mut *part;
        let (state, readers, rendezvous) = {
            let cio = inner.inflight.get(&pid).expect("checked above");
            (
                cio.state,
                Arc::clone(&cio.readers),
                Arc::clone(&cio.rendezvous),
            )
        };

        match state {
            CioState::Reading => {
                // Case B: another thread is loading; rendezvous with it.
                readers.fetch_add(1, Ordering::AcqRel);
                drop(part);

                rendezvous.wait();

                if readers.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let mut part = partition.lock();
                    if readers.load(Ordering::Acquire) == 0 {
                        part.inflight.remove(&pid);
                    }
                }
                Err(BufferError::Restart)
            }
            CioState::Cooling => {
                // Case C: resident and cooling; promote back to hot.
                let frame_ptr = *inner.cooling.get(&pid).expect("cooling frame missing");
                // Safety: pointers in the cooling queue reference live
                // arena frames.
                let frame = unsafe { frame_ptr.as_ref() };
                debug_assert_eq!(frame.pid(), pid);

                let swizzle_guard = ExclusiveGuard::lock(parent)?;
                swip.swizzle(frame_ptr);
                inner.unpark_cooling(pid);
                self.cooling_count.fetch_sub(1, Ordering::Relaxed);
                debug_assert_eq!(frame.state(), FrameState::Cold);
                frame.set_state(FrameState::Hot);

                let mut should_clean = true;
                if frame.cooled_by_read()
                    && readers.fetch_sub(1, Ordering::AcqRel) > 1
                {
                    should_clean = false;
                }
                if should_clean {
                    inner.inflight.remove(&pid);
                }

                self.counters.swizzled_pages.fetch_add(1, Ordering::Relaxed);
                drop(swizzle_guard);
                drop(part);
                Ok(frame)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Backing store
    // -------------------------------------------------------------------------

    /// Synchronously reads page `pid` into `page`.
    pub fn read_page_sync(&self, pid: PageId, page: &mut Page) -> BufferResult<()> {
        self.store
            .read_exact_at(page.as_bytes_mut(), pid.byte_offset(PAGE_SIZE))?;
        self.counters.page_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Synchronously writes `page` at page `pid`'s slot.
    pub fn write_page_sync(&self, pid: PageId, page: &Page) -> BufferResult<()> {
        self.store
            .write_all_at(page.as_bytes(), pid.byte_offset(PAGE_SIZE))?;
        Ok(())
    }

    /// Flushes backing-store data to the device.
    pub fn fdata_sync(&self) -> BufferResult<()> {
        self.store.sync_data()?;
        Ok(())
    }

    /// Stops the background threads, then synchronously flushes every
    /// dirty resident page and syncs the store.
    ///
    /// Worker threads must be quiesced first; restart/recovery is out
    /// of scope, this just leaves the store physically consistent.
    pub fn persist(&self) -> BufferResult<()> {
        self.stop_background_threads();
        let mut flushed = 0u64;
        for frame in self.arena.as_slice() {
            if frame.state() != FrameState::Free && frame.is_dirty() {
                self.write_page_sync(frame.pid(), frame.page())?;
                frame.set_last_written_lsn(frame.page_lsn());
                flushed += 1;
            }
        }
        self.counters
            .flushed_pages
            .fetch_add(flushed, Ordering::Relaxed);
        self.fdata_sync()
    }

    // -------------------------------------------------------------------------
    // Data-structure registry
    // -------------------------------------------------------------------------

    /// Registers a data-structure type.
    pub fn register_datastructure_type(&self, dt_type: DtType, meta: DtMeta) {
        self.registry.register_type(dt_type, meta);
    }

    /// Registers a data-structure instance and returns its id.
    pub fn register_datastructure_instance(
        &self,
        dt_type: DtType,
        instance: Arc<dyn DataStructure>,
    ) -> DtId {
        self.registry.register_instance(dt_type, instance)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Number of frames in the pool.
    pub fn pool_frames(&self) -> usize {
        self.arena.len
    }

    /// High-water mark of allocated page ids.
    pub fn consumed_pages(&self) -> u64 {
        self.next_pid.load(Ordering::Relaxed)
    }

    /// Approximate number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_list.len()
    }

    /// Approximate number of cooling frames.
    pub fn cooling_frames(&self) -> usize {
        self.cooling_count.load(Ordering::Relaxed)
    }

    /// Snapshot of the manager's counters.
    pub fn stats(&self) -> BufferStats {
        let c = &self.counters;
        BufferStats {
            allocated_pages: c.allocated_pages.load(Ordering::Relaxed),
            swizzled_pages: c.swizzled_pages.load(Ordering::Relaxed),
            unswizzled_pages: c.unswizzled_pages.load(Ordering::Relaxed),
            flushed_pages: c.flushed_pages.load(Ordering::Relaxed),
            evicted_pages: c.evicted_pages.load(Ordering::Relaxed),
            page_reads: c.page_reads.load(Ordering::Relaxed),
            writes_submitted: c.writes_submitted.load(Ordering::Relaxed),
            writes_submit_failed: c.writes_submit_failed.load(Ordering::Relaxed),
            provider_rounds: c.provider_rounds.load(Ordering::Relaxed),
            free_frames: self.free_frames(),
            cooling_frames: self.cooling_frames(),
        }
    }

    /// Signals the background threads to stop and waits for them.
    pub fn stop_background_threads(&self) {
        self.keep_running.store(false, Ordering::Release);
        while self.bg_threads.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
    }

    // -------------------------------------------------------------------------
    // Crate-internal plumbing
    // -------------------------------------------------------------------------

    #[inline]
    pub(crate) fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::Acquire)
    }

    pub(crate) fn bg_thread_exited(&self) {
        self.bg_threads.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn partition_for(&self, pid: PageId) -> &Partition {
        &self.partitions[(pid.as_u64() & self.partition_mask) as usize]
    }

    #[inline]
    pub(crate) fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    #[inline]
    pub(crate) fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    #[inline]
    pub(crate) fn cooling_count(&self) -> &AtomicUsize {
        &self.cooling_count
    }

    #[inline]
    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    #[inline]
    pub(crate) fn registry(&self) -> &DtRegistry {
        &self.registry
    }

    #[inline]
    pub(crate) fn store(&self) -> &Arc<StorageFile> {
        &self.store
    }

    #[inline]
    pub(crate) fn config(&self) -> &BufferConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn frame_at(&self, index: usize) -> &BufferFrame {
        &self.arena.as_slice()[index]
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("pool_frames", &self.pool_frames())
            .field("free_frames", &self.free_frames())
            .field("cooling_frames", &self.cooling_frames())
            .field("consumed_pages", &self.consumed_pages())
            .finish()
    }
}
