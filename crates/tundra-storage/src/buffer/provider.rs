//! The background page provider.
//!
//! One thread, three phases per round:
//!
//! 1. **Cool**: while free + cooling frames sit below the cool
//!    watermark, sample random hot frames, descend to a resident child
//!    if the sample still has one swizzled (never unswizzle a page
//!    whose children are resident), and move terminal frames into a
//!    partition's cooling queue, unswizzling the parent swip.
//! 2. **Evict / stage**: while free frames sit below the free
//!    watermark, scan the cooling queue from the front: push clean
//!    frames back to the free list, stage dirty ones into the async
//!    write buffer.
//! 3. **Reap**: submit staged writes, poll completions, apply the
//!    written LSN, and evict frames that stayed cold. Frames a reader
//!    re-swizzled mid-flight are only acknowledged.
//!
//! Restart inside a phase abandons the current candidate and
//! resamples; unfinished work is picked up next round.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use tundra_common::types::PageId;

use super::error::BufferResult;
use super::frame::{BufferFrame, FrameState};
use super::latch::ExclusiveGuard;
use super::manager::BufferManager;
use super::partition::CioFrame;
use super::writer::AsyncWriteBuffer;

enum CoolOutcome {
    /// The candidate was moved into a cooling queue.
    Cooled,
    /// The candidate was unsuitable; resample.
    Skipped,
    /// A resident child was adopted as the next candidate.
    PickedChild(NonNull<BufferFrame>),
}

pub(crate) struct PageProvider {
    manager: Arc<BufferManager>,
    free_limit: usize,
    cool_limit: usize,
}

impl PageProvider {
    pub(crate) fn new(manager: Arc<BufferManager>) -> Self {
        let free_limit = manager.config().free_limit();
        let cool_limit = manager.config().cool_limit();
        Self {
            manager,
            free_limit,
            cool_limit,
        }
    }

    pub(crate) fn run(self) {
        tracing::info!(
            free_limit = self.free_limit,
            cool_limit = self.cool_limit,
            "page provider started"
        );
        let mut writer = AsyncWriteBuffer::new(
            Arc::clone(self.manager.store()),
            self.manager.config().async_batch_size,
        );
        let mut rng = rand::thread_rng();

        while self.manager.keep_running() {
            let cooled = self.phase_cool(&mut rng);
            let staged = self.phase_evict(&mut writer);
            let reaped = self.phase_reap(&mut writer);
            self.manager
                .counters()
                .provider_rounds
                .fetch_add(1, Ordering::Relaxed);

            if cooled == 0 && staged == 0 && reaped == 0 {
                std::thread::sleep(Duration::from_micros(100));
            }
        }

        tracing::info!("page provider stopped");
        self.manager.bg_thread_exited();
    }

    fn needs_cooling(&self) -> bool {
        self.manager.free_list().len() + self.manager.cooling_frames() < self.cool_limit
    }

    fn needs_eviction(&self) -> bool {
        self.manager.free_list().len() < self.free_limit
    }

    fn random_frame(&self, rng: &mut impl Rng) -> &BufferFrame {
        let index = rng.gen_range(0..self.manager.pool_frames());
        self.manager.frame_at(index)
    }

    // -------------------------------------------------------------------------
    // Phase 1
    // -------------------------------------------------------------------------

    fn phase_cool(&self, rng: &mut impl Rng) -> usize {
        let mut progressed = 0;
        let mut candidate: Option<NonNull<BufferFrame>> = None;
        // Bounded so the round always reaches eviction and reaping,
        // even when no sample is coolable.
        let mut attempts = self.manager.pool_frames() * 4;

        while self.needs_cooling() && self.manager.keep_running() && attempts > 0 {
            attempts -= 1;
            let frame = match candidate.take() {
                // Safety: child pointers come out of swizzled swips and
                // reference live arena frames; staleness is caught by
                // the state check and rechecks in try_cool.
                Some(child) => unsafe { child.as_ref() },
                None => self.random_frame(rng),
            };
            match self.try_cool(frame) {
                Ok(CoolOutcome::Cooled) => progressed += 1,
                Ok(CoolOutcome::PickedChild(child)) => candidate = Some(child),
                Ok(CoolOutcome::Skipped) | Err(_) => {}
            }
        }
        progressed
    }

    fn try_cool(&self, frame: &BufferFrame) -> BufferResult<CoolOutcome> {
        let mut guard = frame.latch().optimistic();
        if frame.state() != FrameState::Hot {
            return Ok(CoolOutcome::Skipped);
        }
        guard.recheck()?;

        // Descend to a resident child: cooling a non-leaf would strand
        // the hot pages reachable only through it.
        let dt_id = frame.page().dt_id;
        let mut child: Option<NonNull<BufferFrame>> = None;
        self.manager
            .registry()
            .iterate_children(dt_id, frame, &mut |swip| {
                if swip.is_swizzled() {
                    child = Some(swip.frame_ptr());
                    guard.recheck()?;
                    return Ok(false);
                }
                guard.recheck()?;
                Ok(true)
            })?;
        if let Some(child) = child {
            return Ok(CoolOutcome::PickedChild(child));
        }

        // Terminal frame: unswizzle it under child + parent exclusive
        // guards with the partition mutex held.
        let pid = frame.pid();
        let child_x = ExclusiveGuard::lock(&mut guard)?;
        let mut parent = self.manager.registry().find_parent(dt_id, frame)?;
        let swip_ptr = parent.swip_ptr();
        let parent_x = ExclusiveGuard::lock(&mut parent.guard)?;
        // Safety: the parent's exclusive latch is held; the swip is
        // stable for the rest of this section.
        let parent_swip = unsafe { swip_ptr.as_ref() };
        debug_assert!(parent_swip.is_swizzled());
        debug_assert!(std::ptr::eq(
            parent_swip.frame_ptr().as_ptr(),
            frame as *const BufferFrame as *mut BufferFrame
        ));

        let partition = self.manager.partition_for(pid);
        let mut part = partition.lock();
        debug_assert_eq!(frame.state(), FrameState::Hot);
        if part.inflight.contains_key(&pid) {
            // Some thread is still reading or draining this pid.
            return Ok(CoolOutcome::Skipped);
        }

        part.inflight.insert(pid, CioFrame::cooling());
        part.park_cooling(pid, frame);
        frame.set_state(FrameState::Cold);
        frame.set_cooled_by_read(false);
        parent_swip.unswizzle(pid);
        self.manager.cooling_count().fetch_add(1, Ordering::Relaxed);
        self.manager
            .counters()
            .unswizzled_pages
            .fetch_add(1, Ordering::Relaxed);

        drop(part);
        drop(parent_x);
        drop(child_x);
        Ok(CoolOutcome::Cooled)
    }

    // -------------------------------------------------------------------------
    // Phase 2
    // -------------------------------------------------------------------------

    fn phase_evict(&self, writer: &mut AsyncWriteBuffer) -> usize {
        if !self.needs_eviction() {
            return 0;
        }
        let mut progressed = 0;

        for partition in self.manager.partitions() {
            let mut part = partition.lock();
            let budget = self
                .free_limit
                .saturating_sub(self.manager.free_list().len());
            if budget == 0 {
                break;
            }

            let pids: Vec<PageId> = part.cooling.keys().copied().take(budget).collect();
            for pid in pids {
                let Some(&frame_ptr) = part.cooling.get(&pid) else {
                    continue;
                };
                // Safety: cooling entries reference live arena frames.
                let frame = unsafe { frame_ptr.as_ref() };
                if frame.is_write_back() || frame.cooled_by_read() {
                    continue;
                }

                if !frame.is_dirty() {
                    debug_assert_eq!(frame.state(), FrameState::Cold);
                    part.unpark_cooling(pid);
                    part.inflight.remove(&pid);
                    frame.reset();
                    self.manager.free_list().push(frame);
                    self.manager.cooling_count().fetch_sub(1, Ordering::Relaxed);
                    self.manager
                        .counters()
                        .evicted_pages
                        .fetch_add(1, Ordering::Relaxed);
                    progressed += 1;
                } else if writer.add(frame) {
                    self.manager
                        .counters()
                        .writes_submitted
                        .fetch_add(1, Ordering::Relaxed);
                    progressed += 1;
                } else {
                    self.manager
                        .counters()
                        .writes_submit_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        progressed
    }

    // -------------------------------------------------------------------------
    // Phase 3
    // -------------------------------------------------------------------------

    fn phase_reap(&self, writer: &mut AsyncWriteBuffer) -> usize {
        if writer.is_idle() {
            return 0;
        }

        if let Err(error) = writer.submit_if_necessary() {
            tracing::error!(%error, "async write submission failed");
            panic!("fatal I/O error submitting page writes: {error}");
        }
        let polled = match writer.poll_events_sync() {
            Ok(polled) => polled,
            Err(error) => {
                tracing::error!(%error, "async write completion failed");
                panic!("fatal I/O error completing page writes: {error}");
            }
        };
        if polled == 0 {
            return 0;
        }

        writer.for_each_written(polled, |frame, written_lsn| {
            debug_assert!(frame.is_write_back());
            let pid = frame.pid();
            let partition = self.manager.partition_for(pid);
            let mut part = partition.lock();

            frame.set_last_written_lsn(written_lsn);
            frame.set_write_back(false);
            self.manager
                .counters()
                .flushed_pages
                .fetch_add(1, Ordering::Relaxed);

            // Evict only frames that stayed cold and did not pick up
            // new modifications after the image was staged; a frame a
            // reader swizzled back to hot stays resident.
            if frame.state() == FrameState::Cold && !frame.is_dirty() {
                if part.unpark_cooling(pid).is_some() {
                    part.inflight.remove(&pid);
                    frame.reset();
                    self.manager.free_list().push(frame);
                    self.manager.cooling_count().fetch_sub(1, Ordering::Relaxed);
                    self.manager
                        .counters()
                        .evicted_pages
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use tempfile::tempdir;
    use tundra_common::types::{DtId, Lsn};

    use crate::buffer::config::BufferConfig;
    use crate::buffer::error::BufferError;
    use crate::buffer::registry::{DataStructure, DtMeta, DtType, ParentSwipHandler};
    use crate::buffer::swip::Swip;
    use crate::page::Page;

    /// A flat one-level index: the root frame's payload is an array of
    /// child swips. The root itself is anchored by the structure, so
    /// `find_parent` on it restarts and the provider leaves it hot.
    struct Directory {
        root: NonNull<BufferFrame>,
        children: AtomicUsize,
    }

    unsafe impl Send for Directory {}
    unsafe impl Sync for Directory {}

    impl Directory {
        fn root(&self) -> &BufferFrame {
            unsafe { self.root.as_ref() }
        }

        fn swips<'a>(&self, root: &'a BufferFrame) -> &'a [Swip] {
            let count = self.children.load(Ordering::Acquire);
            unsafe {
                std::slice::from_raw_parts(root.page().payload.as_ptr() as *const Swip, count)
            }
        }
    }

    impl DataStructure for Directory {
        fn iterate_children(
            &self,
            frame: &BufferFrame,
            visitor: &mut dyn FnMut(&Swip) -> BufferResult<bool>,
        ) -> BufferResult<()> {
            if !std::ptr::eq(frame, self.root()) {
                return Ok(()); // leaves have no children
            }
            for swip in self.swips(frame) {
                if !visitor(swip)? {
                    break;
                }
            }
            Ok(())
        }

        fn find_parent(&self, frame: &BufferFrame) -> BufferResult<ParentSwipHandler> {
            let root = self.root();
            if std::ptr::eq(frame, root) {
                return Err(BufferError::Restart); // the root stays anchored
            }
            let guard = root.latch().optimistic();
            for swip in self.swips(root) {
                if swip.is_swizzled() && std::ptr::eq(swip.frame_ptr().as_ptr(), frame) {
                    guard.recheck()?;
                    return Ok(ParentSwipHandler::new(guard, swip));
                }
            }
            guard.recheck()?;
            Err(BufferError::Restart)
        }
    }

    fn retry<T>(mut f: impl FnMut() -> BufferResult<T>) -> T {
        loop {
            match f() {
                Ok(value) => return value,
                Err(BufferError::Restart) => std::thread::yield_now(),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    fn test_manager(frames: usize, free_pct: u8, cool_pct: u8) -> (tempfile::TempDir, Arc<BufferManager>) {
        let dir = tempdir().unwrap();
        let config = BufferConfig::new(dir.path().join("pages.db"))
            .with_pool_frames(frames)
            .with_watermarks(free_pct, cool_pct)
            .with_direct_io(false)
            .with_page_provider(false);
        (dir, BufferManager::open(config).unwrap())
    }

    fn setup_directory(bm: &Arc<BufferManager>, children: usize) -> Arc<Directory> {
        bm.register_datastructure_type(DtType(0), DtMeta { name: "directory" });
        let root = retry(|| bm.allocate_page());
        let dir = Arc::new(Directory {
            root: root.as_ptr(),
            children: AtomicUsize::new(0),
        });
        let dt_id = bm.register_datastructure_instance(
            DtType(0),
            Arc::clone(&dir) as Arc<dyn DataStructure>,
        );
        let mut root = root;
        root.page_mut().dt_id = dt_id;
        drop(root);

        for _ in 0..children {
            add_child(bm, &dir, dt_id);
        }
        dir
    }

    fn add_child(bm: &Arc<BufferManager>, dir: &Directory, dt_id: DtId) -> PageId {
        let mut child = retry(|| bm.allocate_page());
        let pid = child.pid();
        child.page_mut().dt_id = dt_id;
        child.page_mut().lsn = Lsn::new(1);
        child.page_mut().payload[0] = pid.as_u64() as u8;
        let child_ptr = child.as_ptr();
        drop(child);

        let root = dir.root();
        retry(|| {
            let mut guard = root.latch().optimistic();
            let x = ExclusiveGuard::lock(&mut guard)?;
            let index = dir.children.load(Ordering::Acquire);
            // Safety: the root's exclusive latch is held and the slot
            // is not yet published through the children counter.
            unsafe {
                (root.page_mut().payload.as_mut_ptr() as *mut Swip)
                    .add(index)
                    .write(Swip::to_frame(child_ptr));
            }
            dir.children.store(index + 1, Ordering::Release);
            drop(x);
            Ok(())
        });
        pid
    }

    fn read_child(bm: &BufferManager, dir: &Directory, index: usize) -> u8 {
        retry(|| {
            let root = dir.root();
            let mut guard = root.latch().optimistic();
            let swips = dir.swips(root);
            guard.recheck()?;
            let frame = bm.resolve_swip(&mut guard, &swips[index])?;
            let value = frame.page().payload[0];
            guard.recheck()?;
            Ok(value)
        })
    }

    #[test]
    fn test_phase_cool_parks_terminal_frames() {
        let (_dir, bm) = test_manager(32, 25, 50);
        let dir = setup_directory(&bm, 20);

        // free = 32 - 21 = 11, cooling = 0, cool limit = 16.
        let provider = PageProvider::new(Arc::clone(&bm));
        provider.phase_cool(&mut rand::thread_rng());

        assert_eq!(bm.free_frames() + bm.cooling_frames(), 16);
        assert_eq!(bm.cooling_frames(), 5);
        assert_eq!(bm.stats().unswizzled_pages, 5);

        // Cooled children are reachable again through the cold path.
        let cooled: Vec<usize> = (0..20)
            .filter(|&i| !dir.swips(dir.root())[i].is_swizzled())
            .collect();
        assert_eq!(cooled.len(), 5);
        for index in cooled {
            let expected = dir.swips(dir.root())[index].page_id().as_u64() as u8;
            assert_eq!(read_child(&bm, &dir, index), expected);
        }
        assert_eq!(bm.cooling_frames(), 0);
    }

    #[test]
    fn test_dirty_eviction_cycle() {
        let (_dir, bm) = test_manager(32, 25, 50);
        let dir = setup_directory(&bm, 26);

        // free = 32 - 27 = 5 < free limit 8; every child is dirty.
        let provider = PageProvider::new(Arc::clone(&bm));
        provider.phase_cool(&mut rand::thread_rng());
        assert_eq!(bm.free_frames() + bm.cooling_frames(), 16);

        let mut writer = AsyncWriteBuffer::new(
            Arc::clone(bm.store()),
            bm.config().async_batch_size,
        );
        let staged = provider.phase_evict(&mut writer);
        assert_eq!(staged, 3); // free limit (8) minus free frames (5)
        assert_eq!(bm.stats().writes_submitted, 3);

        let reaped = provider.phase_reap(&mut writer);
        assert_eq!(reaped, 3);
        assert_eq!(bm.stats().flushed_pages, 3);
        assert_eq!(bm.stats().evicted_pages, 3);
        assert_eq!(bm.free_frames(), 8);

        // Evicted pages are clean on disk with their authored payload.
        bm.fdata_sync().unwrap();
        let unswizzled: Vec<PageId> = (0..26)
            .map(|i| &dir.swips(dir.root())[i])
            .filter(|s| !s.is_swizzled())
            .map(|s| s.page_id())
            .collect();
        let mut verified = 0;
        for pid in unswizzled {
            let mut page = Page::boxed_zeroed();
            if bm.read_page_sync(pid, &mut page).is_ok() && page.lsn == Lsn::new(1) {
                assert_eq!(page.magic, pid.as_u64());
                assert_eq!(page.payload[0], pid.as_u64() as u8);
                verified += 1;
            }
        }
        assert!(verified >= 3);
    }

    #[test]
    fn test_reswizzle_race_is_not_evicted() {
        let (_dir, bm) = test_manager(32, 25, 50);
        let dir = setup_directory(&bm, 26);

        let provider = PageProvider::new(Arc::clone(&bm));
        provider.phase_cool(&mut rand::thread_rng());

        let mut writer = AsyncWriteBuffer::new(
            Arc::clone(bm.store()),
            bm.config().async_batch_size,
        );
        let staged = provider.phase_evict(&mut writer);
        assert_eq!(staged, 3);

        // A reader touches one staged frame before the write completes.
        let staged_frame = (0..bm.pool_frames())
            .map(|i| bm.frame_at(i))
            .find(|f| f.is_write_back())
            .expect("a staged frame");
        let staged_pid = staged_frame.pid();
        let index = (0..26)
            .position(|i| dir.swips(dir.root())[i].page_id() == staged_pid)
            .expect("staged child index");
        read_child(&bm, &dir, index);
        assert_eq!(staged_frame.state(), FrameState::Hot);
        assert!(staged_frame.is_write_back());

        let free_before = bm.free_frames();
        let reaped = provider.phase_reap(&mut writer);
        assert_eq!(reaped, 3);

        // The hot frame was acknowledged, not evicted.
        assert_eq!(staged_frame.state(), FrameState::Hot);
        assert!(!staged_frame.is_write_back());
        assert_eq!(staged_frame.last_written_lsn(), Lsn::new(1));
        assert_eq!(bm.stats().evicted_pages, 2);
        assert_eq!(bm.free_frames(), free_before + 2);
    }
}
