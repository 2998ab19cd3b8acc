//! Registry of data structures living on top of the buffer manager.
//!
//! The buffer manager itself cannot walk an index; cooling a page needs
//! to know whether the candidate frame still has resident children, and
//! unswizzling needs the swip in the *parent* that references the
//! candidate. Each registered data-structure instance supplies both
//! capabilities through the [`DataStructure`] trait.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use tundra_common::types::DtId;

use super::error::{BufferError, BufferResult};
use super::frame::BufferFrame;
use super::latch::OptimisticGuard;
use super::swip::Swip;

/// Identifier of a registered data-structure *type* (e.g. "b-tree").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DtType(pub u8);

/// Static metadata describing a data-structure type.
#[derive(Debug, Clone)]
pub struct DtMeta {
    /// Human-readable name, used in diagnostics.
    pub name: &'static str,
}

/// The parent-side handle produced by [`DataStructure::find_parent`]:
/// an optimistic guard over the parent frame plus the child swip inside
/// it.
pub struct ParentSwipHandler {
    /// Guard over the parent frame containing the swip.
    pub guard: OptimisticGuard,
    swip: NonNull<Swip>,
}

impl ParentSwipHandler {
    /// Creates a handler from a parent guard and the child swip it
    /// covers.
    pub fn new(guard: OptimisticGuard, swip: &Swip) -> Self {
        Self {
            guard,
            swip: NonNull::from(swip),
        }
    }

    /// The child swip inside the parent frame.
    #[inline]
    pub fn swip(&self) -> &Swip {
        // Safety: the swip lives inside a buffer frame in the arena;
        // its coherence is governed by `guard`.
        unsafe { self.swip.as_ref() }
    }

    /// Raw pointer to the child swip, usable while `guard` is borrowed
    /// for an exclusive upgrade.
    #[inline]
    pub fn swip_ptr(&self) -> NonNull<Swip> {
        self.swip
    }
}

/// Capabilities a registered data structure exposes to the buffer
/// manager.
///
/// Both methods are called under optimistic guards held by the buffer
/// manager and must themselves follow the guard protocol: speculative
/// reads, Restart on validation failure.
pub trait DataStructure: Send + Sync {
    /// Visits each child swip of `frame`. The visitor returns
    /// `Ok(true)` to continue and `Ok(false)` to stop early.
    fn iterate_children(
        &self,
        frame: &BufferFrame,
        visitor: &mut dyn FnMut(&Swip) -> BufferResult<bool>,
    ) -> BufferResult<()>;

    /// Locates the swip referencing `frame` in its parent and returns
    /// it together with an optimistic guard over that parent.
    fn find_parent(&self, frame: &BufferFrame) -> BufferResult<ParentSwipHandler>;
}

struct DtTypeEntry {
    #[allow(dead_code)] // Read by diagnostics only.
    meta: DtMeta,
}

/// Table of registered data-structure types and instances.
pub struct DtRegistry {
    types: RwLock<HashMap<DtType, DtTypeEntry>>,
    instances: RwLock<HashMap<DtId, Arc<dyn DataStructure>>>,
    next_instance: AtomicU64,
}

impl DtRegistry {
    pub(crate) fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            next_instance: AtomicU64::new(0),
        }
    }

    /// Registers a data-structure type.
    pub fn register_type(&self, dt_type: DtType, meta: DtMeta) {
        self.types.write().insert(dt_type, DtTypeEntry { meta });
    }

    /// Registers an instance of a previously registered type and
    /// returns its id.
    ///
    /// # Panics
    ///
    /// Panics if the type was never registered.
    pub fn register_instance(
        &self,
        dt_type: DtType,
        instance: Arc<dyn DataStructure>,
    ) -> DtId {
        assert!(
            self.types.read().contains_key(&dt_type),
            "unregistered data-structure type {dt_type:?}"
        );
        let id = DtId::new(self.next_instance.fetch_add(1, Ordering::Relaxed));
        self.instances.write().insert(id, instance);
        id
    }

    fn instance(&self, dt_id: DtId) -> BufferResult<Arc<dyn DataStructure>> {
        // An unknown id means the frame header was read mid-transition;
        // the caller's guard would fail recheck anyway.
        self.instances
            .read()
            .get(&dt_id)
            .cloned()
            .ok_or(BufferError::Restart)
    }

    /// Dispatches [`DataStructure::iterate_children`] for the instance
    /// owning `frame`.
    pub fn iterate_children(
        &self,
        dt_id: DtId,
        frame: &BufferFrame,
        visitor: &mut dyn FnMut(&Swip) -> BufferResult<bool>,
    ) -> BufferResult<()> {
        self.instance(dt_id)?.iterate_children(frame, visitor)
    }

    /// Dispatches [`DataStructure::find_parent`] for the instance
    /// owning `frame`.
    pub fn find_parent(&self, dt_id: DtId, frame: &BufferFrame) -> BufferResult<ParentSwipHandler> {
        self.instance(dt_id)?.find_parent(frame)
    }
}

impl std::fmt::Debug for DtRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtRegistry")
            .field("types", &self.types.read().len())
            .field("instances", &self.instances.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoChildren;

    impl DataStructure for NoChildren {
        fn iterate_children(
            &self,
            _frame: &BufferFrame,
            _visitor: &mut dyn FnMut(&Swip) -> BufferResult<bool>,
        ) -> BufferResult<()> {
            Ok(())
        }

        fn find_parent(&self, _frame: &BufferFrame) -> BufferResult<ParentSwipHandler> {
            Err(BufferError::Restart)
        }
    }

    #[test]
    fn test_register_and_dispatch() {
        let registry = DtRegistry::new();
        registry.register_type(DtType(0), DtMeta { name: "test" });
        let id = registry.register_instance(DtType(0), Arc::new(NoChildren));

        let frame = BufferFrame::boxed_zeroed();
        let mut visited = 0;
        registry
            .iterate_children(id, &frame, &mut |_swip| {
                visited += 1;
                Ok(true)
            })
            .unwrap();
        assert_eq!(visited, 0);
    }

    #[test]
    fn test_unknown_instance_restarts() {
        let registry = DtRegistry::new();
        let frame = BufferFrame::boxed_zeroed();
        let result = registry.iterate_children(DtId::new(99), &frame, &mut |_| Ok(true));
        assert!(matches!(result, Err(BufferError::Restart)));
    }

    #[test]
    #[should_panic(expected = "unregistered data-structure type")]
    fn test_instance_requires_type() {
        let registry = DtRegistry::new();
        registry.register_instance(DtType(3), Arc::new(NoChildren));
    }

    #[test]
    fn test_instance_ids_unique() {
        let registry = DtRegistry::new();
        registry.register_type(DtType(0), DtMeta { name: "test" });
        let a = registry.register_instance(DtType(0), Arc::new(NoChildren));
        let b = registry.register_instance(DtType(0), Arc::new(NoChildren));
        assert_ne!(a, b);
    }
}
