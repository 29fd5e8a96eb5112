use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// One slot in the global hazard-pointer list. A thread that needs to
/// publish a pointer claims a free slot (or appends a new one if none is
/// free) and leaves it claimed for the rest of its lifetime — slots are
/// never removed from the list, only recycled between threads, per
/// `Reclaimer::drop` below.
struct HazardSlot {
    claimed: AtomicBool,
    ptr: AtomicPtr<()>,
    next: AtomicPtr<HazardSlot>,
}

impl HazardSlot {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(true),
            ptr: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// The append-only, lock-free list of hazard slots shared by every
/// `Reclaimer` operating against one table. One of these lives per
/// `Lfht` instance (not per process): each table reclaims its own nodes
/// independently.
pub struct HazardRegistry {
    head: AtomicPtr<HazardSlot>,
    slot_count: AtomicUsize,
}

/// Threshold (per the original's `maxNodes`) scaling how many retired
/// nodes a thread accumulates before it bothers scanning for safety:
/// wait until the backlog is worth the scan.
const MAX_RECLAIM_NODES: usize = 4;

impl HazardRegistry {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            slot_count: AtomicUsize::new(0),
        }
    }

    fn acquire_slot(&self) -> *const HazardSlot {
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: slots are never freed while the registry is alive; `p`
            // was read from the list and stays valid for `self`'s lifetime.
            let slot = unsafe { &*p };
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return p;
            }
            p = slot.next.load(Ordering::Acquire);
        }
        let fresh = Box::into_raw(Box::new(HazardSlot::new()));
        self.slot_count.fetch_add(1, Ordering::AcqRel);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `fresh` is exclusively owned until published below.
            unsafe {
                (*fresh).next.store(head, Ordering::Release);
            }
            match self
                .head
                .compare_exchange_weak(head, fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return fresh,
                Err(actual) => head = actual,
            }
        }
    }

    fn is_hazard(&self, ptr: *mut ()) -> bool {
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            let slot = unsafe { &*p };
            if slot.ptr.load(Ordering::Acquire) == ptr {
                return true;
            }
            p = slot.next.load(Ordering::Acquire);
        }
        false
    }

    fn snapshot(&self) -> HashSet<usize> {
        let mut live = HashSet::new();
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            let slot = unsafe { &*p };
            let ptr = slot.ptr.load(Ordering::Acquire);
            if !ptr.is_null() {
                live.insert(ptr as usize);
            }
            p = slot.next.load(Ordering::Acquire);
        }
        live
    }

    fn size(&self) -> usize {
        self.slot_count.load(Ordering::Acquire)
    }
}

impl Drop for HazardRegistry {
    fn drop(&mut self) {
        let mut p = *self.head.get_mut();
        while !p.is_null() {
            // SAFETY: by the time the registry drops, every Reclaimer that
            // held a slot has already released it; no one else can hold `p`.
            let slot = unsafe { Box::from_raw(p) };
            p = slot.next.load(Ordering::Acquire);
        }
    }
}

/// RAII guard returned by `Reclaimer::mark_hazard`: publishes a pointer as
/// in-use for as long as the guard lives, clearing the slot on drop. Mirrors
/// the original's `HazardPointer` wrapper, but as a normal Rust guard rather
/// than a move-only handle with a disabled-on-move index.
pub struct HazardGuard {
    slot: *const HazardSlot,
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        if !self.slot.is_null() {
            // SAFETY: slot lifetime is tied to the registry, which outlives
            // every operation that can produce a guard referencing it.
            unsafe {
                (*self.slot).ptr.store(ptr::null_mut(), Ordering::Release);
            }
        }
    }
}

struct RetiredNode {
    ptr: *mut (),
    free: Box<dyn FnOnce(*mut ())>,
}

/// Per-thread bookkeeping: which slots this thread currently holds, and
/// which retired nodes it is still waiting to safely free. Never shared
/// across threads — see `with_reclaimer` below for how one gets attached
/// to the calling thread.
pub struct Reclaimer {
    registry: Arc<HazardRegistry>,
    held_slots: RefCell<Vec<*const HazardSlot>>,
    retired: RefCell<HashMap<usize, RetiredNode>>,
}

impl Reclaimer {
    fn new(registry: Arc<HazardRegistry>) -> Self {
        Self {
            registry,
            held_slots: RefCell::new(Vec::new()),
            retired: RefCell::new(HashMap::new()),
        }
    }

    /// Publishes `ptr` as hazardous, reusing one of this thread's idle
    /// slots before asking the registry for a new one — mirrors
    /// `Reclaimer::MarkHazard` scanning its own `hp_list_` first.
    pub fn mark_hazard(&self, ptr: *mut ()) -> HazardGuard {
        if ptr.is_null() {
            return HazardGuard {
                slot: ptr::null_mut(),
            };
        }
        for &slot in self.held_slots.borrow().iter() {
            // SAFETY: slots in `held_slots` were acquired by this thread and
            // stay valid for the registry's lifetime.
            let s = unsafe { &*slot };
            if s.ptr.load(Ordering::Relaxed).is_null() {
                s.ptr.store(ptr, Ordering::Release);
                return HazardGuard { slot };
            }
        }
        let slot = self.registry.acquire_slot();
        // SAFETY: just acquired, exclusively owned by this thread.
        unsafe {
            (*slot).ptr.store(ptr, Ordering::Release);
        }
        self.held_slots.borrow_mut().push(slot);
        HazardGuard { slot }
    }

    /// Defers freeing `ptr` until no hazard pointer references it.
    /// `free` is called with the raw pointer once that's confirmed.
    pub fn retire_later(&self, ptr: *mut (), free: Box<dyn FnOnce(*mut ())>) {
        self.retired
            .borrow_mut()
            .insert(ptr as usize, RetiredNode { ptr, free });
        self.reclaim_if_worthwhile();
    }

    /// Scans for and frees retired nodes, once the backlog is large
    /// enough relative to the number of live hazard slots to make the
    /// scan worth its cost — mirrors `ReclaimNoHazardPointer`'s gate on
    /// `reclaim_map_.size() >= maxNodes * global_hp_list_.get_size()`.
    fn reclaim_if_worthwhile(&self) {
        let threshold = MAX_RECLAIM_NODES * self.registry.size().max(1);
        if self.retired.borrow().len() < threshold {
            return;
        }
        let live = self.registry.snapshot();
        let freeable: Vec<usize> = self
            .retired
            .borrow()
            .keys()
            .copied()
            .filter(|k| !live.contains(k))
            .collect();
        let mut retired = self.retired.borrow_mut();
        for key in freeable {
            if let Some(node) = retired.remove(&key) {
                (node.free)(node.ptr);
            }
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        for &slot in self.held_slots.borrow().iter() {
            // SAFETY: this thread is the sole owner of its held slots.
            let s = unsafe { &*slot };
            debug_assert!(s.ptr.load(Ordering::Relaxed).is_null());
            s.claimed.store(false, Ordering::Release);
        }
        for (_, node) in self.retired.borrow_mut().drain() {
            while self.registry.is_hazard(node.ptr) {
                thread::yield_now();
            }
            (node.free)(node.ptr);
        }
    }
}

thread_local! {
    static RECLAIMERS: RefCell<HashMap<usize, Reclaimer>> = RefCell::new(HashMap::new());
}

/// Runs `f` against this thread's `Reclaimer` for `registry`, creating one
/// on first use. Threads may participate in more than one table, so the
/// thread-local store is keyed by the registry's identity rather than
/// holding a single reclaimer outright.
pub fn with_reclaimer<R>(registry: &Arc<HazardRegistry>, f: impl FnOnce(&Reclaimer) -> R) -> R {
    let key = Arc::as_ptr(registry) as usize;
    RECLAIMERS.with(|map| {
        let mut map = map.borrow_mut();
        let reclaimer = map
            .entry(key)
            .or_insert_with(|| Reclaimer::new(Arc::clone(registry)));
        f(reclaimer)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn retire_is_deferred_while_hazard_is_held() {
        let registry = Arc::new(HazardRegistry::new());
        let freed = Arc::new(AtomicU32::new(0));
        let freed_clone = Arc::clone(&freed);
        let sentinel: *mut () = Box::into_raw(Box::new(7u32)) as *mut ();

        with_reclaimer(&registry, |r| {
            let guard = r.mark_hazard(sentinel);
            r.retire_later(
                sentinel,
                Box::new(move |p| {
                    freed_clone.fetch_add(1, Ordering::SeqCst);
                    unsafe {
                        drop(Box::from_raw(p as *mut u32));
                    }
                }),
            );
            // Force the scan threshold regardless of backlog size by
            // retiring enough filler nodes.
            for _ in 0..(MAX_RECLAIM_NODES + 1) {
                let filler = Box::into_raw(Box::new(0u32)) as *mut ();
                r.retire_later(filler, Box::new(|p| unsafe { drop(Box::from_raw(p as *mut u32)) }));
            }
            assert_eq!(freed.load(Ordering::SeqCst), 0, "still hazarded, must not free");
            drop(guard);
        });
    }
}
