use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use crate::error::ConfigError;
use crate::hashing::{DefaultComparator, HashFn, KeyOrder, Murmur3Hasher};
use crate::lfht::config::LfhtConfig;
use crate::lfht::hazard::{with_reclaimer, HazardGuard, HazardRegistry, Reclaimer};
use crate::lfht::node::{
    drop_node, equal, greater_or_equal, is_marked, regular_key, with_mark, without_mark, Node,
    NodeKind, Probe,
};
use crate::lfht::segment::{bucket_parent, SegmentTree};
use crate::map::Map;

/// Recursive split-ordered lock-free hash table. Every regular entry's
/// position in one big sorted singly-linked list is fixed by its
/// bit-reversed hash; growing the bucket array never moves a node, it
/// only exposes more dummy "bucket head" nodes that were always going to
/// sit at those positions in the list.
///
/// Memory is reclaimed through the hazard-pointer scheme in `hazard.rs`:
/// a thread never frees a node it has unlinked, only hands it to its
/// `Reclaimer`, which frees it once no thread's hazard slot still points
/// at it.
pub struct Lfht<K, V, H = Murmur3Hasher, C = DefaultComparator> {
    segments: SegmentTree<K, V>,
    registry: Arc<HazardRegistry>,
    size: AtomicUsize,
    bucket_pow: AtomicUsize,
    hash_fn: H,
    cmp: C,
    config: LfhtConfig,
}

// SAFETY: all shared mutable state lives behind atomics or hazard-pointer
// protected raw pointers reached only through `&self` methods; the usual
// `Send`/`Sync` auto-derivation is blocked only because those fields are
// raw pointers, not because the access pattern is actually unsynchronised.
unsafe impl<K: Send + Sync, V: Send + Sync, H: Send + Sync, C: Send + Sync> Send
    for Lfht<K, V, H, C>
{
}
unsafe impl<K: Send + Sync, V: Send + Sync, H: Send + Sync, C: Send + Sync> Sync
    for Lfht<K, V, H, C>
{
}

impl<K, V> Lfht<K, V, Murmur3Hasher, DefaultComparator> {
    pub fn new() -> Self {
        Self::with_hasher_and_comparator(Murmur3Hasher::default(), DefaultComparator)
    }
}

impl<K, V> Default for Lfht<K, V, Murmur3Hasher, DefaultComparator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H, C> Lfht<K, V, H, C> {
    pub fn with_hasher_and_comparator(hash_fn: H, cmp: C) -> Self {
        Self::try_with_config(hash_fn, cmp, LfhtConfig::default())
            .expect("default configuration is always valid")
    }

    pub fn try_with_config(hash_fn: H, cmp: C, config: LfhtConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let segments = SegmentTree::new();
        let head = Box::into_raw(Box::new(Node::new_dummy(0)));
        let cell = segments.get_or_create_bucket_cell(0);
        cell.head.store(head, Ordering::Release);
        Ok(Self {
            segments,
            registry: Arc::new(HazardRegistry::new()),
            size: AtomicUsize::new(0),
            bucket_pow: AtomicUsize::new(0),
            hash_fn,
            cmp,
            config,
        })
    }

    fn bucket_count(&self) -> u64 {
        1u64 << self.bucket_pow.load(Ordering::Acquire)
    }

    fn bucket_index(&self, hash: u64) -> u64 {
        hash & (self.bucket_count() - 1)
    }

    fn bucket_head(&self, bucket_index: u64) -> *mut Node<K, V> {
        self.segments.bucket_head(bucket_index)
    }

    fn maybe_grow(&self) {
        let size = self.size.load(Ordering::Acquire) as f64;
        loop {
            let pow = self.bucket_pow.load(Ordering::Acquire);
            let bucket_count = (1u64 << pow) as f64;
            if size <= bucket_count * self.config.load_factor {
                return;
            }
            if self
                .bucket_pow
                .compare_exchange(pow, pow + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                trace!("lfht bucket count doubled to {}", 1u64 << (pow + 1));
                return;
            }
        }
    }
}

/// Result of a list search: the node immediately before the first node
/// whose key is `>=` the probe, and that node itself (possibly null at
/// the list's tail). Both pointers are kept alive by hazard guards for as
/// long as this value lives — `prev` by `_prev_guard` (absent only when
/// `prev` is an immortal bucket-head dummy), `cur` by `_cur_guard`.
struct SearchResult<K, V> {
    prev: *mut Node<K, V>,
    cur: *mut Node<K, V>,
    _prev_guard: Option<HazardGuard>,
    _cur_guard: HazardGuard,
}

impl<K, V, H, C> Lfht<K, V, H, C>
where
    K: Clone,
    V: Clone,
    H: HashFn<K>,
    C: KeyOrder<K>,
{
    /// Harris-style search with physical unlinking of logically-deleted
    /// nodes along the way. Two points in this routine are explicit fixes
    /// over the algorithm's original shape: the hazard pointer for `cur`
    /// is published *before* the read used to validate it (a degenerate
    /// double read with no publication between them lets `cur` be freed
    /// out from under the caller), and `prev`'s protection is always the
    /// previous iteration's `cur` guard, never assumed safe on its own.
    fn search_node(
        &self,
        start: *mut Node<K, V>,
        probe: &Probe<'_, K>,
        reclaimer: &Reclaimer,
    ) -> SearchResult<K, V> {
        'retry: loop {
            let mut prev = start;
            let mut prev_guard: Option<HazardGuard> = None;
            loop {
                // SAFETY: `prev` is either `start` (an immortal dummy bucket
                // head) or a node whose hazard guard we are still holding in
                // `prev_guard` from the previous iteration.
                let raw_next = unsafe { (*prev).next.load(Ordering::Acquire) };
                let cur = without_mark(raw_next);
                let cur_guard = reclaimer.mark_hazard(cur as *mut ());
                // SAFETY: same as above.
                if unsafe { (*prev).next.load(Ordering::Acquire) } != raw_next {
                    continue 'retry;
                }
                if cur.is_null() {
                    return SearchResult {
                        prev,
                        cur,
                        _prev_guard: prev_guard,
                        _cur_guard: cur_guard,
                    };
                }
                // SAFETY: `cur` is now published as hazardous and was just
                // re-validated as `prev`'s current successor.
                let cur_ref = unsafe { &*cur };
                let next_raw = cur_ref.next.load(Ordering::Acquire);
                let next = without_mark(next_raw);
                if is_marked(next_raw) {
                    // SAFETY: `prev` is valid per the invariant above.
                    let cas = unsafe {
                        (*prev).next.compare_exchange(
                            cur,
                            next,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                    };
                    match cas {
                        Ok(_) => {
                            reclaimer.retire_later(
                                cur as *mut (),
                                Box::new(|p| unsafe { drop_node::<K, V>(p as *mut Node<K, V>) }),
                            );
                            continue;
                        }
                        Err(_) => continue 'retry,
                    }
                }
                if greater_or_equal(cur_ref, probe, &self.cmp) {
                    return SearchResult {
                        prev,
                        cur,
                        _prev_guard: prev_guard,
                        _cur_guard: cur_guard,
                    };
                }
                prev = cur;
                prev_guard = Some(cur_guard);
            }
        }
    }

    /// Ensures `bucket_index`'s dummy head exists, recursively initialising
    /// its parent first (`GetBucketParent`'s own head is where the new
    /// dummy gets linked in relative to). Two threads racing to initialise
    /// the same bucket both link a dummy into the shared list — the loser
    /// just leaves an extra, permanently harmless duplicate-keyed dummy
    /// behind rather than trying to unlink and free it, since by the time
    /// it loses the cell-level CAS other threads may already be traversing
    /// through the node it linked.
    fn ensure_bucket_initialized(&self, bucket_index: u64) {
        if let Some(cell) = self.segments.get_bucket_cell(bucket_index) {
            if !cell.head.load(Ordering::Acquire).is_null() {
                return;
            }
        }
        if bucket_index != 0 {
            self.ensure_bucket_initialized(bucket_parent(bucket_index));
        }
        let cell = self.segments.get_or_create_bucket_cell(bucket_index);
        if !cell.head.load(Ordering::Acquire).is_null() {
            return;
        }
        let candidate = Box::into_raw(Box::new(Node::new_dummy(bucket_index)));
        with_reclaimer(&self.registry, |reclaimer| {
            let probe = Probe::<K>::for_bucket(bucket_index);
            let start = self.bucket_head(bucket_parent(bucket_index));
            loop {
                let search = self.search_node(start, &probe, reclaimer);
                // SAFETY: `candidate` is exclusively owned until CAS-published.
                unsafe {
                    (*candidate).next.store(search.cur, Ordering::Relaxed);
                }
                // SAFETY: `search.prev` is protected by the search result's guard.
                let cas = unsafe {
                    (*search.prev).next.compare_exchange(
                        search.cur,
                        candidate,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                };
                if cas.is_ok() {
                    break;
                }
            }
        });
        if cell
            .head
            .compare_exchange(
                ptr::null_mut(),
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("lost race initialising bucket {bucket_index}, duplicate dummy left in list");
        }
    }
}

impl<K, V, H, C> Map<K, V> for Lfht<K, V, H, C>
where
    K: Clone,
    V: Clone,
    H: HashFn<K>,
    C: KeyOrder<K>,
{
    fn insert(&self, key: K, value: V) -> bool {
        let hash = self.hash_fn.hash(&key);
        let bucket_index = self.bucket_index(hash);
        self.ensure_bucket_initialized(bucket_index);
        let start = self.bucket_head(bucket_index);
        let new_value_ptr: *mut V = Box::into_raw(Box::new(value));

        let inserted = with_reclaimer(&self.registry, |reclaimer| loop {
            let probe = Probe::for_key(hash, &key);
            let search = self.search_node(start, &probe, reclaimer);
            if !search.cur.is_null() {
                // SAFETY: protected by `search`'s cur guard.
                let cur_ref = unsafe { &*search.cur };
                if equal(cur_ref, &probe, &self.cmp) {
                    if let NodeKind::Regular { value: slot, .. } = &cur_ref.kind {
                        let old = slot.swap(new_value_ptr, Ordering::AcqRel);
                        reclaimer.retire_later(
                            old as *mut (),
                            Box::new(|p| unsafe { drop(Box::from_raw(p as *mut V)) }),
                        );
                    }
                    return false;
                }
            }
            let node = Box::into_raw(Box::new(Node {
                reverse_hash: regular_key(hash),
                next: AtomicPtr::new(search.cur),
                kind: NodeKind::Regular {
                    key: key.clone(),
                    value: AtomicPtr::new(new_value_ptr),
                },
            }));
            // SAFETY: `search.prev` is protected by the search result's guard.
            let cas = unsafe {
                (*search.prev).next.compare_exchange(
                    search.cur,
                    node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            };
            match cas {
                Ok(_) => return true,
                Err(_) => {
                    // SAFETY: `node` was never published, we still own it.
                    unsafe {
                        drop(Box::from_raw(node));
                    }
                }
            }
        });

        if inserted {
            self.size.fetch_add(1, Ordering::AcqRel);
            self.maybe_grow();
        }
        inserted
    }

    fn remove(&self, key: &K) -> bool {
        let hash = self.hash_fn.hash(key);
        let bucket_index = self.bucket_index(hash);
        self.ensure_bucket_initialized(bucket_index);
        let start = self.bucket_head(bucket_index);

        let removed = with_reclaimer(&self.registry, |reclaimer| loop {
            let probe = Probe::for_key(hash, key);
            let search = self.search_node(start, &probe, reclaimer);
            if search.cur.is_null() {
                return false;
            }
            // SAFETY: protected by `search`'s cur guard.
            let cur_ref = unsafe { &*search.cur };
            if !equal(cur_ref, &probe, &self.cmp) {
                return false;
            }
            let next_raw = cur_ref.next.load(Ordering::Acquire);
            if is_marked(next_raw) {
                continue;
            }
            let marked = with_mark(next_raw);
            match cur_ref
                .next
                .compare_exchange(next_raw, marked, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: `search.prev` is protected by the search result's guard.
                    let unlinked = unsafe {
                        (*search.prev)
                            .next
                            .compare_exchange(
                                search.cur,
                                without_mark(next_raw),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    };
                    if unlinked {
                        reclaimer.retire_later(
                            search.cur as *mut (),
                            Box::new(|p| unsafe { drop_node::<K, V>(p as *mut Node<K, V>) }),
                        );
                    }
                    return true;
                }
                Err(_) => continue,
            }
        });

        if removed {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    fn get(&self, key: &K) -> Option<V> {
        let hash = self.hash_fn.hash(key);
        let bucket_index = self.bucket_index(hash);
        self.ensure_bucket_initialized(bucket_index);
        let start = self.bucket_head(bucket_index);

        with_reclaimer(&self.registry, |reclaimer| {
            let probe = Probe::for_key(hash, key);
            let search = self.search_node(start, &probe, reclaimer);
            if search.cur.is_null() {
                return None;
            }
            // SAFETY: protected by `search`'s cur guard.
            let cur_ref = unsafe { &*search.cur };
            if !equal(cur_ref, &probe, &self.cmp) {
                return None;
            }
            let slot = match &cur_ref.kind {
                NodeKind::Regular { value, .. } => value,
                NodeKind::Dummy { .. } => return None,
            };
            // Publish the hazard between the two reads so a concurrent
            // `insert` update can't free the value out from under us; the
            // original reads the pointer twice with nothing published
            // between, which is only correct by accident.
            loop {
                let vp = slot.load(Ordering::Acquire);
                if vp.is_null() {
                    return None;
                }
                let guard = reclaimer.mark_hazard(vp as *mut ());
                if slot.load(Ordering::Acquire) == vp {
                    // SAFETY: `vp` is now published as hazardous and was just
                    // re-validated as still live.
                    return Some(unsafe { (*vp).clone() });
                }
                drop(guard);
            }
        })
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }
}

impl<K, V, H, C> Drop for Lfht<K, V, H, C> {
    fn drop(&mut self) {
        let mut p = self.segments.bucket_head(0);
        while !p.is_null() {
            // SAFETY: `self` is being dropped, so no other thread can still
            // hold a reference into this table; walking and freeing the
            // whole chain here is exclusive.
            let next = unsafe { without_mark((*p).next.load(Ordering::Relaxed)) };
            unsafe {
                drop_node::<K, V>(p);
            }
            p = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::thread;

    #[test]
    fn insert_get_remove_roundtrip() {
        let table: Lfht<i32, i32> = Lfht::new();
        assert!(table.insert(1, 100));
        assert!(!table.insert(1, 200));
        assert_eq!(table.get(&1), Some(200));
        assert_eq!(table.len(), 1);
        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.get(&1), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn scenario_s5_grows_past_initial_single_bucket() {
        let table: Lfht<i32, i32> = Lfht::new();
        for i in 0..200 {
            assert!(table.insert(i, i * 2));
        }
        assert_eq!(table.len(), 200);
        assert!(table.bucket_count() > 1, "table should have grown");
        for i in 0..200 {
            assert_eq!(table.get(&i), Some(i * 2));
        }
    }

    #[test]
    fn concurrent_disjoint_range_insert_then_remove_is_linearisable() {
        let table = Arc::new(Lfht::<i32, i32>::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    let key = t * 1000 + i;
                    assert!(table.insert(key, key));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 2000);

        let successes = Arc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();
        for t in 0..4 {
            let table = Arc::clone(&table);
            let successes = Arc::clone(&successes);
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    let key = t * 1000 + i;
                    if table.remove(&key) {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(successes.load(Ordering::SeqCst), 2000);
        assert_eq!(table.len(), 0);
    }

    /// S6: same key, churned by several threads at once (half inserting,
    /// half removing) rather than disjoint ranges. This is what actually
    /// exercises the hazard-pointer reclaimer's ABA handling — a thread
    /// can hold a hazard pointer to a node another thread has already
    /// logically removed and retired, and the reclaimer must not free it
    /// out from under that reader. A double-free or use-after-free here
    /// would show up as a crash or corrupted state, not a failed assert.
    #[test]
    fn scenario_s6_same_key_concurrent_churn_has_no_double_free() {
        let table = Arc::new(Lfht::<i32, i32>::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for i in 0..2000 {
                    if t % 2 == 0 {
                        table.insert(7, i);
                    } else {
                        table.remove(&7);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(table.len() <= 1);
        match table.get(&7) {
            Some(_) => assert_eq!(table.len(), 1),
            None => assert_eq!(table.len(), 0),
        }
    }
}
