use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::eht::bucket::{Bucket, InsertResult};
use crate::eht::config::EhtConfig;
use crate::error::ConfigError;
use crate::hashing::{DefaultComparator, HashFn, KeyOrder, Murmur3Hasher};
use crate::map::Map;

/// Directory bookkeeping (depths, bucket-slot table), held behind its own
/// latch — separate from the bucket pool's latch, separate again from
/// each bucket's own latch. Latches are always acquired in the order
/// meta -> pool -> bucket, top-down, mirroring the header -> directory ->
/// bucket acquisition order at the container level. That fixed order is
/// what rules out deadlock between concurrent operations.
struct DirMeta {
    global_depth: u32,
    max_depth: u32,
    local_depth: Vec<u8>,
    bucket_of: Vec<usize>,
    free_slots: Vec<usize>,
    pool_len: usize,
}

impl DirMeta {
    fn new(max_depth: u32) -> Self {
        let span = 1usize << max_depth;
        Self {
            global_depth: 0,
            max_depth,
            local_depth: vec![0; span],
            bucket_of: vec![0; span],
            free_slots: Vec::new(),
            pool_len: 0,
        }
    }

    fn hash_to_bucket_index(&self, hash: u32) -> usize {
        if self.global_depth == 0 {
            return 0;
        }
        let mask = (1u32 << self.global_depth) - 1;
        (hash & mask) as usize
    }

    fn incr_global_depth(&mut self) -> bool {
        if self.global_depth >= self.max_depth {
            return false;
        }
        let span = 1usize << self.global_depth;
        for i in 0..span {
            self.bucket_of[span + i] = self.bucket_of[i];
            self.local_depth[span + i] = self.local_depth[i];
        }
        self.global_depth += 1;
        true
    }

    fn decr_global_depth(&mut self) -> bool {
        if self.global_depth == 0 {
            return false;
        }
        let span = 1usize << self.global_depth;
        if self.local_depth[..span]
            .iter()
            .any(|&l| l as u32 >= self.global_depth)
        {
            return false;
        }
        self.global_depth -= 1;
        true
    }

    /// Assigns `slot` at `depth` to every index that aliases `index` at
    /// that depth (see `Directory::assign_bucket` in `directory.rs` for the
    /// coarse variant's twin of this method).
    fn assign_bucket(&mut self, index: usize, depth: u8, slot: usize) {
        let stride = 1usize << depth;
        let base = index & (stride - 1);
        let span = 1usize << self.global_depth;
        let mut i = base;
        while i < span {
            self.bucket_of[i] = slot;
            self.local_depth[i] = depth;
            i += stride;
        }
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(slot) = self.free_slots.pop() {
            slot
        } else {
            let slot = self.pool_len;
            self.pool_len += 1;
            slot
        }
    }

    fn free_slot(&mut self, slot: usize) {
        self.free_slots.push(slot);
    }
}

struct FineDirectory<K, V> {
    meta: RwLock<DirMeta>,
    pool: RwLock<Vec<Arc<RwLock<Bucket<K, V>>>>>,
    bucket_capacity: usize,
}

impl<K, V> FineDirectory<K, V> {
    fn new(max_depth: u32, bucket_capacity: usize) -> Self {
        let dir = Self {
            meta: RwLock::new(DirMeta::new(max_depth)),
            pool: RwLock::new(Vec::new()),
            bucket_capacity,
        };
        let mut meta = dir.meta.write();
        let mut pool = dir.pool.write();
        let slot = meta.alloc_slot();
        debug_assert_eq!(slot, 0);
        pool.push(Arc::new(RwLock::new(Bucket::new(bucket_capacity))));
        drop(pool);
        drop(meta);
        dir
    }

    fn bucket_at(&self, slot: usize) -> Arc<RwLock<Bucket<K, V>>> {
        self.pool.read()[slot].clone()
    }
}

/// Extendible hash table whose single container mutex is replaced by
/// per-directory and per-bucket reader/writer latches, acquired top-down
/// (header, then directory meta/pool, then bucket) on every path. Shares
/// the directory/bucket algebra with `CoarseEht`; only the concurrency
/// scheme differs.
pub struct FineGrainedEht<K, V, H = Murmur3Hasher, C = DefaultComparator> {
    header: Vec<RwLock<Option<Arc<FineDirectory<K, V>>>>>,
    header_depth: u32,
    hash_fn: H,
    cmp: C,
    config: EhtConfig,
    size: AtomicUsize,
}

impl<K, V> FineGrainedEht<K, V, Murmur3Hasher, DefaultComparator> {
    pub fn new() -> Self {
        Self::with_hasher_and_comparator(Murmur3Hasher::default(), DefaultComparator)
    }
}

impl<K, V> Default for FineGrainedEht<K, V, Murmur3Hasher, DefaultComparator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H, C> FineGrainedEht<K, V, H, C> {
    pub fn with_hasher_and_comparator(hash_fn: H, cmp: C) -> Self {
        let config = EhtConfig::for_types::<K, V>();
        let span = 1usize << config.max_header_depth;
        Self {
            header: (0..span).map(|_| RwLock::new(None)).collect(),
            header_depth: config.max_header_depth,
            hash_fn,
            cmp,
            config,
            size: AtomicUsize::new(0),
        }
    }

    pub fn try_with_config(config: EhtConfig, hash_fn: H, cmp: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let span = 1usize << config.max_header_depth;
        Ok(Self {
            header: (0..span).map(|_| RwLock::new(None)).collect(),
            header_depth: config.max_header_depth,
            hash_fn,
            cmp,
            config,
            size: AtomicUsize::new(0),
        })
    }

    fn hash_to_directory_index(&self, hash: u32) -> usize {
        if self.header_depth == 0 {
            return 0;
        }
        (hash >> (32 - self.header_depth)) as usize
    }
}

impl<K, V, H, C> FineGrainedEht<K, V, H, C>
where
    K: Clone,
    V: Clone,
    H: HashFn<K>,
    C: KeyOrder<K>,
{
    fn get_or_create_directory(&self, idx: usize) -> Arc<FineDirectory<K, V>> {
        if let Some(dir) = self.header[idx].read().as_ref() {
            return Arc::clone(dir);
        }
        let mut guard = self.header[idx].write();
        if guard.is_none() {
            *guard = Some(Arc::new(FineDirectory::new(
                self.config.max_directory_depth,
                self.config.bucket_capacity,
            )));
            debug!("eht(fine): created directory at header slot {}", idx);
        }
        Arc::clone(guard.as_ref().unwrap())
    }

    fn split(&self, dir: &FineDirectory<K, V>, bucket_idx: usize) -> bool {
        let (new_bucket_idx, old_slot, new_slot) = {
            let mut meta = dir.meta.write();
            let local_depth = meta.local_depth[bucket_idx];
            if local_depth as u32 == meta.max_depth {
                return false;
            }
            if local_depth as u32 == meta.global_depth && !meta.incr_global_depth() {
                return false;
            }
            let new_local_depth = local_depth + 1;
            let new_bucket_idx = bucket_idx + (1usize << (new_local_depth - 1));
            let old_slot = meta.bucket_of[bucket_idx];
            let new_slot = meta.alloc_slot();
            // Propagate to the whole aliasing group on each side, not just
            // `bucket_idx`/`new_bucket_idx` themselves.
            meta.assign_bucket(bucket_idx, new_local_depth, old_slot);
            meta.assign_bucket(new_bucket_idx, new_local_depth, new_slot);
            (new_bucket_idx, old_slot, new_slot)
        };

        {
            let mut pool = dir.pool.write();
            let new_bucket = Arc::new(RwLock::new(Bucket::new(dir.bucket_capacity)));
            if new_slot == pool.len() {
                pool.push(new_bucket);
            } else {
                pool[new_slot] = new_bucket;
            }
        }
        debug!(
            "eht(fine): split bucket {} -> sibling {}",
            bucket_idx, new_bucket_idx
        );

        let capacity = dir.bucket_capacity;
        let old_arc = dir.bucket_at(old_slot);
        let new_arc = dir.bucket_at(new_slot);
        {
            let mut old_bucket = old_arc.write();
            let mut new_bucket = new_arc.write();
            let old_entries = old_bucket.take_entries();
            old_bucket.init(capacity);
            for (k, v) in old_entries {
                let h = self.hash_fn.hash(&k) as u32;
                let target_idx = dir.meta.read().hash_to_bucket_index(h);
                if target_idx == bucket_idx {
                    old_bucket.push_back(k, v);
                } else {
                    new_bucket.push_back(k, v);
                }
            }
        }

        let old_full = old_arc.read().is_full();
        let new_full = new_arc.read().is_full();
        if new_full {
            self.split(dir, new_bucket_idx);
        }
        if old_full {
            self.split(dir, bucket_idx);
        }
        true
    }

    fn merge(&self, dir: &FineDirectory<K, V>, bucket_idx: usize) {
        let (low_idx, high_idx, low_slot, high_slot) = {
            let meta = dir.meta.read();
            let local_depth = meta.local_depth[bucket_idx];
            if local_depth == 0 {
                return;
            }
            let low_idx = bucket_idx & ((1usize << (local_depth - 1)) - 1);
            let high_idx = if local_depth == 1 {
                1
            } else {
                low_idx + (1usize << (local_depth - 1))
            };
            if high_idx >= (1usize << meta.global_depth) {
                return;
            }
            if meta.local_depth[low_idx] != meta.local_depth[high_idx] {
                return;
            }
            (low_idx, high_idx, meta.bucket_of[low_idx], meta.bucket_of[high_idx])
        };
        if low_slot == high_slot {
            return;
        }

        let low_arc = dir.bucket_at(low_slot);
        let high_arc = dir.bucket_at(high_slot);
        let merged = {
            let mut low_bucket = low_arc.write();
            let mut high_bucket = high_arc.write();
            low_bucket.merge(&mut high_bucket)
        };
        if !merged {
            return;
        }

        {
            let mut meta = dir.meta.write();
            meta.free_slot(high_slot);
            // Propagate the merge across the whole reunited aliasing
            // group, not just `low_idx`/`high_idx`.
            let depth = meta.local_depth[low_idx];
            meta.assign_bucket(low_idx, depth.saturating_sub(1), low_slot);
            let depth_now = meta.local_depth[low_idx];
            if (depth_now + 1) as u32 == meta.global_depth {
                meta.decr_global_depth();
            }
        }
        debug!("eht(fine): merged bucket {} into {}", high_idx, low_idx);

        let (global_depth, new_local_depth) = {
            let meta = dir.meta.read();
            (meta.global_depth, meta.local_depth[low_idx])
        };
        if global_depth == 0 {
            return;
        }
        if new_local_depth > 0 {
            let new_high_idx = low_idx + (1usize << (new_local_depth - 1));
            if new_high_idx < (1usize << global_depth) {
                let new_high_slot = dir.meta.read().bucket_of[new_high_idx];
                let low_slot_now = dir.meta.read().bucket_of[low_idx];
                if new_high_slot != low_slot_now && dir.bucket_at(new_high_slot).read().size() == 0
                {
                    self.merge(dir, new_high_idx);
                    return;
                }
            }
        }
        let low_slot_now = dir.meta.read().bucket_of[low_idx];
        if dir.bucket_at(low_slot_now).read().size() == 0 {
            self.merge(dir, low_idx);
        }
    }
}

impl<K, V, H, C> Map<K, V> for FineGrainedEht<K, V, H, C>
where
    K: Clone,
    V: Clone,
    H: HashFn<K>,
    C: KeyOrder<K>,
{
    fn insert(&self, key: K, value: V) -> bool {
        let hash = self.hash_fn.hash(&key) as u32;
        let dir_idx = self.hash_to_directory_index(hash);
        let dir = self.get_or_create_directory(dir_idx);
        loop {
            let (bucket_idx, bucket_arc) = {
                let meta = dir.meta.read();
                let bucket_idx = meta.hash_to_bucket_index(hash);
                let slot = meta.bucket_of[bucket_idx];
                drop(meta);
                (bucket_idx, dir.bucket_at(slot))
            };
            let result = bucket_arc.write().insert(key.clone(), value.clone(), &self.cmp);
            match result {
                InsertResult::Success => {
                    self.size.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                InsertResult::Duplicate => return false,
                InsertResult::Full => {
                    if !self.split(&dir, bucket_idx) {
                        warn!("eht(fine): split failed, directory at max depth");
                        return false;
                    }
                }
            }
        }
    }

    fn remove(&self, key: &K) -> bool {
        let hash = self.hash_fn.hash(key) as u32;
        let dir_idx = self.hash_to_directory_index(hash);
        let dir = match self.header[dir_idx].read().as_ref() {
            Some(dir) => Arc::clone(dir),
            None => return false,
        };
        let (bucket_idx, slot) = {
            let meta = dir.meta.read();
            let bucket_idx = meta.hash_to_bucket_index(hash);
            (bucket_idx, meta.bucket_of[bucket_idx])
        };
        let bucket_arc = dir.bucket_at(slot);
        let removed = bucket_arc.write().remove(key, &self.cmp);
        if removed {
            self.size.fetch_sub(1, Ordering::Relaxed);
            if bucket_arc.read().size() == 0 {
                self.merge(&dir, bucket_idx);
            }
        }
        removed
    }

    fn get(&self, key: &K) -> Option<V> {
        let hash = self.hash_fn.hash(key) as u32;
        let dir_idx = self.hash_to_directory_index(hash);
        let dir = self.header[dir_idx].read().as_ref().map(Arc::clone)?;
        let (bucket_idx, slot) = {
            let meta = dir.meta.read();
            let bucket_idx = meta.hash_to_bucket_index(hash);
            (bucket_idx, meta.bucket_of[bucket_idx])
        };
        dir.bucket_at(slot).read().get_value(key, &self.cmp).cloned()
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    fn small_table() -> FineGrainedEht<i32, i32> {
        FineGrainedEht::try_with_config(
            EhtConfig {
                max_header_depth: 2,
                max_directory_depth: 3,
                bucket_capacity: 2,
            },
            Murmur3Hasher::default(),
            DefaultComparator,
        )
        .unwrap()
    }

    #[test]
    fn split_and_merge_roundtrip() {
        let t = small_table();
        for i in 0..20 {
            assert!(t.insert(i, i * 2));
        }
        for i in 0..20 {
            assert_eq!(t.get(&i), Some(i * 2));
        }
        for i in 0..20 {
            assert!(t.remove(&i));
        }
        for i in 0..20 {
            assert_eq!(t.get(&i), None);
        }
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn concurrent_mixed_workload() {
        let t = StdArc::new(small_table());
        let mut handles = Vec::new();
        for base in 0..4 {
            let t = StdArc::clone(&t);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let k = base * 10_000 + i;
                    t.insert(k, k);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for base in 0..4 {
            for i in 0..100 {
                let k = base * 10_000 + i;
                assert_eq!(t.get(&k), Some(k));
            }
        }
    }
}
