/// The container's public contract: insert/remove/get with linearisable
/// semantics under multithreaded access. Implemented independently by the
/// extendible-hash variants and by the lock-free split-ordered table.
///
/// No method takes `&mut self` — every implementation provides its own
/// interior synchronisation (a single mutex, per-node latches, or lock-free
/// CAS), which is the point of a concurrent container.
pub trait Map<K, V> {
    /// Inserts `key` -> `value`. Returns `true` if this added a new key;
    /// `false` if the key already existed (the EHT variants leave the old
    /// value in place; the lock-free table updates it) or if the container
    /// is full (EHT variants only, once `max_directory_depth` is reached).
    fn insert(&self, key: K, value: V) -> bool;

    /// Removes `key`, returning `true` if it was present.
    fn remove(&self, key: &K) -> bool;

    /// Returns a copy of the value associated with `key`, if present.
    fn get(&self, key: &K) -> Option<V>;

    /// Current element count.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
