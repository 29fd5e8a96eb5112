use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::lfht::node::Node;

pub const MAX_LEVEL: usize = 4;
pub const SEGMENT_SIZE: usize = 64;

/// A single bucket's dummy-head cell. Distinct from `Node::next`: this is
/// the slot the segment tree hands out, not a link in the list itself.
pub struct BucketCell<K, V> {
    pub head: AtomicPtr<Node<K, V>>,
}

impl<K, V> BucketCell<K, V> {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// What a segment's `data` pointer resolves to once allocated: either
/// another level of segments, or — at the last level — the leaf array of
/// bucket cells.
pub enum SegmentChild<K, V> {
    Segments(Box<[Segment<K, V>]>),
    Buckets(Box<[BucketCell<K, V>]>),
}

/// One node of the 4-level, 64-way segment tree. `data` is populated
/// lazily, the first thread to need a path through it wins a CAS and
/// every loser frees its speculative allocation and reuses the winner's.
pub struct Segment<K, V> {
    data: AtomicPtr<SegmentChild<K, V>>,
}

impl<K, V> Segment<K, V> {
    fn new() -> Self {
        Self {
            data: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<K, V> Drop for Segment<K, V> {
    fn drop(&mut self) {
        let ptr = *self.data.get_mut();
        if !ptr.is_null() {
            // SAFETY: `data` only ever holds a pointer this tree allocated via
            // `Box::into_raw`; nothing else can be dereferencing it once the
            // owning Segment is being dropped.
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

fn new_segment_array<K, V>() -> Box<[Segment<K, V>]> {
    (0..SEGMENT_SIZE).map(|_| Segment::new()).collect()
}

fn new_bucket_array<K, V>() -> Box<[BucketCell<K, V>]> {
    (0..SEGMENT_SIZE).map(|_| BucketCell::new()).collect()
}

/// Splits a bucket index into `MAX_LEVEL` base-64 digits, most
/// significant first. `digits[0]` selects the top-level segment;
/// `digits[MAX_LEVEL - 1]` selects the bucket cell inside the leaf array.
/// This is the same indexing the original computes via repeated
/// `pow(kSegmentSize, ...)` division; a plain base conversion is simpler
/// and exact for the `u64` domain we operate in.
fn digits(bucket_index: u64) -> [usize; MAX_LEVEL] {
    let mut out = [0usize; MAX_LEVEL];
    let mut x = bucket_index;
    for slot in out.iter_mut().rev() {
        *slot = (x % SEGMENT_SIZE as u64) as usize;
        x /= SEGMENT_SIZE as u64;
    }
    out
}

/// Clears the highest set bit of a bucket index, giving the index of the
/// bucket whose initialisation this bucket's must wait on. Bucket 0 is
/// its own parent (already initialised eagerly by the table constructor).
/// The original computes this via `__builtin_clzl`; `leading_zeros` is the
/// portable stable-Rust equivalent.
pub fn bucket_parent(bucket_index: u64) -> u64 {
    if bucket_index == 0 {
        return 0;
    }
    let msb = 63 - bucket_index.leading_zeros() as u64;
    bucket_index & !(1u64 << msb)
}

pub struct SegmentTree<K, V> {
    top: Box<[Segment<K, V>]>,
}

impl<K, V> SegmentTree<K, V> {
    pub fn new() -> Self {
        Self {
            top: new_segment_array(),
        }
    }

    /// Reads the bucket cell for `bucket_index` without allocating,
    /// returning `None` if any segment on the path has not been created
    /// yet.
    pub fn get_bucket_cell(&self, bucket_index: u64) -> Option<&BucketCell<K, V>> {
        let idx = digits(bucket_index);
        let mut seg = &self.top[idx[0]];
        for level in 1..MAX_LEVEL {
            let child_ptr = seg.data.load(Ordering::Acquire);
            if child_ptr.is_null() {
                return None;
            }
            // SAFETY: non-null `data` always points at a `SegmentChild` this
            // tree allocated and never frees while `self` is alive.
            let child = unsafe { &*child_ptr };
            match child {
                SegmentChild::Segments(arr) => seg = &arr[idx[level]],
                SegmentChild::Buckets(arr) => return Some(&arr[idx[level]]),
            }
        }
        None
    }

    /// Same walk, but CAS-allocates any missing segment or leaf-bucket
    /// array along the way. Always returns a usable cell.
    pub fn get_or_create_bucket_cell(&self, bucket_index: u64) -> &BucketCell<K, V> {
        let idx = digits(bucket_index);
        let mut seg = &self.top[idx[0]];
        for level in 1..MAX_LEVEL {
            let is_leaf = level == MAX_LEVEL - 1;
            let mut child_ptr = seg.data.load(Ordering::Acquire);
            if child_ptr.is_null() {
                let fresh: *mut SegmentChild<K, V> = if is_leaf {
                    Box::into_raw(Box::new(SegmentChild::Buckets(new_bucket_array())))
                } else {
                    Box::into_raw(Box::new(SegmentChild::Segments(new_segment_array())))
                };
                match seg.data.compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => child_ptr = fresh,
                    Err(actual) => {
                        // Lost the race: free our speculative allocation and
                        // reuse whatever the winner installed.
                        // SAFETY: `fresh` was produced by `Box::into_raw` above
                        // and never published, so we still own it exclusively.
                        unsafe {
                            drop(Box::from_raw(fresh));
                        }
                        child_ptr = actual;
                    }
                }
            }
            // SAFETY: `child_ptr` is non-null and was installed by either this
            // thread or a racing one via the same `Box::into_raw` + CAS path.
            let child = unsafe { &*child_ptr };
            match child {
                SegmentChild::Segments(arr) => seg = &arr[idx[level]],
                SegmentChild::Buckets(arr) => return &arr[idx[level]],
            }
        }
        unreachable!("segment tree always bottoms out at a bucket array")
    }

    pub fn bucket_head(&self, bucket_index: u64) -> *mut Node<K, V> {
        match self.get_bucket_cell(bucket_index) {
            Some(cell) => cell.head.load(Ordering::Acquire),
            None => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_parent_clears_high_bit() {
        assert_eq!(bucket_parent(0), 0);
        assert_eq!(bucket_parent(1), 0);
        assert_eq!(bucket_parent(5), 1);
        assert_eq!(bucket_parent(8), 0);
    }

    #[test]
    fn missing_path_reads_as_none_then_creates_on_demand() {
        let tree: SegmentTree<i32, i32> = SegmentTree::new();
        assert!(tree.get_bucket_cell(12345).is_none());
        let cell = tree.get_or_create_bucket_cell(12345);
        assert!(cell.head.load(Ordering::Acquire).is_null());
        assert!(tree.get_bucket_cell(12345).is_some());
    }

    #[test]
    fn digits_roundtrip_through_base_64() {
        for idx in [0u64, 1, 63, 64, 4095, 4096, 16_777_215] {
            let d = digits(idx);
            let mut reconstructed = 0u64;
            for digit in d {
                reconstructed = reconstructed * SEGMENT_SIZE as u64 + digit as u64;
            }
            assert_eq!(reconstructed, idx);
        }
    }
}
