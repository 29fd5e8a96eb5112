//! Concurrent in-memory associative container with two independent,
//! interchangeable implementations sharing one public contract
//! ([`Map`]): an extendible hash index (coarse- and fine-grained latching
//! variants, see [`eht`]) and a lock-free split-ordered hash table
//! reclaimed via hazard pointers (see [`lfht`]).

pub mod eht;
pub mod error;
pub mod hashing;
pub mod lfht;
pub mod map;

pub use eht::{CoarseEht, EhtConfig, FineGrainedEht};
pub use error::ConfigError;
pub use hashing::{DefaultComparator, HashFn, KeyOrder, Murmur3Hasher};
pub use lfht::{Lfht, LfhtConfig};
pub use map::Map;
