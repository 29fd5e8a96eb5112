pub mod comparator;
pub mod murmur;

pub use comparator::{DefaultComparator, KeyOrder};
pub use murmur::{murmur3_x64_128_low, HashFn, Murmur3Hasher};
