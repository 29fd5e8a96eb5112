use thiserror::Error;

/// Errors that can arise from caller-supplied tunables when constructing a
/// container. Not part of the `Map` contract itself — those outcomes are
/// reported through plain `bool`/`Option` returns (see `map::Map`).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
    #[error("header depth {0} exceeds maximum of {1}")]
    HeaderDepthTooLarge(u32, u32),

    #[error("directory depth {0} exceeds maximum of {1}")]
    DirectoryDepthTooLarge(u32, u32),

    #[error("bucket capacity must be at least 1")]
    BucketCapacityZero,

    #[error("segment fan-out must be a power of two, got {0}")]
    SegmentFanoutNotPowerOfTwo(usize),

    #[error("load factor must be in (0, 1], got {0}")]
    LoadFactorOutOfRange(f64),
}
