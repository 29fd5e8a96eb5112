use crate::error::ConfigError;

/// `HTABLE_HEADER_MAX_DEPTH` in the page-oriented original: the header's
/// fan-out is bounded so its directory-reference table stays small.
pub const DEFAULT_MAX_HEADER_DEPTH: u32 = 9;

/// `HTABLE_DIRECTORY_MAX_DEPTH`.
pub const DEFAULT_MAX_DIRECTORY_DEPTH: u32 = 9;

/// Tunables for both the coarse-grained and fine-grained extendible hash
/// table. `bucket_capacity` defaults to `HTableBucketArraySize`: as many
/// entries as fit in a nominal 1000-byte page, floored at 1.
#[derive(Debug, Clone, Copy)]
pub struct EhtConfig {
    pub max_header_depth: u32,
    pub max_directory_depth: u32,
    pub bucket_capacity: usize,
}

impl EhtConfig {
    pub fn for_types<K, V>() -> Self {
        Self {
            max_header_depth: DEFAULT_MAX_HEADER_DEPTH,
            max_directory_depth: DEFAULT_MAX_DIRECTORY_DEPTH,
            bucket_capacity: default_bucket_capacity::<K, V>(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_header_depth > DEFAULT_MAX_HEADER_DEPTH {
            return Err(ConfigError::HeaderDepthTooLarge(
                self.max_header_depth,
                DEFAULT_MAX_HEADER_DEPTH,
            ));
        }
        if self.max_directory_depth > DEFAULT_MAX_DIRECTORY_DEPTH {
            return Err(ConfigError::DirectoryDepthTooLarge(
                self.max_directory_depth,
                DEFAULT_MAX_DIRECTORY_DEPTH,
            ));
        }
        if self.bucket_capacity == 0 {
            return Err(ConfigError::BucketCapacityZero);
        }
        Ok(())
    }
}

/// `HTableBucketArraySize(x) = 1000 / x`, floored at 1 entry.
pub fn default_bucket_capacity<K, V>() -> usize {
    let entry_size = std::mem::size_of::<K>() + std::mem::size_of::<V>();
    (1000 / entry_size.max(1)).max(1)
}
