use crate::error::ConfigError;
use crate::lfht::segment::SEGMENT_SIZE;

/// Tunables for the lock-free split-ordered table. `segment_fanout` and
/// `bucket_levels` describe the segment tree's shape (64-way, 4 levels,
/// matching `segment.rs`'s constants) and are only exposed here so
/// `validate` has something to check; the tree itself is not generic over
/// them. `load_factor` governs when `bucket_count` doubles: once
/// `size > bucket_count * load_factor`.
#[derive(Debug, Clone, Copy)]
pub struct LfhtConfig {
    pub segment_fanout: usize,
    pub bucket_levels: usize,
    pub load_factor: f64,
}

impl Default for LfhtConfig {
    fn default() -> Self {
        Self {
            segment_fanout: SEGMENT_SIZE,
            bucket_levels: 4,
            load_factor: 0.5,
        }
    }
}

impl LfhtConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_fanout == 0 || !self.segment_fanout.is_power_of_two() {
            return Err(ConfigError::SegmentFanoutNotPowerOfTwo(self.segment_fanout));
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(ConfigError::LoadFactorOutOfRange(self.load_factor));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(LfhtConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_fanout() {
        let cfg = LfhtConfig {
            segment_fanout: 60,
            ..LfhtConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::SegmentFanoutNotPowerOfTwo(60))
        );
    }

    #[test]
    fn rejects_out_of_range_load_factor() {
        let cfg = LfhtConfig {
            load_factor: 1.5,
            ..LfhtConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::LoadFactorOutOfRange(_))
        ));
    }
}
