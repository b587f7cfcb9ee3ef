/// Self-tuning chunk size for the transfer loop.
///
/// Starts from a bucket chosen by file size, grows after a run of
/// successful packet round-trips and shrinks on any failure:
///
/// ```text
///   size < 64 KiB   →  2 KiB
///   size < 1 MiB    →  8 KiB
///   size < 64 MiB   → 16 KiB
///   otherwise       → 32 KiB
/// ```
///
/// The result is always inside `[min_size, max_size]` and a multiple of the
/// AES block size.

use crate::config::{BLOCK, BufferConfig};

const KIB: u64 = 1024;

/// Initial chunk size for a file of `file_size` bytes.
pub fn initial_size(file_size: u64, config: &BufferConfig) -> usize {
    let bucket = if file_size < 64 * KIB {
        2 * 1024
    } else if file_size < 1024 * KIB {
        8 * 1024
    } else if file_size < 64 * 1024 * KIB {
        16 * 1024
    } else {
        32 * 1024
    };
    clamp_aligned(bucket as f64, config)
}

/// Round up to a block multiple, then keep inside the configured bounds.
/// Bounds are block multiples, so the clamp preserves alignment.
fn clamp_aligned(size: f64, config: &BufferConfig) -> usize {
    let size = size.max(0.0).ceil() as usize;
    let aligned = size.div_ceil(BLOCK) * BLOCK;
    aligned.clamp(config.min_size, config.max_size)
}

#[derive(Debug, Clone)]
pub struct BufferState {
    config: BufferConfig,
    current: usize,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl BufferState {
    pub fn new(config: BufferConfig, file_size: u64) -> Self {
        let current = initial_size(file_size, &config);
        Self {
            config,
            current,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    /// Start over for a new transfer attempt.
    pub fn reset(&mut self, file_size: u64) {
        self.current = initial_size(file_size, &self.config);
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a clean round-trip. Returns the new size if it changed.
    pub fn on_success(&mut self) -> Option<usize> {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        if self.consecutive_successes < self.config.grow_after {
            return None;
        }
        self.consecutive_successes = 0;
        let old = self.current;
        self.current = clamp_aligned(old as f64 * self.config.growth_factor, &self.config);
        (self.current != old).then_some(self.current)
    }

    /// Record a failed or recovered round-trip. Returns the new size if it
    /// changed.
    pub fn on_failure(&mut self) -> Option<usize> {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        let old = self.current;
        self.current = clamp_aligned(old as f64 * self.config.shrink_factor, &self.config);
        (self.current != old).then_some(self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn bucket_table() {
        let cfg = BufferConfig::default();
        assert_eq!(initial_size(0, &cfg), 2048);
        assert_eq!(initial_size(64 * 1024 - 1, &cfg), 2048);
        assert_eq!(initial_size(64 * 1024, &cfg), 8192);
        assert_eq!(initial_size(MIB, &cfg), 16384);
        assert_eq!(initial_size(10 * MIB, &cfg), 16384);
        assert_eq!(initial_size(64 * MIB, &cfg), 32768);
    }

    #[test]
    fn ten_mib_growth_then_shrink() {
        let mut buf = BufferState::new(BufferConfig::default(), 10 * MIB);
        assert_eq!(buf.current(), 16 * 1024);

        assert_eq!(buf.on_success(), None);
        assert_eq!(buf.on_success(), None);
        assert_eq!(buf.on_success(), Some(24 * 1024));

        for _ in 0..3 {
            buf.on_success();
        }
        assert_eq!(buf.current(), 32 * 1024);
        for _ in 0..3 {
            buf.on_success();
        }
        assert_eq!(buf.current(), 32 * 1024);

        assert_eq!(buf.on_failure(), Some(24 * 1024));
        assert_eq!(buf.current() % 16, 0);
    }

    #[test]
    fn failure_resets_success_run() {
        let mut buf = BufferState::new(BufferConfig::default(), 10 * MIB);
        buf.on_success();
        buf.on_success();
        buf.on_failure();
        assert_eq!(buf.consecutive_successes(), 0);
        assert_eq!(buf.consecutive_failures(), 1);
        let after_failure = buf.current();
        buf.on_success();
        buf.on_success();
        assert_eq!(buf.current(), after_failure);
    }

    #[test]
    fn shrink_floors_at_min() {
        let mut buf = BufferState::new(BufferConfig::default(), 0);
        for _ in 0..20 {
            buf.on_failure();
        }
        assert_eq!(buf.current(), 1024);
        assert_eq!(buf.on_failure(), None);
    }

    #[test]
    fn odd_products_round_up_to_block() {
        let cfg = BufferConfig {
            min_size: 1024,
            max_size: 32768,
            growth_factor: 1.37,
            shrink_factor: 0.61,
            grow_after: 1,
        };
        let mut buf = BufferState::new(cfg, 100 * 1024);
        buf.on_success();
        // 8192 * 1.37 = 11223.04 → 11232
        assert_eq!(buf.current(), 11232);
        buf.on_failure();
        // 11232 * 0.61 = 6851.52 → 6864
        assert_eq!(buf.current(), 6864);
    }

    #[test]
    fn arbitrary_outcomes_stay_in_bounds() {
        for seed in 0..50u64 {
            let mut buf = BufferState::new(BufferConfig::default(), seed * 3 * MIB);
            for _ in 0..500 {
                if rand::random::<u8>() % 4 == 0 {
                    buf.on_failure();
                } else {
                    buf.on_success();
                }
                let size = buf.current();
                assert!((1024..=32768).contains(&size), "size {} out of bounds", size);
                assert_eq!(size % 16, 0);
            }
        }
    }

    #[test]
    fn reset_restores_bucket() {
        let mut buf = BufferState::new(BufferConfig::default(), 10 * MIB);
        for _ in 0..6 {
            buf.on_success();
        }
        buf.on_failure();
        buf.reset(10 * MIB);
        assert_eq!(buf.current(), 16 * 1024);
        assert_eq!(buf.consecutive_failures(), 0);
    }
}
