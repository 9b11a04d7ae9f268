use std::time::Duration;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

/// Thresholds used by [`classify`](super::classify).
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOptions {
    /// A window slower than this fraction of the initial rate counts as
    /// throttling.
    pub throttle_factor: f64,
    /// Fewer chunk boundaries than this are not enough to measure a rate.
    pub min_throttle_chunks: usize,
    /// Windows shorter than this are timer noise, not a measurement.
    pub min_window_time: Duration,
    /// Two resets or stalls this many bytes apart count as the same offset.
    pub dpi_offset_tolerance: u64,
    /// Independent sessions that must share an offset before DPI is suspected.
    pub dpi_min_repeats: usize,
    /// A chunk slower than this multiple of the median chunk is a stall.
    pub stall_factor: f64,
    /// Accept private or loopback answers for non-literal hosts (lab setups).
    pub allow_private_resolution: bool,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            throttle_factor: 0.5,
            min_throttle_chunks: 4,
            min_window_time: Duration::from_millis(10),
            dpi_offset_tolerance: 4096,
            dpi_min_repeats: 2,
            stall_factor: 5.0,
            allow_private_resolution: false,
        }
    }
}

impl ClassifierOptions {
    pub(crate) fn dpi_min_repeats(&self) -> usize {
        self.dpi_min_repeats.max(2)
    }

    pub(crate) fn min_throttle_chunks(&self) -> usize {
        self.min_throttle_chunks.max(2)
    }
}
