pub mod dsp;
pub mod kernel;

pub use kernel::ConvolutionKernel;

/// Partition sizes outside this range buy nothing: below 64 the FFT overhead
/// dominates, above 8192 the swap latency becomes audible.
pub const MIN_PARTITION: usize = 64;
pub const MAX_PARTITION: usize = 8192;

/// Pick the convolution partition size for a host maximum block length.
#[inline]
pub fn partition_for_block(max_block: usize) -> usize {
    max_block
        .next_power_of_two()
        .clamp(MIN_PARTITION, MAX_PARTITION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_pow2_and_clamped() {
        assert_eq!(partition_for_block(0), MIN_PARTITION);
        assert_eq!(partition_for_block(48), MIN_PARTITION);
        assert_eq!(partition_for_block(65), 128);
        assert_eq!(partition_for_block(512), 512);
        assert_eq!(partition_for_block(100_000), MAX_PARTITION);
    }
}
