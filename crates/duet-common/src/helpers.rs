//! Common helper functions for Duet.

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Number of samples per channel covering `duration` at `sample_rate`, rounded to nearest.
pub fn duration_to_samples(sample_rate: u32, duration: Duration) -> usize {
    let nanos = duration.as_nanos() * sample_rate as u128;
    ((nanos + NANOS_PER_SEC / 2) / NANOS_PER_SEC) as usize
}

/// Interleaved sample count of one frame: `channels * round(duration * rate)`.
pub fn frame_samples(sample_rate: u32, channels: usize, duration: Duration) -> usize {
    channels * duration_to_samples(sample_rate, duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes_at_48k_stereo() {
        assert_eq!(frame_samples(48_000, 2, Duration::from_millis(20)), 1920);
        assert_eq!(frame_samples(48_000, 2, Duration::from_millis(120)), 11520);
        assert_eq!(frame_samples(48_000, 2, Duration::from_millis(30)), 2880);
    }

    #[test]
    fn duration_to_samples_rounds() {
        // 2.5ms at 8kHz is exactly 20
        assert_eq!(duration_to_samples(8_000, Duration::from_micros(2_500)), 20);
        // 1.0625 samples rounds down, 1.5 rounds up
        assert_eq!(duration_to_samples(16_000, Duration::from_nanos(66_406)), 1);
        assert_eq!(duration_to_samples(1_000, Duration::from_micros(1_500)), 2);
        assert_eq!(duration_to_samples(48_000, Duration::ZERO), 0);
    }

    #[test]
    fn env_bool_defaults_when_unset() {
        assert!(env_bool("DUET_TEST_SURELY_UNSET_VARIABLE", true));
        assert!(!env_bool("DUET_TEST_SURELY_UNSET_VARIABLE", false));
    }
}
