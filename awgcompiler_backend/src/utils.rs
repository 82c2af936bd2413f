//! Quantization and validation helpers shared by every waveform element.
//!
//! All durations in this crate come in two flavours: `mus` (microseconds, `f64`) and `smpl`
//! (integer sample count at [`SAMPLE_FREQUENCY`]). Every duration-bearing field is routed through
//! [`valid_length_mus`] / [`mus_to_smpl`] on assignment, so a stored pair always satisfies
//! `round(mus * SAMPLE_FREQUENCY) == smpl`.
//!
//! # Example
//! ```
//! use awgcompiler_backend::utils::*;
//!
//! assert_eq!(mus_to_smpl(1.0).unwrap(), 12000);
//! assert!(mus_to_smpl(1.0 / 24e3).is_err()); // half a sample
//! assert_eq!(quantize_amplitude(0.3), 614. / 2048.);
//! ```

use std::time::Instant;

use crate::error::{AwgError, Result};

/// Samples per microsecond (12 GSa/s).
pub const SAMPLE_FREQUENCY: f64 = 12e3;
pub const AMPLITUDE_GRANULARITY: f64 = 1. / 2048.;
pub const MAX_LENGTH_SMPL: f64 = 2e9;
/// Duration of the smallest block the sequencer handles comfortably (384 samples).
pub const BLM: f64 = 384. / SAMPLE_FREQUENCY;
/// Tolerance on a duration, one hundredth of a sample.
pub const SAMPLE_DURATION_TOLERANCE: f64 = 1e-2 / SAMPLE_FREQUENCY;
pub const MIN_SEGMENT_LENGTH_SMPL: i64 = 320;
pub const SEGMENT_GRANULARITY_SMPL: i64 = 64;
/// Largest value of the 12-bit signed DAC.
pub const DAC_FULL_SCALE: f64 = 2047.;
/// `segment_end_offset` value meaning "play until the end of the segment".
pub const SEGMENT_END_OFFSET_MAX: u32 = u32::MAX;
/// Slack allowed on amplitude sums and constant levels (ten machine epsilons).
pub const AMPLITUDE_TOLERANCE: f64 = 10. * f64::EPSILON;

pub fn round_to_full_sample(length_mus: f64) -> f64 {
    (length_mus * SAMPLE_FREQUENCY).round() / SAMPLE_FREQUENCY
}

/// Fails with [`AwgError::InvalidDuration`] unless `length_mus` lies within
/// [`SAMPLE_DURATION_TOLERANCE`] of a full sample.
pub fn valid_length_mus(length_mus: f64) -> Result<()> {
    let invalid = || AwgError::InvalidDuration {
        length_mus,
        sample_frequency: SAMPLE_FREQUENCY,
    };
    if !length_mus.is_finite() {
        return Err(invalid());
    }
    if (length_mus - round_to_full_sample(length_mus)).abs() > SAMPLE_DURATION_TOLERANCE {
        return Err(invalid());
    }
    Ok(())
}

pub fn valid_length_smpl(length_smpl: f64) -> Result<()> {
    if length_smpl.is_finite() && length_smpl.fract() == 0. {
        Ok(())
    } else {
        Err(AwgError::InvalidDuration {
            length_mus: length_smpl / SAMPLE_FREQUENCY,
            sample_frequency: SAMPLE_FREQUENCY,
        })
    }
}

pub fn mus_to_smpl(length_mus: f64) -> Result<i64> {
    valid_length_mus(length_mus)?;
    Ok((length_mus * SAMPLE_FREQUENCY).round() as i64)
}

pub fn smpl_to_mus(length_smpl: i64) -> f64 {
    length_smpl as f64 / SAMPLE_FREQUENCY
}

pub fn quantize_amplitude(amplitude: f64) -> f64 {
    (amplitude / AMPLITUDE_GRANULARITY).round() * AMPLITUDE_GRANULARITY
}

pub fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<f64> {
    if value.is_nan() || value < min || value > max {
        return Err(AwgError::ValueOutOfRange {
            name: name.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(value)
}

/// Number of samples needed to pad a block of `length_smpl` samples to a legal segment:
/// at least [`MIN_SEGMENT_LENGTH_SMPL`] long and a multiple of [`SEGMENT_GRANULARITY_SMPL`].
pub fn missing_smpl(length_smpl: i64) -> i64 {
    (MIN_SEGMENT_LENGTH_SMPL - length_smpl).max((-length_smpl).rem_euclid(SEGMENT_GRANULARITY_SMPL))
}

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Seconds elapsed since the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        tracing::debug!("{} ({:.4} s)", msg, diff);
        diff
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    #[rstest]
    #[case(0.0)]
    #[case(1.0)]
    #[case(3.0)]
    #[case(BLM)]
    #[case(27. * BLM)]
    #[case(1234. / SAMPLE_FREQUENCY)]
    fn mus_smpl_round_trip(#[case] length_mus: f64) {
        let smpl = mus_to_smpl(length_mus).unwrap();
        assert_abs_diff_eq!(smpl_to_mus(smpl), length_mus, epsilon = SAMPLE_DURATION_TOLERANCE);
    }

    #[rstest]
    #[case(0.5 / SAMPLE_FREQUENCY)]
    #[case(1.0 + 0.3 / SAMPLE_FREQUENCY)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn misaligned_durations_are_rejected(#[case] length_mus: f64) {
        assert!(matches!(
            mus_to_smpl(length_mus),
            Err(AwgError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn duration_within_tolerance_is_accepted() {
        let length_mus = 2.0 + 0.001 / SAMPLE_FREQUENCY;
        assert_eq!(mus_to_smpl(length_mus).unwrap(), 24000);
    }

    #[test]
    fn quantization_is_idempotent() {
        for a in [0.0, 0.1, 0.33333, 0.5, 0.999, 1.0] {
            let q = quantize_amplitude(a);
            assert_eq!(quantize_amplitude(q), q);
            assert!((q - a).abs() <= AMPLITUDE_GRANULARITY / 2.);
        }
        let d = round_to_full_sample(1.2345);
        assert_eq!(round_to_full_sample(d), d);
    }

    #[test]
    fn smpl_validation() {
        assert!(valid_length_smpl(12.).is_ok());
        assert!(valid_length_smpl(12.5).is_err());
    }

    #[rstest]
    #[case(0, 320)]
    #[case(100, 220)]
    #[case(320, 0)]
    #[case(384, 0)]
    #[case(36000, 32)]
    #[case(36032, 0)]
    #[case(400, 48)]
    fn padding_to_segment_granularity(#[case] length_smpl: i64, #[case] missing: i64) {
        assert_eq!(missing_smpl(length_smpl), missing);
        let padded = length_smpl + missing;
        assert!(padded >= MIN_SEGMENT_LENGTH_SMPL);
        assert_eq!(padded % SEGMENT_GRANULARITY_SMPL, 0);
    }

    #[test]
    fn range_check() {
        assert_eq!(check_range("x", 0.5, 0., 1.).unwrap(), 0.5);
        assert!(check_range("x", 1.5, 0., 1.).is_err());
        assert!(check_range("x", f64::NAN, 0., 1.).is_err());
    }
}
