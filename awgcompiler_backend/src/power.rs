//! Average RF power budgeting.
//!
//! Amplifier inputs tolerate a bounded average power. For every channel with a configured ceiling
//! the physical average power of a sequence is estimated as
//! `amplifier_gain * normalized_avg_power`. When the estimate exceeds the ceiling, the idle time
//! needed to bring it back under is turned into a looped wait segment appended to the sequence.

use crate::config::{AwgConfig, ChannelId};
use crate::error::{AwgError, Result};
use crate::sequence::Sequence;
use crate::utils::*;

pub const POWER_SAFETY_SEGMENT_NAME: &str = "rf_power_safety";
/// Residual overage tolerated after correction.
pub const POWER_RECHECK_MARGIN: f64 = 1.1;

/// Power figures of one channel of one sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct PowerCheck {
    pub channel: ChannelId,
    pub avg_power: f64,
    pub max_avg_power: f64,
    /// Idle time that would bring `avg_power` down to `max_avg_power`, zero when within budget.
    pub additional_wait_mus: f64,
}

impl PowerCheck {
    pub fn within_budget(&self) -> bool {
        self.additional_wait_mus <= SAMPLE_DURATION_TOLERANCE
    }

    pub fn exceeds_margin(&self) -> bool {
        self.avg_power > POWER_RECHECK_MARGIN * self.max_avg_power
    }

    pub fn into_error(self, program: &str) -> AwgError {
        AwgError::PowerBudgetExceeded {
            program: program.to_string(),
            channel: self.channel,
            avg_power: self.avg_power,
            max_avg_power: self.max_avg_power,
            additional_wait_mus: self.additional_wait_mus,
        }
    }
}

pub fn additional_wait_mus(length_mus: f64, avg_power: f64, max_avg_power: f64) -> f64 {
    (length_mus * (avg_power / max_avg_power - 1.)).max(0.)
}

/// Loop count of the [`BLM`]-long safety wait covering `additional_wait_mus`.
pub fn safety_loop_count(additional_wait_mus: f64) -> Result<u32> {
    let loops = (additional_wait_mus / BLM).ceil();
    check_range("rf_power_safety loop_count", loops, 0., u32::MAX as f64)?;
    Ok(loops as u32)
}

/// Checks `sequence` as played on `channel` against its ceiling.
///
/// Returns `None` for channels without a ceiling. A ceiling without an amplifier gain is a
/// configuration error.
pub fn check_avg_rf_power(
    config: &AwgConfig,
    channel: &ChannelId,
    sequence: &Sequence,
) -> Result<Option<PowerCheck>> {
    let max_avg_power = match config.max_sine_avg_power(channel) {
        Some(max) => max,
        None => return Ok(None),
    };
    let gain = config.amplifier_gain(channel).ok_or_else(|| {
        AwgError::config(format!(
            "channel {} has a power ceiling but no amplifier gain",
            channel
        ))
    })?;
    if max_avg_power <= 0. {
        return Err(AwgError::config(format!(
            "ceiling of channel {} must be positive, got {}",
            channel, max_avg_power
        )));
    }
    let avg_power = gain * sequence.normalized_avg_power()?;
    let additional_wait_mus = additional_wait_mus(sequence.length_mus()?, avg_power, max_avg_power);
    tracing::debug!(
        "{} '{}': avg power {:.4}, ceiling {:.4}, additional wait {:.4} mus",
        channel,
        sequence.name(),
        avg_power,
        max_avg_power,
        additional_wait_mus
    );
    Ok(Some(PowerCheck {
        channel: channel.clone(),
        avg_power,
        max_avg_power,
        additional_wait_mus,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::segment::{SegmentOptions, SequenceStep};
    use crate::wave_step::WaveStep;
    use approx::assert_relative_eq;

    fn config() -> AwgConfig {
        let mut config = AwgConfig::single("awg", &[1]);
        let ch = ChannelId::new("awg", 1);
        config.max_sine_avg_power.insert(ch.clone(), 1.0);
        config.amplifier_power.insert(ch, 10.0);
        config
    }

    fn sine_sequence(amplitude: f64) -> Sequence {
        let mut seq = Sequence::new("s");
        let step = WaveStep::sine("s", 10. * BLM, vec![100.], vec![amplitude], vec![0.]).unwrap();
        seq.push_segment(
            SequenceStep::new("a", SegmentOptions::default())
                .unwrap()
                .with_wave_steps(vec![step]),
        );
        seq
    }

    #[test]
    fn channels_without_ceiling_are_skipped() {
        let seq = sine_sequence(1.);
        let config = AwgConfig::single("awg", &[1]);
        assert!(check_avg_rf_power(&config, &ChannelId::new("awg", 1), &seq)
            .unwrap()
            .is_none());
    }

    #[test]
    fn over_budget_needs_wait() {
        // gain 10, amplitude^2 = 0.12: 20% over the ceiling
        let amplitude = 0.12f64.sqrt();
        let seq = sine_sequence(amplitude);
        let check = check_avg_rf_power(&config(), &ChannelId::new("awg", 1), &seq)
            .unwrap()
            .unwrap();
        assert_relative_eq!(check.avg_power, 1.2, max_relative = 1e-12);
        assert_relative_eq!(check.additional_wait_mus, 0.2 * 10. * BLM, max_relative = 1e-9);
        assert!(!check.within_budget());
        assert!(check.exceeds_margin());
        let loops = safety_loop_count(check.additional_wait_mus).unwrap() as f64;
        assert!(loops * BLM >= check.additional_wait_mus);
        assert!((loops - 1.) * BLM < check.additional_wait_mus);
    }

    #[test]
    fn under_budget() {
        let seq = sine_sequence(0.05);
        let check = check_avg_rf_power(&config(), &ChannelId::new("awg", 1), &seq)
            .unwrap()
            .unwrap();
        assert_eq!(check.additional_wait_mus, 0.);
        assert!(check.within_budget());
    }

    #[test]
    fn ceiling_needs_gain() {
        let mut config = config();
        config.amplifier_power.clear();
        let id = ChannelId::new("awg", 1);
        assert!(check_avg_rf_power(&config, &id, &sine_sequence(1.)).is_err());
    }

    #[test]
    fn wait_helpers() {
        assert_eq!(additional_wait_mus(10., 0.5, 1.), 0.);
        assert_relative_eq!(additional_wait_mus(10., 1.5, 1.), 5.);
        assert_eq!(safety_loop_count(0.).unwrap(), 0);
        assert_eq!(safety_loop_count(BLM * 1.5).unwrap(), 2);
        assert!(safety_loop_count(f64::INFINITY).is_err());
    }
}
