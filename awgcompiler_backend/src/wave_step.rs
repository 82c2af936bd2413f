//! The atomic waveform primitive.
//!
//! A [`WaveStep`] is a stretch of samples of one of four kinds ([`StepType`]):
//!
//! - `wait`: zero output,
//! - `constant`: a DC level in `[-1, 1]` of full scale,
//! - `sine`: a sum of tones with individual amplitudes and phases (degrees),
//! - `robust`: tones whose amplitude and phase follow an imported [`RobustPulse`].
//!
//! Two digital markers (`smpl` and `sync`) travel with every sample. The M8190A packs them into
//! the low bits of each 16-bit word, the 12-bit DAC value sits in the upper bits:
//!
//! ```text
//! | 15 ........... 4 | 3 | 2 |   1  |   0  |
//! |    DAC value     | - | - | sync | smpl |
//! ```
//!
//! Every setter validates its input, so a constructed step is always synthesizable: durations
//! fall on full samples and tone amplitudes never sum above one.
//!
//! ```
//! use awgcompiler_backend::wave_step::*;
//!
//! let step = WaveStep::constant("level", 0.032, 0.5).unwrap().with_markers(true, false);
//! let samples = step.samples(0);
//! assert_eq!(samples.len(), 384);
//! assert_eq!(samples[0], (1024 << 4) + 1);
//!
//! assert!(WaveStep::sine("two tones", 1.0, vec![1., 2.], vec![0.6, 0.6], vec![0.]).is_err());
//! ```

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use ndarray::Array1;

use crate::error::{AwgError, Result};
use crate::robust::RobustPulse;
use crate::utils::*;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepType {
    #[default]
    Wait,
    Constant,
    Sine,
    Robust,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                StepType::Wait => "wait",
                StepType::Constant => "constant",
                StepType::Sine => "sine",
                StepType::Robust => "robust",
            }
        )
    }
}

impl FromStr for StepType {
    type Err = AwgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wait" => Ok(StepType::Wait),
            "constant" => Ok(StepType::Constant),
            "sine" => Ok(StepType::Sine),
            "robust" => Ok(StepType::Robust),
            _ => Err(AwgError::config(format!("unknown step type '{}'", s))),
        }
    }
}

/// Reference of the sine phase: the running sample index of the sequence (`Coherent`) or the
/// first sample of the step (`Absolute`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PhaseOffsetType {
    #[default]
    Coherent,
    Absolute,
}

impl FromStr for PhaseOffsetType {
    type Err = AwgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coherent" => Ok(PhaseOffsetType::Coherent),
            "absolute" => Ok(PhaseOffsetType::Absolute),
            _ => Err(AwgError::config(format!("unknown phase offset type '{}'", s))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WaveStep {
    name: String,
    comment: String,
    step_type: StepType,
    length_smpl: i64,
    frequencies: Vec<f64>,
    amplitudes: Vec<f64>,
    phases: Vec<f64>,
    constant_value: f64,
    smpl_marker: bool,
    sync_marker: bool,
    phase_offset_type: PhaseOffsetType,
    robust: Option<RobustPulse>,
}

/// Expands a single value to `n` copies; otherwise requires exactly `n` values.
fn broadcast(what: &str, values: &[f64], n: usize) -> Result<Vec<f64>> {
    match values.len() {
        1 => Ok(vec![values[0]; n]),
        len if len == n => Ok(values.to_vec()),
        len => Err(AwgError::index(format!("{} (one per frequency)", what), len, n)),
    }
}

impl WaveStep {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            comment: String::new(),
            step_type: StepType::Wait,
            length_smpl: 0,
            frequencies: vec![0.],
            amplitudes: vec![0.],
            phases: vec![0.],
            constant_value: 0.,
            smpl_marker: false,
            sync_marker: false,
            phase_offset_type: PhaseOffsetType::Coherent,
            robust: None,
        }
    }

    pub fn wait(name: &str, length_mus: f64) -> Result<Self> {
        let mut step = Self::empty(name);
        step.set_length_mus(length_mus)?;
        Ok(step)
    }

    pub fn wait_smpl(name: &str, length_smpl: i64) -> Result<Self> {
        let mut step = Self::empty(name);
        step.set_length_smpl(length_smpl)?;
        Ok(step)
    }

    /// Unchecked wait used to fill segments up to a legal length.
    pub(crate) fn padding(name: &str, length_smpl: i64) -> Self {
        let mut step = Self::empty(name);
        step.length_smpl = length_smpl;
        step
    }

    pub fn constant(name: &str, length_mus: f64, value: f64) -> Result<Self> {
        let mut step = Self::wait(name, length_mus)?;
        step.set_constant_value(value)?;
        step.step_type = StepType::Constant;
        Ok(step)
    }

    /// Sine tones at `frequencies` (MHz). `amplitudes` and `phases` (degrees) hold either one value
    /// per frequency or a single value shared by all of them.
    pub fn sine(
        name: &str,
        length_mus: f64,
        frequencies: Vec<f64>,
        amplitudes: Vec<f64>,
        phases: Vec<f64>,
    ) -> Result<Self> {
        let mut step = Self::wait(name, length_mus)?;
        step.set_tones(frequencies, amplitudes, phases)?;
        step.step_type = StepType::Sine;
        Ok(step)
    }

    /// A step playing `pulse` on `frequencies`; its length is the length of the pulse.
    pub fn robust(
        name: &str,
        pulse: RobustPulse,
        frequencies: Vec<f64>,
        phases: Vec<f64>,
    ) -> Result<Self> {
        let mut step = Self::empty(name);
        step.set_tones(frequencies, vec![0.], phases)?;
        step.set_robust_pulse(pulse)?;
        Ok(step)
    }

    pub fn with_markers(mut self, smpl_marker: bool, sync_marker: bool) -> Self {
        self.smpl_marker = smpl_marker;
        self.sync_marker = sync_marker;
        self
    }

    pub fn with_phase_offset_type(mut self, phase_offset_type: PhaseOffsetType) -> Self {
        self.phase_offset_type = phase_offset_type;
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }

    // Field methods
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn comment(&self) -> &str {
        &self.comment
    }
    pub fn step_type(&self) -> StepType {
        self.step_type
    }
    pub fn length_smpl(&self) -> i64 {
        self.length_smpl
    }
    pub fn length_mus(&self) -> f64 {
        smpl_to_mus(self.length_smpl)
    }
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }
    pub fn constant_value(&self) -> f64 {
        self.constant_value
    }
    pub fn smpl_marker(&self) -> bool {
        self.smpl_marker
    }
    pub fn sync_marker(&self) -> bool {
        self.sync_marker
    }
    pub fn phase_offset_type(&self) -> PhaseOffsetType {
        self.phase_offset_type
    }
    pub fn robust_pulse(&self) -> Option<&RobustPulse> {
        self.robust.as_ref()
    }

    /// Amplitudes broadcast to one per frequency.
    pub fn amplitudes(&self) -> Vec<f64> {
        broadcast("amplitudes", &self.amplitudes, self.frequencies.len())
            .unwrap_or_else(|_| self.amplitudes.clone())
    }

    /// Phases in degrees, broadcast to one per frequency.
    pub fn phases(&self) -> Vec<f64> {
        broadcast("phases", &self.phases, self.frequencies.len())
            .unwrap_or_else(|_| self.phases.clone())
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn set_length_mus(&mut self, length_mus: f64) -> Result<()> {
        valid_length_mus(length_mus)?;
        check_range(
            "length_mus",
            length_mus,
            0.,
            (MAX_LENGTH_SMPL - 1.) / SAMPLE_FREQUENCY,
        )?;
        self.set_length_smpl(mus_to_smpl(length_mus)?)
    }

    pub fn set_length_smpl(&mut self, length_smpl: i64) -> Result<()> {
        check_range("length_smpl", length_smpl as f64, 0., MAX_LENGTH_SMPL - 1.)?;
        if let Some(pulse) = &self.robust {
            if pulse.length_smpl() != length_smpl {
                return Err(AwgError::DurationMismatch {
                    lengths_mus: vec![smpl_to_mus(length_smpl), pulse.length_mus()],
                });
            }
        }
        self.length_smpl = length_smpl;
        Ok(())
    }

    fn check_tones(&self, frequencies: &[f64], amplitudes: &[f64], phases: &[f64]) -> Result<()> {
        if frequencies.is_empty() {
            return Err(AwgError::index("frequencies", 0, 1));
        }
        if let Some(f) = frequencies.iter().find(|f| !f.is_finite()) {
            return Err(AwgError::ValueOutOfRange {
                name: "frequency".to_string(),
                value: *f,
                min: f64::NEG_INFINITY,
                max: f64::INFINITY,
            });
        }
        let amps = broadcast("amplitudes", amplitudes, frequencies.len())?;
        broadcast("phases", phases, frequencies.len())?;
        if let Some(a) = amps.iter().find(|a| !(**a >= 0.)) {
            return Err(AwgError::ValueOutOfRange {
                name: "amplitude".to_string(),
                value: *a,
                min: 0.,
                max: 1.,
            });
        }
        let sum: f64 = amps.iter().sum();
        if sum - 1.0 > AMPLITUDE_TOLERANCE {
            return Err(AwgError::AmplitudeOverflow {
                name: self.name.clone(),
                sum,
                frequencies: frequencies.to_vec(),
            });
        }
        if let Some(pulse) = &self.robust {
            self.check_robust_pulse(pulse, frequencies.len())?;
        }
        Ok(())
    }

    fn check_robust_pulse(&self, pulse: &RobustPulse, n_freq: usize) -> Result<()> {
        if !pulse.supports_frequencies(n_freq) {
            return Err(AwgError::index(
                "frequencies of the robust pulse",
                n_freq,
                pulse.number_of_frequencies(),
            ));
        }
        let sum = pulse.max_amplitude_sum(n_freq);
        if sum - 1.0 > AMPLITUDE_TOLERANCE {
            return Err(AwgError::PowerOverflow(format!(
                "wave step '{}' drives {} frequencies with a total amplitude of {}",
                self.name, n_freq, sum
            )));
        }
        Ok(())
    }

    /// Assigns frequencies, amplitudes and phases together, checking the amplitude sum.
    pub fn set_tones(
        &mut self,
        frequencies: Vec<f64>,
        amplitudes: Vec<f64>,
        phases: Vec<f64>,
    ) -> Result<()> {
        self.check_tones(&frequencies, &amplitudes, &phases)?;
        self.frequencies = frequencies;
        self.amplitudes = amplitudes;
        self.phases = phases;
        Ok(())
    }

    pub fn set_frequencies(&mut self, frequencies: Vec<f64>) -> Result<()> {
        self.check_tones(&frequencies, &self.amplitudes, &self.phases)?;
        self.frequencies = frequencies;
        Ok(())
    }

    pub fn set_amplitudes(&mut self, amplitudes: Vec<f64>) -> Result<()> {
        self.check_tones(&self.frequencies, &amplitudes, &self.phases)?;
        self.amplitudes = amplitudes;
        Ok(())
    }

    pub fn set_phases(&mut self, phases: Vec<f64>) -> Result<()> {
        self.check_tones(&self.frequencies, &self.amplitudes, &phases)?;
        self.phases = phases;
        Ok(())
    }

    pub fn set_constant_value(&mut self, value: f64) -> Result<()> {
        self.constant_value = check_range(
            "constant_value",
            value,
            -(1. + AMPLITUDE_TOLERANCE),
            1. + AMPLITUDE_TOLERANCE,
        )?;
        Ok(())
    }

    pub fn set_markers(&mut self, smpl_marker: bool, sync_marker: bool) {
        self.smpl_marker = smpl_marker;
        self.sync_marker = sync_marker;
    }

    pub fn set_phase_offset_type(&mut self, phase_offset_type: PhaseOffsetType) {
        self.phase_offset_type = phase_offset_type;
    }

    /// Turns the step into a `robust` step with the length of `pulse`.
    pub fn set_robust_pulse(&mut self, pulse: RobustPulse) -> Result<()> {
        self.check_robust_pulse(&pulse, self.frequencies.len())?;
        self.length_smpl = pulse.length_smpl();
        self.robust = Some(pulse);
        self.step_type = StepType::Robust;
        Ok(())
    }

    /// Marker bits as they appear in the low bits of every sample.
    pub fn marker(&self) -> i16 {
        self.smpl_marker as i16 + 2 * self.sync_marker as i16
    }

    pub fn effective_offset(&self, coherent_offset: i64) -> i64 {
        match self.phase_offset_type {
            PhaseOffsetType::Coherent => coherent_offset,
            PhaseOffsetType::Absolute => 0,
        }
    }

    /// Writes the step into `out`, which must be `length_smpl` long.
    ///
    /// `coherent_offset` is the index of the first sample of the step counted from the start of
    /// the sequence; sine phases are continuous across steps sharing the same reference.
    pub fn fill_samples(&self, coherent_offset: i64, out: &mut [i16]) {
        debug_assert_eq!(out.len() as i64, self.length_smpl);
        let offset = self.effective_offset(coherent_offset) as f64;
        match self.step_type {
            StepType::Wait => out.fill(0),
            StepType::Constant => out.fill((self.constant_value * DAC_FULL_SCALE).round() as i16),
            StepType::Sine | StepType::Robust => {
                let amplitudes = self.amplitudes();
                let phases = self.phases();
                let mut acc = vec![0f64; out.len()];
                for (i, freq) in self.frequencies.iter().enumerate() {
                    let omega = 2. * PI * freq / SAMPLE_FREQUENCY;
                    match &self.robust {
                        Some(pulse) if self.step_type == StepType::Robust => {
                            let amps = pulse.amplitude_samples(i);
                            let pulse_phases = pulse.phase_samples(i);
                            for (k, v) in acc.iter_mut().enumerate() {
                                let arg = omega * (offset + k as f64)
                                    + (pulse_phases[k] + phases[i]).to_radians();
                                *v += amps[k] * DAC_FULL_SCALE * arg.sin();
                            }
                        }
                        _ => {
                            let phase = phases[i].to_radians();
                            let amp = amplitudes[i] * DAC_FULL_SCALE;
                            for (k, v) in acc.iter_mut().enumerate() {
                                *v += amp * (omega * (offset + k as f64) + phase).sin();
                            }
                        }
                    }
                }
                for (o, v) in out.iter_mut().zip(acc) {
                    *o = v as i16;
                }
            }
        }
        let marker = self.marker();
        out.iter_mut()
            .for_each(|o| *o = o.wrapping_shl(4).wrapping_add(marker));
    }

    pub fn samples(&self, coherent_offset: i64) -> Array1<i16> {
        let mut samples = Array1::zeros(self.length_smpl as usize);
        if let Some(out) = samples.as_slice_mut() {
            self.fill_samples(coherent_offset, out);
        }
        samples
    }

    /// The output level the AWG produces, in units of full scale, at 12-bit resolution.
    pub fn samples_amp(&self, coherent_offset: i64) -> Array1<f64> {
        self.samples(coherent_offset)
            .mapv(|s| (s >> 4) as f64 / DAC_FULL_SCALE)
    }

    pub fn samples_marker(&self) -> Array1<i16> {
        Array1::from_elem(self.length_smpl as usize, self.marker())
    }

    /// Mean squared amplitude of the step, used as RF power proxy.
    pub fn normalized_power(&self) -> f64 {
        match self.step_type {
            StepType::Wait | StepType::Constant => 0.,
            StepType::Sine => self.amplitudes().iter().map(|a| a * a).sum(),
            StepType::Robust => self
                .robust
                .as_ref()
                .map_or(0., |p| p.normalized_power(self.frequencies.len())),
        }
    }

    pub fn info_line(&self, row: usize, prefix: &str) -> String {
        let markers = format!("{:<8}{:<8}", self.smpl_marker as u8, self.sync_marker as u8);
        let head = format!(
            "{}{:<6}{:<18}{:<10.6}{:<10}",
            prefix,
            row,
            self.name,
            self.length_mus(),
            self.step_type
        );
        match self.step_type {
            StepType::Wait => format!("{}{}", head, markers),
            StepType::Constant => format!("{}{:<8}{}", head, self.constant_value, markers),
            StepType::Sine => format!(
                "{}{:?} {:?} {:?} {}",
                head,
                self.frequencies,
                self.amplitudes(),
                self.phases(),
                markers
            ),
            StepType::Robust => format!(
                "{}{:?} robust({} steps) {:?} {}",
                head,
                self.frequencies,
                self.robust.as_ref().map_or(0, |p| p.number_of_steps()),
                self.phases(),
                markers
            ),
        }
    }
}

/// Per-channel description of a wave step whose length is decided when it is added to a
/// program, see [`crate::multi_ch_seq::MultiChSeq::add_step`].
///
/// ```
/// use awgcompiler_backend::wave_step::*;
///
/// let step = StepParams::sine(vec![2.], vec![0.5])
///     .phases(vec![90.])
///     .sync_marker(true)
///     .build(0.5, "pi/2")
///     .unwrap();
/// assert_eq!(step.step_type(), StepType::Sine);
/// assert_eq!(step.length_smpl(), 6000);
/// assert!(step.sync_marker());
/// ```
#[derive(Clone, Debug, Default)]
pub struct StepParams {
    pub step_type: StepType,
    pub name: Option<String>,
    pub length_mus: Option<f64>,
    pub frequencies: Option<Vec<f64>>,
    pub amplitudes: Option<Vec<f64>>,
    pub phases: Option<Vec<f64>>,
    pub constant_value: Option<f64>,
    pub smpl_marker: bool,
    pub sync_marker: bool,
    pub phase_offset_type: PhaseOffsetType,
    pub robust: Option<RobustPulse>,
}

impl StepParams {
    pub fn wait() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        Self {
            step_type: StepType::Constant,
            constant_value: Some(value),
            ..Default::default()
        }
    }

    pub fn sine(frequencies: Vec<f64>, amplitudes: Vec<f64>) -> Self {
        Self {
            step_type: StepType::Sine,
            frequencies: Some(frequencies),
            amplitudes: Some(amplitudes),
            ..Default::default()
        }
    }

    pub fn robust(pulse: RobustPulse, frequencies: Vec<f64>) -> Self {
        Self {
            step_type: StepType::Robust,
            frequencies: Some(frequencies),
            robust: Some(pulse),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn length_mus(mut self, length_mus: f64) -> Self {
        self.length_mus = Some(length_mus);
        self
    }

    pub fn phases(mut self, phases: Vec<f64>) -> Self {
        self.phases = Some(phases);
        self
    }

    pub fn smpl_marker(mut self, on: bool) -> Self {
        self.smpl_marker = on;
        self
    }

    pub fn sync_marker(mut self, on: bool) -> Self {
        self.sync_marker = on;
        self
    }

    pub fn phase_offset_type(mut self, phase_offset_type: PhaseOffsetType) -> Self {
        self.phase_offset_type = phase_offset_type;
        self
    }

    /// Length this step insists on: the pulse length for robust steps, else an explicit length.
    pub fn own_length_mus(&self) -> Option<f64> {
        match (&self.robust, self.step_type) {
            (Some(pulse), StepType::Robust) => Some(pulse.length_mus()),
            _ => self.length_mus,
        }
    }

    pub fn build(&self, length_mus: f64, default_name: &str) -> Result<WaveStep> {
        let name = self.name.as_deref().unwrap_or(default_name);
        let frequencies = self.frequencies.clone().unwrap_or_else(|| vec![0.]);
        let amplitudes = self.amplitudes.clone().unwrap_or_else(|| vec![0.]);
        let phases = self.phases.clone().unwrap_or_else(|| vec![0.]);
        let step = match self.step_type {
            StepType::Wait => WaveStep::wait(name, length_mus)?,
            StepType::Constant => {
                WaveStep::constant(name, length_mus, self.constant_value.unwrap_or(0.))?
            }
            StepType::Sine => WaveStep::sine(name, length_mus, frequencies, amplitudes, phases)?,
            StepType::Robust => {
                let pulse = self.robust.clone().ok_or_else(|| {
                    AwgError::table(format!("robust step '{}' has no pulse table", name))
                })?;
                WaveStep::robust(name, pulse, frequencies, phases)?
            }
        };
        Ok(step
            .with_markers(self.smpl_marker, self.sync_marker)
            .with_phase_offset_type(self.phase_offset_type))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::robust::{LinearResponse, RobustOptions};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::sync::Arc;

    #[test]
    fn wait_is_zero_plus_markers() {
        let step = WaveStep::wait("w", 0.1).unwrap().with_markers(false, true);
        assert_eq!(step.length_smpl(), 1200);
        assert!(step.samples(17).iter().all(|&s| s == 2));
        assert!(step.samples_amp(0).iter().all(|&a| a == 0.));
    }

    #[test]
    fn constant_levels() {
        let full = WaveStep::constant("c", 0.032, 1.0).unwrap();
        assert!(full.samples(0).iter().all(|&s| s == 2047 << 4));
        let neg = WaveStep::constant("c", 0.032, -1.0).unwrap();
        assert!(neg.samples(0).iter().all(|&s| s == -2047 * 16));
        assert_abs_diff_eq!(neg.samples_amp(0)[0], -1.0);
        assert!(WaveStep::constant("c", 0.032, 1.01).is_err());
    }

    #[test]
    fn sine_follows_formula() {
        let step = WaveStep::sine("s", 0.032, vec![375.], vec![1.0], vec![0.]).unwrap();
        let samples = step.samples(0);
        // 375 MHz at 12 GSa/s: one period every 32 samples.
        assert_eq!(samples[0], 0);
        assert_eq!(samples[8], 2047 << 4);
        assert_eq!(samples[24], -2047 * 16);
        for k in 0..samples.len() {
            let expected = (2047. * (2. * PI * 375. / 12e3 * k as f64).sin()) as i16;
            assert_eq!(samples[k], expected << 4);
        }
    }

    #[test]
    fn coherent_and_absolute_phase() {
        let coherent = WaveStep::sine("s", 0.032, vec![375.], vec![1.0], vec![0.]).unwrap();
        let absolute = coherent
            .clone()
            .with_phase_offset_type(PhaseOffsetType::Absolute);
        // An offset of 8 samples is a quarter period.
        assert_eq!(coherent.samples(8)[0], 2047 << 4);
        assert_eq!(absolute.samples(8)[0], 0);
        assert_eq!(absolute.samples(8), coherent.samples(0));
    }

    #[test]
    fn phase_in_degrees() {
        let step = WaveStep::sine("s", 0.032, vec![375.], vec![0.5], vec![90.]).unwrap();
        assert_eq!(step.samples(0)[0], ((0.5 * 2047.) as i16) << 4);
    }

    #[test]
    fn amplitude_sum_invariant() {
        assert!(WaveStep::sine("s", 1.0, vec![1., 2.], vec![0.5, 0.5], vec![0.]).is_ok());
        let amplitude = 0.5 + 2. * f64::EPSILON;
        assert!(WaveStep::sine("s", 1.0, vec![1., 2.], vec![amplitude], vec![0.]).is_ok());
        let err = WaveStep::sine("s", 1.0, vec![1., 2.], vec![0.51], vec![0.]).unwrap_err();
        assert!(matches!(err, AwgError::AmplitudeOverflow { .. }));

        let mut step = WaveStep::sine("s", 1.0, vec![1.], vec![0.6], vec![0.]).unwrap();
        assert!(step.set_frequencies(vec![1., 2.]).is_err());
        assert_eq!(step.frequencies(), &[1.]);
        assert!(step.set_amplitudes(vec![0.7, 0.2]).is_err());
        assert!(step.set_amplitudes(vec![1.0]).is_ok());
    }

    #[test]
    fn broadcast_amplitudes_and_phases() {
        let step = WaveStep::sine("s", 1.0, vec![1., 2., 3.], vec![0.2], vec![10.]).unwrap();
        assert_eq!(step.amplitudes(), vec![0.2, 0.2, 0.2]);
        assert_eq!(step.phases(), vec![10., 10., 10.]);
        assert_abs_diff_eq!(step.normalized_power(), 0.12, epsilon = 1e-12);
        assert!(WaveStep::sine("s", 1.0, vec![1., 2., 3.], vec![0.2, 0.2], vec![0.]).is_err());
    }

    #[test]
    fn invalid_lengths() {
        assert!(matches!(
            WaveStep::wait("w", 0.5 / SAMPLE_FREQUENCY),
            Err(AwgError::InvalidDuration { .. })
        ));
        assert!(WaveStep::wait("w", -1.0).is_err());
        assert!(WaveStep::wait_smpl("w", -1).is_err());
        assert_eq!(WaveStep::wait("w", 0.0).unwrap().samples(0).len(), 0);
    }

    #[test]
    fn robust_step_uses_pulse_arrays() {
        let table = array![[0.016, 10.0, 0.0], [0.016, 5.0, PI / 2.]];
        let pulse =
            RobustPulse::new(table, Arc::new(LinearResponse::new(10.)), RobustOptions::default())
                .unwrap();
        let step = WaveStep::robust("r", pulse, vec![375.], vec![0.]).unwrap();
        assert_eq!(step.length_smpl(), 384);
        assert_eq!(step.step_type(), StepType::Robust);
        let samples = step.samples(0);
        assert_eq!(samples[8], 2047 << 4);
        // Second half: amplitude 0.5, phase shifted by a quarter period.
        let expected = (0.5 * 2047. * (2. * PI * 375. / 12e3 * 192. + PI / 2.).sin()) as i16;
        assert_eq!(samples[192], expected << 4);
        assert_abs_diff_eq!(step.normalized_power(), (1. + 0.25) / 2.);

        let mut step = step;
        assert!(matches!(
            step.set_length_mus(1.0),
            Err(AwgError::DurationMismatch { .. })
        ));
    }

    #[test]
    fn broadcast_robust_pulse_keeps_amplitude_sum() {
        let table = array![[0.032, 7.5, 0.0]];
        let pulse =
            RobustPulse::new(table, Arc::new(LinearResponse::new(10.)), RobustOptions::default())
                .unwrap();
        assert!(matches!(
            WaveStep::robust("r", pulse.clone(), vec![0., 0.], vec![90.]),
            Err(AwgError::PowerOverflow(_))
        ));

        let mut step = WaveStep::robust("r", pulse, vec![0.], vec![90.]).unwrap();
        assert!(step.samples(0).iter().all(|&s| s >= 0));
        assert!(matches!(
            step.set_frequencies(vec![0., 0.]),
            Err(AwgError::PowerOverflow(_))
        ));
        assert_eq!(step.frequencies(), &[0.]);
    }

    #[test]
    fn params_build() {
        let step = StepParams::constant(0.25)
            .smpl_marker(true)
            .build(0.1, "default")
            .unwrap();
        assert_eq!(step.name(), "default");
        assert_eq!(step.samples(0)[0], (512 << 4) + 1);
        assert!(StepParams {
            step_type: StepType::Robust,
            ..Default::default()
        }
        .build(0.1, "r")
        .is_err());
        assert_eq!(StepParams::wait().length_mus(0.2).own_length_mus(), Some(0.2));
    }

    #[test]
    fn step_type_names() {
        for t in [StepType::Wait, StepType::Constant, StepType::Sine, StepType::Robust] {
            assert_eq!(t.to_string().parse::<StepType>().unwrap(), t);
        }
        assert!("square".parse::<StepType>().is_err());
        assert_eq!("absolute".parse::<PhaseOffsetType>().unwrap(), PhaseOffsetType::Absolute);
    }
}
