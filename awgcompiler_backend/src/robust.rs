//! Import of tabulated ("robust") pulse shapes.
//!
//! A robust pulse is a piecewise-constant drive computed offline, typically by optimal control,
//! and stored as a whitespace separated table. Every row is one step of the pulse:
//!
//! ```text
//! duration  rabi_1  phase_1  [detuning_1]  rabi_2  phase_2  [detuning_2]  ...
//! ```
//!
//! Durations are in microseconds, Rabi frequencies in MHz and phases in radians. The number of
//! data columns decides whether detunings are present: a multiple of three (or at least six
//! columns) means `[rabi, phase, detuning]` triples, otherwise `[rabi, phase]` pairs.
//!
//! The importer maps every tabulated Rabi frequency through an [`AmplitudeResponse`] (the
//! measured, usually nonlinear, response of amplifier and antenna) to a DAC amplitude, quantizes
//! it and expands the table into per-sample amplitude and phase arrays, one row per frequency
//! channel. Those arrays drive the synthesis of `robust` wave steps.
//!
//! ```
//! use std::sync::Arc;
//! use awgcompiler_backend::robust::*;
//!
//! let table = parse_table("
//!     ## duration rabi phase
//!     0.032      5.0  0.0
//!     0.064      2.5  3.14159
//! ").unwrap();
//! let pulse = RobustPulse::new(
//!     table,
//!     Arc::new(LinearResponse::new(10.)),
//!     RobustOptions::default(),
//! ).unwrap();
//! assert_eq!(pulse.number_of_frequencies(), 1);
//! assert_eq!(pulse.length_smpl(), 1152);
//! assert_eq!(pulse.amplitude(1, 0), 0.25);
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{AwgError, Result};
use crate::utils::*;

/// Nonlinear map from a requested Rabi frequency to the DAC amplitude producing it.
///
/// Implementations return a negative amplitude when the requested Rabi frequency can not be
/// reached; the importer reports that as [`AwgError::PowerOverflow`].
pub trait AmplitudeResponse: Send + Sync + fmt::Debug {
    fn amplitude(&self, transition: Option<&str>, rabi: f64) -> f64;
}

/// Rabi frequency proportional to the DAC amplitude.
#[derive(Clone, Debug)]
pub struct LinearResponse {
    /// Rabi frequency in MHz reached at full DAC amplitude.
    pub rabi_at_full_scale: f64,
}

impl LinearResponse {
    pub fn new(rabi_at_full_scale: f64) -> Self {
        Self { rabi_at_full_scale }
    }
}

impl AmplitudeResponse for LinearResponse {
    fn amplitude(&self, _transition: Option<&str>, rabi: f64) -> f64 {
        rabi / self.rabi_at_full_scale
    }
}

/// Measured calibration curves `(amplitude, rabi)`, inverted by piecewise-linear interpolation.
///
/// Outside of the calibrated range the outermost segment is extrapolated linearly. A curve can be
/// registered per transition; lookups without (or with an unknown) transition use the default
/// curve.
#[derive(Clone, Debug)]
pub struct TabulatedResponse {
    default: Vec<(f64, f64)>,
    transitions: IndexMap<String, Vec<(f64, f64)>>,
}

impl TabulatedResponse {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self> {
        Ok(Self {
            default: Self::check_curve(points)?,
            transitions: IndexMap::new(),
        })
    }

    pub fn with_transition(mut self, transition: &str, points: Vec<(f64, f64)>) -> Result<Self> {
        self.transitions
            .insert(transition.to_string(), Self::check_curve(points)?);
        Ok(self)
    }

    fn check_curve(mut points: Vec<(f64, f64)>) -> Result<Vec<(f64, f64)>> {
        if points.len() < 2 {
            return Err(AwgError::table("a calibration curve needs at least two points"));
        }
        points.sort_by(|a, b| a.1.total_cmp(&b.1));
        if points.windows(2).any(|w| w[1].1 <= w[0].1 || w[1].0 <= w[0].0) {
            return Err(AwgError::table("calibration curve must be strictly increasing"));
        }
        Ok(points)
    }
}

impl AmplitudeResponse for TabulatedResponse {
    fn amplitude(&self, transition: Option<&str>, rabi: f64) -> f64 {
        let curve = transition
            .and_then(|t| self.transitions.get(t))
            .unwrap_or(&self.default);
        // Index of the segment used for interpolation, clamped to the outermost ones.
        let i = curve
            .iter()
            .position(|&(_, r)| r >= rabi)
            .unwrap_or(curve.len() - 1)
            .clamp(1, curve.len() - 1);
        let (a0, r0) = curve[i - 1];
        let (a1, r1) = curve[i];
        a0 + (rabi - r0) * (a1 - a0) / (r1 - r0)
    }
}

#[derive(Clone, Debug)]
pub struct RobustOptions {
    /// Divides all durations and multiplies all Rabi frequencies.
    pub scaling_factor: f64,
    /// Multiplies all Rabi frequencies.
    pub frequency_scaling_factor: f64,
    pub transition: Option<String>,
}

impl Default for RobustOptions {
    fn default() -> Self {
        Self {
            scaling_factor: 1.0,
            frequency_scaling_factor: 1.0,
            transition: None,
        }
    }
}

/// A tabulated pulse expanded to per-sample amplitude and phase arrays.
#[derive(Clone, Debug)]
pub struct RobustPulse {
    response: Arc<dyn AmplitudeResponse>,
    options: RobustOptions,
    table: Array2<f64>,
    part: (usize, usize),
    number_of_frequencies: usize,
    detuning_given: bool,
    amplitudes: Array2<f64>,
    phases: Array2<f64>,
    detunings: Array2<f64>,
    step_length_smpl: Vec<i64>,
    length_smpl: i64,
    amplitude_samples: Array2<f64>,
    phase_samples: Array2<f64>,
}

/// Parses whitespace (or comma) separated rows of numbers. Empty lines and `#` comments are
/// skipped; all rows must have the same number of columns.
pub fn parse_table(s: &str) -> Result<Array2<f64>> {
    let mut values = Vec::new();
    let mut ncols = None;
    let mut nrows = 0;
    for (lineno, line) in s.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<f64>().map_err(|_| {
                    AwgError::table(format!("line {}: can not parse '{}'", lineno + 1, t))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        match ncols {
            None => ncols = Some(row.len()),
            Some(n) if n != row.len() => {
                return Err(AwgError::table(format!(
                    "line {}: expected {} columns, found {}",
                    lineno + 1,
                    n,
                    row.len()
                )))
            }
            _ => {}
        }
        values.extend(row);
        nrows += 1;
    }
    let ncols = ncols.ok_or_else(|| AwgError::table("table is empty"))?;
    Array2::from_shape_vec((nrows, ncols), values).map_err(|e| AwgError::table(e.to_string()))
}

/// `(number_of_frequencies, detuning_given)` for a table with `nc` data columns.
fn column_layout(nc: usize) -> Result<(usize, bool)> {
    if nc == 0 {
        Err(AwgError::table("table has no data columns"))
    } else if nc % 3 == 0 || nc >= 6 {
        Ok((nc / 3, true))
    } else if nc % 2 == 0 {
        Ok((nc / 2, false))
    } else {
        Err(AwgError::table(format!(
            "{} data columns is neither [rabi, phase] pairs nor [rabi, phase, detuning] triples",
            nc
        )))
    }
}

impl RobustPulse {
    pub fn new(
        table: Array2<f64>,
        response: Arc<dyn AmplitudeResponse>,
        options: RobustOptions,
    ) -> Result<Self> {
        let nrows = table.nrows();
        Self::with_part(table, response, options, (0, nrows))
    }

    pub fn from_file<P: AsRef<Path>>(
        path: P,
        response: Arc<dyn AmplitudeResponse>,
        options: RobustOptions,
    ) -> Result<Self> {
        let table = parse_table(&std::fs::read_to_string(path)?)?;
        Self::new(table, response, options)
    }

    fn with_part(
        table: Array2<f64>,
        response: Arc<dyn AmplitudeResponse>,
        options: RobustOptions,
        part: (usize, usize),
    ) -> Result<Self> {
        for (name, v) in [
            ("scaling_factor", options.scaling_factor),
            ("frequency_scaling_factor", options.frequency_scaling_factor),
        ] {
            if !(v.is_finite() && v > 0.) {
                return Err(AwgError::ValueOutOfRange {
                    name: name.to_string(),
                    value: v,
                    min: 0.,
                    max: f64::INFINITY,
                });
            }
        }
        if part.0 >= part.1 || part.1 > table.nrows() {
            return Err(AwgError::table(format!(
                "part {:?} is empty or exceeds the {} table rows",
                part,
                table.nrows()
            )));
        }
        let rows = table.slice(s![part.0..part.1, ..]);
        let (number_of_frequencies, detuning_given) =
            column_layout(rows.ncols().saturating_sub(1))?;
        let stride = if detuning_given { 3 } else { 2 };
        let nsteps = rows.nrows();
        let column = |i: usize, j: usize, k: usize| rows[[i, 1 + j * stride + k]];

        let step_length_smpl = rows
            .column(0)
            .iter()
            .map(|raw| mus_to_smpl(raw / options.scaling_factor))
            .collect::<Result<Vec<i64>>>()?;
        if let Some(l) = step_length_smpl.iter().find(|&&l| l < 0) {
            return Err(AwgError::table(format!("negative step length of {} samples", l)));
        }
        let length_smpl: i64 = step_length_smpl.iter().sum();

        let rabi_scaling = options.scaling_factor * options.frequency_scaling_factor;
        let transition = options.transition.as_deref();
        let amplitudes = Array2::from_shape_fn((nsteps, number_of_frequencies), |(i, j)| {
            quantize_amplitude(response.amplitude(transition, column(i, j, 0) * rabi_scaling))
        });
        if let Some(a) = amplitudes.iter().find(|&&a| !(a >= 0.)) {
            return Err(AwgError::PowerOverflow(format!(
                "a tabulated rabi frequency maps to the amplitude {}, outside of the response",
                a
            )));
        }
        if let Some((i, row)) = amplitudes
            .rows()
            .into_iter()
            .enumerate()
            .find(|(_, row)| row.sum() > 1.0)
        {
            return Err(AwgError::PowerOverflow(format!(
                "step {} needs a total amplitude of {}, its rabi frequencies are too high",
                i,
                row.sum()
            )));
        }
        let phases =
            Array2::from_shape_fn((nsteps, number_of_frequencies), |(i, j)| column(i, j, 1));
        let detunings = Array2::from_shape_fn((nsteps, number_of_frequencies), |(i, j)| {
            if detuning_given {
                column(i, j, 2)
            } else {
                0.
            }
        });

        let mut amplitude_samples = Array2::zeros((number_of_frequencies, length_smpl as usize));
        let mut phase_samples = Array2::zeros((number_of_frequencies, length_smpl as usize));
        let mut start = 0usize;
        for (i, &l) in step_length_smpl.iter().enumerate() {
            let end = start + l as usize;
            for j in 0..number_of_frequencies {
                amplitude_samples
                    .slice_mut(s![j, start..end])
                    .fill(amplitudes[[i, j]]);
                phase_samples
                    .slice_mut(s![j, start..end])
                    .fill(phases[[i, j]].to_degrees());
            }
            start = end;
        }

        Ok(Self {
            response,
            options,
            table,
            part,
            number_of_frequencies,
            detuning_given,
            amplitudes,
            phases,
            detunings,
            step_length_smpl,
            length_smpl,
            amplitude_samples,
            phase_samples,
        })
    }

    /// Restricts the pulse to the rows between two cumulative durations. Both boundaries must
    /// coincide with step boundaries; a pulse can only be cut once.
    pub fn part(&self, start_mus: f64, end_mus: f64) -> Result<RobustPulse> {
        if self.part != (0, self.table.nrows()) {
            return Err(AwgError::table("part has already been set"));
        }
        let mut csd = vec![0.];
        for l in self.step_length_mus().iter() {
            csd.push(csd[csd.len() - 1] + l);
        }
        let boundary = |t: f64| -> Result<usize> {
            let found: Vec<usize> = csd
                .iter()
                .enumerate()
                .filter(|(_, c)| (*c - t).abs() < SAMPLE_DURATION_TOLERANCE)
                .map(|(i, _)| i)
                .collect();
            match found[..] {
                [i] => Ok(i),
                _ => Err(AwgError::table(format!(
                    "{} mus should match exactly one step boundary, found {}",
                    t,
                    found.len()
                ))),
            }
        };
        let part = (boundary(start_mus)?, boundary(end_mus)?);
        Self::with_part(
            self.table.clone(),
            self.response.clone(),
            self.options.clone(),
            part,
        )
    }

    pub fn options(&self) -> &RobustOptions {
        &self.options
    }

    pub fn transition(&self) -> Option<&str> {
        self.options.transition.as_deref()
    }

    pub fn number_of_frequencies(&self) -> usize {
        self.number_of_frequencies
    }

    pub fn number_of_steps(&self) -> usize {
        self.part.1 - self.part.0
    }

    pub fn detuning_given(&self) -> bool {
        self.detuning_given
    }

    /// Rows of the full table this pulse was cut from.
    pub fn part_rows(&self) -> (usize, usize) {
        self.part
    }

    pub fn length_smpl(&self) -> i64 {
        self.length_smpl
    }

    pub fn length_mus(&self) -> f64 {
        smpl_to_mus(self.length_smpl)
    }

    pub fn step_length_mus(&self) -> Array1<f64> {
        self.step_length_smpl.iter().map(|&l| smpl_to_mus(l)).collect()
    }

    pub fn step_length_smpl(&self) -> &[i64] {
        &self.step_length_smpl
    }

    pub fn rabi_frequencies(&self) -> Array2<f64> {
        let stride = if self.detuning_given { 3 } else { 2 };
        let rows = self.table.slice(s![self.part.0..self.part.1, ..]);
        let scaling = self.options.scaling_factor * self.options.frequency_scaling_factor;
        Array2::from_shape_fn(self.amplitudes.dim(), |(i, j)| {
            rows[[i, 1 + j * stride]] * scaling
        })
    }

    pub fn amplitudes(&self) -> ArrayView2<f64> {
        self.amplitudes.view()
    }

    pub fn phases(&self) -> ArrayView2<f64> {
        self.phases.view()
    }

    pub fn detunings(&self) -> ArrayView2<f64> {
        self.detunings.view()
    }

    // A single-channel table drives every frequency of its wave step.
    fn freq_index(&self, n_freq: usize) -> usize {
        if self.number_of_frequencies == 1 {
            0
        } else {
            n_freq
        }
    }

    pub fn amplitude(&self, n_step: usize, n_freq: usize) -> f64 {
        self.amplitudes[[n_step, self.freq_index(n_freq)]]
    }

    pub fn phase(&self, n_step: usize, n_freq: usize) -> f64 {
        self.phases[[n_step, self.freq_index(n_freq)]]
    }

    pub fn detuning(&self, n_step: usize, n_freq: usize) -> f64 {
        self.detunings[[n_step, self.freq_index(n_freq)]]
    }

    /// Per-sample DAC amplitude driving frequency `n_freq`.
    pub fn amplitude_samples(&self, n_freq: usize) -> ArrayView1<f64> {
        self.amplitude_samples.row(self.freq_index(n_freq))
    }

    /// Per-sample phase in degrees driving frequency `n_freq`.
    pub fn phase_samples(&self, n_freq: usize) -> ArrayView1<f64> {
        self.phase_samples.row(self.freq_index(n_freq))
    }

    /// Whether the pulse can drive a wave step with `n_freq` frequencies.
    pub fn supports_frequencies(&self, n_freq: usize) -> bool {
        self.number_of_frequencies == 1 || n_freq <= self.number_of_frequencies
    }

    /// Largest total amplitude of a tabulated step when the pulse drives `n_freq` frequencies.
    pub fn max_amplitude_sum(&self, n_freq: usize) -> f64 {
        (0..self.number_of_steps())
            .map(|i| (0..n_freq).map(|j| self.amplitude(i, j)).sum::<f64>())
            .fold(0., f64::max)
    }

    /// Mean over tabulated steps of the summed squared amplitudes of `n_freq` frequencies.
    pub fn normalized_power(&self, n_freq: usize) -> f64 {
        let nsteps = self.number_of_steps();
        let total: f64 = (0..nsteps)
            .flat_map(|i| (0..n_freq).map(move |j| (i, j)))
            .map(|(i, j)| self.amplitude(i, j).powi(2))
            .sum();
        total / nsteps as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::f64::consts::PI;

    fn linear() -> Arc<dyn AmplitudeResponse> {
        Arc::new(LinearResponse::new(10.))
    }

    #[test]
    fn column_layouts() {
        assert_eq!(column_layout(2).unwrap(), (1, false));
        assert_eq!(column_layout(3).unwrap(), (1, true));
        assert_eq!(column_layout(4).unwrap(), (2, false));
        assert_eq!(column_layout(6).unwrap(), (2, true));
        assert_eq!(column_layout(7).unwrap(), (2, true));
        assert!(column_layout(5).is_err());
        assert!(column_layout(1).is_err());
    }

    #[test]
    fn two_frequencies_with_detuning() {
        let table = array![
            [0.032, 2.0, 0.0, 0.1, 4.0, PI, 0.2],
            [0.032, 3.0, PI / 2., 0.1, 1.0, 0.0, 0.2],
        ];
        let pulse = RobustPulse::new(table, linear(), RobustOptions::default()).unwrap();
        assert_eq!(pulse.number_of_frequencies(), 2);
        assert!(pulse.detuning_given());
        assert_eq!(pulse.number_of_steps(), 2);
        assert_eq!(pulse.length_smpl(), 768);
        assert_abs_diff_eq!(pulse.amplitude(0, 1), quantize_amplitude(0.4));
        assert_eq!(pulse.detuning(1, 1), 0.2);
        let phases = pulse.phase_samples(0);
        assert_eq!(phases[0], 0.);
        assert_abs_diff_eq!(phases[400], 90., epsilon = 1e-12);
        assert_eq!(pulse.amplitude_samples(1)[767], quantize_amplitude(0.1));
    }

    #[test]
    fn scaling_factors() {
        let table = array![[0.064, 2.0, 0.0]];
        let options = RobustOptions {
            scaling_factor: 2.,
            frequency_scaling_factor: 1.5,
            transition: None,
        };
        let pulse = RobustPulse::new(table, linear(), options).unwrap();
        assert_eq!(pulse.length_smpl(), 384);
        assert_abs_diff_eq!(pulse.rabi_frequencies()[[0, 0]], 6.0);
        assert_abs_diff_eq!(pulse.amplitude(0, 0), quantize_amplitude(0.6));
    }

    #[test]
    fn overflowing_rows_are_rejected() {
        let table = array![[0.032, 6.0, 0.0, 6.0, 0.0]];
        let err = RobustPulse::new(table, linear(), RobustOptions::default()).unwrap_err();
        assert!(matches!(err, AwgError::PowerOverflow(_)));

        let table = array![[0.032, -1.0, 0.0]];
        let err = RobustPulse::new(table, linear(), RobustOptions::default()).unwrap_err();
        assert!(matches!(err, AwgError::PowerOverflow(_)));
    }

    #[test]
    fn misaligned_step_duration_is_rejected() {
        let table = array![[0.5 / SAMPLE_FREQUENCY, 1.0, 0.0]];
        let err = RobustPulse::new(table, linear(), RobustOptions::default()).unwrap_err();
        assert!(matches!(err, AwgError::InvalidDuration { .. }));
    }

    #[test]
    fn part_selects_rows_once() {
        let table = array![[0.032, 1.0, 0.0], [0.064, 2.0, 0.0], [0.032, 3.0, 0.0]];
        let pulse = RobustPulse::new(table, linear(), RobustOptions::default()).unwrap();
        let part = pulse.part(0.032, 0.128).unwrap();
        assert_eq!(part.part_rows(), (1, 3));
        assert_eq!(part.number_of_steps(), 2);
        assert_eq!(part.length_smpl(), 1152);
        assert_eq!(part.amplitude(0, 0), quantize_amplitude(0.2));
        assert!(part.part(0., 0.064).is_err());
        assert!(pulse.part(0.01, 0.128).is_err());
    }

    #[test]
    fn tabulated_response_inversion() {
        let response = TabulatedResponse::new(vec![(0.0, 0.0), (0.5, 4.0), (1.0, 6.0)])
            .unwrap()
            .with_transition("+1", vec![(0.0, 0.0), (1.0, 2.0)])
            .unwrap();
        assert_abs_diff_eq!(response.amplitude(None, 2.0), 0.25);
        assert_abs_diff_eq!(response.amplitude(None, 5.0), 0.75);
        assert_abs_diff_eq!(response.amplitude(None, 7.0), 1.25);
        assert_abs_diff_eq!(response.amplitude(Some("+1"), 1.0), 0.5);
        assert_abs_diff_eq!(response.amplitude(Some("-1"), 2.0), 0.25);
        assert!(TabulatedResponse::new(vec![(0.0, 0.0)]).is_err());
    }

    #[test]
    fn table_parsing() {
        let table = parse_table("0.1 1 2\n\n# comment\n0.2, 3, 4 # trailing\n").unwrap();
        assert_eq!(table, array![[0.1, 1., 2.], [0.2, 3., 4.]]);
        assert!(parse_table("0.1 1 2\n0.2 3").is_err());
        assert!(parse_table("0.1 a 2").is_err());
        assert!(parse_table("# nothing").is_err());
    }

    #[test]
    fn normalized_power_broadcasts_single_channel() {
        let table = array![[0.032, 5.0, 0.0], [0.032, 0.0, 0.0]];
        let pulse = RobustPulse::new(table, linear(), RobustOptions::default()).unwrap();
        assert_abs_diff_eq!(pulse.normalized_power(1), 0.125);
        assert_abs_diff_eq!(pulse.normalized_power(2), 0.25);
        assert!(pulse.supports_frequencies(3));
    }
}
