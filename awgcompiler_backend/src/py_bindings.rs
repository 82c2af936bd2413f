//! Python bindings, built with the `python` feature.
//!
//! Python code builds and inspects programs in memory; talking to instruments stays on the Rust
//! side (see the `awgctrl_backend` crate). Channels are addressed as `"awg/chN"` strings.
//!
//! ```python
//! from awgcompiler_backend import MultiChSeq
//!
//! prog = MultiChSeq("rabi")
//! prog.start_new_segment("pulse")
//! prog.add_step("pi", 0.5, sines={"2g/ch1": ([2.0], [1.0], [0.0])}, markers={"gate": True})
//! prog.write_seq()
//! samples = prog.segment_samples("2g/ch1", 1)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use numpy::{IntoPyArray, PyArray1};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use crate::config::*;
use crate::error::AwgError;
use crate::multi_ch_seq::*;
use crate::segment::*;
use crate::seq_table::*;
use crate::wave_step::StepParams;

impl From<AwgError> for PyErr {
    fn from(err: AwgError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

#[pyclass(name = "MultiChSeq")]
pub struct PyMultiChSeq {
    inner: MultiChSeq,
}

fn parse_channel(channel: &str) -> PyResult<ChannelId> {
    Ok(channel.parse::<ChannelId>()?)
}

#[pymethods]
impl PyMultiChSeq {
    /// `config_json` defaults to the built-in setup; `channels` maps awg names to channel
    /// numbers and defaults to every configured channel.
    #[new]
    #[pyo3(signature = (name, config_json=None, channels=None))]
    fn new(
        name: &str,
        config_json: Option<&str>,
        channels: Option<HashMap<String, Vec<u8>>>,
    ) -> PyResult<Self> {
        let config = match config_json {
            Some(s) => AwgConfig::from_json_str(s)?,
            None => AwgConfig::default(),
        };
        // keep the configured awg order
        let ch_map = channels.map(|chs| {
            config
                .channels
                .keys()
                .filter_map(|awg| chs.get(awg).map(|c| (awg.clone(), c.clone())))
                .collect::<ChannelMap>()
        });
        if let (Some(given), Some(map)) = (&channels, &ch_map) {
            if given.len() != map.len() {
                return Err(PyValueError::new_err("unknown awg in channels"));
            }
        }
        Ok(Self {
            inner: MultiChSeq::new(name, Arc::new(config), ch_map)?,
        })
    }

    #[pyo3(signature = (name, loop_count=1, advance_mode="AUTO", reuse=false))]
    fn start_new_segment(
        &mut self,
        name: &str,
        loop_count: u32,
        advance_mode: &str,
        reuse: bool,
    ) -> PyResult<()> {
        let options = SegmentOptions::default()
            .loop_count(loop_count)
            .advance_mode(advance_mode.parse::<AdvanceMode>()?);
        Ok(self.inner.start_new_segment(name, options, reuse)?)
    }

    /// `sines` maps channels to `(frequencies, amplitudes, phases)`, `constants` to a level.
    #[pyo3(signature = (name, length_mus=None, sines=None, constants=None, markers=None))]
    fn add_step(
        &mut self,
        name: &str,
        length_mus: Option<f64>,
        sines: Option<HashMap<String, (Vec<f64>, Vec<f64>, Vec<f64>)>>,
        constants: Option<HashMap<String, f64>>,
        markers: Option<HashMap<String, bool>>,
    ) -> PyResult<()> {
        let mut spec = StepSpec::new(name);
        spec.length_mus = length_mus;
        for (channel, (frequencies, amplitudes, phases)) in sines.unwrap_or_default() {
            spec = spec.channel(
                parse_channel(&channel)?,
                StepParams::sine(frequencies, amplitudes).phases(phases),
            );
        }
        for (channel, value) in constants.unwrap_or_default() {
            spec = spec.channel(parse_channel(&channel)?, StepParams::constant(value));
        }
        for (alias, on) in markers.unwrap_or_default() {
            spec = spec.marker(&alias, on);
        }
        Ok(self.inner.add_step(spec)?)
    }

    #[pyo3(signature = (ignore_max_avg_power=false))]
    fn finalize(&mut self, ignore_max_avg_power: bool) -> PyResult<()> {
        Ok(self.inner.finalize(ignore_max_avg_power)?)
    }

    fn precompile(&mut self) -> PyResult<()> {
        Ok(self.inner.precompile()?)
    }

    fn write_seq(&mut self) -> PyResult<()> {
        Ok(self.inner.write_seq()?)
    }

    fn status(&self) -> String {
        self.inner.status().to_string()
    }

    fn length_mus(&self) -> PyResult<f64> {
        Ok(self.inner.length_mus()?)
    }

    fn segment_samples<'py>(
        &self,
        py: Python<'py>,
        channel: &str,
        row: usize,
    ) -> PyResult<&'py PyArray1<i16>> {
        let id = parse_channel(channel)?;
        let seq = self.inner.sequence(&id)?;
        let offset = seq
            .sample_offsets()?
            .get(row)
            .copied()
            .ok_or_else(|| AwgError::index("rows", row, seq.number_of_rows()))?;
        let samples = seq.segment(row)?.samples(offset);
        Ok(samples.as_ref().clone().into_pyarray(py))
    }

    fn sequence_samples<'py>(
        &self,
        py: Python<'py>,
        channel: &str,
    ) -> PyResult<&'py PyArray1<i16>> {
        let id = parse_channel(channel)?;
        Ok(self.inner.sequence(&id)?.samples()?.into_pyarray(py))
    }

    /// Table rows of `channel` with placeholder segment ids, as sent to the instrument.
    fn sequence_table<'py>(&self, py: Python<'py>, channel: &str) -> PyResult<&'py PyBytes> {
        let id = parse_channel(channel)?;
        let payloads = self.inner.compile_payloads()?;
        let payload = payloads
            .get(&id)
            .ok_or_else(|| AwgError::UnknownChannel(id.to_string()))?;
        Ok(PyBytes::new(py, &payload.table))
    }

    fn sequence_records(&self, channel: &str) -> PyResult<Vec<(u32, u32, u32, u32, u32, u32)>> {
        let id = parse_channel(channel)?;
        let payloads = self.inner.compile_payloads()?;
        let payload = payloads
            .get(&id)
            .ok_or_else(|| AwgError::UnknownChannel(id.to_string()))?;
        Ok(records_from_bytes(&payload.table)?
            .into_iter()
            .map(|r| {
                (
                    r.control,
                    r.sequence_loop_count,
                    r.segment_loop_count,
                    r.segment_id,
                    r.segment_start_offset,
                    r.segment_end_offset,
                )
            })
            .collect())
    }

    fn info(&self) -> String {
        self.inner.info()
    }

    fn __repr__(&self) -> String {
        format!("MultiChSeq('{}', {})", self.inner.name(), self.inner.status())
    }
}

#[pymodule]
fn awgcompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyMultiChSeq>()?;
    Ok(())
}
