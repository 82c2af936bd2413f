//! Programs spanning several channels and instruments.
//!
//! A [`MultiChSeq`] holds one [`Sequence`] per channel of its channel map and keeps them in
//! lockstep: every segment and every step is added to all channels at once, so all channels
//! always have the same number of rows and the same row lengths.
//!
//! ## Life cycle
//! A program goes through three states, see [`SeqStatus`]:
//! 1. `Building`: segments and steps are added with [`MultiChSeq::start_new_segment`] and
//!    [`MultiChSeq::add_step`].
//! 2. `Finalized`: [`MultiChSeq::finalize`] has budgeted the RF power and, for programs spanning
//!    several instruments, injected the master/slave trigger segments. The program is frozen.
//! 3. `Precompiled`: [`MultiChSeq::precompile`] has computed and cached all segment samples.
//!
//! Writing to instruments ([`MultiChSeq::write_to_device_memory`]) is possible from `Finalized`
//! on and is tracked per channel, independently of the status.
//!
//! ## Synchronization of several instruments
//! The master instrument starts with a `triggerwait` segment whose first step raises the sync
//! marker of the master trigger channel, which is wired to the trigger input of every slave. The
//! slaves end with a zero-length wait in single advance mode, so each of them waits for the next
//! trigger before starting over. A `w_trig_safety` segment at the end of the master sequence
//! leaves the slaves time to reach that wait.
//!
//! ```
//! use std::sync::Arc;
//! use awgcompiler_backend::prelude::*;
//!
//! let config = Arc::new(AwgConfig::single("awg", &[1, 2]));
//! let mut prog = MultiChSeq::new("rabi", config, None).unwrap();
//! prog.start_new_segment("pulse", SegmentOptions::default(), false).unwrap();
//! prog.add_step(StepSpec::new("w").length_mus(1.0)).unwrap();
//! prog.add_step(
//!     StepSpec::new("pi")
//!         .length_mus(2.0)
//!         .channel(ChannelId::new("awg", 1), StepParams::sine(vec![2.], vec![1.])),
//! )
//! .unwrap();
//! prog.write_seq().unwrap();
//! assert_eq!(prog.status(), SeqStatus::Precompiled);
//! // 3 mus plus 32 samples of padding
//! assert_eq!(prog.length_mus().unwrap(), 36032. / 12e3);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::config::*;
use crate::error::{AwgError, Result};
use crate::power::*;
use crate::segment::*;
use crate::seq_table::*;
use crate::sequence::Sequence;
use crate::transport::{AwgHandles, AwgTransport};
use crate::utils::*;
use crate::wave_step::{StepParams, WaveStep};

pub const TRIGGER_SEGMENT_NAME: &str = "triggerwait";
pub const TRIGGER_SAFETY_SEGMENT_NAME: &str = "w_trig_safety";
pub const SLAVE_WAIT_STEP_NAME: &str = "w_trig_step";
/// Maximal disagreement between step lengths given for different channels.
pub const STEP_LENGTH_TOLERANCE_MUS: f64 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SeqStatus {
    Building,
    Finalized,
    Precompiled,
}

impl fmt::Display for SeqStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SeqStatus::Building => "building",
                SeqStatus::Finalized => "finalized",
                SeqStatus::Precompiled => "precompiled",
            }
        )
    }
}

/// One step added to every channel of a program.
///
/// Channels without parameters receive a wait of the common length. Marker aliases from the
/// configuration switch markers on the channel they point to.
#[derive(Clone, Debug, Default)]
pub struct StepSpec {
    pub name: String,
    pub length_mus: Option<f64>,
    pub channels: IndexMap<ChannelId, StepParams>,
    pub markers: IndexMap<String, bool>,
    /// Row to insert into, the last row by default.
    pub segment_index: Option<usize>,
    /// Position within the segment, appended by default.
    pub step_index: Option<usize>,
}

impl StepSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn length_mus(mut self, length_mus: f64) -> Self {
        self.length_mus = Some(length_mus);
        self
    }

    pub fn channel(mut self, channel: ChannelId, params: StepParams) -> Self {
        self.channels.insert(channel, params);
        self
    }

    pub fn marker(mut self, alias: &str, on: bool) -> Self {
        self.markers.insert(alias.to_string(), on);
        self
    }

    pub fn at(mut self, segment_index: usize, step_index: usize) -> Self {
        self.segment_index = Some(segment_index);
        self.step_index = Some(step_index);
        self
    }
}

/// The common length of a step: all given lengths must agree.
pub fn step_length_mus<'a>(
    length_mus: Option<f64>,
    params: impl IntoIterator<Item = &'a StepParams>,
) -> Result<f64> {
    let lengths: Vec<f64> = length_mus
        .into_iter()
        .chain(params.into_iter().filter_map(|p| p.own_length_mus()))
        .collect();
    match lengths.first() {
        None => Ok(0.),
        Some(&first) => {
            if lengths
                .iter()
                .any(|l| (l - first).abs() > STEP_LENGTH_TOLERANCE_MUS)
            {
                Err(AwgError::DurationMismatch { lengths_mus: lengths })
            } else {
                Ok(first)
            }
        }
    }
}

/// Compiled form of one channel as it would be sent to the instrument.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelPayload {
    /// Placeholder segment ids, counted from 1 in row order.
    pub segment_ids: Vec<u32>,
    pub segments: Vec<Vec<u8>>,
    /// Encoded table rows, starting at sequence id 0.
    pub table: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MultiChSeq {
    name: String,
    config: Arc<AwgConfig>,
    ch_map: ChannelMap,
    sequences: IndexMap<ChannelId, Sequence>,
    status: SeqStatus,
    written_channels: Vec<ChannelId>,
}

impl MultiChSeq {
    /// A program on the channels of `ch_map`, or on every configured channel.
    pub fn new(name: &str, config: Arc<AwgConfig>, ch_map: Option<ChannelMap>) -> Result<Self> {
        let ch_map = ch_map.unwrap_or_else(|| config.channels.clone());
        config.valid_ch_map(&ch_map)?;
        let sequences = ch_map
            .iter()
            .flat_map(|(awg, chs)| chs.iter().map(move |&ch| ChannelId::new(awg, ch)))
            .map(|id| (id, Sequence::new(name)))
            .collect();
        Ok(Self {
            name: name.to_string(),
            config,
            ch_map,
            sequences,
            status: SeqStatus::Building,
            written_channels: Vec::new(),
        })
    }

    /// The idle program selected on channels not used by the running program: a single silent
    /// segment on every configured channel.
    pub fn wait_program(config: Arc<AwgConfig>) -> Result<Self> {
        let mut wait = Self::new("wait", config, None)?;
        wait.start_new_segment("wait", SegmentOptions::default(), false)?;
        wait.status = SeqStatus::Finalized;
        Ok(wait)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<AwgConfig> {
        &self.config
    }

    pub fn ch_map(&self) -> &ChannelMap {
        &self.ch_map
    }

    pub fn status(&self) -> SeqStatus {
        self.status
    }

    pub fn is_written(&self) -> bool {
        !self.written_channels.is_empty()
    }

    pub fn written_channels(&self) -> &[ChannelId] {
        &self.written_channels
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelId> {
        self.sequences.keys()
    }

    pub fn sequences(&self) -> &IndexMap<ChannelId, Sequence> {
        &self.sequences
    }

    pub fn sequence(&self, channel: &ChannelId) -> Result<&Sequence> {
        self.sequences
            .get(channel)
            .ok_or_else(|| AwgError::UnknownChannel(channel.to_string()))
    }

    /// Direct access to the sequence of a channel while the program is being built.
    pub fn sequence_mut(&mut self, channel: &ChannelId) -> Result<&mut Sequence> {
        self.ensure_building()?;
        self.sequences
            .get_mut(channel)
            .ok_or_else(|| AwgError::UnknownChannel(channel.to_string()))
    }

    pub fn dl(&self, channel: &ChannelId, row: usize, wave_step: usize) -> Result<&WaveStep> {
        self.sequence(channel)?.dl(row, wave_step)
    }

    /// Length of one pass; identical on every channel.
    pub fn length_mus(&self) -> Result<f64> {
        match self.sequences.values().next() {
            Some(seq) => seq.length_mus(),
            None => Ok(0.),
        }
    }

    fn ensure_building(&self) -> Result<()> {
        if self.status != SeqStatus::Building {
            return Err(AwgError::SequenceFrozen {
                name: self.name.clone(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&self, from: SeqStatus, to: SeqStatus) -> Result<()> {
        if self.status != from {
            return Err(AwgError::InvalidTransition {
                name: self.name.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Opens a new segment on every channel.
    ///
    /// With `reuse`, channels already holding a segment called `name` get a row replaying it
    /// instead; the wave steps of that segment are shared and uploaded only once.
    pub fn start_new_segment(
        &mut self,
        name: &str,
        options: SegmentOptions,
        reuse: bool,
    ) -> Result<()> {
        self.ensure_building()?;
        Self::append_segment(&mut self.sequences, name, options, reuse)
    }

    fn append_segment(
        sequences: &mut IndexMap<ChannelId, Sequence>,
        name: &str,
        options: SegmentOptions,
        reuse: bool,
    ) -> Result<()> {
        for (id, seq) in sequences.iter_mut() {
            let target = if reuse {
                seq.find_row(name)
                    .map(|row| seq.row(row).map(|r| r.target_key()))
                    .transpose()?
                    .flatten()
            } else {
                None
            };
            match target {
                Some(key) => seq.push_alias(name, key, options.clone())?,
                None => {
                    if reuse {
                        tracing::warn!(
                            "{}: no segment '{}' to reuse in sequence '{}', starting a new one",
                            id,
                            name,
                            seq.name()
                        );
                    }
                    seq.push_segment(SequenceStep::new(name, options.clone())?);
                }
            }
        }
        Ok(())
    }

    /// Adds one wave step to every channel, see [`StepSpec`].
    ///
    /// All steps are built and all positions checked before any channel is touched, so a failing
    /// call leaves the program unchanged.
    pub fn add_step(&mut self, spec: StepSpec) -> Result<()> {
        self.ensure_building()?;
        let StepSpec {
            name,
            length_mus,
            mut channels,
            markers,
            segment_index,
            step_index,
        } = spec;
        if let Some(id) = channels.keys().find(|id| !self.sequences.contains_key(*id)) {
            return Err(AwgError::UnknownChannel(id.to_string()));
        }
        for (alias, on) in markers {
            let marker = self
                .config
                .marker(&alias)
                .ok_or_else(|| AwgError::config(format!("unknown marker alias '{}'", alias)))?;
            if !self.sequences.contains_key(&marker.channel) {
                return Err(AwgError::UnknownChannel(format!(
                    "{} (marker alias '{}')",
                    marker.channel, alias
                )));
            }
            let params = channels.entry(marker.channel.clone()).or_default();
            match marker.marker {
                MarkerKind::Smpl => params.smpl_marker = on,
                MarkerKind::Sync => params.sync_marker = on,
            }
        }
        let length_mus = step_length_mus(length_mus, channels.values())?;

        let mut planned = Vec::with_capacity(self.sequences.len());
        for (id, seq) in &self.sequences {
            let step = channels
                .shift_remove(id)
                .unwrap_or_default()
                .build(length_mus, &name)?;
            if seq.is_empty() {
                return Err(AwgError::NoOpenSegment(id.clone()));
            }
            let ssi = segment_index.unwrap_or(seq.number_of_rows() - 1);
            if ssi >= seq.number_of_rows() {
                return Err(AwgError::index(
                    format!("segments of {}", id),
                    ssi,
                    seq.number_of_rows(),
                ));
            }
            let len = seq.segment(ssi)?.number_of_wave_steps();
            let wsi = step_index.unwrap_or(len);
            if wsi > len {
                let what = format!("wave steps of {} segment {}", id, ssi);
                return Err(AwgError::index(what, wsi, len));
            }
            planned.push((id.clone(), ssi, wsi, step));
        }
        for (id, ssi, wsi, step) in planned {
            if let Some(seq) = self.sequences.get_mut(&id) {
                seq.segment_mut(ssi)?.insert(wsi, step)?;
            }
        }
        Ok(())
    }

    /// Freezes the program: budgets RF power and injects trigger segments.
    ///
    /// Works on a copy of the sequences, so a failure leaves the program building and unchanged.
    pub fn finalize(&mut self, ignore_max_avg_power: bool) -> Result<()> {
        self.transition(SeqStatus::Building, SeqStatus::Finalized)?;
        let mut timer = TickTimer::new();
        let mut sequences = self.sequences.clone();
        self.fix_avg_rf_power(&mut sequences, ignore_max_avg_power)?;
        if self.ch_map.len() > 1 {
            if let Some(master) = self.config.master_awg.clone() {
                if self.ch_map.contains_key(&master) {
                    self.inject_trigger_segments(&mut sequences, &master)?;
                }
            }
        }
        self.sequences = sequences;
        self.status = SeqStatus::Finalized;
        tracing::info!("program '{}' finalized ({:.4} s)", self.name, timer.tick());
        Ok(())
    }

    fn fix_avg_rf_power(
        &self,
        sequences: &mut IndexMap<ChannelId, Sequence>,
        ignore_max_avg_power: bool,
    ) -> Result<()> {
        if ignore_max_avg_power {
            return Ok(());
        }
        let mut checks = Vec::new();
        for (id, seq) in sequences.iter() {
            if let Some(check) = check_avg_rf_power(&self.config, id, seq)? {
                checks.push(check);
            }
        }
        let max_wait = checks
            .iter()
            .map(|c| c.additional_wait_mus)
            .fold(0., f64::max);
        if max_wait <= 0. {
            return Ok(());
        }
        let options = SegmentOptions::default().loop_count(safety_loop_count(max_wait)?);
        Self::append_segment(sequences, POWER_SAFETY_SEGMENT_NAME, options, false)?;
        for seq in sequences.values_mut() {
            let rows = seq.number_of_rows();
            seq.segment_mut(rows - 1)?
                .push(WaveStep::wait(POWER_SAFETY_SEGMENT_NAME, BLM)?);
        }
        for check in checks {
            let seq = sequences
                .get(&check.channel)
                .ok_or_else(|| AwgError::UnknownChannel(check.channel.to_string()))?;
            let after = check_avg_rf_power(&self.config, &check.channel, seq)?;
            if let Some(after) = after {
                if after.exceeds_margin() {
                    return Err(PowerCheck {
                        additional_wait_mus: check.additional_wait_mus,
                        ..after
                    }
                    .into_error(&self.name));
                }
                if check.additional_wait_mus > 0. {
                    tracing::warn!(
                        "program '{}': added {:.4} mus of wait on {}, {:.4} W (allowed: {} W)",
                        self.name,
                        max_wait,
                        check.channel,
                        after.avg_power,
                        after.max_avg_power
                    );
                }
            }
        }
        Ok(())
    }

    fn inject_trigger_segments(
        &self,
        sequences: &mut IndexMap<ChannelId, Sequence>,
        master: &str,
    ) -> Result<()> {
        let config = &self.config;
        for (id, seq) in sequences.iter_mut() {
            if id.awg == master {
                let trigger_marker = config.master_trigger_channel == Some(id.ch);
                let trigger = SequenceStep::new(TRIGGER_SEGMENT_NAME, SegmentOptions::default())?
                    .with_wave_steps(vec![
                        WaveStep::wait("trigger", config.trigger_length_mus)?
                            .with_markers(false, trigger_marker),
                        WaveStep::wait(
                            "waittrigger",
                            config.trigger_delay_length_mus - config.trigger_length_mus,
                        )?,
                    ]);
                let safety_wait = WaveStep::wait(
                    TRIGGER_SAFETY_SEGMENT_NAME,
                    config.slave_trigger_safety_length_mus,
                )?;
                let safety =
                    SequenceStep::new(TRIGGER_SAFETY_SEGMENT_NAME, SegmentOptions::default())?
                        .with_wave_steps(vec![safety_wait]);
                seq.insert_segment(0, trigger)?;
                seq.push_segment(safety);
            } else {
                let wait = SequenceStep::new(
                    "",
                    SegmentOptions::default().advance_mode(AdvanceMode::Sing),
                )?
                .with_wave_steps(vec![WaveStep::wait(SLAVE_WAIT_STEP_NAME, 0.)?]);
                seq.push_segment(wait);
            }
        }
        Ok(())
    }

    pub fn precompile(&mut self) -> Result<()> {
        self.transition(SeqStatus::Finalized, SeqStatus::Precompiled)?;
        let mut timer = TickTimer::new();
        for seq in self.sequences.values_mut() {
            seq.precompile()?;
        }
        self.status = SeqStatus::Precompiled;
        tracing::info!("program '{}' precompiled ({:.4} s)", self.name, timer.tick());
        Ok(())
    }

    /// Finalizes with the power budget enforced, then precompiles.
    pub fn write_seq(&mut self) -> Result<()> {
        self.finalize(false)?;
        self.precompile()
    }

    /// Fails if any channel with a power ceiling would still need additional wait time.
    pub fn check_power_budget(&self) -> Result<()> {
        for (id, seq) in &self.sequences {
            if let Some(check) = check_avg_rf_power(&self.config, id, seq)? {
                if !check.within_budget() {
                    return Err(check.into_error(&self.name));
                }
            }
        }
        Ok(())
    }

    /// Uploads segments and sequence tables of every channel.
    ///
    /// Channels are written one after the other in channel map order. The `abort` flag is checked
    /// between channels; channels written before an abort or a failure stay written and must be
    /// removed with [`MultiChSeq::delete_from_device_memory`].
    pub fn write_to_device_memory(
        &mut self,
        awgs: &mut AwgHandles,
        ignore_max_avg_power: bool,
        abort: Option<&AtomicBool>,
    ) -> Result<()> {
        if self.status == SeqStatus::Building {
            return Err(AwgError::InvalidTransition {
                name: self.name.clone(),
                from: self.status.to_string(),
                to: "written".to_string(),
            });
        }
        if self.is_written() {
            return Err(AwgError::AlreadyWritten(self.name.clone()));
        }
        if !ignore_max_avg_power {
            self.check_power_budget()?;
        }
        let channels: Vec<ChannelId> = self.sequences.keys().cloned().collect();
        let mut times = Vec::with_capacity(channels.len());
        for id in channels {
            if abort.map_or(false, |a| a.load(Ordering::SeqCst)) {
                tracing::warn!(
                    "writing program '{}' aborted after {} channel(s)",
                    self.name,
                    self.written_channels.len()
                );
                return Err(AwgError::Aborted {
                    program: self.name.clone(),
                    written: self.written_channels.len(),
                });
            }
            let mut timer = TickTimer::new();
            let awg = transport(awgs, &id.awg)?;
            self.write_channel(&id, awg.as_mut())?;
            self.written_channels.push(id.clone());
            times.push(format!("{}: {:.4} s", id, timer.tick()));
        }
        tracing::info!("program '{}' written ({})", self.name, times.join(", "));
        Ok(())
    }

    fn write_channel(&mut self, id: &ChannelId, awg: &mut dyn AwgTransport) -> Result<()> {
        let program = self.name.clone();
        let sequence = self
            .sequences
            .get_mut(id)
            .ok_or_else(|| AwgError::UnknownChannel(id.to_string()))?;
        let wrap = |step_index: usize, step_name: &str, source: AwgError| AwgError::DeviceWrite {
            program: program.clone(),
            channel: id.clone(),
            step_index,
            step_name: step_name.to_string(),
            source: Box::new(source),
        };
        let rows = sequence.number_of_rows();
        let row_offset = awg
            .read_sequence_table(id.ch)
            .map_err(|e| wrap(rows, "sequence table", e))?
            .len() as u32;
        let offsets = sequence.sample_offsets()?;
        for (i, offset) in offsets.into_iter().enumerate() {
            if let SegmentRef::Owned(seg) = sequence.row_mut(i)? {
                let segment_id = awg
                    .allocate_segment(id.ch, seg.length_smpl())
                    .map_err(|e| wrap(i, seg.name(), e))?;
                awg.write_segment_payload(id.ch, segment_id, 0, &seg.payload_bytes(offset))
                    .map_err(|e| wrap(i, seg.name(), e))?;
                seg.set_segment_id(Some(segment_id));
            }
        }
        let segment_ids = sequence.segment_ids()?;
        let table = encode_sequence(sequence, &segment_ids, row_offset)
            .map_err(|e| wrap(rows, "sequence table", e))?;
        awg.write_sequence_table(id.ch, row_offset, &table)
            .map_err(|e| wrap(rows, "sequence table", e))?;
        sequence.clear_write_flags();
        tracing::debug!(
            "{}: sequence '{}' written at sequence id {} with segments {:?}",
            id,
            sequence.name(),
            row_offset,
            segment_ids
        );
        Ok(())
    }

    /// Removes the program from every channel it was written to.
    ///
    /// The segment ids and sequence ids recorded at write time are checked against the
    /// instrument's catalogues first; a mismatch means the memory was modified behind the
    /// program's back and nothing is deleted on that channel.
    pub fn delete_from_device_memory(&mut self, awgs: &mut AwgHandles) -> Result<()> {
        for id in self.written_channels.clone() {
            let awg = transport(awgs, &id.awg)?;
            let sequence = self
                .sequences
                .get_mut(&id)
                .ok_or_else(|| AwgError::UnknownChannel(id.to_string()))?;
            delete_channel(&id, sequence, awg.as_mut())?;
            self.written_channels.retain(|c| c != &id);
        }
        Ok(())
    }

    /// Selects this program on its channels and `wait` everywhere else.
    pub fn initialize(&self, awgs: &mut AwgHandles, wait: &MultiChSeq) -> Result<()> {
        for id in self.config.channel_ids() {
            let sequence = match self.sequences.get(&id) {
                Some(seq) => seq,
                None => wait.sequence(&id)?,
            };
            let sequence_id = sequence
                .rows()
                .first()
                .and_then(|r| r.sequence_id())
                .ok_or_else(|| AwgError::StaleHandle {
                    channel: id.clone(),
                    reason: format!("sequence '{}' has not been written", sequence.name()),
                })?;
            transport(awgs, &id.awg)?.select_sequence(id.ch, sequence_id)?;
        }
        Ok(())
    }

    pub fn run(&self, awgs: &mut AwgHandles, wait: &MultiChSeq, trigger: bool) -> Result<()> {
        self.initialize(awgs, wait)?;
        start_awgs(&self.config, awgs, &self.ch_map, trigger)
    }

    /// Compiles every channel without touching an instrument.
    pub fn compile_payloads(&self) -> Result<IndexMap<ChannelId, ChannelPayload>> {
        let mut out = IndexMap::new();
        for (id, seq) in &self.sequences {
            let offsets = seq.sample_offsets()?;
            let mut placeholders: IndexMap<SegmentKey, u32> = IndexMap::new();
            let mut segments = Vec::new();
            for (row, offset) in seq.rows().iter().zip(offsets) {
                if let SegmentRef::Owned(seg) = row {
                    if let Some(key) = seg.key() {
                        placeholders.insert(key, segments.len() as u32 + 1);
                        segments.push(seg.payload_bytes(offset));
                    }
                }
            }
            let segment_ids = seq
                .rows()
                .iter()
                .map(|r| {
                    r.target_key()
                        .and_then(|k| placeholders.get(&k).copied())
                        .ok_or_else(|| {
                            AwgError::EncodingError(format!("row '{}' has no segment", r.name()))
                        })
                })
                .collect::<Result<Vec<u32>>>()?;
            let table = records_to_bytes(&sequence_records(seq, &segment_ids)?);
            out.insert(
                id.clone(),
                ChannelPayload {
                    segment_ids,
                    segments,
                    table,
                },
            );
        }
        Ok(out)
    }

    pub fn info(&self) -> String {
        let mut out = vec![format!(
            "program '{}' ({}), channels {:?}",
            self.name, self.status, self.ch_map
        )];
        for (id, seq) in &self.sequences {
            out.push(format!("{}: {}", id, seq));
        }
        out.join("\n")
    }
}

impl fmt::Display for MultiChSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.info())
    }
}

fn transport<'a>(awgs: &'a mut AwgHandles, awg: &str) -> Result<&'a mut Box<dyn AwgTransport>> {
    awgs.get_mut(awg)
        .ok_or_else(|| AwgError::NotConnected(awg.to_string()))
}

fn delete_channel(
    id: &ChannelId,
    sequence: &mut Sequence,
    awg: &mut dyn AwgTransport,
) -> Result<()> {
    let stale = |reason: String| AwgError::StaleHandle {
        channel: id.clone(),
        reason,
    };
    let catalogue = awg.read_segment_catalogue(id.ch)?;
    let mut segment_ids = Vec::new();
    for (i, row) in sequence.rows().iter().enumerate() {
        if let SegmentRef::Owned(seg) = row {
            let segment_id = seg.segment_id().ok_or_else(|| {
                stale(format!(
                    "segment {} '{}' of sequence '{}' has no segment id",
                    i,
                    seg.name(),
                    sequence.name()
                ))
            })?;
            if !catalogue.iter().any(|(s, _)| *s == segment_id) {
                return Err(stale(format!(
                    "segment id {} of segment {} '{}' is not in waveform memory",
                    segment_id,
                    i,
                    seg.name()
                )));
            }
            segment_ids.push(segment_id);
        }
    }
    let first = sequence
        .rows()
        .first()
        .and_then(|r| r.sequence_id())
        .ok_or_else(|| stale(format!("sequence '{}' has no sequence id", sequence.name())))?;
    let table = awg.read_sequence_table(id.ch)?;
    let (start, count) = sequence_catalogue(&table)
        .into_iter()
        .find(|(start, _)| *start == first)
        .ok_or_else(|| {
            stale(format!(
                "sequence id {} of '{}' is not the start of a sequence",
                first,
                sequence.name()
            ))
        })?;
    if count as usize != sequence.number_of_rows() {
        return Err(stale(format!(
            "sequence '{}' has {} rows but {} rows are in sequencer memory",
            sequence.name(),
            sequence.number_of_rows(),
            count
        )));
    }
    if awg.device_is_running(id.ch)? {
        return Err(AwgError::DeviceRunning(id.clone()));
    }
    awg.reset_sequence_table(id.ch, start, count)?;
    for segment_id in segment_ids {
        awg.delete_segment(id.ch, segment_id)?;
    }
    sequence.forget_device_ids();
    tracing::debug!("{}: sequence '{}' deleted", id, sequence.name());
    Ok(())
}

/// Switches on the outputs of the channels in `ch_map` and off all others.
pub fn set_outputs(config: &AwgConfig, awgs: &mut AwgHandles, ch_map: &ChannelMap) -> Result<()> {
    for id in config.channel_ids() {
        let on = ch_map.get(&id.awg).map_or(false, |chs| chs.contains(&id.ch));
        transport(awgs, &id.awg)?.set_output(id.ch, on)?;
    }
    Ok(())
}

/// Triggers the master instrument, or the only instrument of `ch_map`.
pub fn send_trigger(config: &AwgConfig, awgs: &mut AwgHandles, ch_map: &ChannelMap) -> Result<()> {
    let awg = if ch_map.len() == 1 {
        ch_map.keys().next().cloned()
    } else {
        config.master_awg.clone()
    }
    .ok_or_else(|| AwgError::config("no awg to send the trigger to"))?;
    transport(awgs, &awg)?.send_trigger()
}

pub fn start_awgs(
    config: &AwgConfig,
    awgs: &mut AwgHandles,
    ch_map: &ChannelMap,
    trigger: bool,
) -> Result<()> {
    for awg in ch_map.keys() {
        let channels = config.channels.get(awg).cloned().unwrap_or_default();
        let handle = transport(awgs, awg)?;
        for ch in channels {
            handle.arm(ch)?;
        }
    }
    set_outputs(config, awgs, ch_map)?;
    if trigger {
        send_trigger(config, awgs, ch_map)?;
    }
    Ok(())
}

pub fn stop_awgs(config: &AwgConfig, awgs: &mut AwgHandles, ch_map: &ChannelMap) -> Result<()> {
    for awg in ch_map.keys() {
        let channels = config.channels.get(awg).cloned().unwrap_or_default();
        let handle = transport(awgs, awg)?;
        for ch in channels {
            handle.disarm(ch)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn ch(awg: &str, n: u8) -> ChannelId {
        ChannelId::new(awg, n)
    }

    fn single() -> MultiChSeq {
        MultiChSeq::new("p", Arc::new(AwgConfig::single("awg", &[1, 2])), None).unwrap()
    }

    fn dual_config() -> Arc<AwgConfig> {
        let mut config = AwgConfig::default();
        config.max_sine_avg_power.clear();
        Arc::new(config)
    }

    #[test]
    fn steps_go_to_every_channel() {
        let mut prog = single();
        prog.start_new_segment("s", SegmentOptions::default(), false).unwrap();
        prog.add_step(
            StepSpec::new("x")
                .length_mus(1.)
                .channel(ch("awg", 1), StepParams::sine(vec![10.], vec![0.5])),
        )
        .unwrap();
        assert_eq!(prog.dl(&ch("awg", 1), 0, 0).unwrap().amplitudes(), vec![0.5]);
        let other = prog.dl(&ch("awg", 2), 0, 0).unwrap();
        assert_eq!(other.length_smpl(), 12000);
        assert_eq!(other.name(), "x");
        assert_eq!(prog.length_mus().unwrap(), 12032. / 12e3);
    }

    #[test]
    fn step_needs_open_segment() {
        let mut prog = single();
        assert!(matches!(
            prog.add_step(StepSpec::new("x").length_mus(1.)),
            Err(AwgError::NoOpenSegment(_))
        ));
    }

    #[test]
    fn mismatched_lengths_leave_program_unchanged() {
        let mut prog = single();
        prog.start_new_segment("s", SegmentOptions::default(), false).unwrap();
        let err = prog
            .add_step(
                StepSpec::new("x")
                    .length_mus(1.)
                    .channel(ch("awg", 2), StepParams::wait().length_mus(2.)),
            )
            .unwrap_err();
        assert!(matches!(err, AwgError::DurationMismatch { .. }));
        // an invalid step on the second channel must not leave a step on the first
        let err = prog
            .add_step(
                StepSpec::new("x")
                    .length_mus(1.)
                    .channel(ch("awg", 2), StepParams::sine(vec![1., 2.], vec![0.6, 0.6])),
            )
            .unwrap_err();
        assert!(matches!(err, AwgError::AmplitudeOverflow { .. }));
        for id in [ch("awg", 1), ch("awg", 2)] {
            assert_eq!(prog.sequence(&id).unwrap().segment(0).unwrap().number_of_wave_steps(), 0);
        }
        assert!(matches!(
            prog.add_step(StepSpec::new("x").channel(ch("other", 1), StepParams::wait())),
            Err(AwgError::UnknownChannel(_))
        ));
    }

    #[test]
    fn step_length_rules() {
        assert_eq!(step_length_mus(None, std::iter::empty()).unwrap(), 0.);
        let p = StepParams::wait().length_mus(1. + 5e-5);
        assert_eq!(step_length_mus(Some(1.), [&p]).unwrap(), 1.);
        let q = StepParams::wait().length_mus(1.001);
        assert!(step_length_mus(Some(1.), [&q]).is_err());
    }

    #[test]
    fn insertion_position() {
        let mut prog = single();
        prog.start_new_segment("a", SegmentOptions::default(), false).unwrap();
        prog.start_new_segment("b", SegmentOptions::default(), false).unwrap();
        prog.add_step(StepSpec::new("b0").length_mus(BLM)).unwrap();
        prog.add_step(StepSpec::new("a0").length_mus(BLM).at(0, 0)).unwrap();
        prog.add_step(StepSpec::new("a1").length_mus(BLM).at(0, 0)).unwrap();
        let seq = prog.sequence(&ch("awg", 1)).unwrap();
        assert_eq!(seq.dl(0, 0).unwrap().name(), "a1");
        assert_eq!(seq.dl(0, 1).unwrap().name(), "a0");
        assert_eq!(seq.dl(1, 0).unwrap().name(), "b0");
        assert!(matches!(
            prog.add_step(StepSpec::new("x").at(2, 0)),
            Err(AwgError::InvalidIndex { .. })
        ));
        assert!(matches!(
            prog.add_step(StepSpec::new("x").at(1, 5)),
            Err(AwgError::InvalidIndex { .. })
        ));
    }

    #[test]
    fn reuse_creates_alias() {
        let mut prog = single();
        prog.start_new_segment("a", SegmentOptions::default(), false).unwrap();
        prog.add_step(StepSpec::new("s").length_mus(BLM)).unwrap();
        prog.start_new_segment("b", SegmentOptions::default(), false).unwrap();
        prog.add_step(StepSpec::new("w").length_mus(BLM)).unwrap();
        prog.start_new_segment("a", SegmentOptions::default().loop_count(2), true).unwrap();
        prog.start_new_segment("c", SegmentOptions::default(), true).unwrap();
        let seq = prog.sequence(&ch("awg", 1)).unwrap();
        assert!(seq.rows()[2].is_alias());
        assert!(!seq.rows()[3].is_alias());
        assert_eq!(seq.segment(2).unwrap().name(), "a");
        assert_eq!(seq.owned_segments().count(), 3);
        let payloads = prog.compile_payloads().unwrap();
        assert_eq!(payloads[&ch("awg", 1)].segment_ids, vec![1, 2, 1, 3]);
    }

    #[test]
    fn marker_aliases() {
        let mut prog = MultiChSeq::new("m", dual_config(), None).unwrap();
        prog.start_new_segment("s", SegmentOptions::default(), false).unwrap();
        prog.add_step(
            StepSpec::new("laser")
                .length_mus(1.)
                .marker("green", true)
                .marker("red", true),
        )
        .unwrap();
        assert!(prog.dl(&ch("2g", 2), 0, 0).unwrap().smpl_marker());
        assert!(!prog.dl(&ch("2g", 2), 0, 0).unwrap().sync_marker());
        assert!(prog.dl(&ch("128m", 1), 0, 0).unwrap().sync_marker());
        assert!(!prog.dl(&ch("2g", 1), 0, 0).unwrap().smpl_marker());
        assert!(prog.add_step(StepSpec::new("x").marker("blue", true)).is_err());
    }

    #[test]
    fn state_machine() {
        let mut prog = single();
        prog.start_new_segment("s", SegmentOptions::default(), false).unwrap();
        assert!(matches!(prog.precompile(), Err(AwgError::InvalidTransition { .. })));
        prog.finalize(false).unwrap();
        assert!(matches!(
            prog.add_step(StepSpec::new("x")),
            Err(AwgError::SequenceFrozen { .. })
        ));
        assert!(matches!(
            prog.start_new_segment("t", SegmentOptions::default(), false),
            Err(AwgError::SequenceFrozen { .. })
        ));
        assert!(matches!(prog.finalize(false), Err(AwgError::InvalidTransition { .. })));
        prog.precompile().unwrap();
        assert_eq!(prog.status(), SeqStatus::Precompiled);
        assert!(prog.precompile().is_err());
    }

    #[test]
    fn single_awg_gets_no_trigger_segments() {
        let mut prog = single();
        prog.start_new_segment("s", SegmentOptions::default(), false).unwrap();
        prog.finalize(false).unwrap();
        assert_eq!(prog.sequence(&ch("awg", 1)).unwrap().number_of_rows(), 1);
    }

    #[test]
    fn trigger_injection() {
        let mut prog = MultiChSeq::new("t", dual_config(), None).unwrap();
        prog.start_new_segment("s", SegmentOptions::default(), false).unwrap();
        prog.add_step(StepSpec::new("x").length_mus(1.)).unwrap();
        prog.finalize(false).unwrap();

        let master = prog.sequence(&ch("2g", 1)).unwrap();
        assert_eq!(master.number_of_rows(), 3);
        assert_eq!(master.rows()[0].name(), TRIGGER_SEGMENT_NAME);
        let trigger = master.dl(0, 0).unwrap();
        assert_eq!(trigger.name(), "trigger");
        assert!(trigger.sync_marker());
        assert_eq!(trigger.length_smpl(), 27 * 384);
        assert_eq!(master.dl(0, 1).unwrap().length_smpl(), 0);
        assert_eq!(master.rows()[2].name(), TRIGGER_SAFETY_SEGMENT_NAME);
        assert_eq!(master.dl(2, 0).unwrap().length_smpl(), 5 * 384);
        assert!(!prog.dl(&ch("2g", 2), 0, 0).unwrap().sync_marker());

        for n in [1, 2] {
            let slave = prog.sequence(&ch("128m", n)).unwrap();
            assert_eq!(slave.number_of_rows(), 2);
            assert_eq!(slave.rows()[1].playback().advance_mode(), AdvanceMode::Sing);
            assert_eq!(slave.dl(1, 0).unwrap().name(), SLAVE_WAIT_STEP_NAME);
            assert_eq!(slave.segment(1).unwrap().length_smpl(), 320);
        }
    }

    #[test]
    fn power_correction_at_twenty_percent() {
        let mut config = AwgConfig::single("awg", &[1, 2]);
        config.max_sine_avg_power.insert(ch("awg", 1), 1.0);
        config.amplifier_power.insert(ch("awg", 1), 10.0);
        let mut prog = MultiChSeq::new("p", Arc::new(config), None).unwrap();
        prog.start_new_segment("s", SegmentOptions::default(), false).unwrap();
        prog.add_step(
            StepSpec::new("x")
                .length_mus(10. * BLM)
                .channel(ch("awg", 1), StepParams::sine(vec![100.], vec![0.12f64.sqrt()])),
        )
        .unwrap();
        let before = prog.clone();
        prog.finalize(false).unwrap();
        for id in [ch("awg", 1), ch("awg", 2)] {
            let seq = prog.sequence(&id).unwrap();
            assert_eq!(seq.number_of_rows(), 2);
            assert_eq!(seq.rows()[1].name(), POWER_SAFETY_SEGMENT_NAME);
            assert_eq!(seq.dl(1, 0).unwrap().length_smpl(), 384);
        }
        let seq = prog.sequence(&ch("awg", 1)).unwrap();
        let loops = seq.rows()[1].playback().loop_count() as f64;
        let needed = 0.2 * 10. * BLM;
        assert!(loops * BLM >= needed * (1. - 1e-9));
        assert!(loops <= 3.);
        let check = check_avg_rf_power(prog.config(), &ch("awg", 1), seq).unwrap().unwrap();
        assert!(check.avg_power <= 1.0 + 1e-9);
        assert!(check.within_budget());
        prog.check_power_budget().unwrap();

        let mut unchecked = before.clone();
        unchecked.finalize(true).unwrap();
        assert_eq!(unchecked.sequence(&ch("awg", 1)).unwrap().number_of_rows(), 1);
        assert!(matches!(
            unchecked.check_power_budget(),
            Err(AwgError::PowerBudgetExceeded { .. })
        ));
        let sequence = unchecked.sequence(&ch("awg", 1)).unwrap();
        assert_relative_eq!(
            check_avg_rf_power(unchecked.config(), &ch("awg", 1), sequence)
                .unwrap()
                .unwrap()
                .avg_power,
            1.2,
            max_relative = 1e-9
        );
    }

    #[test]
    fn wait_program() {
        let wait = MultiChSeq::wait_program(dual_config()).unwrap();
        assert_eq!(wait.status(), SeqStatus::Finalized);
        assert_eq!(wait.channels().count(), 4);
        let payloads = wait.compile_payloads().unwrap();
        let p = &payloads[&ch("128m", 2)];
        assert_eq!(p.segments.len(), 1);
        assert_eq!(p.segments[0].len(), 640);
        assert!(p.segments[0].iter().all(|&b| b == 0));
        assert_eq!(p.table.len(), RECORD_SIZE);
    }

    #[test]
    fn multi_awg_program_needs_master_trigger_channel() {
        let mut map = ChannelMap::new();
        map.insert("2g".to_string(), vec![2]);
        map.insert("128m".to_string(), vec![1]);
        assert!(MultiChSeq::new("x", dual_config(), Some(map)).is_err());
    }
}
