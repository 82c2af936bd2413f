//! Segments: the unit of waveform memory and of the sequencer table.
//!
//! A [`SequenceStep`] owns an ordered list of [`WaveStep`]s which are compiled into one block of
//! waveform memory. On top of the waveform it carries the playback attributes of its row in the
//! sequencer table ([`Playback`]): loop count, advance mode, marker enable and the start/end
//! offsets bounding playback within the segment.
//!
//! A [`SegmentAlias`] replays a segment already owned by the same sequence. It owns no waveform
//! data and resolves length, samples and `segment_id` through the [`SegmentKey`] of its target,
//! while contributing its own row, with its own playback attributes, to the sequencer table.
//! Rows of a sequence are [`SegmentRef`]s, one of the two.
//!
//! The behavior shared by segments and aliases lives in the [`BaseSequenceStep`] trait, whose
//! default methods keep the `write_sequence_memory` flag up to date. Mutations of the wave step
//! list set `write_segment_memory` and drop any precompiled samples.
//!
//! The hardware only accepts segments of at least 320 samples in multiples of 64. Every segment
//! ends in an implicit `_missing_smpls_` wait step covering the difference:
//!
//! ```
//! use awgcompiler_backend::segment::*;
//! use awgcompiler_backend::wave_step::WaveStep;
//!
//! let mut seg = SequenceStep::new("pulse", SegmentOptions::default()).unwrap();
//! seg.push(WaveStep::wait("w", 1.0).unwrap());
//! seg.push(WaveStep::sine("s", 2.0, vec![1.], vec![1.], vec![0.]).unwrap());
//! assert_eq!(seg.missing_smpl(), 32);
//! assert_eq!(seg.length_smpl(), 36032);
//! assert!(seg.write_segment_memory());
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{s, Array1};

use crate::error::{AwgError, Result};
use crate::utils::*;
use crate::wave_step::WaveStep;

pub const PADDING_STEP_NAME: &str = "_missing_smpls_";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AdvanceMode {
    #[default]
    Auto,
    Cond,
    Rep,
    Sing,
}

impl AdvanceMode {
    /// Two-bit code used in the control word of the sequencer table.
    pub fn code(&self) -> u32 {
        match self {
            AdvanceMode::Auto => 0,
            AdvanceMode::Cond => 1,
            AdvanceMode::Rep => 2,
            AdvanceMode::Sing => 3,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(AdvanceMode::Auto),
            1 => Ok(AdvanceMode::Cond),
            2 => Ok(AdvanceMode::Rep),
            3 => Ok(AdvanceMode::Sing),
            _ => Err(AwgError::EncodingError(format!("unknown advance mode code {}", code))),
        }
    }
}

impl fmt::Display for AdvanceMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                AdvanceMode::Auto => "AUTO",
                AdvanceMode::Cond => "COND",
                AdvanceMode::Rep => "REP",
                AdvanceMode::Sing => "SING",
            }
        )
    }
}

impl FromStr for AdvanceMode {
    type Err = AwgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "AUTO" => Ok(AdvanceMode::Auto),
            "COND" => Ok(AdvanceMode::Cond),
            "REP" => Ok(AdvanceMode::Rep),
            "SING" => Ok(AdvanceMode::Sing),
            _ => Err(AwgError::config(format!("unknown advance mode '{}'", s))),
        }
    }
}

/// A sample offset given either in samples or in microseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Offset {
    Smpl(u32),
    Mus(f64),
}

impl Offset {
    fn to_smpl(self, name: &str) -> Result<u32> {
        match self {
            Offset::Smpl(smpl) => Ok(smpl),
            Offset::Mus(mus) => {
                valid_length_mus(mus)?;
                check_range(name, mus, 0., MAX_LENGTH_SMPL / SAMPLE_FREQUENCY)?;
                Ok(mus_to_smpl(mus)? as u32)
            }
        }
    }
}

/// Handle of a segment within its sequence, stable under insertions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey(pub(crate) u64);

/// Attributes of one sequencer table row.
#[derive(Clone, Debug, PartialEq)]
pub struct Playback {
    loop_count: u32,
    advance_mode: AdvanceMode,
    marker_enable: bool,
    segment_start_offset: u32,
    segment_end_offset: u32,
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            loop_count: 1,
            advance_mode: AdvanceMode::Auto,
            marker_enable: true,
            segment_start_offset: 0,
            segment_end_offset: SEGMENT_END_OFFSET_MAX,
        }
    }
}

impl Playback {
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }
    pub fn advance_mode(&self) -> AdvanceMode {
        self.advance_mode
    }
    pub fn marker_enable(&self) -> bool {
        self.marker_enable
    }
    pub fn segment_start_offset(&self) -> u32 {
        self.segment_start_offset
    }
    pub fn segment_end_offset(&self) -> u32 {
        self.segment_end_offset
    }
    /// `None` when the segment plays to its end.
    pub fn segment_end_offset_mus(&self) -> Option<f64> {
        (self.segment_end_offset != SEGMENT_END_OFFSET_MAX)
            .then(|| smpl_to_mus(self.segment_end_offset as i64))
    }
    pub fn segment_start_offset_mus(&self) -> f64 {
        smpl_to_mus(self.segment_start_offset as i64)
    }
}

/// Playback attributes of a new segment or alias.
#[derive(Clone, Debug)]
pub struct SegmentOptions {
    pub loop_count: u32,
    pub advance_mode: AdvanceMode,
    pub marker_enable: bool,
    pub segment_start_offset: Option<Offset>,
    pub segment_end_offset: Option<Offset>,
    pub comment: String,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            loop_count: 1,
            advance_mode: AdvanceMode::Auto,
            marker_enable: true,
            segment_start_offset: None,
            segment_end_offset: None,
            comment: String::new(),
        }
    }
}

impl SegmentOptions {
    pub fn loop_count(mut self, loop_count: u32) -> Self {
        self.loop_count = loop_count;
        self
    }

    pub fn advance_mode(mut self, advance_mode: AdvanceMode) -> Self {
        self.advance_mode = advance_mode;
        self
    }

    fn playback(&self) -> Result<Playback> {
        let mut playback = Playback {
            loop_count: self.loop_count,
            advance_mode: self.advance_mode,
            marker_enable: self.marker_enable,
            ..Default::default()
        };
        if let Some(offset) = self.segment_start_offset {
            playback.segment_start_offset = offset.to_smpl("segment_start_offset")?;
        }
        if let Some(offset) = self.segment_end_offset {
            playback.segment_end_offset = offset.to_smpl("segment_end_offset")?;
        }
        Ok(playback)
    }
}

/// Behavior shared by owned segments and aliases.
///
/// Implementors only provide field access; the default methods route every playback change
/// through validation and mark the row for rewriting in sequencer memory.
pub trait BaseSequenceStep {
    // Field methods
    fn name(&self) -> &str;
    fn playback(&self) -> &Playback;
    fn sequence_id(&self) -> Option<u32>;
    fn write_sequence_memory(&self) -> bool;
    // Mutable field references
    fn playback_(&mut self) -> &mut Playback;
    fn sequence_id_(&mut self) -> &mut Option<u32>;
    fn write_sequence_memory_(&mut self) -> &mut bool;

    fn loop_count(&self) -> u32 {
        self.playback().loop_count
    }

    fn advance_mode(&self) -> AdvanceMode {
        self.playback().advance_mode
    }

    fn marker_enable(&self) -> bool {
        self.playback().marker_enable
    }

    fn set_loop_count(&mut self, loop_count: u32) {
        self.playback_().loop_count = loop_count;
        *self.write_sequence_memory_() = true;
    }

    fn set_advance_mode(&mut self, advance_mode: AdvanceMode) {
        self.playback_().advance_mode = advance_mode;
        *self.write_sequence_memory_() = true;
    }

    fn set_marker_enable(&mut self, marker_enable: bool) {
        if !marker_enable {
            tracing::warn!("disabling the markers of segment '{}'", self.name());
        }
        self.playback_().marker_enable = marker_enable;
        *self.write_sequence_memory_() = true;
    }

    fn set_segment_start_offset(&mut self, offset: Offset) -> Result<()> {
        self.playback_().segment_start_offset = offset.to_smpl("segment_start_offset")?;
        *self.write_sequence_memory_() = true;
        Ok(())
    }

    fn set_segment_end_offset(&mut self, offset: Offset) -> Result<()> {
        self.playback_().segment_end_offset = offset.to_smpl("segment_end_offset")?;
        *self.write_sequence_memory_() = true;
        Ok(())
    }

    fn mark_sequence_memory(&mut self) {
        *self.write_sequence_memory_() = true;
    }
}

/// A segment owning its wave steps.
#[derive(Clone, Debug)]
pub struct SequenceStep {
    key: Option<SegmentKey>,
    name: String,
    comment: String,
    wave_steps: Vec<WaveStep>,
    playback: Playback,
    write_segment_memory: bool,
    write_sequence_memory: bool,
    segment_id: Option<u32>,
    sequence_id: Option<u32>,
    cached: Option<(i64, Arc<Array1<i16>>)>,
}

impl BaseSequenceStep for SequenceStep {
    fn name(&self) -> &str {
        &self.name
    }
    fn playback(&self) -> &Playback {
        &self.playback
    }
    fn sequence_id(&self) -> Option<u32> {
        self.sequence_id
    }
    fn write_sequence_memory(&self) -> bool {
        self.write_sequence_memory
    }
    fn playback_(&mut self) -> &mut Playback {
        &mut self.playback
    }
    fn sequence_id_(&mut self) -> &mut Option<u32> {
        &mut self.sequence_id
    }
    fn write_sequence_memory_(&mut self) -> &mut bool {
        &mut self.write_sequence_memory
    }
}

impl SequenceStep {
    pub fn new(name: &str, options: SegmentOptions) -> Result<Self> {
        Ok(Self {
            key: None,
            name: name.to_string(),
            comment: options.comment.clone(),
            wave_steps: Vec::new(),
            playback: options.playback()?,
            write_segment_memory: true,
            write_sequence_memory: true,
            segment_id: None,
            sequence_id: None,
            cached: None,
        })
    }

    pub fn with_wave_steps(mut self, wave_steps: Vec<WaveStep>) -> Self {
        self.set_wave_steps(wave_steps);
        self
    }

    pub fn key(&self) -> Option<SegmentKey> {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: SegmentKey) {
        self.key = Some(key);
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn wave_steps(&self) -> &[WaveStep] {
        &self.wave_steps
    }

    pub fn number_of_wave_steps(&self) -> usize {
        self.wave_steps.len()
    }

    pub fn segment_id(&self) -> Option<u32> {
        self.segment_id
    }

    pub(crate) fn set_segment_id(&mut self, segment_id: Option<u32>) {
        self.segment_id = segment_id;
    }

    pub fn write_segment_memory(&self) -> bool {
        self.write_segment_memory
    }

    pub(crate) fn clear_write_flags(&mut self) {
        self.write_segment_memory = false;
        self.write_sequence_memory = false;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.write_segment_memory = true;
        self.write_sequence_memory = true;
    }

    fn touch(&mut self) {
        self.write_segment_memory = true;
        self.cached = None;
    }

    pub fn push(&mut self, step: WaveStep) {
        self.wave_steps.push(step);
        self.touch();
    }

    pub fn insert(&mut self, index: usize, step: WaveStep) -> Result<()> {
        if index > self.wave_steps.len() {
            return Err(AwgError::index(
                format!("wave steps of segment '{}'", self.name),
                index,
                self.wave_steps.len(),
            ));
        }
        self.wave_steps.insert(index, step);
        self.touch();
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<WaveStep> {
        if index >= self.wave_steps.len() {
            return Err(AwgError::index(
                format!("wave steps of segment '{}'", self.name),
                index,
                self.wave_steps.len(),
            ));
        }
        let step = self.wave_steps.remove(index);
        self.touch();
        Ok(step)
    }

    pub fn set_wave_steps(&mut self, wave_steps: Vec<WaveStep>) {
        self.wave_steps = wave_steps;
        self.touch();
    }

    /// Mutable access to a wave step; the segment is marked for re-upload.
    pub fn wave_step_mut(&mut self, index: usize) -> Result<&mut WaveStep> {
        let len = self.wave_steps.len();
        if index >= len {
            return Err(AwgError::index("wave steps", index, len));
        }
        self.touch();
        Ok(&mut self.wave_steps[index])
    }

    /// The wave step called `name`; more than one match is an error.
    pub fn find_wave_step(&self, name: &str) -> Result<Option<&WaveStep>> {
        let mut found = self.wave_steps.iter().filter(|w| w.name() == name);
        match (found.next(), found.next()) {
            (Some(step), None) => Ok(Some(step)),
            (None, _) => Ok(None),
            (Some(_), Some(_)) => Err(AwgError::config(format!(
                "wave step name '{}' occurs more than once in segment '{}'",
                name, self.name
            ))),
        }
    }

    /// Length of the wave steps without padding.
    pub fn data_length_smpl(&self) -> i64 {
        self.wave_steps.iter().map(|w| w.length_smpl()).sum()
    }

    pub fn missing_smpl(&self) -> i64 {
        missing_smpl(self.data_length_smpl())
    }

    pub fn padding_step(&self) -> WaveStep {
        WaveStep::padding(PADDING_STEP_NAME, self.missing_smpl())
    }

    pub fn length_smpl(&self) -> i64 {
        self.data_length_smpl() + self.missing_smpl()
    }

    pub fn length_mus(&self) -> f64 {
        smpl_to_mus(self.length_smpl())
    }

    pub fn segment_size_bytes(&self) -> usize {
        2 * self.length_smpl() as usize
    }

    /// Sample-weighted mean of the normalized power of the wave steps, padding included.
    pub fn normalized_power(&self) -> f64 {
        let weighted: f64 = self
            .wave_steps
            .iter()
            .map(|w| w.length_smpl() as f64 * w.normalized_power())
            .sum();
        weighted / self.length_smpl() as f64
    }

    fn compute_samples(&self, coherent_offset: i64) -> Array1<i16> {
        let mut samples = Array1::<i16>::zeros(self.length_smpl() as usize);
        let mut idx = 0usize;
        let padding = self.padding_step();
        for step in self.wave_steps.iter().chain(std::iter::once(&padding)) {
            let end = idx + step.length_smpl() as usize;
            let mut view = samples.slice_mut(s![idx..end]);
            if let Some(out) = view.as_slice_mut() {
                step.fill_samples(coherent_offset + idx as i64, out);
            }
            idx = end;
        }
        samples
    }

    /// The segment payload, starting at sample `coherent_offset` of the sequence.
    pub fn samples(&self, coherent_offset: i64) -> Arc<Array1<i16>> {
        match &self.cached {
            Some((offset, samples)) if *offset == coherent_offset => samples.clone(),
            _ => Arc::new(self.compute_samples(coherent_offset)),
        }
    }

    /// Computes the samples once and keeps them until the next change of the wave steps.
    pub fn precompile(&mut self, coherent_offset: i64) {
        let mut timer = TickTimer::new();
        let samples = Arc::new(self.compute_samples(coherent_offset));
        self.cached = Some((coherent_offset, samples));
        timer.tick_log(&format!("segment '{}' precompiled", self.name));
    }

    pub fn is_precompiled(&self) -> bool {
        self.cached.is_some()
    }

    /// Little-endian 16-bit words as uploaded to waveform memory.
    pub fn payload_bytes(&self, coherent_offset: i64) -> Vec<u8> {
        self.samples(coherent_offset)
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    pub fn info(&self, row: usize, prefix: &str) -> String {
        let mut out = vec![format!(
            "{}{:<6}{:<18}{:<10.6}{:<8}{:<6}",
            prefix,
            row,
            self.name,
            self.length_mus() * self.playback.loop_count as f64,
            self.playback.loop_count,
            self.playback.advance_mode
        )];
        let padding = self.padding_step();
        let inner = format!("   {}", prefix);
        for (i, step) in self
            .wave_steps
            .iter()
            .chain(std::iter::once(&padding))
            .enumerate()
        {
            out.push(step.info_line(i, &inner));
        }
        out.join("\n")
    }
}

/// A row replaying a segment owned elsewhere in the same sequence.
#[derive(Clone, Debug)]
pub struct SegmentAlias {
    name: String,
    target: SegmentKey,
    playback: Playback,
    write_sequence_memory: bool,
    sequence_id: Option<u32>,
}

impl BaseSequenceStep for SegmentAlias {
    fn name(&self) -> &str {
        &self.name
    }
    fn playback(&self) -> &Playback {
        &self.playback
    }
    fn sequence_id(&self) -> Option<u32> {
        self.sequence_id
    }
    fn write_sequence_memory(&self) -> bool {
        self.write_sequence_memory
    }
    fn playback_(&mut self) -> &mut Playback {
        &mut self.playback
    }
    fn sequence_id_(&mut self) -> &mut Option<u32> {
        &mut self.sequence_id
    }
    fn write_sequence_memory_(&mut self) -> &mut bool {
        &mut self.write_sequence_memory
    }
}

impl SegmentAlias {
    pub fn new(name: &str, target: SegmentKey, options: SegmentOptions) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            target,
            playback: options.playback()?,
            write_sequence_memory: true,
            sequence_id: None,
        })
    }

    pub fn target(&self) -> SegmentKey {
        self.target
    }

    pub(crate) fn clear_write_flags(&mut self) {
        self.write_sequence_memory = false;
    }
}

/// One row of a sequence.
#[derive(Clone, Debug)]
pub enum SegmentRef {
    Owned(SequenceStep),
    Alias(SegmentAlias),
}

impl SegmentRef {
    pub fn as_base(&self) -> &dyn BaseSequenceStep {
        match self {
            SegmentRef::Owned(seg) => seg,
            SegmentRef::Alias(alias) => alias,
        }
    }

    pub fn as_base_mut(&mut self) -> &mut dyn BaseSequenceStep {
        match self {
            SegmentRef::Owned(seg) => seg,
            SegmentRef::Alias(alias) => alias,
        }
    }

    pub fn name(&self) -> &str {
        self.as_base().name()
    }

    pub fn playback(&self) -> &Playback {
        self.as_base().playback()
    }

    pub fn sequence_id(&self) -> Option<u32> {
        self.as_base().sequence_id()
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, SegmentRef::Alias(_))
    }

    /// Key of the segment holding the samples of this row.
    pub fn target_key(&self) -> Option<SegmentKey> {
        match self {
            SegmentRef::Owned(seg) => seg.key(),
            SegmentRef::Alias(alias) => Some(alias.target()),
        }
    }

    pub(crate) fn clear_write_flags(&mut self) {
        match self {
            SegmentRef::Owned(seg) => seg.clear_write_flags(),
            SegmentRef::Alias(alias) => alias.clear_write_flags(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn segment_with(lengths_smpl: &[i64]) -> SequenceStep {
        let mut seg = SequenceStep::new("seg", SegmentOptions::default()).unwrap();
        for (i, &l) in lengths_smpl.iter().enumerate() {
            seg.push(WaveStep::wait_smpl(&format!("w{}", i), l).unwrap());
        }
        seg
    }

    #[rstest]
    #[case(&[], 320)]
    #[case(&[100], 320)]
    #[case(&[100, 300], 448)]
    #[case(&[384], 384)]
    #[case(&[12000, 24000], 36032)]
    fn segments_are_aligned(#[case] lengths: &[i64], #[case] expected: i64) {
        let seg = segment_with(lengths);
        assert_eq!(seg.length_smpl(), expected);
        assert_eq!(seg.length_smpl() % SEGMENT_GRANULARITY_SMPL, 0);
        assert_eq!(seg.padding_step().name(), PADDING_STEP_NAME);
        assert_eq!(seg.samples(0).len() as i64, expected);
        assert_eq!(seg.payload_bytes(0).len(), seg.segment_size_bytes());
    }

    #[test]
    fn mutations_mark_segment_memory() {
        let mut seg = segment_with(&[384]);
        seg.clear_write_flags();
        assert!(!seg.write_segment_memory());
        seg.insert(0, WaveStep::wait("w", 0.1).unwrap()).unwrap();
        assert!(seg.write_segment_memory());
        assert!(!seg.write_sequence_memory());

        seg.clear_write_flags();
        seg.remove(0).unwrap();
        assert!(seg.write_segment_memory());
        assert!(seg.remove(5).is_err());
        assert!(seg.insert(5, WaveStep::wait("w", 0.1).unwrap()).is_err());

        seg.clear_write_flags();
        seg.set_loop_count(3);
        assert!(seg.write_sequence_memory());
        assert!(!seg.write_segment_memory());
        assert_eq!(seg.loop_count(), 3);
    }

    #[test]
    fn precompiled_samples_are_dropped_on_change() {
        let mut seg = segment_with(&[384]);
        seg.precompile(0);
        assert!(seg.is_precompiled());
        let a = seg.samples(0);
        let b = seg.samples(0);
        assert!(Arc::ptr_eq(&a, &b));
        seg.push(WaveStep::constant("c", BLM, 1.).unwrap());
        assert!(!seg.is_precompiled());
        assert_eq!(seg.samples(0)[384], 2047 << 4);
    }

    #[test]
    fn payload_is_little_endian() {
        let mut seg = SequenceStep::new("c", SegmentOptions::default()).unwrap();
        seg.push(WaveStep::constant("c", BLM, 1.).unwrap().with_markers(true, true));
        let bytes = seg.payload_bytes(0);
        let word = ((2047i16 << 4) + 3).to_le_bytes();
        assert_eq!(&bytes[..2], &word);
    }

    #[test]
    fn wave_steps_keep_their_coherent_offset() {
        let mut seg = SequenceStep::new("s", SegmentOptions::default()).unwrap();
        let sine = WaveStep::sine("s", BLM, vec![375.], vec![1.], vec![0.]).unwrap();
        seg.push(WaveStep::wait_smpl("w", 8).unwrap());
        seg.push(sine.clone());
        let samples = seg.samples(0);
        // The sine starts 8 samples, a quarter period, into the segment.
        assert_eq!(samples[8], 2047 << 4);
        assert_eq!(samples.slice(s![8..392]), sine.samples(8));
    }

    #[test]
    fn offsets_and_options() {
        let options = SegmentOptions {
            segment_start_offset: Some(Offset::Mus(BLM)),
            segment_end_offset: Some(Offset::Smpl(1024)),
            ..Default::default()
        }
        .loop_count(4)
        .advance_mode(AdvanceMode::Sing);
        let mut seg = SequenceStep::new("o", options).unwrap();
        assert_eq!(seg.playback().segment_start_offset(), 384);
        assert_eq!(seg.playback().segment_end_offset(), 1024);
        assert_eq!(seg.playback().segment_end_offset_mus(), Some(1024. / SAMPLE_FREQUENCY));
        assert_eq!(seg.advance_mode(), AdvanceMode::Sing);
        assert!(seg
            .set_segment_start_offset(Offset::Mus(0.5 / SAMPLE_FREQUENCY))
            .is_err());
        assert_eq!(
            SequenceStep::new("d", SegmentOptions::default())
                .unwrap()
                .playback()
                .segment_end_offset_mus(),
            None
        );
    }

    #[test]
    fn normalized_power_includes_padding() {
        let mut seg = SequenceStep::new("p", SegmentOptions::default()).unwrap();
        let step = WaveStep::sine("s", 160. / SAMPLE_FREQUENCY, vec![1.], vec![1.], vec![0.]);
        seg.push(step.unwrap());
        assert_eq!(seg.length_smpl(), 320);
        assert_eq!(seg.normalized_power(), 0.5);
    }

    #[test]
    fn find_wave_step_by_name() {
        let mut seg = segment_with(&[10, 20]);
        assert_eq!(seg.find_wave_step("w1").unwrap().unwrap().length_smpl(), 20);
        assert!(seg.find_wave_step("x").unwrap().is_none());
        seg.push(WaveStep::wait_smpl("w1", 5).unwrap());
        assert!(seg.find_wave_step("w1").is_err());
    }

    #[test]
    fn advance_mode_codes() {
        for (mode, code) in [
            (AdvanceMode::Auto, 0),
            (AdvanceMode::Cond, 1),
            (AdvanceMode::Rep, 2),
            (AdvanceMode::Sing, 3),
        ] {
            assert_eq!(mode.code(), code);
            assert_eq!(AdvanceMode::from_code(code).unwrap(), mode);
            assert_eq!(mode.to_string().parse::<AdvanceMode>().unwrap(), mode);
        }
        assert!(AdvanceMode::from_code(4).is_err());
    }
}
