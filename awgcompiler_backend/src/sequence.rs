use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::{concatenate, Array1, ArrayView1, Axis};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::{AwgError, Result};
use crate::segment::*;
use crate::utils::*;
use crate::wave_step::WaveStep;

/// The ordered rows one channel plays for one program.
///
/// Rows are either segments owned by the sequence or aliases replaying one of them. The
/// sequence itself carries the loop count and advance mode applied to the whole table entry;
/// changing either marks the first row for rewriting since it holds the sequence-level fields.
#[derive(Clone, Debug)]
pub struct Sequence {
    name: String,
    comment: String,
    date: String,
    rows: Vec<SegmentRef>,
    loop_count: u32,
    advance_mode: AdvanceMode,
    next_key: u64,
}

impl Sequence {
    pub fn new(name: &str) -> Self {
        let date = OffsetDateTime::now_utc()
            .format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            comment: String::new(),
            date,
            rows: Vec::new(),
            loop_count: 1,
            advance_mode: AdvanceMode::Cond,
            next_key: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.comment = comment.to_string();
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn advance_mode(&self) -> AdvanceMode {
        self.advance_mode
    }

    pub fn set_loop_count(&mut self, loop_count: u32) {
        self.loop_count = loop_count;
        if let Some(first) = self.rows.first_mut() {
            first.as_base_mut().mark_sequence_memory();
        }
    }

    pub fn set_advance_mode(&mut self, advance_mode: AdvanceMode) {
        self.advance_mode = advance_mode;
        if let Some(first) = self.rows.first_mut() {
            first.as_base_mut().mark_sequence_memory();
        }
    }

    pub fn rows(&self) -> &[SegmentRef] {
        &self.rows
    }

    pub fn number_of_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Result<&SegmentRef> {
        self.rows.get(index).ok_or_else(|| {
            AwgError::index(format!("rows of sequence '{}'", self.name), index, self.rows.len())
        })
    }

    pub fn row_mut(&mut self, index: usize) -> Result<&mut SegmentRef> {
        let len = self.rows.len();
        let name = self.name.clone();
        self.rows
            .get_mut(index)
            .ok_or_else(|| AwgError::index(format!("rows of sequence '{}'", name), index, len))
    }

    fn allocate_key(&mut self) -> SegmentKey {
        let key = SegmentKey(self.next_key);
        self.next_key += 1;
        key
    }

    pub fn push_segment(&mut self, mut segment: SequenceStep) -> SegmentKey {
        let key = self.allocate_key();
        segment.set_key(key);
        segment.mark_sequence_memory();
        self.rows.push(SegmentRef::Owned(segment));
        key
    }

    /// Inserts a segment at row `index`. A segment pushed to the front takes over the
    /// sequence-level fields, so the row it displaces is rewritten too.
    pub fn insert_segment(
        &mut self,
        index: usize,
        mut segment: SequenceStep,
    ) -> Result<SegmentKey> {
        if index > self.rows.len() {
            return Err(AwgError::index(
                format!("rows of sequence '{}'", self.name),
                index,
                self.rows.len(),
            ));
        }
        let key = self.allocate_key();
        segment.set_key(key);
        segment.mark_sequence_memory();
        if index == 0 {
            if let Some(first) = self.rows.first_mut() {
                first.as_base_mut().mark_sequence_memory();
            }
        }
        self.rows.insert(index, SegmentRef::Owned(segment));
        Ok(key)
    }

    /// Appends a row replaying the segment `target`.
    pub fn push_alias(
        &mut self,
        name: &str,
        target: SegmentKey,
        options: SegmentOptions,
    ) -> Result<()> {
        if self.by_key(target).is_none() {
            return Err(AwgError::config(format!(
                "sequence '{}' owns no segment with key {:?}",
                self.name, target
            )));
        }
        self.rows
            .push(SegmentRef::Alias(SegmentAlias::new(name, target, options)?));
        Ok(())
    }

    /// Index of the first row called `name`.
    pub fn find_row(&self, name: &str) -> Option<usize> {
        self.rows.iter().position(|r| r.name() == name)
    }

    pub fn by_key(&self, key: SegmentKey) -> Option<&SequenceStep> {
        self.rows.iter().find_map(|r| match r {
            SegmentRef::Owned(seg) if seg.key() == Some(key) => Some(seg),
            _ => None,
        })
    }

    pub fn by_key_mut(&mut self, key: SegmentKey) -> Option<&mut SequenceStep> {
        self.rows.iter_mut().find_map(|r| match r {
            SegmentRef::Owned(seg) if seg.key() == Some(key) => Some(seg),
            _ => None,
        })
    }

    /// The segment holding the samples played by `row`.
    pub fn resolve<'a>(&'a self, row: &'a SegmentRef) -> Result<&'a SequenceStep> {
        match row {
            SegmentRef::Owned(seg) => Ok(seg),
            SegmentRef::Alias(alias) => self.by_key(alias.target()).ok_or_else(|| {
                AwgError::config(format!(
                    "alias '{}' in sequence '{}' points to a missing segment",
                    alias.name(),
                    self.name
                ))
            }),
        }
    }

    /// The segment played by row `index`, following aliases.
    pub fn segment(&self, index: usize) -> Result<&SequenceStep> {
        self.resolve(self.row(index)?)
    }

    /// Mutable access to the segment played by row `index`. Editing the target of an alias
    /// changes every row replaying it.
    pub fn segment_mut(&mut self, index: usize) -> Result<&mut SequenceStep> {
        let key = self
            .row(index)?
            .target_key()
            .ok_or_else(|| AwgError::config("segment without key"))?;
        let name = self.name.clone();
        self.by_key_mut(key).ok_or_else(|| {
            AwgError::config(format!(
                "row {} of sequence '{}' points to a missing segment",
                index, name
            ))
        })
    }

    /// Wave step `wave_index` of the segment played by row `row_index`.
    pub fn dl(&self, row_index: usize, wave_index: usize) -> Result<&WaveStep> {
        let seg = self.segment(row_index)?;
        seg.wave_steps()
            .get(wave_index)
            .ok_or_else(|| AwgError::index("wave steps", wave_index, seg.number_of_wave_steps()))
    }

    pub fn owned_segments(&self) -> impl Iterator<Item = &SequenceStep> {
        self.rows.iter().filter_map(|r| match r {
            SegmentRef::Owned(seg) => Some(seg),
            SegmentRef::Alias(_) => None,
        })
    }

    pub(crate) fn owned_segments_mut(&mut self) -> impl Iterator<Item = &mut SequenceStep> {
        self.rows.iter_mut().filter_map(|r| match r {
            SegmentRef::Owned(seg) => Some(seg),
            SegmentRef::Alias(_) => None,
        })
    }

    /// Played length of every row: segment length times row loop count.
    pub fn row_lengths_smpl(&self) -> Result<Vec<i64>> {
        self.rows
            .iter()
            .map(|r| Ok(self.resolve(r)?.length_smpl() * r.playback().loop_count() as i64))
            .collect()
    }

    /// Length of one pass through the sequence.
    pub fn length_smpl(&self) -> Result<i64> {
        Ok(self.row_lengths_smpl()?.iter().sum())
    }

    pub fn length_mus(&self) -> Result<f64> {
        Ok(smpl_to_mus(self.length_smpl()?))
    }

    pub fn repeated_length_mus(&self) -> Result<f64> {
        Ok(self.length_mus()? * self.loop_count as f64)
    }

    /// Index of the first sample of every row, counted from the start of the sequence.
    pub fn sample_offsets(&self) -> Result<Vec<i64>> {
        let mut offset = 0;
        self.row_lengths_smpl()?
            .into_iter()
            .map(|l| {
                let start = offset;
                offset += l;
                Ok(start)
            })
            .collect()
    }

    /// Mean normalized power over one pass, weighted by played length.
    ///
    /// The denominator is the length of a single pass rather than the repeated length. Every pass
    /// plays the same rows, so the mean is the same either way, whatever the sequence loop count.
    pub fn normalized_avg_power(&self) -> Result<f64> {
        let lengths = self.row_lengths_smpl()?;
        let total: i64 = lengths.iter().sum();
        if total == 0 {
            return Ok(0.);
        }
        let mut weighted = 0.;
        for (row, length) in self.rows.iter().zip(lengths) {
            weighted += self.resolve(row)?.normalized_power() * length as f64;
        }
        Ok(weighted / total as f64)
    }

    /// Payload of every owned segment, keyed by segment, at the offset of its own row.
    pub fn segment_payloads(&self) -> Result<IndexMap<SegmentKey, Arc<Array1<i16>>>> {
        let offsets = self.sample_offsets()?;
        let mut out = IndexMap::new();
        for (row, offset) in self.rows.iter().zip(offsets) {
            if let SegmentRef::Owned(seg) = row {
                if let Some(key) = seg.key() {
                    out.insert(key, seg.samples(offset));
                }
            }
        }
        Ok(out)
    }

    pub fn precompile(&mut self) -> Result<()> {
        let mut timer = TickTimer::new();
        let offsets = self.sample_offsets()?;
        for (row, offset) in self.rows.iter_mut().zip(offsets) {
            if let SegmentRef::Owned(seg) = row {
                seg.precompile(offset);
            }
        }
        timer.tick_log(&format!("sequence '{}' precompiled", self.name));
        Ok(())
    }

    /// One pass of the sequence as the AWG plays it, loops unrolled.
    pub fn samples(&self) -> Result<Array1<i16>> {
        let payloads = self.segment_payloads()?;
        let mut parts: Vec<Arc<Array1<i16>>> = Vec::new();
        for row in &self.rows {
            let key = row
                .target_key()
                .ok_or_else(|| AwgError::config("segment without key"))?;
            let payload = payloads
                .get(&key)
                .ok_or_else(|| AwgError::config(format!("no payload for row '{}'", row.name())))?;
            for _ in 0..row.playback().loop_count() {
                parts.push(payload.clone());
            }
        }
        let views: Vec<ArrayView1<i16>> = parts.iter().map(|p| p.view()).collect();
        if views.is_empty() {
            return Ok(Array1::zeros(0));
        }
        concatenate(Axis(0), &views).map_err(|e| AwgError::EncodingError(e.to_string()))
    }

    /// Segment ids of all rows as assigned by the last write, aliases resolved.
    pub fn segment_ids(&self) -> Result<Vec<u32>> {
        self.rows
            .iter()
            .map(|r| {
                self.resolve(r)?.segment_id().ok_or_else(|| {
                    AwgError::EncodingError(format!(
                        "segment '{}' of sequence '{}' has no segment id",
                        r.name(),
                        self.name
                    ))
                })
            })
            .collect()
    }

    pub(crate) fn clear_write_flags(&mut self) {
        self.rows.iter_mut().for_each(|r| r.clear_write_flags());
    }

    pub(crate) fn forget_device_ids(&mut self) {
        for row in self.rows.iter_mut() {
            *row.as_base_mut().sequence_id_() = None;
            if let SegmentRef::Owned(seg) = row {
                seg.set_segment_id(None);
                seg.mark_dirty();
            } else {
                row.as_base_mut().mark_sequence_memory();
            }
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "sequence '{}' ({}), loop_count {}, advance {}, length {:.6} mus",
            self.name,
            self.date,
            self.loop_count,
            self.advance_mode,
            self.length_mus().unwrap_or(f64::NAN)
        )?;
        for (i, row) in self.rows.iter().enumerate() {
            match row {
                SegmentRef::Owned(seg) => writeln!(f, "{}", seg.info(i, "   "))?,
                SegmentRef::Alias(alias) => writeln!(
                    f,
                    "   {:<6}{:<18}alias, loop_count {}, advance {}",
                    i,
                    alias.name(),
                    alias.loop_count(),
                    alias.advance_mode()
                )?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn seg(name: &str, wave_steps: Vec<WaveStep>) -> SequenceStep {
        SequenceStep::new(name, SegmentOptions::default())
            .unwrap()
            .with_wave_steps(wave_steps)
    }

    fn sine(length_mus: f64) -> WaveStep {
        WaveStep::sine("s", length_mus, vec![375.], vec![1.], vec![0.]).unwrap()
    }

    #[test]
    fn new_sequence_defaults() {
        let seq = Sequence::new("rabi");
        assert_eq!(seq.advance_mode(), AdvanceMode::Cond);
        assert_eq!(seq.loop_count(), 1);
        assert!(seq.is_empty());
        assert_eq!(seq.date().len(), 16);
        assert_eq!(seq.length_smpl().unwrap(), 0);
    }

    #[test]
    fn offsets_accumulate_over_rows_and_loops() {
        let mut seq = Sequence::new("s");
        let a = seq.push_segment(seg("a", vec![sine(BLM)]));
        seq.push_segment(
            SequenceStep::new("b", SegmentOptions::default().loop_count(3))
                .unwrap()
                .with_wave_steps(vec![WaveStep::wait("w", 2. * BLM).unwrap()]),
        );
        seq.push_alias("a", a, SegmentOptions::default()).unwrap();
        assert_eq!(seq.row_lengths_smpl().unwrap(), vec![384, 3 * 768, 384]);
        assert_eq!(seq.sample_offsets().unwrap(), vec![0, 384, 384 + 3 * 768]);
        assert_eq!(seq.length_smpl().unwrap(), 384 * 2 + 3 * 768);
        assert_eq!(seq.owned_segments().count(), 2);
        assert_eq!(seq.segment(2).unwrap().name(), "a");
        assert_eq!(seq.find_row("b"), Some(1));
        assert_eq!(seq.samples().unwrap().len() as i64, seq.length_smpl().unwrap());
    }

    #[test]
    fn alias_requires_known_target() {
        let mut seq = Sequence::new("s");
        assert!(seq
            .push_alias("x", SegmentKey(7), SegmentOptions::default())
            .is_err());
    }

    #[test]
    fn editing_through_an_alias_changes_the_target() {
        let mut seq = Sequence::new("s");
        let a = seq.push_segment(seg("a", vec![]));
        seq.push_alias("a", a, SegmentOptions::default()).unwrap();
        seq.segment_mut(1).unwrap().push(sine(BLM));
        assert_eq!(seq.segment(0).unwrap().number_of_wave_steps(), 1);
        assert_eq!(seq.dl(1, 0).unwrap().name(), "s");
        assert!(seq.dl(1, 1).is_err());
    }

    #[test]
    fn front_insertion_marks_displaced_row() {
        let mut seq = Sequence::new("s");
        seq.push_segment(seg("a", vec![]));
        seq.clear_write_flags();
        seq.insert_segment(0, seg("t", vec![])).unwrap();
        assert!(seq.row(0).unwrap().as_base().write_sequence_memory());
        assert!(seq.row(1).unwrap().as_base().write_sequence_memory());
        assert!(seq.insert_segment(5, seg("x", vec![])).is_err());

        seq.clear_write_flags();
        seq.set_loop_count(2);
        assert!(seq.row(0).unwrap().as_base().write_sequence_memory());
        assert!(!seq.row(1).unwrap().as_base().write_sequence_memory());
    }

    #[test]
    fn average_power_is_length_weighted() {
        let mut seq = Sequence::new("s");
        seq.push_segment(seg("a", vec![sine(BLM)]));
        seq.push_segment(seg("b", vec![WaveStep::wait("w", 3. * BLM).unwrap()]));
        assert_eq!(seq.normalized_avg_power().unwrap(), 0.25);
    }

    #[test]
    fn precompile_keeps_continuous_phase() {
        let mut seq = Sequence::new("s");
        seq.push_segment(seg("a", vec![WaveStep::wait_smpl("w", 360).unwrap()]));
        seq.push_segment(seg("b", vec![sine(BLM)]));
        seq.precompile().unwrap();
        let b = seq.segment(1).unwrap();
        assert!(b.is_precompiled());
        assert_eq!(*b.samples(384), sine(BLM).samples(384));
        assert!(seq.segment_ids().is_err());
        assert!(format!("{}", seq).contains("sequence 's'"));
    }
}
