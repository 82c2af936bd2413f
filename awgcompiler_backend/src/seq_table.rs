//! Binary layout of the sequencer table.
//!
//! Every row is a 24-byte record of six little-endian `u32` words:
//! `control, sequence_loop_count, segment_loop_count, segment_id, segment_start_offset,
//! segment_end_offset`. The control word packs the row flags:
//!
//! | bits  | meaning                          |
//! |-------|----------------------------------|
//! | 28    | first row of a sequence          |
//! | 30    | last row of a sequence           |
//! | 24    | marker enable                    |
//! | 20-21 | sequence advance mode            |
//! | 16-17 | segment advance mode             |
//!
//! A sequence occupies consecutive rows. The id of a sequence is the index of its first row, and
//! the rows of a new sequence are appended after the current end of the table.

use crate::error::{AwgError, Result};
use crate::segment::{AdvanceMode, BaseSequenceStep};
use crate::sequence::Sequence;

pub const RECORD_SIZE: usize = 24;
pub const CONTROL_SEQUENCE_START: u32 = 1 << 28;
pub const CONTROL_SEQUENCE_END: u32 = 1 << 30;
pub const CONTROL_MARKER_ENABLE: u32 = 1 << 24;
pub const CONTROL_RESET: u32 = 1 << 31;
const SEQUENCE_ADVANCE_SHIFT: u32 = 20;
const SEGMENT_ADVANCE_SHIFT: u32 = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequenceTableRecord {
    pub control: u32,
    pub sequence_loop_count: u32,
    pub segment_loop_count: u32,
    pub segment_id: u32,
    pub segment_start_offset: u32,
    pub segment_end_offset: u32,
}

pub fn control_word(
    first: bool,
    last: bool,
    marker_enable: bool,
    sequence_advance: AdvanceMode,
    segment_advance: AdvanceMode,
) -> u32 {
    let mut control = 0;
    if first {
        control |= CONTROL_SEQUENCE_START;
    }
    if last {
        control |= CONTROL_SEQUENCE_END;
    }
    if marker_enable {
        control |= CONTROL_MARKER_ENABLE;
    }
    control
        | (sequence_advance.code() << SEQUENCE_ADVANCE_SHIFT)
        | (segment_advance.code() << SEGMENT_ADVANCE_SHIFT)
}

impl SequenceTableRecord {
    /// The record written over rows freed by a deleted program.
    pub fn reset() -> Self {
        Self {
            control: CONTROL_RESET,
            sequence_loop_count: 1,
            segment_loop_count: 0,
            segment_id: 0,
            segment_start_offset: 640,
            segment_end_offset: 0,
        }
    }

    fn words(&self) -> [u32; 6] {
        [
            self.control,
            self.sequence_loop_count,
            self.segment_loop_count,
            self.segment_id,
            self.segment_start_offset,
            self.segment_end_offset,
        ]
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_SIZE {
            return Err(AwgError::table(format!(
                "a sequence table record has {} bytes, got {}",
                RECORD_SIZE,
                bytes.len()
            )));
        }
        let mut words = [0u32; 6];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            *word = u32::from_le_bytes(buf);
        }
        Ok(Self {
            control: words[0],
            sequence_loop_count: words[1],
            segment_loop_count: words[2],
            segment_id: words[3],
            segment_start_offset: words[4],
            segment_end_offset: words[5],
        })
    }

    pub fn is_sequence_start(&self) -> bool {
        self.control & CONTROL_SEQUENCE_START != 0
    }

    pub fn is_sequence_end(&self) -> bool {
        self.control & CONTROL_SEQUENCE_END != 0
    }

    pub fn marker_enable(&self) -> bool {
        self.control & CONTROL_MARKER_ENABLE != 0
    }

    pub fn sequence_advance(&self) -> Result<AdvanceMode> {
        AdvanceMode::from_code((self.control >> SEQUENCE_ADVANCE_SHIFT) & 0b11)
    }

    pub fn segment_advance(&self) -> Result<AdvanceMode> {
        AdvanceMode::from_code((self.control >> SEGMENT_ADVANCE_SHIFT) & 0b11)
    }
}

/// The records of `sequence`, one per row, given the segment id each row plays.
pub fn sequence_records(
    sequence: &Sequence,
    segment_ids: &[u32],
) -> Result<Vec<SequenceTableRecord>> {
    let rows = sequence.rows();
    if rows.is_empty() {
        return Err(AwgError::EncodingError(format!(
            "sequence '{}' has no rows and can not be written",
            sequence.name()
        )));
    }
    if rows.len() != segment_ids.len() {
        return Err(AwgError::EncodingError(format!(
            "sequence '{}' has {} rows but {} segment ids were given",
            sequence.name(),
            rows.len(),
            segment_ids.len()
        )));
    }
    let last = rows.len() - 1;
    Ok(rows
        .iter()
        .zip(segment_ids)
        .enumerate()
        .map(|(i, (row, &segment_id))| {
            let playback = row.playback();
            SequenceTableRecord {
                control: control_word(
                    i == 0,
                    i == last,
                    playback.marker_enable(),
                    sequence.advance_mode(),
                    playback.advance_mode(),
                ),
                sequence_loop_count: sequence.loop_count(),
                segment_loop_count: playback.loop_count(),
                segment_id,
                segment_start_offset: playback.segment_start_offset(),
                segment_end_offset: playback.segment_end_offset(),
            }
        })
        .collect())
}

pub fn records_to_bytes(records: &[SequenceTableRecord]) -> Vec<u8> {
    records.iter().flat_map(|r| r.to_bytes()).collect()
}

pub fn records_from_bytes(bytes: &[u8]) -> Result<Vec<SequenceTableRecord>> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(AwgError::table(format!(
            "sequence table of {} bytes is not a whole number of records",
            bytes.len()
        )));
    }
    bytes
        .chunks_exact(RECORD_SIZE)
        .map(SequenceTableRecord::from_bytes)
        .collect()
}

/// Encodes `sequence` for the rows starting at `sequence_id_offset` and records the resulting
/// sequence id on every row.
pub fn encode_sequence(
    sequence: &mut Sequence,
    segment_ids: &[u32],
    sequence_id_offset: u32,
) -> Result<Vec<u8>> {
    let records = sequence_records(sequence, segment_ids)?;
    for i in 0..sequence.number_of_rows() {
        *sequence.row_mut(i)?.as_base_mut().sequence_id_() = Some(sequence_id_offset + i as u32);
    }
    Ok(records_to_bytes(&records))
}

/// `(first row, number of rows)` of every complete sequence in `records`.
pub fn sequence_catalogue(records: &[SequenceTableRecord]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut start: Option<u32> = None;
    for (i, record) in records.iter().enumerate() {
        let i = i as u32;
        if record.is_sequence_start() {
            start = Some(i);
        }
        if record.is_sequence_end() {
            if let Some(s) = start.take() {
                out.push((s, i - s + 1));
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::segment::{SegmentOptions, SequenceStep};
    use crate::utils::SEGMENT_END_OFFSET_MAX;

    fn sequence(rows: usize) -> Sequence {
        let mut seq = Sequence::new("s");
        for i in 0..rows {
            let segment = SequenceStep::new(&format!("r{}", i), SegmentOptions::default()).unwrap();
            seq.push_segment(segment);
        }
        seq
    }

    #[test]
    fn control_words() {
        assert_eq!(
            control_word(true, true, true, AdvanceMode::Cond, AdvanceMode::Auto),
            (1 << 28) + (1 << 30) + (1 << 24) + (1 << 20)
        );
        assert_eq!(
            control_word(false, false, false, AdvanceMode::Sing, AdvanceMode::Rep),
            (3 << 20) + (2 << 16)
        );
    }

    #[test]
    fn single_row_sequence() {
        let mut seq = sequence(1);
        let bytes = encode_sequence(&mut seq, &[5], 3).unwrap();
        assert_eq!(bytes.len(), RECORD_SIZE);
        let record = SequenceTableRecord::from_bytes(&bytes).unwrap();
        assert!(record.is_sequence_start() && record.is_sequence_end());
        assert!(record.marker_enable());
        assert_eq!(record.sequence_advance().unwrap(), AdvanceMode::Cond);
        assert_eq!(record.segment_advance().unwrap(), AdvanceMode::Auto);
        assert_eq!(record.segment_id, 5);
        assert_eq!(record.sequence_loop_count, 1);
        assert_eq!(record.segment_loop_count, 1);
        assert_eq!(record.segment_start_offset, 0);
        assert_eq!(record.segment_end_offset, SEGMENT_END_OFFSET_MAX);
        assert_eq!(seq.row(0).unwrap().sequence_id(), Some(3));
        assert_eq!(&bytes[..4], &((1u32 << 28) + (1 << 30) + (1 << 24) + (1 << 20)).to_le_bytes());
    }

    #[test]
    fn multi_row_flags_and_ids() {
        let mut seq = sequence(3);
        let bytes = encode_sequence(&mut seq, &[1, 2, 1], 10).unwrap();
        let records = records_from_bytes(&bytes).unwrap();
        assert!(records[0].is_sequence_start() && !records[0].is_sequence_end());
        assert!(!records[1].is_sequence_start() && !records[1].is_sequence_end());
        assert!(!records[2].is_sequence_start() && records[2].is_sequence_end());
        let ids: Vec<_> = seq.rows().iter().map(|r| r.sequence_id()).collect();
        assert_eq!(ids, vec![Some(10), Some(11), Some(12)]);
    }

    #[test]
    fn invalid_inputs() {
        assert!(matches!(
            encode_sequence(&mut sequence(0), &[], 0),
            Err(AwgError::EncodingError(_))
        ));
        assert!(encode_sequence(&mut sequence(2), &[1], 0).is_err());
        assert!(records_from_bytes(&[0; 25]).is_err());
    }

    #[test]
    fn catalogue_of_table() {
        let records_of = |rows: usize, ids: &[u32], first_row: u32| {
            let bytes = encode_sequence(&mut sequence(rows), ids, first_row).unwrap();
            records_from_bytes(&bytes).unwrap()
        };
        let mut records = records_of(1, &[1], 0);
        records.extend(records_of(3, &[2, 3, 2], 1));
        records.push(SequenceTableRecord::reset());
        records.extend(records_of(2, &[4, 4], 5));
        assert_eq!(sequence_catalogue(&records), vec![(0, 1), (1, 3), (5, 2)]);
    }

    #[test]
    fn reset_record_bytes() {
        let bytes = SequenceTableRecord::reset().to_bytes();
        assert_eq!(&bytes[..4], &(1u32 << 31).to_le_bytes());
        assert_eq!(&bytes[16..20], &640u32.to_le_bytes());
        assert!(!SequenceTableRecord::reset().is_sequence_start());
    }
}
