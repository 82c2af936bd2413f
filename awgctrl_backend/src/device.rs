//! # In-memory instrument
//!
//! [`SimulatedAwg`] implements [`AwgTransport`] on top of plain memory, reproducing the parts of
//! an M8190A that programs rely on:
//!
//! - **Waveform memory:** segments are allocated in multiples of 64 samples, at least 320 samples
//!   long, with the smallest free id starting from 1. The total number of samples per channel is
//!   bounded by a configurable capacity.
//! - **Sequencer memory:** table rows are written at arbitrary row offsets. Freed rows hold
//!   [`SequenceTableRecord::reset`] records and reading the table stops at the first of them.
//! - **Run state:** arming, outputs, the selected sequence and a counter of received triggers.
//!
//! The state lives behind an `Arc<parking_lot::Mutex<_>>`; [`SimulatedAwg::memory`] hands out a
//! second reference so that the memory can be inspected (or tampered with) while the transport
//! itself is owned by a registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use awgcompiler_backend::prelude::*;

pub const MAX_SEGMENT_ID: u32 = 1 << 19;
pub const MAX_SEGMENT_LENGTH_SMPL: i64 = 2 * 1024 * 1024 * 1024;
pub const MAX_SEQUENCE_TABLE_ROWS: usize = 1 << 19;

#[derive(Clone, Debug, Default)]
pub struct ChannelMemory {
    pub segments: BTreeMap<u32, Vec<i16>>,
    pub table: Vec<SequenceTableRecord>,
    pub selected_sequence: Option<u32>,
    pub output: bool,
    pub armed: bool,
}

impl ChannelMemory {
    pub fn used_smpl(&self) -> i64 {
        self.segments.values().map(|s| s.len() as i64).sum()
    }

    /// Rows before the first reset record.
    pub fn table_in_use(&self) -> &[SequenceTableRecord] {
        let end = self
            .table
            .iter()
            .position(|r| r.control == CONTROL_RESET)
            .unwrap_or(self.table.len());
        &self.table[..end]
    }

    fn free_segment_id(&self) -> Option<u32> {
        (1..=MAX_SEGMENT_ID).find(|id| !self.segments.contains_key(id))
    }
}

#[derive(Clone, Debug)]
pub struct AwgMemory {
    pub channels: IndexMap<u8, ChannelMemory>,
    /// Waveform memory of each channel, in samples.
    pub capacity_smpl: i64,
    pub triggers: usize,
    pub settings_restored: usize,
}

pub type SharedMemory = Arc<Mutex<AwgMemory>>;

pub struct SimulatedAwg {
    name: String,
    memory: SharedMemory,
}

impl SimulatedAwg {
    pub fn new(name: &str, channels: &[u8]) -> Self {
        let memory = AwgMemory {
            channels: channels
                .iter()
                .map(|&ch| (ch, ChannelMemory::default()))
                .collect(),
            capacity_smpl: MAX_SEGMENT_LENGTH_SMPL,
            triggers: 0,
            settings_restored: 0,
        };
        Self {
            name: name.to_string(),
            memory: Arc::new(Mutex::new(memory)),
        }
    }

    pub fn with_capacity(self, capacity_smpl: i64) -> Self {
        self.memory.lock().capacity_smpl = capacity_smpl;
        self
    }

    pub fn memory(&self) -> SharedMemory {
        self.memory.clone()
    }

    fn channel_id(&self, ch: u8) -> ChannelId {
        ChannelId::new(&self.name, ch)
    }

    fn err(&self, ch: u8, msg: String) -> AwgError {
        AwgError::Transport(format!("{}: {}", self.channel_id(ch), msg))
    }

    fn with_channel<T>(
        &self,
        ch: u8,
        f: impl FnOnce(&mut ChannelMemory) -> Result<T>,
    ) -> Result<T> {
        let mut memory = self.memory.lock();
        match memory.channels.get_mut(&ch) {
            Some(channel) => f(channel),
            None => Err(self.err(ch, "no such channel".to_string())),
        }
    }
}

impl AwgTransport for SimulatedAwg {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate_segment(&mut self, ch: u8, length_smpl: i64) -> Result<u32> {
        let failure = |reason: String| AwgError::AllocationFailure {
            channel: self.channel_id(ch),
            length_smpl,
            reason,
        };
        if length_smpl < MIN_SEGMENT_LENGTH_SMPL
            || length_smpl > MAX_SEGMENT_LENGTH_SMPL
            || length_smpl % SEGMENT_GRANULARITY_SMPL != 0
        {
            return Err(failure(format!(
                "segment length must be a multiple of {} within [{}, {}]",
                SEGMENT_GRANULARITY_SMPL, MIN_SEGMENT_LENGTH_SMPL, MAX_SEGMENT_LENGTH_SMPL
            )));
        }
        let mut memory = self.memory.lock();
        let capacity = memory.capacity_smpl;
        let channel = memory
            .channels
            .get_mut(&ch)
            .ok_or_else(|| failure("no such channel".to_string()))?;
        let free = capacity - channel.used_smpl();
        if length_smpl > free {
            return Err(failure(format!("only {} samples of waveform memory left", free)));
        }
        let id = channel
            .free_segment_id()
            .ok_or_else(|| failure("no free segment id".to_string()))?;
        channel.segments.insert(id, vec![0; length_smpl as usize]);
        Ok(id)
    }

    fn write_segment_payload(
        &mut self,
        ch: u8,
        segment_id: u32,
        byte_offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        if byte_offset % 2 != 0 || bytes.len() % 2 != 0 {
            return Err(self.err(ch, "payloads are made of whole 16 bit samples".to_string()));
        }
        let missing = self.err(ch, format!("no segment {}", segment_id));
        let overflow = self.err(
            ch,
            format!(
                "{} bytes at offset {} overflow segment {}",
                bytes.len(),
                byte_offset,
                segment_id
            ),
        );
        self.with_channel(ch, |channel| {
            let segment = channel.segments.get_mut(&segment_id).ok_or(missing)?;
            let start = byte_offset / 2;
            let end = start + bytes.len() / 2;
            if end > segment.len() {
                return Err(overflow);
            }
            for (sample, chunk) in segment[start..end].iter_mut().zip(bytes.chunks_exact(2)) {
                *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            }
            Ok(())
        })
    }

    fn write_sequence_table(&mut self, ch: u8, row_offset: u32, records: &[u8]) -> Result<()> {
        let records = records_from_bytes(records)?;
        let row_offset = row_offset as usize;
        let out_of_table = self.err(ch, format!("table write at row {} leaves a gap", row_offset));
        let too_long = self.err(
            ch,
            format!("sequencer memory holds {} rows", MAX_SEQUENCE_TABLE_ROWS),
        );
        self.with_channel(ch, |channel| {
            if row_offset > channel.table.len() {
                return Err(out_of_table);
            }
            if row_offset + records.len() > MAX_SEQUENCE_TABLE_ROWS {
                return Err(too_long);
            }
            for (i, record) in records.into_iter().enumerate() {
                match channel.table.get_mut(row_offset + i) {
                    Some(row) => *row = record,
                    None => channel.table.push(record),
                }
            }
            Ok(())
        })
    }

    fn read_sequence_table(&mut self, ch: u8) -> Result<Vec<SequenceTableRecord>> {
        self.with_channel(ch, |channel| Ok(channel.table_in_use().to_vec()))
    }

    fn read_segment_catalogue(&mut self, ch: u8) -> Result<Vec<(u32, i64)>> {
        self.with_channel(ch, |channel| {
            Ok(channel
                .segments
                .iter()
                .map(|(&id, samples)| (id, samples.len() as i64))
                .collect())
        })
    }

    fn delete_segment(&mut self, ch: u8, segment_id: u32) -> Result<()> {
        let missing = self.err(ch, format!("no segment {}", segment_id));
        self.with_channel(ch, |channel| {
            channel.segments.remove(&segment_id).map(|_| ()).ok_or(missing)
        })
    }

    fn reset_sequence_table(&mut self, ch: u8, row_offset: u32, count: u32) -> Result<()> {
        let end = row_offset.checked_add(count).ok_or_else(|| {
            AwgError::index("sequence table rows", u32::MAX as usize, MAX_SEQUENCE_TABLE_ROWS)
        })?;
        let (start, end) = (row_offset as usize, end as usize);
        let outside = self.err(ch, format!("rows {}..{} are not in the table", start, end));
        self.with_channel(ch, |channel| {
            let rows = channel.table.get_mut(start..end).ok_or(outside)?;
            rows.fill(SequenceTableRecord::reset());
            Ok(())
        })
    }

    fn device_is_running(&mut self, ch: u8) -> Result<bool> {
        self.with_channel(ch, |channel| Ok(channel.armed))
    }

    fn select_sequence(&mut self, ch: u8, sequence_id: u32) -> Result<()> {
        let not_found = self.err(ch, format!("no sequence starts at row {}", sequence_id));
        self.with_channel(ch, |channel| {
            if !sequence_catalogue(channel.table_in_use())
                .iter()
                .any(|(start, _)| *start == sequence_id)
            {
                return Err(not_found);
            }
            channel.selected_sequence = Some(sequence_id);
            Ok(())
        })
    }

    fn set_output(&mut self, ch: u8, on: bool) -> Result<()> {
        self.with_channel(ch, |channel| {
            channel.output = on;
            Ok(())
        })
    }

    fn arm(&mut self, ch: u8) -> Result<()> {
        self.with_channel(ch, |channel| {
            channel.armed = true;
            Ok(())
        })
    }

    fn disarm(&mut self, ch: u8) -> Result<()> {
        self.with_channel(ch, |channel| {
            channel.armed = false;
            Ok(())
        })
    }

    fn send_trigger(&mut self) -> Result<()> {
        self.memory.lock().triggers += 1;
        Ok(())
    }

    fn clear_memories(&mut self) -> Result<()> {
        let mut memory = self.memory.lock();
        if let Some((&ch, _)) = memory.channels.iter().find(|(_, c)| c.armed) {
            return Err(AwgError::DeviceRunning(self.channel_id(ch)));
        }
        for channel in memory.channels.values_mut() {
            channel.segments.clear();
            channel.table.clear();
            channel.selected_sequence = None;
        }
        tracing::debug!("{}: memories cleared", self.name);
        Ok(())
    }

    fn restore_settings(&mut self) -> Result<()> {
        let mut memory = self.memory.lock();
        for channel in memory.channels.values_mut() {
            channel.output = false;
        }
        memory.settings_restored += 1;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn awg() -> SimulatedAwg {
        SimulatedAwg::new("sim", &[1, 2])
    }

    #[test]
    fn allocation_granularity() {
        let mut awg = awg();
        assert_eq!(awg.allocate_segment(1, 320).unwrap(), 1);
        assert_eq!(awg.allocate_segment(1, 384).unwrap(), 2);
        assert_eq!(awg.allocate_segment(2, 320).unwrap(), 1);
        for bad in [0, 256, 330, 400] {
            assert!(matches!(
                awg.allocate_segment(1, bad),
                Err(AwgError::AllocationFailure { .. })
            ));
        }
        awg.delete_segment(1, 1).unwrap();
        assert_eq!(awg.allocate_segment(1, 640).unwrap(), 1);
        assert_eq!(awg.read_segment_catalogue(1).unwrap(), vec![(1, 640), (2, 384)]);
        assert!(awg.delete_segment(1, 7).is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut awg = awg().with_capacity(1024);
        awg.allocate_segment(1, 640).unwrap();
        assert!(matches!(
            awg.allocate_segment(1, 448),
            Err(AwgError::AllocationFailure { .. })
        ));
        awg.allocate_segment(1, 384).unwrap();
    }

    #[test]
    fn payload_words() {
        let mut awg = awg();
        let id = awg.allocate_segment(1, 320).unwrap();
        awg.write_segment_payload(1, id, 4, &[0x10, 0x00, 0xf0, 0xff]).unwrap();
        let memory = awg.memory();
        let samples = memory.lock().channels[&1u8].segments[&id].clone();
        assert_eq!(&samples[..4], &[0, 0, 16, -16]);
        assert!(awg.write_segment_payload(1, id, 638, &[0; 4]).is_err());
        assert!(awg.write_segment_payload(1, id, 1, &[0; 2]).is_err());
        assert!(awg.write_segment_payload(1, 9, 0, &[0; 2]).is_err());
    }

    #[test]
    fn table_reads_stop_at_reset_rows() {
        let mut awg = awg();
        let first = control_word(true, true, true, AdvanceMode::Cond, AdvanceMode::Auto);
        let record = |segment_id| SequenceTableRecord {
            control: first,
            sequence_loop_count: 1,
            segment_loop_count: 1,
            segment_id,
            segment_start_offset: 0,
            segment_end_offset: SEGMENT_END_OFFSET_MAX,
        };
        awg.write_sequence_table(1, 0, &records_to_bytes(&[record(1), record(2), record(3)]))
            .unwrap();
        assert!(awg.write_sequence_table(1, 5, &records_to_bytes(&[record(4)])).is_err());
        awg.reset_sequence_table(1, 1, 2).unwrap();
        assert_eq!(awg.read_sequence_table(1).unwrap(), vec![record(1)]);
        // the freed rows are overwritten by the next write
        awg.write_sequence_table(1, 1, &records_to_bytes(&[record(5)])).unwrap();
        assert_eq!(awg.read_sequence_table(1).unwrap(), vec![record(1), record(5)]);
        assert!(awg.reset_sequence_table(1, 2, 5).is_err());
        assert!(matches!(
            awg.reset_sequence_table(1, u32::MAX, 2),
            Err(AwgError::InvalidIndex { .. })
        ));

        assert!(awg.select_sequence(1, 1).is_ok());
        assert!(awg.select_sequence(1, 2).is_err());
    }

    #[test]
    fn run_state() {
        let mut awg = awg();
        awg.allocate_segment(2, 320).unwrap();
        awg.arm(2).unwrap();
        assert!(awg.device_is_running(2).unwrap());
        assert!(!awg.device_is_running(1).unwrap());
        assert!(matches!(awg.clear_memories(), Err(AwgError::DeviceRunning(_))));
        awg.disarm(2).unwrap();
        awg.clear_memories().unwrap();
        assert!(awg.read_segment_catalogue(2).unwrap().is_empty());

        awg.set_output(1, true).unwrap();
        awg.restore_settings().unwrap();
        awg.send_trigger().unwrap();
        let memory = awg.memory();
        let memory = memory.lock();
        assert!(!memory.channels[&1u8].output);
        assert_eq!(memory.triggers, 1);
        assert_eq!(memory.settings_restored, 1);
        drop(memory);
        assert!(awg.arm(3).is_err());
    }
}
