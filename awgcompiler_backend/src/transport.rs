//! The boundary between compiled programs and instruments.
//!
//! The compiler never talks to hardware directly. Everything a program needs from an AWG, from
//! allocating waveform memory to arming outputs, goes through the [`AwgTransport`] trait. An
//! implementation wraps one instrument (all of its channels) and is addressed by the instrument
//! name used in [`crate::config::AwgConfig::channels`].
//!
//! ## Channel addressing
//! Channel numbers are the 1-based numbers of the front panel, as in the configuration.
//!
//! ## Sequence table
//! Tables are read and written as raw [`SequenceTableRecord`]s, see [`crate::seq_table`]. The row
//! offset of a write is the sequence id of its first row.
//!
//! ## Error handling
//! Implementations report failures as [`crate::error::AwgError`]; allocation failures are
//! expected to use [`crate::error::AwgError::AllocationFailure`] so that callers can tell a full
//! waveform memory from a broken connection.

use indexmap::IndexMap;

use crate::error::Result;
use crate::seq_table::SequenceTableRecord;

/// Operations a program performs on one instrument.
pub trait AwgTransport: Send {
    /// Instrument name, as used in the configuration.
    fn name(&self) -> &str;

    /// Reserves a segment of `length_smpl` samples on `ch` and returns its id.
    fn allocate_segment(&mut self, ch: u8, length_smpl: i64) -> Result<u32>;
    /// Writes little-endian sample words into segment `segment_id` at `byte_offset`.
    fn write_segment_payload(
        &mut self,
        ch: u8,
        segment_id: u32,
        byte_offset: usize,
        bytes: &[u8],
    ) -> Result<()>;
    /// Writes encoded records starting at table row `row_offset`.
    fn write_sequence_table(&mut self, ch: u8, row_offset: u32, records: &[u8]) -> Result<()>;
    /// The rows currently in use, from row 0 up to the last written row.
    fn read_sequence_table(&mut self, ch: u8) -> Result<Vec<SequenceTableRecord>>;
    /// `(segment_id, length_smpl)` of every allocated segment.
    fn read_segment_catalogue(&mut self, ch: u8) -> Result<Vec<(u32, i64)>>;
    fn delete_segment(&mut self, ch: u8, segment_id: u32) -> Result<()>;
    /// Overwrites `count` rows from `row_offset` with [`SequenceTableRecord::reset`].
    fn reset_sequence_table(&mut self, ch: u8, row_offset: u32, count: u32) -> Result<()>;

    fn device_is_running(&mut self, ch: u8) -> Result<bool>;
    /// Selects the sequence played on the next start.
    fn select_sequence(&mut self, ch: u8, sequence_id: u32) -> Result<()>;
    fn set_output(&mut self, ch: u8, on: bool) -> Result<()>;
    fn arm(&mut self, ch: u8) -> Result<()>;
    fn disarm(&mut self, ch: u8) -> Result<()>;
    fn send_trigger(&mut self) -> Result<()>;
    /// Drops every segment and table row on all channels.
    fn clear_memories(&mut self) -> Result<()>;
    /// Loads the instrument settings saved for this setup (amplitudes, delays, clock source).
    fn restore_settings(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Connected instruments by name.
pub type AwgHandles = IndexMap<String, Box<dyn AwgTransport>>;
