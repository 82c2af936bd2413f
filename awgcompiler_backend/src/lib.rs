//! Compiler for Keysight M8190A-style arbitrary waveform generator programs.
//!
//! Programs are built as [`multi_ch_seq::MultiChSeq`]s: one [`sequence::Sequence`] per channel,
//! made of [`segment::SequenceStep`] segments holding [`wave_step::WaveStep`]s. The crate turns
//! them into 16-bit sample payloads (see [`wave_step`]) and 24-byte sequencer table records
//! (see [`seq_table`]), keeps the average RF power of every channel within its budget (see
//! [`power`]) and synchronizes several instruments through trigger segments.
//!
//! Instruments are reached through the [`transport::AwgTransport`] trait only.

pub mod config;
pub mod error;
pub mod multi_ch_seq;
pub mod power;
pub mod robust;
pub mod segment;
pub mod seq_table;
pub mod sequence;
pub mod transport;
pub mod utils;
pub mod wave_step;

#[cfg(feature = "python")]
mod py_bindings;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{AwgError, Result};
    pub use crate::multi_ch_seq::*;
    pub use crate::power::*;
    pub use crate::robust::*;
    pub use crate::segment::*;
    pub use crate::seq_table::*;
    pub use crate::sequence::*;
    pub use crate::transport::*;
    pub use crate::utils::*;
    pub use crate::wave_step::*;
}
