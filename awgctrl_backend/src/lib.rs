//! Instrument-side management of compiled AWG programs.
//!
//! [`ProgramRegistry`] keeps programs built with `awgcompiler_backend` resident in waveform and
//! sequencer memory and plays them; [`SimulatedAwg`] is an in-memory instrument for running all
//! of this without hardware.

pub mod device;
pub mod registry;

pub use crate::device::SimulatedAwg;
pub use crate::registry::ProgramRegistry;
