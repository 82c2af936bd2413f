//! Error type shared by every stage of the compiler.
//!
//! Validation errors ([`AwgError::InvalidDuration`], [`AwgError::AmplitudeOverflow`],
//! [`AwgError::DurationMismatch`], ...) are raised at the point of assignment, so a malformed
//! program can never be built. Compile errors ([`AwgError::PowerBudgetExceeded`],
//! [`AwgError::EncodingError`]) leave the program in the state it had before the call.
//! Device errors are wrapped in [`AwgError::DeviceWrite`] together with the channel and the
//! offending segment.

use crate::config::ChannelId;

#[derive(thiserror::Error, Debug)]
pub enum AwgError {
    #[error("duration {length_mus} mus is not a multiple of 1 / {sample_frequency} mus")]
    InvalidDuration {
        length_mus: f64,
        sample_frequency: f64,
    },

    #[error("{name} = {value} is outside of [{min}, {max}]")]
    ValueOutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("wave step '{name}' has amplitudes summing to {sum} for frequencies {frequencies:?}")]
    AmplitudeOverflow {
        name: String,
        sum: f64,
        frequencies: Vec<f64>,
    },

    #[error("robust pulse amplitudes are not realizable: {0}")]
    PowerOverflow(String),

    #[error(
        "rf power on {channel} is {avg_power} W (allowed: {max_avg_power} W) \
         with {additional_wait_mus} mus of wait added to '{program}'"
    )]
    PowerBudgetExceeded {
        program: String,
        channel: ChannelId,
        avg_power: f64,
        max_avg_power: f64,
        additional_wait_mus: f64,
    },

    #[error("steps on different channels must have the same length, got {lengths_mus:?} mus")]
    DurationMismatch { lengths_mus: Vec<f64> },

    #[error("sequence table encoding failed: {0}")]
    EncodingError(String),

    #[error("program '{name}' is {status} and can not be changed anymore")]
    SequenceFrozen { name: String, status: String },

    #[error("program '{name}' can not move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("stale handle on {channel}: {reason}")]
    StaleHandle { channel: ChannelId, reason: String },

    #[error("segment allocation of {length_smpl} samples failed on {channel}: {reason}")]
    AllocationFailure {
        channel: ChannelId,
        length_smpl: i64,
        reason: String,
    },

    #[error("{0} is running")]
    DeviceRunning(ChannelId),

    #[error(
        "{channel} could not write '{program}' (segment {step_index} '{step_name}'): {source}"
    )]
    DeviceWrite {
        program: String,
        channel: ChannelId,
        step_index: usize,
        step_name: String,
        #[source]
        source: Box<AwgError>,
    },

    #[error("writing program '{program}' was aborted after {written} channel(s)")]
    Aborted { program: String, written: usize },

    #[error("program '{0}' has already been written to device memory")]
    AlreadyWritten(String),

    #[error("no program '{0}'")]
    UnknownProgram(String),

    #[error("awg '{0}' is not connected")]
    NotConnected(String),

    #[error("invalid table: {0}")]
    InvalidTable(String),

    #[error("index {index} out of range for {what} of length {len}")]
    InvalidIndex {
        what: String,
        index: usize,
        len: usize,
    },

    #[error("there is no segment to append to on {0}; start a new segment first")]
    NoOpenSegment(ChannelId),

    #[error("unknown channel {0}")]
    UnknownChannel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AwgError {
    pub fn config(msg: impl Into<String>) -> Self {
        AwgError::Config(msg.into())
    }

    pub fn table(msg: impl Into<String>) -> Self {
        AwgError::InvalidTable(msg.into())
    }

    pub fn index(what: impl Into<String>, index: usize, len: usize) -> Self {
        AwgError::InvalidIndex {
            what: what.into(),
            index,
            len,
        }
    }
}

pub type Result<T, E = AwgError> = std::result::Result<T, E>;
