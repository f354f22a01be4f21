//! Device-layer error taxonomy.

use thiserror::Error;

use crate::driver::CmdState;

#[derive(Error, Debug)]
pub enum NpuError {
    /// The instruction stream could not be parsed. Carries the word offset
    /// at which decoding diverged.
    #[error("malformed instruction stream at word {offset}: {reason}")]
    MalformedStream { offset: usize, reason: String },

    /// More than the driver-imposed maximum of distinct binaries registered.
    #[error("hardware context limit reached ({limit} binaries)")]
    ContextLimitReached { limit: usize },

    /// The device returned a terminal state other than `Completed`.
    #[error("device launch failed: terminal state {0}")]
    DeviceLaunchFailure(CmdState),

    #[error("unsupported element size {0} bytes (DMA moves at most 4-byte elements)")]
    UnsupportedElementSize(usize),

    #[error("buffer size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("buffer is not device-backed")]
    NotDeviceBacked,

    /// Runlists and preemption are mutually exclusive on this runtime.
    #[error("runlists are not supported while preemption is enabled")]
    RunlistWithPreemption,

    #[error("ELF object is not a valid control-code package: {0}")]
    BadElf(String),

    #[error("launch argument {0} missing for address patch")]
    MissingArgument(u32),

    #[error("driver call {call} failed: {source}")]
    Driver {
        call: &'static str,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
