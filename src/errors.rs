use std::io;
use thiserror::Error;

use crate::connection::ConnectionState;

/// Top-level error for the acquisition core.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("firmware update failed: {0}")]
    Oad(#[from] OadFailure),
}

/// Frame layout violations. The offending frame is dropped, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("sample region of {len} bytes is not a multiple of the {stride}-byte stride")]
    Misaligned { len: usize, stride: usize },
    #[error("frame carries {slots} sample slots, at most {max} are addressable")]
    TooManySlots { slots: usize, max: usize },
    #[error("command payload of {len} bytes does not fit the u16 length field")]
    PayloadTooLarge { len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("decoded block has {channels} channels of lengths {lengths:?} for {slots} slots, expected {expected} channels")]
    BlockShape {
        channels: usize,
        expected: usize,
        lengths: Vec<usize>,
        slots: usize,
    },
    #[error("decode worker is gone")]
    WorkerClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Terminal failure reasons of a firmware update session.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum OadFailure {
    #[error("device rejected the update request")]
    ValidationRejected,
    #[error("device reported a CRC mismatch after transfer")]
    CrcMismatch,
    #[error("device did not come back after reboot")]
    ReconnectTimeout,
    #[error("packet {index} was not acknowledged after {attempts} attempts")]
    TransferTimeout { index: u16, attempts: u32 },
    #[error("link lost outside of the reboot window")]
    UnexpectedDisconnect,
    #[error("device runs firmware {found}, expected {expected}")]
    VersionMismatch { expected: String, found: String },
    #[error("update cancelled")]
    Cancelled,
    #[error("firmware image is empty")]
    EmptyImage,
    #[error("firmware image needs {packets} packets, at most {max} are addressable")]
    ImageTooLarge { packets: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, SdkError>;
