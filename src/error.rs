//! Error types for the codec, framing and reactor layers.
//!
//! Configuration errors (`PoolError::EmptyPool`, `PoolError::InvalidPoolSize`,
//! `PoolError::InvalidSetting`) are fatal at startup. Everything else is
//! scoped to a single message or connection and is recovered by closing that
//! connection.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::runtime::ControllerState;

/// Failure of a single compress or decompress call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed encoded payload: {0}")]
    Decode(String),

    #[error("decoded length {actual} does not match expected uncompressed length {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("range {offset}+{length} exceeds source of {available} bytes")]
    InvalidRange {
        offset: usize,
        length: usize,
        available: usize,
    },
}

/// Failure to encode or decode one wire frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("payload of {0} bytes does not fit a 32-bit length field")]
    Oversize(usize),
}

/// Per-connection failure. Never propagates past the owning controller.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("connection is closed")]
    Closed,
}

impl From<CodecError> for ConnectionError {
    fn from(e: CodecError) -> Self {
        ConnectionError::Frame(FrameError::Codec(e))
    }
}

/// Errors raised while building the pool or handing a channel to it.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("controller pool is empty")]
    EmptyPool,

    #[error("invalid controller pool size {0}, must be positive")]
    InvalidPoolSize(usize),

    #[error("invalid controller setting {name} = {value}, must be positive")]
    InvalidSetting { name: &'static str, value: usize },

    #[error("controller {controller} is {state:?}")]
    InvalidState {
        controller: usize,
        state: ControllerState,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("invalid controller pool size {0}, must be positive")]
    InvalidPoolSize(usize),

    #[error(transparent)]
    Pool(#[from] PoolError),
}
