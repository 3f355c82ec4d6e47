use thiserror::Error;

use micromed_core::{BufferError, ConfigError, DecodeError, FormatError, ProtocolError};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Format(#[from] FormatError),
    #[error("Corrupt stream: {0}")]
    Decode(#[from] DecodeError),
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Buffer(#[from] BufferError),
    #[error("Cannot parse configuration file '{path}': {reason}")]
    ConfigFile { path: String, reason: String },
    #[error("Playback speed {0} cannot pace this recording")]
    InvalidSpeed(f64),
    #[error("Epoch consumer went away")]
    ConsumerClosed,
}
