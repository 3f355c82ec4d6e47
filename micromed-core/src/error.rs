//! Error types for file parsing, wire decoding and epoch buffering

use thiserror::Error;

use crate::codec::FrameKind;

/// Errors that can occur when parsing a TRC recording
#[derive(Error, Debug)]
pub enum FormatError {
    /// A required header field could not be decoded or holds an implausible value
    #[error("Corrupt header at offset {offset}: {reason}")]
    CorruptHeader { offset: usize, reason: String },

    /// The file is shorter than a region it declares
    #[error("Truncated file: {region} needs {needed} bytes, file has {actual}")]
    TruncatedFile {
        region: &'static str,
        needed: u64,
        actual: u64,
    },

    /// A requested sample range lies outside the recording
    #[error("Sample range {start}..{end} outside recording of {available} samples")]
    OutOfRange { start: u64, end: u64, available: u64 },

    /// A value cannot be represented in the on-disk layout
    #[error("Cannot encode {field}: {reason}")]
    Unencodable { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FormatError {
    pub(crate) fn corrupt(offset: usize, reason: impl Into<String>) -> Self {
        FormatError::CorruptHeader {
            offset,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur when decoding wire frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Frame kind tag is not recognized
    #[error("Unknown frame kind {tag:#04X} at byte {offset}")]
    UnknownKind { tag: u8, offset: usize },

    /// Declared payload length is larger than any valid frame
    #[error("{kind} frame at byte {offset} declares {length} bytes, limit is {limit}")]
    Oversized {
        kind: FrameKind,
        offset: usize,
        length: usize,
        limit: usize,
    },

    /// Payload content does not agree with its declared length
    #[error("{kind} frame at byte {offset}: payload of {length} bytes is inconsistent: {reason}")]
    LengthMismatch {
        kind: FrameKind,
        offset: usize,
        length: usize,
        reason: String,
    },

    /// Payload could not be interpreted
    #[error("{kind} frame at byte {offset}: {reason}")]
    InvalidPayload {
        kind: FrameKind,
        offset: usize,
        reason: String,
    },

    /// The transport closed in the middle of a frame
    #[error("Stream closed inside a frame: {available} of {expected} bytes received")]
    Truncated { expected: usize, available: usize },
}

/// Violations of the session frame ordering
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Connection closed before a header frame was received")]
    ClosedBeforeHeader,

    #[error("Session must start with a header frame, got {kind}")]
    MissingHeader { kind: FrameKind },

    #[error("Second header frame received after {samples} samples")]
    DuplicateHeader { samples: u64 },

    #[error("Data frame at sample {sample} has {actual} channels, header declares {expected}")]
    ChannelMismatch {
        sample: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Data frame at sample {sample} uses {actual}-byte samples, header declares {expected}")]
    WidthMismatch {
        sample: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Data frame starts at sample {actual}, expected {expected}")]
    Discontinuity { expected: u64, actual: u64 },

    #[error("{kind} frame refers to sample {sample}, only {received} samples received")]
    ForwardReference {
        kind: FrameKind,
        sample: u64,
        received: u64,
    },

    #[error("{kind} frame refers to sample {sample}, the session starts at sample {first}")]
    BeforeSession { kind: FrameKind, sample: u64, first: u64 },
}

/// Invalid epoching parameters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Epoch duration {epoch}s must be longer than overlap {overlap}s")]
    NonPositiveStep { epoch: f64, overlap: f64 },

    #[error("Overlap {0}s must not be negative")]
    NegativeOverlap(f64),

    #[error("Epoch parameters must be finite (epoch {epoch}, overlap {overlap})")]
    NotFinite { epoch: f64, overlap: f64 },

    #[error("Epoch of {duration}s at {sampling_rate} Hz is shorter than one sample")]
    EmptyEpoch { duration: f64, sampling_rate: f64 },

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Channel selection is empty")]
    NoChannels,

    #[error("Channel '{0}' is not in an electrical unit, cannot convert to volts")]
    NotElectrical(String),
}

/// Errors reported while feeding an epoch buffer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BufferError {
    #[error("Buffer has not been configured with a header")]
    NotConfigured,

    #[error("Buffer is already configured")]
    AlreadyConfigured,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Block at sample {sample} has {actual} channels, expected {expected}")]
    ChannelMismatch {
        sample: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Block starts at sample {actual}, expected {expected}")]
    Discontinuity { expected: u64, actual: u64 },

    #[error("Event at sample {sample} precedes the open window starting at {window_start}")]
    StaleEvent { sample: u64, window_start: u64 },
}
