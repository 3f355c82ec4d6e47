//! # Micromed Core
//!
//! Platform-independent handling of Micromed EEG recordings and their
//! TCP streaming protocol.
//!
//! This crate contains pure parsing, encoding and buffering logic with no
//! async runtime and no sockets. Transport, pacing and logging live in
//! `micromed-stream`.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  micromed-core (no tokio, no sockets)                     │
//! │  ├── layout    (byte layout table shared by trc + codec)  │
//! │  ├── trc       (TRC reader / writer, lazy sample access)  │
//! │  ├── codec     (wire frames, partial-read accumulator)    │
//! │  ├── session   (frame ordering state machine)             │
//! │  └── epoch     (sliding-window epoch buffer)              │
//! └───────────────────────────────────────────────────────────┘
//!                             ▲
//!               ┌─────────────┴─────────────┐
//!               │  micromed-stream          │
//!               │  (emulator, receiver)     │
//!               └───────────────────────────┘
//! ```
//!
//! ## Example: reading a file and epoching it offline
//!
//! ```rust,no_run
//! use micromed_core::{EpochBuffer, EpochConfig, TrcReader};
//!
//! let mut reader = TrcReader::open("recording.TRC").unwrap();
//! let mut buffer = EpochBuffer::with_header(EpochConfig::default(), reader.header()).unwrap();
//! for marker in reader.markers().to_vec() {
//!     buffer.push_marker(marker).unwrap();
//! }
//! let samples = reader.read_all().unwrap();
//! for epoch in buffer.push_block(&samples).unwrap() {
//!     println!("epoch at {} with {} markers", epoch.start, epoch.markers.len());
//! }
//! ```
//!
//! ## Example: decoding frames from partial reads
//!
//! ```rust
//! use micromed_core::{Frame, FrameBuffer, Marker};
//!
//! let bytes = Frame::Marker(Marker { sample: 12, code: 3 }).encode().unwrap();
//! let mut buffer = FrameBuffer::new();
//! buffer.extend(&bytes[..4]);
//! assert!(buffer.decode().unwrap().is_empty());
//! buffer.extend(&bytes[4..]);
//! assert_eq!(buffer.decode().unwrap().len(), 1);
//! ```

pub mod codec;
pub mod epoch;
pub mod error;
pub mod layout;
pub mod session;
pub mod trc;
pub mod types;

pub use codec::{decode_frames, Frame, FrameBuffer, FrameKind};
pub use epoch::{BufferState, Epoch, EpochBuffer, EpochConfig};
pub use error::{BufferError, ConfigError, DecodeError, FormatError, ProtocolError};
pub use session::{SessionState, SessionValidator};
pub use trc::{parse_trc, Recording, TrcReader, TrcWriter};
pub use types::{
    AcquisitionUnit, AnalysisConverter, Annotation, ChannelDescriptor, Marker, MeasurementUnit,
    Note, RecordingHeader, SampleBlock, SampleUnits, SampleWidth,
};
