//! Session state machine for a received frame sequence.
//!
//! Pure bookkeeping, no I/O: the receiver feeds every decoded frame through
//! [`SessionValidator::accept`] and fails the session on the first error.
//!
//! ```text
//!  AwaitingHeader ──Header──▶ Streaming ──Data/Marker/Note──▶ Streaming
//!        │                        │
//!     close()                  close()
//!        ▼                        ▼
//!  ClosedBeforeHeader            Ok
//! ```

use serde::Serialize;
use strum::Display;

use crate::codec::{Frame, FrameKind};
use crate::error::ProtocolError;
use crate::types::{RecordingHeader, SampleWidth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize)]
pub enum SessionState {
    #[default]
    AwaitingHeader,
    Streaming,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    channels: usize,
    width: SampleWidth,
}

#[derive(Debug, Default)]
pub struct SessionValidator {
    layout: Option<Layout>,
    first_sample: Option<u64>,
    /// Index one past the last received sample
    next_sample: u64,
}

impl SessionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        match self.layout {
            None => SessionState::AwaitingHeader,
            Some(_) => SessionState::Streaming,
        }
    }

    /// Samples per channel received so far
    pub fn samples_received(&self) -> u64 {
        self.first_sample.map_or(0, |first| self.next_sample - first)
    }

    /// Index the next data frame must start at, once data has been seen
    pub fn next_sample(&self) -> Option<u64> {
        self.first_sample.map(|_| self.next_sample)
    }

    pub fn accept(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let Some(layout) = self.layout else {
            return match frame {
                Frame::Header(header) => {
                    self.start(header);
                    Ok(())
                }
                other => Err(ProtocolError::MissingHeader { kind: other.kind() }),
            };
        };

        match frame {
            Frame::Header(_) => Err(ProtocolError::DuplicateHeader {
                samples: self.samples_received(),
            }),
            Frame::Data(block) => {
                if block.channel_count() != layout.channels {
                    return Err(ProtocolError::ChannelMismatch {
                        sample: block.start(),
                        expected: layout.channels,
                        actual: block.channel_count(),
                    });
                }
                if block.width() != layout.width {
                    return Err(ProtocolError::WidthMismatch {
                        sample: block.start(),
                        expected: layout.width.bytes(),
                        actual: block.width().bytes(),
                    });
                }
                match self.first_sample {
                    None => self.first_sample = Some(block.start()),
                    Some(_) if block.start() != self.next_sample => {
                        return Err(ProtocolError::Discontinuity {
                            expected: self.next_sample,
                            actual: block.start(),
                        })
                    }
                    Some(_) => {}
                }
                self.next_sample = block.end();
                Ok(())
            }
            Frame::Marker(m) => self.check_reference(FrameKind::Marker, m.sample),
            Frame::Note(n) => self.check_reference(FrameKind::Note, n.sample),
        }
    }

    /// Called when the transport closes cleanly
    pub fn close(&self) -> Result<(), ProtocolError> {
        match self.state() {
            SessionState::AwaitingHeader => Err(ProtocolError::ClosedBeforeHeader),
            SessionState::Streaming => Ok(()),
        }
    }

    fn start(&mut self, header: &RecordingHeader) {
        self.layout = Some(Layout {
            channels: header.channel_count(),
            width: header.sample_width,
        });
    }

    fn check_reference(&self, kind: FrameKind, sample: u64) -> Result<(), ProtocolError> {
        match self.first_sample {
            Some(first) if sample < first => Err(ProtocolError::BeforeSession { kind, sample, first }),
            Some(_) if sample < self.next_sample => Ok(()),
            _ => Err(ProtocolError::ForwardReference {
                kind,
                sample,
                received: self.samples_received(),
            }),
        }
    }
}
