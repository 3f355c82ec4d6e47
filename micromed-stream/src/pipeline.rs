//! Frames to epochs.
//!
//! [`EpochAssembler`] drives an [`EpochBuffer`] from a received frame
//! sequence. Markers and notes arrive *after* the data frame holding their
//! sample, so the assembler keeps the newest data block back until the next
//! one (or the end of the session) before handing it to the buffer. That way
//! a window ending inside the newest block still sees its trailing events.
//!
//! ```text
//!  Data[0..66) ─┐ held
//!  Marker(60)   │ ──▶ buffer.push_marker
//!  Data[66..)   └──▶ buffer.push_block(Data[0..66)) ──▶ epochs
//! ```

use async_trait::async_trait;
use log::{debug, info, warn};
use micromed_core::{
    BufferError, BufferState, ConfigError, Epoch, EpochBuffer, EpochConfig, Frame, Recording,
    RecordingHeader, SampleBlock,
};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::receiver::StreamReceiver;

/// Receives finished epochs
#[async_trait]
pub trait EpochSink: Send {
    async fn push(&mut self, epoch: Epoch) -> Result<(), StreamError>;
}

/// Forwards epochs into a bounded channel, waiting for room
pub struct ChannelSink {
    tx: mpsc::Sender<Epoch>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Epoch>) -> Self {
        ChannelSink { tx }
    }
}

#[async_trait]
impl EpochSink for ChannelSink {
    async fn push(&mut self, epoch: Epoch) -> Result<(), StreamError> {
        self.tx.send(epoch).await.map_err(|_| StreamError::ConsumerClosed)
    }
}

#[async_trait]
impl EpochSink for Vec<Epoch> {
    async fn push(&mut self, epoch: Epoch) -> Result<(), StreamError> {
        Vec::push(self, epoch);
        Ok(())
    }
}

/// Logs one line per epoch
#[derive(Debug, Default)]
pub struct LogSink {
    pub count: usize,
}

#[async_trait]
impl EpochSink for LogSink {
    async fn push(&mut self, epoch: Epoch) -> Result<(), StreamError> {
        self.count += 1;
        info!(
            "Epoch {} at sample {}: {} channels x {} samples, {} markers, {} notes",
            self.count,
            epoch.start,
            epoch.channels.len(),
            epoch.len(),
            epoch.markers.len(),
            epoch.notes.len()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub frames: u64,
    pub epochs: usize,
    /// Samples at the end of the session too short for a full epoch
    pub discarded_tail: usize,
}

pub struct EpochAssembler {
    buffer: EpochBuffer,
    header: Option<RecordingHeader>,
    held: Option<SampleBlock>,
    mkr_warned: bool,
}

impl EpochAssembler {
    pub fn new(config: EpochConfig) -> Result<Self, ConfigError> {
        Ok(EpochAssembler {
            buffer: EpochBuffer::new(config)?,
            header: None,
            held: None,
            mkr_warned: false,
        })
    }

    pub fn header(&self) -> Option<&RecordingHeader> {
        self.header.as_ref()
    }

    pub fn state(&self) -> BufferState {
        self.buffer.state()
    }

    /// Feed one frame; returns the epochs it completed, oldest first
    pub fn handle(&mut self, frame: Frame) -> Result<Vec<Epoch>, BufferError> {
        match frame {
            Frame::Header(header) => {
                self.buffer.configure(&header)?;
                info!(
                    "Session: {} channels at {} Hz, epochs of {} samples every {} samples",
                    header.channel_count(),
                    header.sampling_rate,
                    self.buffer.epoch_length().unwrap_or_default(),
                    self.buffer.step_length().unwrap_or_default()
                );
                self.header = Some(header);
                Ok(Vec::new())
            }
            Frame::Data(block) => {
                let Some(header) = &self.header else {
                    return Err(BufferError::NotConfigured);
                };
                if block.channel_count() != header.channel_count() {
                    return Err(BufferError::ChannelMismatch {
                        sample: block.start(),
                        expected: header.channel_count(),
                        actual: block.channel_count(),
                    });
                }
                if !self.mkr_warned && !header.check_mkr(&block) {
                    warn!(
                        "MKR channel out of range at sample {}, check the trigger input",
                        block.start()
                    );
                    self.mkr_warned = true;
                }
                match self.held.replace(block) {
                    Some(previous) => self.buffer.push_block(&previous),
                    None => Ok(Vec::new()),
                }
            }
            Frame::Marker(marker) => {
                debug!("Marker {} at sample {}", marker.code, marker.sample);
                self.buffer.push_marker(marker).map(|_| Vec::new())
            }
            Frame::Note(note) => {
                debug!("Note '{}' at sample {}", note.text, note.sample);
                self.buffer.push_note(note).map(|_| Vec::new())
            }
        }
    }

    /// End of session: flush the held block. Returns the remaining epochs and
    /// the length of the discarded partial tail.
    pub fn finish(mut self) -> Result<(Vec<Epoch>, usize), BufferError> {
        let epochs = match self.held.take() {
            Some(block) => self.buffer.push_block(&block)?,
            None => Vec::new(),
        };
        let tail = self.buffer.close();
        if tail > 0 {
            debug!("Discarding {} samples shorter than an epoch", tail);
        }
        Ok((epochs, tail))
    }
}

/// Epoch every frame from `rx` until the channel closes
pub async fn epoch_frames<S>(
    mut rx: mpsc::Receiver<Frame>,
    config: EpochConfig,
    sink: &mut S,
) -> Result<PipelineReport, StreamError>
where
    S: EpochSink + ?Sized,
{
    let mut assembler = EpochAssembler::new(config)?;
    let mut report = PipelineReport::default();
    while let Some(frame) = rx.recv().await {
        report.frames += 1;
        for epoch in assembler.handle(frame)? {
            sink.push(epoch).await?;
            report.epochs += 1;
        }
    }
    let (epochs, tail) = assembler.finish()?;
    for epoch in epochs {
        sink.push(epoch).await?;
        report.epochs += 1;
    }
    report.discarded_tail = tail;
    Ok(report)
}

/// Receive one session from `reader` and epoch it into `sink`.
///
/// The receiver and the epoching run concurrently over a channel of
/// `capacity` frames. The error reported is the one that ended the session:
/// when the epoching fails first, the receiver is stopped and its
/// closed-channel error is not reported.
pub async fn epoch_session<R, S>(
    reader: R,
    config: EpochConfig,
    capacity: usize,
    sink: &mut S,
    token: CancellationToken,
) -> Result<PipelineReport, StreamError>
where
    R: AsyncRead + Unpin,
    S: EpochSink + ?Sized,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stop = token.child_token();
    let receiving = StreamReceiver::new(reader).forward(tx, stop.clone());
    let epoching = async move {
        let result = epoch_frames(rx, config, sink).await;
        if result.is_err() {
            stop.cancel();
        }
        result
    };

    match tokio::join!(receiving, epoching) {
        (Err(StreamError::ConsumerClosed), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
        (Ok(_), epoched) => epoched,
    }
}

/// Epoch a whole recording without streaming it
pub fn epoch_recording(recording: &Recording, config: EpochConfig) -> Result<Vec<Epoch>, BufferError> {
    let mut buffer = EpochBuffer::with_header(config, &recording.header)?;
    for marker in &recording.markers {
        buffer.push_marker(*marker)?;
    }
    for note in &recording.notes {
        buffer.push_note(note.clone())?;
    }
    let epochs = buffer.push_block(&recording.samples)?;
    buffer.close();
    Ok(epochs)
}
