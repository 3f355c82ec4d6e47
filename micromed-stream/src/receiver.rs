//! Byte stream to frame sequence.
//!
//! [`StreamReceiver`] owns one transport. Reads of any size are appended to
//! a [`FrameBuffer`]; complete frames are checked by a [`SessionValidator`]
//! and handed out strictly in arrival order. Any decode or protocol error
//! ends the session: there is no attempt to resynchronise. Frames that were
//! complete before a corrupt one are still delivered, whatever the read
//! boundaries were.

use futures::stream::{self, Stream};
use log::{debug, info, trace};
use micromed_core::{DecodeError, Frame, FrameBuffer, SessionState, SessionValidator};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;

const READ_CHUNK: usize = 64 * 1024;

pub struct StreamReceiver<R> {
    reader: R,
    buffer: FrameBuffer,
    validator: SessionValidator,
    ready: VecDeque<Frame>,
    /// Raised once `ready` has drained
    corrupt: Option<DecodeError>,
    chunk: Vec<u8>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> StreamReceiver<R> {
    pub fn new(reader: R) -> Self {
        StreamReceiver {
            reader,
            buffer: FrameBuffer::new(),
            validator: SessionValidator::new(),
            ready: VecDeque::new(),
            corrupt: None,
            chunk: vec![0; READ_CHUNK],
            finished: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.validator.state()
    }

    /// Samples per channel delivered so far
    pub fn samples_received(&self) -> u64 {
        self.validator.samples_received()
    }

    /// Next frame, `Ok(None)` once the peer closed the session cleanly.
    /// After an error the receiver yields nothing further.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        let result = self.advance().await;
        if result.is_err() {
            self.finished = true;
            self.ready.clear();
            self.corrupt = None;
        }
        result
    }

    async fn advance(&mut self) -> Result<Option<Frame>, StreamError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                self.validator.accept(&frame)?;
                trace!("Received {} frame", frame.kind());
                return Ok(Some(frame));
            }
            if let Some(e) = self.corrupt.take() {
                return Err(e.into());
            }
            if self.finished {
                return Ok(None);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.finished = true;
                self.buffer.finish()?;
                self.validator.close()?;
                debug!(
                    "Session closed after {} bytes, {} samples",
                    self.buffer.consumed(),
                    self.validator.samples_received()
                );
                return Ok(None);
            }
            self.buffer.extend(&self.chunk[..n]);
            if let Err(e) = self.buffer.decode_into(&mut self.ready) {
                self.corrupt = Some(e);
                self.finished = true;
            }
        }
    }

    /// The session as a stream; it ends after the first error
    pub fn frames(self) -> impl Stream<Item = Result<Frame, StreamError>> {
        stream::unfold(self, |mut receiver| async move {
            match receiver.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), receiver)),
                Ok(None) => None,
                Err(e) => Some((Err(e), receiver)),
            }
        })
    }

    /// Push every frame into `tx` until the session ends or `token` is
    /// cancelled. A full channel pauses reading; nothing is dropped.
    /// Returns the number of frames forwarded.
    pub async fn forward(
        mut self,
        tx: mpsc::Sender<Frame>,
        token: CancellationToken,
    ) -> Result<u64, StreamError> {
        let mut forwarded = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                r = self.next_frame() => Some(r),
            };
            let Some(result) = next else {
                info!("Receiver cancelled after {} frames", forwarded);
                break;
            };
            let Some(frame) = result? else {
                break;
            };
            if tx.send(frame).await.is_err() {
                return Err(StreamError::ConsumerClosed);
            }
            forwarded += 1;
        }
        Ok(forwarded)
    }
}
