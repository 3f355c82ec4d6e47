//! Wire frame codec.
//!
//! Every frame is a 5-byte header (kind tag, big-endian payload length)
//! followed by the payload:
//!
//! | kind | payload |
//! |------|---------|
//! | 0 Header | TRC header region, as written by [`TrcWriter`] |
//! | 1 Data | start sample u64, channels u16, width u8, interleaved LE samples |
//! | 2 Note | sample u64, text length u16, UTF-8 text |
//! | 3 Marker | sample u64, code u16 |
//!
//! Decoding works on an append-only accumulator: complete frames are
//! returned with the number of bytes they used, a partial frame is left in
//! place until more bytes arrive.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::Serialize;
use strum::Display;

use crate::error::{DecodeError, FormatError};
use crate::layout::{data_frame, frame, marker_frame, note_frame};
use crate::trc::{parse_header_region, TrcWriter};
use crate::types::{Marker, Note, RecordingHeader, SampleBlock, SampleWidth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Display, Serialize)]
#[repr(u8)]
pub enum FrameKind {
    Header = 0,
    Data = 1,
    Note = 2,
    Marker = 3,
}

/// One decoded wire frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header(RecordingHeader),
    Data(SampleBlock),
    Marker(Marker),
    Note(Note),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Header(_) => FrameKind::Header,
            Frame::Data(_) => FrameKind::Data,
            Frame::Marker(_) => FrameKind::Marker,
            Frame::Note(_) => FrameKind::Note,
        }
    }

    /// Append the encoded frame to `out`. On error `out` is left unchanged.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FormatError> {
        let payload = self.payload()?;
        if payload.len() > frame::MAX_PAYLOAD {
            return Err(FormatError::Unencodable {
                field: "payload",
                reason: format!("{} payload of {} bytes", self.kind(), payload.len()),
            });
        }
        let start = out.len();
        out.resize(start + frame::HEADER_SIZE, 0);
        frame::KIND.put(out, start, &[self.kind() as u8]);
        frame::LENGTH.put_u32(out, start, payload.len() as u32);
        out.extend_from_slice(&payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    fn payload(&self) -> Result<Vec<u8>, FormatError> {
        match self {
            Frame::Header(header) => TrcWriter::new(header).header_region(),
            Frame::Data(block) => {
                let channels = u16::try_from(block.channel_count()).map_err(|_| {
                    FormatError::Unencodable {
                        field: "channel count",
                        reason: block.channel_count().to_string(),
                    }
                })?;
                let mut payload = vec![0u8; data_frame::PREFIX];
                data_frame::START.put_u64(&mut payload, 0, block.start());
                data_frame::CHANNELS.put_u16(&mut payload, 0, channels);
                data_frame::WIDTH.put(&mut payload, 0, &[block.width().bytes() as u8]);
                block.write_interleaved(&mut payload);
                Ok(payload)
            }
            Frame::Marker(marker) => {
                let mut payload = vec![0u8; marker_frame::SIZE];
                marker_frame::SAMPLE.put_u64(&mut payload, 0, marker.sample);
                marker_frame::CODE.put_u16(&mut payload, 0, marker.code);
                Ok(payload)
            }
            Frame::Note(note) => {
                let text = note.text.as_bytes();
                let len = u16::try_from(text.len()).map_err(|_| FormatError::Unencodable {
                    field: "note text",
                    reason: format!("{} bytes", text.len()),
                })?;
                let mut payload = vec![0u8; note_frame::PREFIX];
                note_frame::SAMPLE.put_u64(&mut payload, 0, note.sample);
                note_frame::TEXT_LENGTH.put_u16(&mut payload, 0, len);
                payload.extend_from_slice(text);
                Ok(payload)
            }
        }
    }
}

/// Decode every complete frame at the front of `buf`.
///
/// Returns the frames and the number of bytes they occupied. Trailing bytes
/// of an incomplete frame are not consumed. A corrupt frame fails the whole
/// call; [`FrameBuffer::decode_into`] keeps the frames that precede it.
pub fn decode_frames(buf: &[u8]) -> Result<(Vec<Frame>, usize), DecodeError> {
    let mut frames = Vec::new();
    let (consumed, result) = decode_frames_at(buf, 0, &mut frames);
    result?;
    Ok((frames, consumed))
}

/// Push complete frames into `out` until the data runs out or a frame is
/// corrupt. Returns the bytes used by the pushed frames and the error, if any.
fn decode_frames_at<E>(buf: &[u8], stream_offset: usize, out: &mut E) -> (usize, Result<(), DecodeError>)
where
    E: Extend<Frame>,
{
    let mut consumed = 0;
    loop {
        match decode_one(&buf[consumed..], stream_offset + consumed) {
            Ok(Some((frame, used))) => {
                out.extend(Some(frame));
                consumed += used;
            }
            Ok(None) => return (consumed, Ok(())),
            Err(e) => return (consumed, Err(e)),
        }
    }
}

fn decode_one(buf: &[u8], offset: usize) -> Result<Option<(Frame, usize)>, DecodeError> {
    let Some(tag) = frame::KIND.u8(buf, 0) else {
        return Ok(None);
    };
    let kind = FrameKind::from_u8(tag).ok_or(DecodeError::UnknownKind { tag, offset })?;
    let Some(length) = frame::LENGTH.u32(buf, 0) else {
        return Ok(None);
    };
    let length = length as usize;
    if length > frame::MAX_PAYLOAD {
        return Err(DecodeError::Oversized {
            kind,
            offset,
            length,
            limit: frame::MAX_PAYLOAD,
        });
    }
    let total = frame::HEADER_SIZE + length;
    let Some(payload) = buf.get(frame::HEADER_SIZE..total) else {
        return Ok(None);
    };
    let frame = decode_payload(kind, payload, offset)?;
    Ok(Some((frame, total)))
}

fn decode_payload(kind: FrameKind, payload: &[u8], offset: usize) -> Result<Frame, DecodeError> {
    let mismatch = |reason: String| DecodeError::LengthMismatch {
        kind,
        offset,
        length: payload.len(),
        reason,
    };
    let invalid = |reason: String| DecodeError::InvalidPayload {
        kind,
        offset,
        reason,
    };

    match kind {
        FrameKind::Header => parse_header_region(payload)
            .map(|region| Frame::Header(region.header))
            .map_err(|e| invalid(e.to_string())),
        FrameKind::Data => {
            if payload.len() < data_frame::PREFIX {
                return Err(mismatch(format!("shorter than the {}-byte prefix", data_frame::PREFIX)));
            }
            let start = data_frame::START.u64(payload, 0).unwrap_or_default();
            let channels = data_frame::CHANNELS.u16(payload, 0).unwrap_or_default() as usize;
            let width_bytes = data_frame::WIDTH.u8(payload, 0).unwrap_or_default();
            let width = SampleWidth::from_bytes(width_bytes as usize)
                .ok_or_else(|| invalid(format!("sample width {width_bytes} at sample {start}")))?;
            if channels == 0 {
                return Err(invalid(format!("zero channels at sample {start}")));
            }
            let samples = &payload[data_frame::PREFIX..];
            SampleBlock::from_interleaved(start, channels, width, samples)
                .map(Frame::Data)
                .ok_or_else(|| {
                    mismatch(format!(
                        "{} sample bytes at sample {start} is not a multiple of {channels} x {width_bytes}",
                        samples.len()
                    ))
                })
        }
        FrameKind::Marker => {
            if payload.len() != marker_frame::SIZE {
                return Err(mismatch(format!("marker payload must be {} bytes", marker_frame::SIZE)));
            }
            Ok(Frame::Marker(Marker {
                sample: marker_frame::SAMPLE.u64(payload, 0).unwrap_or_default(),
                code: marker_frame::CODE.u16(payload, 0).unwrap_or_default(),
            }))
        }
        FrameKind::Note => {
            if payload.len() < note_frame::PREFIX {
                return Err(mismatch(format!("shorter than the {}-byte prefix", note_frame::PREFIX)));
            }
            let sample = note_frame::SAMPLE.u64(payload, 0).unwrap_or_default();
            let text_len = note_frame::TEXT_LENGTH.u16(payload, 0).unwrap_or_default() as usize;
            let text = &payload[note_frame::PREFIX..];
            if text.len() != text_len {
                return Err(mismatch(format!(
                    "note at sample {sample} declares {text_len} text bytes, carries {}",
                    text.len()
                )));
            }
            let text = std::str::from_utf8(text)
                .map_err(|e| invalid(format!("note at sample {sample}: {e}")))?;
            Ok(Frame::Note(Note {
                sample,
                text: text.to_string(),
            }))
        }
    }
}

/// Append-only accumulator for bytes read from a transport
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`, for error context
    offset: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode and remove all complete frames
    pub fn decode(&mut self) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        self.decode_into(&mut frames)?;
        Ok(frames)
    }

    /// Decode and remove complete frames into `out`, in stream order. Frames
    /// in front of a corrupt one are delivered before the error is returned;
    /// the corrupt bytes stay in the buffer.
    pub fn decode_into<E: Extend<Frame>>(&mut self, out: &mut E) -> Result<(), DecodeError> {
        let (used, result) = decode_frames_at(&self.buf, self.offset, out);
        self.buf.drain(..used);
        self.offset += used;
        result
    }

    /// Bytes of an incomplete frame still waiting for the rest
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes decoded so far
    pub fn consumed(&self) -> usize {
        self.offset
    }

    /// Called when the transport closes: fails if a frame was cut short
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let expected = frame::LENGTH
            .u32(&self.buf, 0)
            .map_or(frame::HEADER_SIZE, |len| frame::HEADER_SIZE + len as usize);
        Err(DecodeError::Truncated {
            expected,
            available: self.buf.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trc::fixtures;

    fn session() -> Vec<Frame> {
        vec![
            Frame::Header(fixtures::header(4, 512.0)),
            Frame::Data(fixtures::ramp(0, 4, 16)),
            Frame::Marker(Marker { sample: 3, code: 250 }),
            Frame::Note(Note { sample: 15, text: "Augen geöffnet".into() }),
            Frame::Data(fixtures::ramp(16, 4, 5)),
        ]
    }

    fn encode_all(frames: &[Frame]) -> Vec<u8> {
        let mut out = Vec::new();
        for f in frames {
            f.encode_into(&mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_frame_header_layout() {
        let bytes = Frame::Marker(Marker { sample: 0x0102, code: 7 }).encode().unwrap();
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[..5], &[3, 0, 0, 0, 10]);
        assert_eq!(&bytes[5..13], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&bytes[13..], &[0, 7]);
    }

    #[test]
    fn test_decode_every_split_point() {
        let frames = session();
        let bytes = encode_all(&frames);

        for split in 0..=bytes.len() {
            let mut buffer = FrameBuffer::new();
            buffer.extend(&bytes[..split]);
            let mut decoded = buffer.decode().unwrap();
            buffer.extend(&bytes[split..]);
            decoded.extend(buffer.decode().unwrap());
            assert_eq!(decoded, frames, "split at {split}");
            assert_eq!(buffer.pending(), 0);
            assert!(buffer.finish().is_ok());
        }
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let frames = session();
        let bytes = encode_all(&frames);

        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        for b in &bytes {
            buffer.extend(std::slice::from_ref(b));
            decoded.extend(buffer.decode().unwrap());
        }
        assert_eq!(decoded, frames);
        assert_eq!(buffer.consumed(), bytes.len());
    }

    #[test]
    fn test_decode_reports_consumed_bytes() {
        let bytes = encode_all(&session());
        let (frames, used) = decode_frames(&bytes[..bytes.len() - 3]).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(used, bytes.len() - (5 + 11 + 4 * 5 * 2));
    }

    #[test]
    fn test_truncated_frame_waits_for_rest() {
        let note = Frame::Note(Note { sample: 1, text: "x".repeat(90) });
        let bytes = note.encode().unwrap();
        assert_eq!(bytes.len(), 105);

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes[..45]);
        assert!(buffer.decode().unwrap().is_empty());
        assert_eq!(
            buffer.finish(),
            Err(DecodeError::Truncated { expected: 105, available: 45 })
        );

        buffer.extend(&bytes[45..]);
        assert_eq!(buffer.decode().unwrap(), vec![note]);
        assert!(buffer.finish().is_ok());
    }

    #[test]
    fn test_inconsistent_length_fails_once_complete() {
        // marker frame declaring 7 payload bytes instead of 10
        let bytes = [3u8, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 1];
        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes[..8]);
        assert!(buffer.decode().unwrap().is_empty());
        buffer.extend(&bytes[8..]);
        assert!(matches!(
            buffer.decode(),
            Err(DecodeError::LengthMismatch { kind: FrameKind::Marker, offset: 0, length: 7, .. })
        ));
    }

    #[test]
    fn test_data_payload_must_hold_whole_samples() {
        let mut bytes = Frame::Data(fixtures::ramp(0, 3, 2)).encode().unwrap();
        bytes.pop();
        let len = (bytes.len() - 5) as u32;
        bytes[1..5].copy_from_slice(&len.to_be_bytes());
        assert!(matches!(
            decode_frames(&bytes),
            Err(DecodeError::LengthMismatch { kind: FrameKind::Data, .. })
        ));
    }

    #[test]
    fn test_unknown_kind_and_oversized() {
        assert_eq!(
            decode_frames(&[9]),
            Err(DecodeError::UnknownKind { tag: 9, offset: 0 })
        );

        let mut bytes = Frame::Marker(Marker { sample: 1, code: 1 }).encode().unwrap();
        bytes.extend_from_slice(&[1, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            decode_frames(&bytes),
            Err(DecodeError::Oversized { kind: FrameKind::Data, offset: 15, .. })
        ));
    }

    #[test]
    fn test_frames_before_corruption_are_kept() {
        let frames = session();
        let mut bytes = encode_all(&frames[..3]);
        let good = bytes.len();
        bytes.extend_from_slice(&[9, 0, 0, 0, 0]);

        assert!(decode_frames(&bytes).is_err());

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes);
        let mut decoded: Vec<Frame> = Vec::new();
        assert_eq!(
            buffer.decode_into(&mut decoded),
            Err(DecodeError::UnknownKind { tag: 9, offset: good })
        );
        assert_eq!(decoded, frames[..3]);
        assert_eq!(buffer.consumed(), good);
        assert_eq!(buffer.pending(), 5);
    }

    #[test]
    fn test_header_payload_is_a_trc_region() {
        let header = fixtures::header(2, 1024.0);
        let bytes = Frame::Header(header.clone()).encode().unwrap();
        let region = parse_header_region(&bytes[5..]).unwrap();
        assert_eq!(region.header, header);
        assert_eq!(region.data_start as usize, bytes.len() - 5);
    }
}
