//! Replays a recording as a live acquisition stream.
//!
//! The emulator sends the header, then the samples in fixed size packets,
//! each one released when the wall clock reaches the time its last sample
//! would have been acquired. Markers and notes follow the data frame that
//! contains their sample (markers first when a marker and a note share a
//! sample).
//!
//! ```text
//!  t=0          t=256ms             t=512ms
//!   │ Header     │ Data[0..66)       │ Data[66..132) Marker(70) Note(70) ...
//! ```
//!
//! Deadlines are computed from the session start, so a late wakeup does not
//! push every following packet back.

use log::{debug, info, trace, warn};
use micromed_core::{Frame, Marker, Note, Recording};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;

pub const DEFAULT_PACKET: Duration = Duration::from_millis(256);

/// Lag, in packets, after which a slow consumer is reported
const LAG_WARNING_PACKETS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmulatorConfig {
    /// Duration of one data frame
    pub packet: Duration,
    /// Playback speed multiplier, 1.0 is real time
    pub speed: f64,
    /// When false, frames are written as fast as the transport accepts them
    pub throttle: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig {
            packet: DEFAULT_PACKET,
            speed: 1.0,
            throttle: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Marker(Marker),
    Note(Note),
}

impl Event {
    fn sample(&self) -> u64 {
        match self {
            Event::Marker(m) => m.sample,
            Event::Note(n) => n.sample,
        }
    }

    fn to_frame(&self) -> Frame {
        match self {
            Event::Marker(m) => Frame::Marker(*m),
            Event::Note(n) => Frame::Note(n.clone()),
        }
    }
}

/// One frame and, for data frames, the number of samples (from the
/// recording start) that must have elapsed before it is sent
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub frame: Frame,
    pub due: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmulationReport {
    pub frames: usize,
    pub samples: u64,
    pub cancelled: bool,
}

pub struct Emulator {
    recording: Recording,
    config: EmulatorConfig,
    block_samples: usize,
    /// Sorted by sample, markers before notes on ties
    events: Vec<Event>,
}

impl Emulator {
    pub fn new(recording: Recording, config: EmulatorConfig) -> Result<Self, StreamError> {
        if !(config.speed.is_finite() && config.speed > 0.0) {
            return Err(StreamError::InvalidSpeed(config.speed));
        }
        let rate = recording.header.sampling_rate;
        let block_samples = ((rate * config.packet.as_secs_f64()).round() as usize).max(1);

        let range = recording.samples.start()..recording.samples.end();
        let mut events: Vec<Event> = recording
            .markers
            .iter()
            .copied()
            .map(Event::Marker)
            .chain(recording.notes.iter().cloned().map(Event::Note))
            .filter(|event| {
                let inside = range.contains(&event.sample());
                if !inside {
                    warn!(
                        "Dropping event at sample {} outside the recording ({}..{})",
                        event.sample(),
                        range.start,
                        range.end
                    );
                }
                inside
            })
            .collect();
        // stable: markers were chained first
        events.sort_by_key(Event::sample);

        let emulator = Emulator {
            recording,
            config,
            block_samples,
            events,
        };
        // the last deadline must be representable
        let longest = emulator.recording.samples.len().max(block_samples);
        emulator.elapsed(longest as u64)?;
        Ok(emulator)
    }

    /// Paced time from the session start until `samples` have been acquired
    fn elapsed(&self, samples: u64) -> Result<Duration, StreamError> {
        let rate = self.recording.header.sampling_rate * self.config.speed;
        Duration::try_from_secs_f64(samples as f64 / rate)
            .map_err(|_| StreamError::InvalidSpeed(self.config.speed))
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Samples per channel in each data frame
    pub fn block_samples(&self) -> usize {
        self.block_samples
    }

    /// Every frame of the session in send order
    pub fn frames(&self) -> Schedule<'_> {
        Schedule {
            emulator: self,
            header_sent: false,
            offset: 0,
            sent_until: self.recording.samples.start(),
            next_event: 0,
        }
    }

    /// Send the whole recording to `out`, then shut it down.
    ///
    /// Cancellation is honoured between frames only, so the peer always sees
    /// the stream end on a frame boundary.
    pub async fn run<W>(&self, mut out: W, token: CancellationToken) -> Result<EmulationReport, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let packet = self.elapsed(self.block_samples as u64)?;
        info!(
            "Streaming {} channels at {} Hz, {} samples per frame, speed {}{}",
            self.recording.header.channel_count(),
            self.recording.header.sampling_rate,
            self.block_samples,
            self.config.speed,
            if self.config.throttle { "" } else { " (unthrottled)" }
        );

        let started = Instant::now();
        let mut report = EmulationReport::default();
        let mut lag_reported = false;
        let mut bytes = Vec::new();

        for scheduled in self.frames() {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if let (Some(due), true) = (scheduled.due, self.config.throttle) {
                let deadline = started
                    .checked_add(self.elapsed(due)?)
                    .ok_or(StreamError::InvalidSpeed(self.config.speed))?;
                let cancelled = tokio::select! {
                    biased;
                    _ = token.cancelled() => true,
                    _ = sleep_until(deadline) => false,
                };
                if cancelled {
                    report.cancelled = true;
                    break;
                }
                let lag = Instant::now().saturating_duration_since(deadline);
                if !lag_reported && lag > packet * LAG_WARNING_PACKETS {
                    warn!("Falling behind real time by {:?}, the receiver is too slow", lag);
                    lag_reported = true;
                }
            }

            bytes.clear();
            scheduled.frame.encode_into(&mut bytes)?;
            out.write_all(&bytes).await?;
            trace!("Sent {} frame, {} bytes", scheduled.frame.kind(), bytes.len());

            report.frames += 1;
            if let Frame::Data(block) = &scheduled.frame {
                report.samples += block.len() as u64;
            }
        }

        out.flush().await?;
        out.shutdown().await?;
        if report.cancelled {
            info!("Emulation cancelled after {} samples", report.samples);
        } else {
            debug!("Emulation finished: {} frames, {} samples", report.frames, report.samples);
        }
        Ok(report)
    }
}

pub struct Schedule<'a> {
    emulator: &'a Emulator,
    header_sent: bool,
    /// Next sample to send, relative to the recording start
    offset: usize,
    /// Global index one past the last sent sample
    sent_until: u64,
    next_event: usize,
}

impl Iterator for Schedule<'_> {
    type Item = Scheduled;

    fn next(&mut self) -> Option<Scheduled> {
        let emulator = self.emulator;
        if !self.header_sent {
            self.header_sent = true;
            return Some(Scheduled {
                frame: Frame::Header(emulator.recording.header.clone()),
                due: None,
            });
        }

        if let Some(event) = emulator.events.get(self.next_event) {
            if event.sample() < self.sent_until {
                self.next_event += 1;
                return Some(Scheduled {
                    frame: event.to_frame(),
                    due: None,
                });
            }
        }

        let samples = &emulator.recording.samples;
        if self.offset >= samples.len() {
            return None;
        }
        let block = samples.slice(self.offset..self.offset + emulator.block_samples);
        self.offset += block.len();
        self.sent_until = block.end();
        Some(Scheduled {
            frame: Frame::Data(block),
            due: Some(self.offset as u64),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::StreamReceiver;
    use micromed_core::FrameKind;
    use ndarray::{concatenate, Axis};

    fn kinds(emulator: &Emulator) -> Vec<FrameKind> {
        emulator.frames().map(|s| s.frame.kind()).collect()
    }

    #[test]
    fn test_block_size_from_packet_duration() {
        let rec = fixtures::recording(2, 512.0, 1000, vec![], vec![]);
        let emulator = Emulator::new(rec, EmulatorConfig::default()).unwrap();
        // 512 * 0.256 = 131.07
        assert_eq!(emulator.block_samples(), 131);

        let rec = fixtures::recording(2, 2.0, 10, vec![], vec![]);
        let emulator = Emulator::new(rec, EmulatorConfig::default()).unwrap();
        assert_eq!(emulator.block_samples(), 1);

        let rec = fixtures::recording(2, 2.0, 10, vec![], vec![]);
        let config = EmulatorConfig {
            speed: 0.0,
            ..Default::default()
        };
        assert!(matches!(Emulator::new(rec, config), Err(StreamError::InvalidSpeed(_))));

        // 10 samples would take longer than any Duration
        let rec = fixtures::recording(2, 2.0, 10, vec![], vec![]);
        let config = EmulatorConfig {
            speed: 1e-300,
            ..Default::default()
        };
        assert!(matches!(
            Emulator::new(rec, config),
            Err(StreamError::InvalidSpeed(speed)) if speed == 1e-300
        ));
    }

    #[test]
    fn test_events_follow_their_data_frame() {
        let config = EmulatorConfig {
            packet: Duration::from_millis(100),
            ..Default::default()
        };
        // 100 Hz, 10 samples per frame
        let rec = fixtures::recording(
            1,
            100.0,
            25,
            vec![Marker { sample: 10, code: 2 }, Marker { sample: 9, code: 1 }],
            vec![
                Note { sample: 10, text: "a".into() },
                Note { sample: 24, text: "b".into() },
            ],
        );
        let emulator = Emulator::new(rec, config).unwrap();
        let (h, d, m, n) = (FrameKind::Header, FrameKind::Data, FrameKind::Marker, FrameKind::Note);
        assert_eq!(kinds(&emulator), [h, d, m, d, m, n, d, n]);

        let dues: Vec<_> = emulator.frames().filter_map(|s| s.due).collect();
        assert_eq!(dues, [10, 20, 25]);
    }

    #[test]
    fn test_events_outside_recording_are_dropped() {
        let rec = fixtures::recording(
            1,
            100.0,
            20,
            vec![Marker { sample: 20, code: 1 }, Marker { sample: 5, code: 1 }],
            vec![],
        );
        let emulator = Emulator::new(rec, EmulatorConfig::default()).unwrap();
        let markers = emulator
            .frames()
            .filter(|s| s.frame.kind() == FrameKind::Marker)
            .count();
        assert_eq!(markers, 1);
    }

    #[tokio::test]
    async fn test_loopback_reproduces_samples() {
        let rec = fixtures::recording(
            3,
            256.0,
            1000,
            vec![Marker { sample: 400, code: 7 }],
            vec![Note { sample: 999, text: "end".into() }],
        );
        let expected = rec.clone();
        let config = EmulatorConfig {
            throttle: false,
            ..Default::default()
        };
        let emulator = Emulator::new(rec, config).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let sender = tokio::spawn(async move {
            let socket = tokio::net::TcpStream::connect(address).await.unwrap();
            emulator.run(socket, CancellationToken::new()).await.unwrap()
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut receiver = StreamReceiver::new(socket);
        let mut header = None;
        let mut blocks = Vec::new();
        let mut markers = Vec::new();
        let mut notes = Vec::new();
        while let Some(frame) = receiver.next_frame().await.unwrap() {
            match frame {
                Frame::Header(h) => header = Some(h),
                Frame::Data(b) => blocks.push(b),
                Frame::Marker(m) => markers.push(m),
                Frame::Note(n) => notes.push(n),
            }
        }
        let report = sender.await.unwrap();

        assert_eq!(header.as_ref(), Some(&expected.header));
        let views: Vec<_> = blocks.iter().map(|b| b.data().view()).collect();
        let data = concatenate(Axis(1), &views).unwrap();
        assert_eq!(&data, expected.samples.data());
        assert_eq!(markers, expected.markers);
        assert_eq!(notes, expected.notes);
        assert_eq!(report.samples, 1000);
        assert!(!report.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_follows_sampling_rate() {
        // 256 Hz, 2 s of data, 66 samples per frame
        let rec = fixtures::recording(2, 256.0, 512, vec![], vec![]);
        let emulator = Emulator::new(rec, EmulatorConfig::default()).unwrap();
        let (writer, reader) = tokio::io::duplex(1 << 16);

        let started = Instant::now();
        let reading = tokio::spawn(async move {
            let mut receiver = StreamReceiver::new(reader);
            let mut first_data = None;
            while let Some(frame) = receiver.next_frame().await.unwrap() {
                if matches!(frame, Frame::Data(_)) && first_data.is_none() {
                    first_data = Some(Instant::now());
                }
            }
            first_data
        });
        emulator.run(writer, CancellationToken::new()).await.unwrap();
        let elapsed = started.elapsed();
        let first_data = reading.await.unwrap().unwrap() - started;

        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2010), "{elapsed:?}");
        // first frame is released once its 66 samples have been "acquired"
        assert!(first_data >= Duration::from_millis(257), "{first_data:?}");
        assert!(first_data < Duration::from_millis(270), "{first_data:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_multiplier() {
        let rec = fixtures::recording(1, 256.0, 512, vec![], vec![]);
        let config = EmulatorConfig {
            speed: 4.0,
            ..Default::default()
        };
        let emulator = Emulator::new(rec, config).unwrap();
        let (writer, mut reader) = tokio::io::duplex(1 << 16);
        let draining = tokio::spawn(async move {
            let mut sink = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut sink).await.unwrap();
        });

        let started = Instant::now();
        emulator.run(writer, CancellationToken::new()).await.unwrap();
        draining.await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(510), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_on_frame_boundary() {
        let rec = fixtures::recording(4, 256.0, 256 * 10, vec![], vec![]);
        let emulator = Emulator::new(rec, EmulatorConfig::default()).unwrap();
        let (writer, reader) = tokio::io::duplex(1 << 16);
        let token = CancellationToken::new();

        let sending = {
            let token = token.clone();
            tokio::spawn(async move { emulator.run(writer, token).await })
        };

        let mut receiver = StreamReceiver::new(reader);
        let mut data_frames = 0;
        // a clean end of stream after cancellation is Ok(None), never a decode error
        while let Some(frame) = receiver.next_frame().await.unwrap() {
            if matches!(frame, Frame::Data(_)) {
                data_frames += 1;
                if data_frames == 3 {
                    token.cancel();
                }
            }
        }
        let report = sending.await.unwrap().unwrap();

        assert!(report.cancelled);
        assert_eq!(report.frames, data_frames + 1);
        assert_eq!(report.samples, receiver.samples_received());
        assert!(report.samples < 2560);
    }
}
