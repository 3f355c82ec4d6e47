//! Sliding-window epoch buffer.
//!
//! Samples arrive in blocks of any size; every time the buffer holds a full
//! window starting at the current window start, one [`Epoch`] is returned
//! and the window advances by the step length. Markers and notes are
//! attached to every emitted window that contains their sample index.
//!
//! ```text
//!  AwaitingHeader ──configure──▶ Accumulating ◀──────────┐
//!                                    │ push_block        │ push_block
//!                                    ▼ (window full)     │ (not full)
//!                                EpochReady ─────────────┘
//! ```

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strum::Display;

use crate::error::{BufferError, ConfigError};
use crate::types::{Marker, Note, RecordingHeader, SampleBlock, SampleUnits};

/// Epoching parameters, fixed for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EpochConfig {
    /// Window length in seconds
    pub epoch_duration: f64,
    /// Overlap between consecutive windows in seconds
    pub overlap: f64,
    /// Channel names to keep, in output order; all channels when `None`
    pub picks: Option<Vec<String>>,
    pub units: SampleUnits,
}

impl Default for EpochConfig {
    fn default() -> Self {
        EpochConfig {
            epoch_duration: 5.0,
            overlap: 2.5,
            picks: None,
            units: SampleUnits::Physical,
        }
    }
}

impl EpochConfig {
    pub fn new(epoch_duration: f64, overlap: f64) -> Self {
        EpochConfig {
            epoch_duration,
            overlap,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (epoch, overlap) = (self.epoch_duration, self.overlap);
        if !epoch.is_finite() || !overlap.is_finite() {
            return Err(ConfigError::NotFinite { epoch, overlap });
        }
        if overlap < 0.0 {
            return Err(ConfigError::NegativeOverlap(overlap));
        }
        if epoch <= overlap {
            return Err(ConfigError::NonPositiveStep { epoch, overlap });
        }
        Ok(())
    }

    /// `(epoch_length, step_length)` in samples at `sampling_rate`.
    /// Both durations are rounded to the nearest sample.
    pub fn lengths(&self, sampling_rate: f64) -> Result<(usize, usize), ConfigError> {
        self.validate()?;
        let epoch_length = (self.epoch_duration * sampling_rate).round();
        let overlap_length = (self.overlap * sampling_rate).round();
        if epoch_length < 1.0 {
            return Err(ConfigError::EmptyEpoch {
                duration: self.epoch_duration,
                sampling_rate,
            });
        }
        if overlap_length >= epoch_length {
            return Err(ConfigError::NonPositiveStep {
                epoch: self.epoch_duration,
                overlap: self.overlap,
            });
        }
        Ok((epoch_length as usize, (epoch_length - overlap_length) as usize))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum BufferState {
    AwaitingHeader,
    Accumulating,
    EpochReady,
}

/// One emitted window, owned by the consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    /// Global index of the first sample
    pub start: u64,
    pub channels: Vec<String>,
    /// Shape `[channels, epoch_length]`
    pub data: Array2<f64>,
    pub markers: Vec<Marker>,
    pub notes: Vec<Note>,
}

impl Epoch {
    pub fn len(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.data.ncols() == 0
    }

    pub fn end(&self) -> u64 {
        self.start + self.len() as u64
    }

    pub fn contains(&self, sample: u64) -> bool {
        (self.start..self.end()).contains(&sample)
    }
}

#[derive(Debug)]
struct Geometry {
    epoch_length: usize,
    step: usize,
    source_channels: usize,
    picks: Vec<usize>,
    names: Vec<String>,
    conversion: Vec<(f64, f64)>,
}

#[derive(Debug)]
pub struct EpochBuffer {
    config: EpochConfig,
    geometry: Option<Geometry>,
    state: BufferState,
    /// Converted samples per picked channel, starting at `buffer_start`
    rows: Vec<VecDeque<f64>>,
    buffer_start: u64,
    window_start: Option<u64>,
    markers: Vec<Marker>,
    notes: Vec<Note>,
}

impl EpochBuffer {
    /// Fails when the durations cannot produce a positive step
    pub fn new(config: EpochConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(EpochBuffer {
            config,
            geometry: None,
            state: BufferState::AwaitingHeader,
            rows: Vec::new(),
            buffer_start: 0,
            window_start: None,
            markers: Vec::new(),
            notes: Vec::new(),
        })
    }

    pub fn with_header(config: EpochConfig, header: &RecordingHeader) -> Result<Self, BufferError> {
        let mut buffer = EpochBuffer::new(config)?;
        buffer.configure(header)?;
        Ok(buffer)
    }

    /// Fix channel layout, sampling rate and window geometry
    pub fn configure(&mut self, header: &RecordingHeader) -> Result<(), BufferError> {
        if self.geometry.is_some() {
            return Err(BufferError::AlreadyConfigured);
        }
        let (epoch_length, step) = self.config.lengths(header.sampling_rate)?;
        let picks = header.select(self.config.picks.as_deref())?;
        let conversion = header.conversion(&picks, self.config.units)?;
        let names = picks.iter().map(|&i| header.channels[i].name()).collect();

        self.rows = vec![VecDeque::with_capacity(epoch_length * 2); picks.len()];
        self.geometry = Some(Geometry {
            epoch_length,
            step,
            source_channels: header.channel_count(),
            picks,
            names,
            conversion,
        });
        self.state = BufferState::Accumulating;
        Ok(())
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn config(&self) -> &EpochConfig {
        &self.config
    }

    pub fn epoch_length(&self) -> Option<usize> {
        self.geometry.as_ref().map(|g| g.epoch_length)
    }

    pub fn step_length(&self) -> Option<usize> {
        self.geometry.as_ref().map(|g| g.step)
    }

    /// Global index of the next window to be emitted
    pub fn window_start(&self) -> Option<u64> {
        self.window_start
    }

    /// Samples held per channel
    pub fn buffered(&self) -> usize {
        self.rows.first().map_or(0, VecDeque::len)
    }

    /// Append a block and return every window it completes, oldest first
    pub fn push_block(&mut self, block: &SampleBlock) -> Result<Vec<Epoch>, BufferError> {
        let geometry = self.geometry.as_ref().ok_or(BufferError::NotConfigured)?;
        if block.channel_count() != geometry.source_channels {
            return Err(BufferError::ChannelMismatch {
                sample: block.start(),
                expected: geometry.source_channels,
                actual: block.channel_count(),
            });
        }
        match self.window_start {
            None => {
                self.buffer_start = block.start();
                self.window_start = Some(block.start());
                // events queued before any data cannot precede the first block
                let first = block.start();
                self.markers.retain(|m| m.sample >= first);
                self.notes.retain(|n| n.sample >= first);
            }
            Some(_) => {
                let expected = self.buffer_start + self.buffered() as u64;
                if block.start() != expected {
                    return Err(BufferError::Discontinuity {
                        expected,
                        actual: block.start(),
                    });
                }
            }
        }

        let data = block.data();
        for ((row, &ch), &(ground, factor)) in self
            .rows
            .iter_mut()
            .zip(&geometry.picks)
            .zip(&geometry.conversion)
        {
            row.extend(data.row(ch).iter().map(|&raw| (f64::from(raw) - ground) * factor));
        }

        Ok(self.drain_ready())
    }

    pub fn push_marker(&mut self, marker: Marker) -> Result<(), BufferError> {
        self.check_event(marker.sample)?;
        let at = self.markers.partition_point(|m| m.sample <= marker.sample);
        self.markers.insert(at, marker);
        Ok(())
    }

    pub fn push_note(&mut self, note: Note) -> Result<(), BufferError> {
        self.check_event(note.sample)?;
        let at = self.notes.partition_point(|n| n.sample <= note.sample);
        self.notes.insert(at, note);
        Ok(())
    }

    /// End of stream: the partial tail is dropped. Returns its length in samples.
    pub fn close(self) -> usize {
        self.buffered()
    }

    fn check_event(&self, sample: u64) -> Result<(), BufferError> {
        if self.geometry.is_none() {
            return Err(BufferError::NotConfigured);
        }
        match self.window_start {
            Some(window_start) if sample < window_start => Err(BufferError::StaleEvent {
                sample,
                window_start,
            }),
            _ => Ok(()),
        }
    }

    fn drain_ready(&mut self) -> Vec<Epoch> {
        let (Some(geometry), Some(mut window_start)) = (self.geometry.as_ref(), self.window_start)
        else {
            return Vec::new();
        };
        let len = geometry.epoch_length;
        let buffered_end = self.buffer_start + self.buffered() as u64;

        let mut epochs = Vec::new();
        while window_start + len as u64 <= buffered_end {
            let offset = (window_start - self.buffer_start) as usize;
            let mut data = Array2::zeros((self.rows.len(), len));
            for (mut out, row) in data.rows_mut().into_iter().zip(&self.rows) {
                out.iter_mut()
                    .zip(row.range(offset..offset + len))
                    .for_each(|(dst, &v)| *dst = v);
            }
            let end = window_start + len as u64;
            let inside = |sample: u64| (window_start..end).contains(&sample);
            epochs.push(Epoch {
                start: window_start,
                channels: geometry.names.clone(),
                data,
                markers: self.markers.iter().filter(|m| inside(m.sample)).copied().collect(),
                notes: self.notes.iter().filter(|n| inside(n.sample)).cloned().collect(),
            });
            window_start += geometry.step as u64;
        }

        // Keep only what the next window needs
        let discard = ((window_start - self.buffer_start) as usize).min(self.buffered());
        for row in &mut self.rows {
            row.drain(..discard);
        }
        self.buffer_start += discard as u64;
        self.window_start = Some(window_start);
        self.markers.retain(|m| m.sample >= window_start);
        self.notes.retain(|n| n.sample >= window_start);

        self.state = if epochs.is_empty() {
            BufferState::Accumulating
        } else {
            BufferState::EpochReady
        };
        epochs
    }
}
