//! Recording data model shared by the file parser, the wire codec and the
//! epoch buffer.

use chrono::{NaiveDate, NaiveDateTime};
use ndarray::{s, Array2, ArrayView1, Axis};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use strum::Display;
use std::ops::Range;

use crate::error::{ConfigError, FormatError};

// =============================================================================
// Enumerations
// =============================================================================

/// Measurement unit of a channel, as coded in the electrode record
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, FromPrimitive, Display,
)]
#[repr(i16)]
pub enum MeasurementUnit {
    #[strum(to_string = "nV")]
    Nanovolt = -1,
    #[default]
    #[strum(to_string = "µV")]
    Microvolt = 0,
    #[strum(to_string = "mV")]
    Millivolt = 1,
    #[strum(to_string = "V")]
    Volt = 2,
    #[strum(to_string = "%")]
    Percent = 100,
    #[strum(to_string = "bpm")]
    BeatsPerMinute = 101,
    #[strum(to_string = "dimensionless")]
    Dimensionless = 102,
}

impl MeasurementUnit {
    /// Unknown codes fall back to microvolts, the device default
    pub fn from_code(code: i16) -> Self {
        MeasurementUnit::from_i16(code).unwrap_or_default()
    }

    pub fn code(self) -> i16 {
        self as i16
    }

    /// Multiplier from this unit to volts, `None` for non-electrical units
    pub fn volts(self) -> Option<f64> {
        match self {
            MeasurementUnit::Nanovolt => Some(1e-9),
            MeasurementUnit::Microvolt => Some(1e-6),
            MeasurementUnit::Millivolt => Some(1e-3),
            MeasurementUnit::Volt => Some(1.0),
            _ => None,
        }
    }
}

/// Headbox / interface that produced the recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromPrimitive)]
#[repr(i16)]
pub enum AcquisitionUnit {
    Bq124Internal = 0,
    Ms40Holter = 2,
    Bq132sInternal = 6,
    Bq124Card = 7,
    Sam32Card = 8,
    Sam25Card = 9,
    Bq132sReverseInternal = 10,
    Sam32ReverseCard = 11,
    Sam25ReverseCard = 12,
    Sam32Internal = 13,
    Sam25Internal = 14,
    Sam32ReverseInternal = 15,
    Sam25ReverseInternal = 16,
    SdJackbox = 17,
    Sd128 = 18,
    Sd96 = 19,
    Sd64 = 20,
    Sd128c = 21,
    Sd64c = 22,
    Bq132sPci = 23,
    Bq132sReversePci = 24,
}

impl AcquisitionUnit {
    pub fn from_code(code: i16) -> Option<Self> {
        AcquisitionUnit::from_i16(code)
    }

    pub fn description(self) -> &'static str {
        use AcquisitionUnit::*;
        match self {
            Bq124Internal => "BQ124 - 24 channels headbox, Internal Interface",
            Ms40Holter => "MS40 - Holter recorder",
            Bq132sInternal => "BQ132S - 32 channels headbox, Internal Interface",
            Bq124Card => "BQ124 - 24 channels headbox, BQ CARD Interface",
            Sam32Card => "SAM32 - 32 channels headbox, BQ CARD Interface",
            Sam25Card => "SAM25 - 25 channels headbox, BQ CARD Interface",
            Bq132sReverseInternal => "BQ132S R - 32 channels reverse headbox, Internal Interface",
            Sam32ReverseCard => "SAM32 R - 32 channels reverse headbox, BQ CARD Interface",
            Sam25ReverseCard => "SAM25 R - 25 channels reverse headbox, BQ CARD Interface",
            Sam32Internal => "SAM32 - 32 channels headbox, Internal Interface",
            Sam25Internal => "SAM25 - 25 channels headbox, Internal Interface",
            Sam32ReverseInternal => "SAM32 R - 32 channels reverse headbox, Internal Interface",
            Sam25ReverseInternal => "SAM25 R - 25 channels reverse headbox, Internal Interface",
            SdJackbox => "SD - 32 channels headbox with jackbox, SD CARD Interface",
            Sd128 => "SD128 - 128 channels headbox, SD CARD Interface",
            Sd96 => "SD96 - 96 channels headbox, SD CARD Interface",
            Sd64 => "SD64 - 64 channels headbox, SD CARD Interface",
            Sd128c => "SD128c - 128 channels headbox with jackbox, SD CARD Interface",
            Sd64c => "SD64c - 64 channels headbox with jackbox, SD CARD Interface",
            Bq132sPci => "BQ132S - 32 channels headbox, PCI Internal Interface",
            Bq132sReversePci => "BQ132S R - 32 channels reverse headbox, PCI Internal Interface",
        }
    }
}

/// Storage width of one raw sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum SampleWidth {
    #[strum(to_string = "u8")]
    U8,
    #[strum(to_string = "u16")]
    U16,
    #[strum(to_string = "i32")]
    I32,
}

impl SampleWidth {
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(SampleWidth::U8),
            2 => Some(SampleWidth::U16),
            4 => Some(SampleWidth::I32),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::U8 => 1,
            SampleWidth::U16 => 2,
            SampleWidth::I32 => 4,
        }
    }

    pub fn fits(self, value: i32) -> bool {
        match self {
            SampleWidth::U8 => u8::try_from(value).is_ok(),
            SampleWidth::U16 => u16::try_from(value).is_ok(),
            SampleWidth::I32 => true,
        }
    }

    /// Decode one little-endian sample; `bytes` must hold exactly `self.bytes()`
    fn decode(self, bytes: &[u8]) -> i32 {
        match self {
            SampleWidth::U8 => i32::from(bytes[0]),
            SampleWidth::U16 => i32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            SampleWidth::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    fn encode(self, value: i32, out: &mut Vec<u8>) {
        match self {
            SampleWidth::U8 => out.push(value as u8),
            SampleWidth::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            SampleWidth::I32 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Units of converted sample values
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum SampleUnits {
    /// Raw integers as stored by the device
    #[strum(to_string = "raw")]
    Raw,
    /// Each channel's own unit (µV for EEG)
    #[default]
    #[strum(to_string = "physical")]
    Physical,
    #[strum(to_string = "volts")]
    Volts,
}

// =============================================================================
// Header
// =============================================================================

/// One recorded input and its raw-to-physical conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    /// Positive input name, e.g. `Fp1`
    pub label: String,
    /// Negative input name, e.g. `G2`
    pub reference: String,
    pub logic_min: i32,
    pub logic_max: i32,
    pub logic_ground: i32,
    pub physical_min: i32,
    pub physical_max: i32,
    pub unit: MeasurementUnit,
    pub high_pass_limit: u16,
    pub low_pass_limit: u16,
}

impl ChannelDescriptor {
    pub fn new(label: &str, reference: &str) -> Self {
        ChannelDescriptor {
            label: label.to_string(),
            reference: reference.to_string(),
            logic_min: 0,
            logic_max: 65535,
            logic_ground: 32768,
            physical_min: -3200,
            physical_max: 3200,
            unit: MeasurementUnit::Microvolt,
            high_pass_limit: 0,
            low_pass_limit: 0,
        }
    }

    /// Name as shown by the acquisition software, `positive-negative`
    pub fn name(&self) -> String {
        format!("{}-{}", self.label, self.reference)
    }

    /// Multiplier from raw units to the channel's physical unit
    pub fn scale_factor(&self) -> f64 {
        let logic_span = f64::from(self.logic_max) - f64::from(self.logic_min) + 1.0;
        (f64::from(self.physical_max) - f64::from(self.physical_min)) / logic_span
    }

    pub fn to_physical(&self, raw: i32) -> f64 {
        (f64::from(raw) - f64::from(self.logic_ground)) * self.scale_factor()
    }

    /// Raw value in volts, `None` when the unit is not electrical
    pub fn to_volts(&self, raw: i32) -> Option<f64> {
        self.unit.volts().map(|v| self.to_physical(raw) * v)
    }
}

/// Recording metadata needed to interpret the sample stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingHeader {
    /// Sampling rate in Hz
    pub sampling_rate: f64,
    pub channels: Vec<ChannelDescriptor>,
    pub sample_width: SampleWidth,
    pub recording_start: NaiveDateTime,
    /// Patient date of birth, `None` when the file leaves it blank
    pub birth_date: Option<NaiveDate>,
    /// Header type code, 4 for System98
    pub version: i8,
    pub title: String,
    pub laboratory: String,
    pub surname: String,
    pub first_name: String,
    pub acquisition_unit: i16,
    pub file_type: u16,
}

impl RecordingHeader {
    /// Header with placeholder metadata, recording start at the Unix epoch
    pub fn new(sampling_rate: f64, channels: Vec<ChannelDescriptor>, sample_width: SampleWidth) -> Self {
        RecordingHeader {
            sampling_rate,
            channels,
            sample_width,
            recording_start: NaiveDateTime::default(),
            birth_date: None,
            version: crate::layout::header::SYSTEM98,
            title: "MICROMED  Brain-Quick file".to_string(),
            laboratory: String::new(),
            surname: String::new(),
            first_name: String::new(),
            acquisition_unit: AcquisitionUnit::Sd128 as i16,
            file_type: 0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(ChannelDescriptor::name).collect()
    }

    /// Index of a channel by its `positive-negative` name
    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name() == name)
    }

    /// Channel indices for `picks` in pick order, or every channel when `None`
    pub fn select(&self, picks: Option<&[String]>) -> Result<Vec<usize>, ConfigError> {
        let Some(picks) = picks else {
            return Ok((0..self.channels.len()).collect());
        };
        if picks.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        picks
            .iter()
            .map(|name| {
                self.channel_index(name)
                    .ok_or_else(|| ConfigError::UnknownChannel(name.clone()))
            })
            .collect()
    }

    /// Per channel `(ground, factor)` so that `value = (raw - ground) * factor`
    pub fn conversion(
        &self,
        picks: &[usize],
        units: SampleUnits,
    ) -> Result<Vec<(f64, f64)>, ConfigError> {
        picks
            .iter()
            .map(|&i| {
                let desc = self
                    .channels
                    .get(i)
                    .ok_or_else(|| ConfigError::UnknownChannel(i.to_string()))?;
                match units {
                    SampleUnits::Raw => Ok((0.0, 1.0)),
                    SampleUnits::Physical => {
                        Ok((f64::from(desc.logic_ground), desc.scale_factor()))
                    }
                    SampleUnits::Volts => desc
                        .unit
                        .volts()
                        .map(|v| (f64::from(desc.logic_ground), desc.scale_factor() * v))
                        .ok_or_else(|| ConfigError::NotElectrical(desc.name())),
                }
            })
            .collect()
    }

    pub fn acquisition_unit(&self) -> Option<AcquisitionUnit> {
        AcquisitionUnit::from_code(self.acquisition_unit)
    }

    /// Reference channels carrying the 50 mV calibration signal
    pub fn mkr_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.name().contains("MKR"))
            .map(|(i, _)| i)
            .collect()
    }

    /// True when every MKR channel sample is close to ±50 mV.
    /// Fails legitimately while a trigger is being received on the serial port,
    /// and for a block that lacks one of the MKR channels.
    pub fn check_mkr(&self, block: &SampleBlock) -> bool {
        self.mkr_channels().into_iter().all(|ch| {
            if ch >= block.channel_count() {
                return false;
            }
            let desc = &self.channels[ch];
            block.channel(ch).iter().all(|&raw| {
                let mv = desc.to_volts(raw).map(|v| v * 1e3).unwrap_or(0.0);
                (mv.abs() - 50.0).abs() <= 1e-8 + 1e-5 * 50.0
            })
        })
    }
}

// =============================================================================
// Events
// =============================================================================

/// A trigger code at a sample index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub sample: u64,
    pub code: u16,
}

/// Free text annotation at a sample index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub sample: u64,
    pub text: String,
}

/// Marker or note expressed in seconds, for conversion collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub onset: f64,
    pub description: String,
}

/// Markers and notes merged in onset order, markers first on ties
pub fn annotations(header: &RecordingHeader, markers: &[Marker], notes: &[Note]) -> Vec<Annotation> {
    let mut all: Vec<(u64, u8, String)> = markers
        .iter()
        .map(|m| (m.sample, 0, m.code.to_string()))
        .chain(notes.iter().map(|n| (n.sample, 1, n.text.clone())))
        .collect();
    all.sort_by_key(|(sample, order, _)| (*sample, *order));
    all.into_iter()
        .map(|(sample, _, description)| Annotation {
            onset: sample as f64 / header.sampling_rate,
            description,
        })
        .collect()
}

/// Hand-off to a third-party analysis object model
pub trait AnalysisConverter {
    type Output;
    type Error;

    fn convert(
        &self,
        header: &RecordingHeader,
        samples: &SampleBlock,
        annotations: &[Annotation],
    ) -> Result<Self::Output, Self::Error>;
}

// =============================================================================
// Samples
// =============================================================================

/// Raw samples for all channels, shape `[channels, samples]`, starting at
/// global sample index `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    start: u64,
    width: SampleWidth,
    data: Array2<i32>,
}

impl SampleBlock {
    /// Fails when a value does not fit the storage width
    pub fn new(start: u64, width: SampleWidth, data: Array2<i32>) -> Result<Self, FormatError> {
        if let Some(v) = data.iter().find(|&&v| !width.fits(v)) {
            return Err(FormatError::Unencodable {
                field: "sample",
                reason: format!("{v} does not fit {width}"),
            });
        }
        Ok(SampleBlock { start, width, data })
    }

    /// Build from channel-interleaved little-endian bytes.
    /// Returns `None` unless `bytes` holds a whole number of sample frames.
    pub fn from_interleaved(
        start: u64,
        channels: usize,
        width: SampleWidth,
        bytes: &[u8],
    ) -> Option<Self> {
        let frame = channels.checked_mul(width.bytes())?;
        if frame == 0 || bytes.len() % frame != 0 {
            return None;
        }
        let samples = bytes.len() / frame;
        let values: Vec<i32> = bytes
            .chunks_exact(width.bytes())
            .map(|b| width.decode(b))
            .collect();
        // Interleaved bytes are sample-major; transpose to channel-major
        let data = Array2::from_shape_vec((samples, channels), values)
            .ok()?
            .reversed_axes()
            .as_standard_layout()
            .into_owned();
        Some(SampleBlock { start, width, data })
    }

    pub fn write_interleaved(&self, out: &mut Vec<u8>) {
        out.reserve(self.data.len() * self.width.bytes());
        for sample in self.data.axis_iter(Axis(1)) {
            for &v in sample.iter() {
                self.width.encode(v, out);
            }
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Index one past the last sample
    pub fn end(&self) -> u64 {
        self.start + self.len() as u64
    }

    pub fn width(&self) -> SampleWidth {
        self.width
    }

    pub fn channel_count(&self) -> usize {
        self.data.nrows()
    }

    pub fn len(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.data.ncols() == 0
    }

    pub fn data(&self) -> &Array2<i32> {
        &self.data
    }

    pub fn into_data(self) -> Array2<i32> {
        self.data
    }

    pub fn channel(&self, index: usize) -> ArrayView1<'_, i32> {
        self.data.row(index)
    }

    /// Columns `range` (relative to this block) as a new block.
    /// The range is clamped to the block length.
    pub fn slice(&self, range: Range<usize>) -> SampleBlock {
        let end = range.end.min(self.len());
        let begin = range.start.min(end);
        SampleBlock {
            start: self.start + begin as u64,
            width: self.width,
            data: self.data.slice(s![.., begin..end]).to_owned(),
        }
    }

    /// Values in each channel's physical unit
    pub fn to_physical(&self, channels: &[ChannelDescriptor]) -> Array2<f64> {
        let mut out = self.data.mapv(f64::from);
        for (mut row, desc) in out.rows_mut().into_iter().zip(channels) {
            row.mapv_inplace(|raw| (raw - f64::from(desc.logic_ground)) * desc.scale_factor());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_scale_factor() {
        let ch = ChannelDescriptor::new("Fp1", "G2");
        assert_eq!(ch.name(), "Fp1-G2");
        assert!((ch.scale_factor() - 6400.0 / 65536.0).abs() < 1e-12);
        assert_eq!(ch.to_physical(32768), 0.0);
        assert!((ch.to_physical(32768 + 1024) - 100.0).abs() < 1e-9);
        assert!((ch.to_volts(32768 + 1024).unwrap() - 100e-6).abs() < 1e-15);

        let mut bpm = ch.clone();
        bpm.unit = MeasurementUnit::BeatsPerMinute;
        assert_eq!(bpm.to_volts(0), None);
    }

    #[test]
    fn test_unit_codes() {
        assert_eq!(MeasurementUnit::from_code(-1), MeasurementUnit::Nanovolt);
        assert_eq!(MeasurementUnit::from_code(101), MeasurementUnit::BeatsPerMinute);
        assert_eq!(MeasurementUnit::from_code(55), MeasurementUnit::Microvolt);
        assert_eq!(MeasurementUnit::Millivolt.to_string(), "mV");
        assert_eq!(
            AcquisitionUnit::from_code(19).map(AcquisitionUnit::description),
            Some("SD96 - 96 channels headbox, SD CARD Interface")
        );
        assert_eq!(AcquisitionUnit::from_code(1), None);
    }

    #[test]
    fn test_interleaved_layout() {
        // two channels, three samples: ch0 = 1,2,3 ; ch1 = 10,20,30
        let bytes: Vec<u8> = [1u16, 10, 2, 20, 3, 30]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let block = SampleBlock::from_interleaved(7, 2, SampleWidth::U16, &bytes).unwrap();
        assert_eq!(block.data(), &array![[1, 2, 3], [10, 20, 30]]);
        assert_eq!(block.start(), 7);
        assert_eq!(block.end(), 10);

        let mut out = Vec::new();
        block.write_interleaved(&mut out);
        assert_eq!(out, bytes);

        assert!(SampleBlock::from_interleaved(0, 2, SampleWidth::U16, &bytes[..5]).is_none());
    }

    #[test]
    fn test_slice_keeps_global_index() {
        let block = SampleBlock::new(100, SampleWidth::U16, array![[1, 2, 3, 4], [5, 6, 7, 8]]).unwrap();
        let part = block.slice(1..3);
        assert_eq!(part.start(), 101);
        assert_eq!(part.data(), &array![[2, 3], [6, 7]]);
        assert_eq!(block.slice(3..10).len(), 1);
        assert!(block.slice(9..12).is_empty());
    }

    #[test]
    fn test_block_rejects_values_outside_width() {
        assert!(SampleBlock::new(0, SampleWidth::U16, array![[70000]]).is_err());
        assert!(SampleBlock::new(0, SampleWidth::U8, array![[-1]]).is_err());
        assert!(SampleBlock::new(0, SampleWidth::I32, array![[-70000]]).is_ok());
    }

    #[test]
    fn test_channel_selection() {
        let mut ecg = ChannelDescriptor::new("ECG1", "ECG2");
        ecg.unit = MeasurementUnit::Millivolt;
        let mut hr = ChannelDescriptor::new("HR", "");
        hr.unit = MeasurementUnit::BeatsPerMinute;
        let header = RecordingHeader::new(
            512.0,
            vec![ChannelDescriptor::new("Fp1", "G2"), ecg, hr],
            SampleWidth::U16,
        );

        assert_eq!(header.select(None).unwrap(), vec![0, 1, 2]);
        let picks = vec!["ECG1-ECG2".to_string(), "Fp1-G2".to_string()];
        assert_eq!(header.select(Some(&picks)).unwrap(), vec![1, 0]);
        let unknown = vec!["Cz-G2".to_string()];
        assert_eq!(
            header.select(Some(&unknown)),
            Err(ConfigError::UnknownChannel("Cz-G2".into()))
        );
        assert_eq!(header.select(Some(&[])), Err(ConfigError::NoChannels));

        let volts = header.conversion(&[1], SampleUnits::Volts).unwrap();
        assert_eq!(volts[0].0, 32768.0);
        assert!((volts[0].1 - 6400.0 / 65536.0 * 1e-3).abs() < 1e-15);
        assert_eq!(header.conversion(&[0], SampleUnits::Raw).unwrap(), vec![(0.0, 1.0)]);
        assert_eq!(
            header.conversion(&[2], SampleUnits::Volts),
            Err(ConfigError::NotElectrical("HR-".into()))
        );
    }

    #[test]
    fn test_mkr_check() {
        let mut mkr = ChannelDescriptor::new("MKR+", "MKR-");
        mkr.unit = MeasurementUnit::Millivolt;
        mkr.physical_min = -100;
        mkr.physical_max = 100;
        mkr.logic_min = 0;
        mkr.logic_max = 199;
        mkr.logic_ground = 100;
        let header = RecordingHeader::new(
            256.0,
            vec![ChannelDescriptor::new("Fz", "G2"), mkr],
            SampleWidth::U16,
        );
        assert_eq!(header.mkr_channels(), vec![1]);

        let good = SampleBlock::new(0, SampleWidth::U16, array![[1, 2], [150, 50]]).unwrap();
        assert!(header.check_mkr(&good));
        let bad = SampleBlock::new(0, SampleWidth::U16, array![[1, 2], [150, 100]]).unwrap();
        assert!(!header.check_mkr(&bad));
        let short = SampleBlock::new(0, SampleWidth::U16, array![[1, 2]]).unwrap();
        assert!(!header.check_mkr(&short));
    }

    #[test]
    fn test_annotations_are_ordered() {
        let header =
            RecordingHeader::new(256.0, vec![ChannelDescriptor::new("Fz", "G2")], SampleWidth::U16);
        let markers = [Marker { sample: 512, code: 3 }];
        let notes = [
            Note { sample: 512, text: "eyes closed".into() },
            Note { sample: 256, text: "start".into() },
        ];
        let a = annotations(&header, &markers, &notes);
        assert_eq!(a.len(), 3);
        assert_eq!(a[0], Annotation { onset: 1.0, description: "start".into() });
        assert_eq!(a[1].description, "3");
        assert_eq!(a[2].onset, 2.0);
    }
}
