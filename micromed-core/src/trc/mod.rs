//! Micromed TRC recordings.
//!
//! [`TrcReader`] loads the header region (patient and recording metadata,
//! channel table, notes and triggers) and fetches samples lazily, so that
//! metadata-only use never touches the data region. [`TrcWriter`] produces
//! the same layout; it is used for fixtures and for the wire header frame.
//!
//! All offsets come from [`crate::layout`].

mod reader;
mod writer;

pub use reader::{parse_header_region, HeaderRegion, TrcReader};
pub use writer::TrcWriter;

use ndarray::Array2;
use std::io::Cursor;

use crate::error::{ConfigError, FormatError};
use crate::types::{annotations, Annotation, Marker, Note, RecordingHeader, SampleBlock, SampleUnits};

/// A fully loaded recording
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub header: RecordingHeader,
    pub markers: Vec<Marker>,
    pub notes: Vec<Note>,
    pub samples: SampleBlock,
}

impl Recording {
    pub fn sample_count(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.sample_count() as f64 / self.header.sampling_rate
    }

    /// Samples for the picked channels (all when `None`), converted to `units`
    pub fn data(
        &self,
        picks: Option<&[String]>,
        units: SampleUnits,
    ) -> Result<Array2<f64>, ConfigError> {
        let selected = self.header.select(picks)?;
        let conversion = self.header.conversion(&selected, units)?;
        let raw = self.samples.data();
        let mut out = Array2::zeros((selected.len(), raw.ncols()));
        for (row, (&ch, &(ground, factor))) in selected.iter().zip(&conversion).enumerate() {
            out.row_mut(row)
                .iter_mut()
                .zip(raw.row(ch))
                .for_each(|(dst, &v)| *dst = (f64::from(v) - ground) * factor);
        }
        Ok(out)
    }

    pub fn annotations(&self) -> Vec<Annotation> {
        annotations(&self.header, &self.markers, &self.notes)
    }
}

/// Parse a complete TRC file held in memory
pub fn parse_trc(bytes: &[u8]) -> Result<Recording, FormatError> {
    TrcReader::new(Cursor::new(bytes))?.into_recording()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;
    use crate::types::{ChannelDescriptor, MeasurementUnit};
    use chrono::NaiveDate;

    fn sample_recording() -> (RecordingHeader, Vec<Marker>, Vec<Note>, SampleBlock) {
        let mut header = fixtures::header(3, 512.0);
        header.recording_start = NaiveDate::from_ymd_opt(2023, 11, 2)
            .unwrap()
            .and_hms_opt(14, 5, 9)
            .unwrap();
        header.birth_date = NaiveDate::from_ymd_opt(1980, 4, 17);
        header.surname = "Doe".into();
        header.first_name = "Jane".into();
        header.laboratory = "Neuro Lab".into();
        header.channels[2] = ChannelDescriptor {
            unit: MeasurementUnit::Millivolt,
            ..ChannelDescriptor::new("ECG+", "ECG-")
        };
        let markers = vec![Marker { sample: 10, code: 1 }, Marker { sample: 300, code: 42 }];
        let notes = vec![Note { sample: 64, text: "eyes closed".into() }];
        (header, markers, notes, fixtures::ramp(0, 3, 1000))
    }

    fn encode(header: &RecordingHeader, markers: &[Marker], notes: &[Note], samples: &SampleBlock) -> Vec<u8> {
        TrcWriter::new(header)
            .with_markers(markers)
            .with_notes(notes)
            .to_bytes(samples)
            .unwrap()
    }

    #[test]
    fn test_parse_written_file() {
        let (header, markers, notes, samples) = sample_recording();
        let bytes = encode(&header, &markers, &notes, &samples);

        let rec = parse_trc(&bytes).unwrap();
        assert_eq!(rec.header, header);
        assert_eq!(rec.header.birth_date, NaiveDate::from_ymd_opt(1980, 4, 17));
        assert_eq!(rec.markers, markers);
        assert_eq!(rec.notes, notes);
        assert_eq!(rec.samples, samples);
        assert_eq!(rec.header.channel_names(), vec!["E0-G2", "E1-G2", "ECG+-ECG-"]);
        assert!((rec.duration() - 1000.0 / 512.0).abs() < 1e-12);
    }

    #[test]
    fn test_physical_data() {
        let (header, markers, notes, samples) = sample_recording();
        let rec = parse_trc(&encode(&header, &markers, &notes, &samples)).unwrap();

        let picks = vec!["ECG+-ECG-".to_string()];
        let mv = rec.data(Some(&picks), SampleUnits::Physical).unwrap();
        let volts = rec.data(Some(&picks), SampleUnits::Volts).unwrap();
        assert_eq!(mv.dim(), (1, 1000));
        let raw = samples.data()[[2, 5]];
        let expected = header.channels[2].to_physical(raw);
        assert!((mv[[0, 5]] - expected).abs() < 1e-9);
        assert!((volts[[0, 5]] - expected * 1e-3).abs() < 1e-12);

        let raw_all = rec.data(None, SampleUnits::Raw).unwrap();
        assert_eq!(raw_all[[1, 9]], f64::from(samples.data()[[1, 9]]));
    }

    #[test]
    fn test_wrong_header_type_is_corrupt() {
        let (header, markers, notes, samples) = sample_recording();
        let mut bytes = encode(&header, &markers, &notes, &samples);
        bytes[layout::header::HEADER_TYPE.offset] = 2;
        match parse_trc(&bytes) {
            Err(FormatError::CorruptHeader { offset, .. }) => {
                assert_eq!(offset, layout::header::HEADER_TYPE.offset)
            }
            other => panic!("expected corrupt header, got {other:?}"),
        }
    }

    #[test]
    fn test_implausible_fields_are_corrupt() {
        let (header, markers, notes, samples) = sample_recording();
        let clean = encode(&header, &markers, &notes, &samples);

        let mut bytes = clean.clone();
        layout::header::CHANNEL_COUNT.put_u16(&mut bytes, 0, 0);
        assert!(matches!(
            parse_trc(&bytes),
            Err(FormatError::CorruptHeader { offset: 142, .. })
        ));

        let mut bytes = clean.clone();
        layout::header::SAMPLING_RATE.put_u16(&mut bytes, 0, 0);
        assert!(matches!(
            parse_trc(&bytes),
            Err(FormatError::CorruptHeader { offset: 146, .. })
        ));

        let mut bytes = clean.clone();
        layout::header::BYTES_PER_SAMPLE.put_u16(&mut bytes, 0, 3);
        assert!(matches!(
            parse_trc(&bytes),
            Err(FormatError::CorruptHeader { offset: 148, .. })
        ));

        let mut bytes = clean;
        layout::zone::NAME.put_text(&mut bytes, layout::header::ZONE_TABLE, "BOGUS");
        assert!(matches!(parse_trc(&bytes), Err(FormatError::CorruptHeader { .. })));
    }

    #[test]
    fn test_truncated_files() {
        let (header, markers, notes, samples) = sample_recording();
        let bytes = encode(&header, &markers, &notes, &samples);

        // cut in the middle of a sample frame
        assert!(matches!(
            parse_trc(&bytes[..bytes.len() - 1]),
            Err(FormatError::TruncatedFile { region: "data", .. })
        ));
        // cut inside the header region
        assert!(matches!(
            parse_trc(&bytes[..700]),
            Err(FormatError::TruncatedFile { .. })
        ));
        assert!(matches!(
            parse_trc(&bytes[..100]),
            Err(FormatError::TruncatedFile { .. })
        ));
    }

    #[test]
    fn test_lazy_reads() {
        let (header, markers, notes, samples) = sample_recording();
        let bytes = encode(&header, &markers, &notes, &samples);

        let mut reader = TrcReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.sample_count(), 1000);
        assert_eq!(reader.markers(), &markers[..]);

        let block = reader.read_samples(250, 100).unwrap();
        assert_eq!(block.start(), 250);
        assert_eq!(block, fixtures::ramp(250, 3, 100));

        assert!(matches!(
            reader.read_samples(950, 51),
            Err(FormatError::OutOfRange { .. })
        ));
        assert_eq!(reader.read_samples(1000, 0).unwrap().len(), 0);
    }

    #[test]
    fn test_open_from_disk() {
        let (header, markers, notes, samples) = sample_recording();
        let bytes = encode(&header, &markers, &notes, &samples);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &bytes).unwrap();

        let reader = TrcReader::open(file.path()).unwrap();
        assert_eq!(reader.header().surname, "Doe");
        assert_eq!(reader.data_start() as usize, bytes.len() - 3 * 2 * 1000);
        let rec = reader.into_recording().unwrap();
        assert_eq!(rec.samples, samples);
    }

    #[test]
    fn test_header_serializes() {
        let (header, ..) = sample_recording();
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["samplingRate"], 512.0);
        assert_eq!(json["channels"][0]["label"], "E0");
        assert_eq!(json["sampleWidth"], "U16");
    }
}
