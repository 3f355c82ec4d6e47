use chrono::NaiveDate;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::Recording;
use crate::error::FormatError;
use crate::layout::{electrode, header as hdr, note, order, trigger, zone, Field};
use crate::types::{
    ChannelDescriptor, MeasurementUnit, Marker, Note, RecordingHeader, SampleBlock, SampleWidth,
};

/// Upper bound for a plausible channel count
const MAX_CHANNELS: u16 = 1024;

/// Everything stored before the data region
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderRegion {
    pub header: RecordingHeader,
    pub markers: Vec<Marker>,
    pub notes: Vec<Note>,
    /// Byte offset of the first sample
    pub data_start: u64,
}

#[derive(Debug, Clone, Copy)]
struct Zone {
    position: usize,
    length: usize,
}

fn field<T>(buf: &[u8], f: Field, read: impl Fn(&Field, &[u8], usize) -> Option<T>) -> Result<T, FormatError> {
    read(&f, buf, 0).ok_or(FormatError::TruncatedFile {
        region: f.name,
        needed: f.end() as u64,
        actual: buf.len() as u64,
    })
}

fn find_zone(zones: &[(String, Zone)], name: &str) -> Result<Zone, FormatError> {
    zones
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, z)| *z)
        .ok_or_else(|| FormatError::corrupt(hdr::ZONE_TABLE, format!("missing {name} zone")))
}

/// Bytes of a zone, failing when it extends past the buffer
fn zone_bytes<'a>(buf: &'a [u8], z: Zone, region: &'static str) -> Result<&'a [u8], FormatError> {
    let end = z.position.saturating_add(z.length);
    buf.get(z.position..end).ok_or(FormatError::TruncatedFile {
        region,
        needed: end as u64,
        actual: buf.len() as u64,
    })
}

/// Parse a TRC header region: the fixed header, the zone table and the
/// ORDER, LABCOD, NOTE and TRIGGER zones. `buf` must start at file offset 0.
pub fn parse_header_region(buf: &[u8]) -> Result<HeaderRegion, FormatError> {
    if buf.len() < hdr::FIXED_SIZE {
        return Err(FormatError::TruncatedFile {
            region: "fixed header",
            needed: hdr::FIXED_SIZE as u64,
            actual: buf.len() as u64,
        });
    }

    let header_type = field(buf, hdr::HEADER_TYPE, Field::i8)?;
    if header_type != hdr::SYSTEM98 {
        return Err(FormatError::corrupt(
            hdr::HEADER_TYPE.offset,
            format!("unsupported header type {header_type}"),
        ));
    }

    let zones: Vec<(String, Zone)> = (0..hdr::ZONE_COUNT)
        .map(|i| {
            let base = hdr::ZONE_TABLE + i * zone::SIZE;
            let name = zone::NAME.text(buf, base).unwrap_or_default();
            let position = zone::POSITION.u32(buf, base).unwrap_or(0) as usize;
            let length = zone::LENGTH.u32(buf, base).unwrap_or(0) as usize;
            (name, Zone { position, length })
        })
        .collect();
    if zones.first().map(|(n, _)| n.as_str()) != Some(zone::ORDER) {
        return Err(FormatError::corrupt(
            hdr::ZONE_TABLE,
            "zone table does not start with ORDER",
        ));
    }

    let channel_count = field(buf, hdr::CHANNEL_COUNT, Field::u16)?;
    if channel_count == 0 || channel_count > MAX_CHANNELS {
        return Err(FormatError::corrupt(
            hdr::CHANNEL_COUNT.offset,
            format!("implausible channel count {channel_count}"),
        ));
    }
    let sampling_rate = field(buf, hdr::SAMPLING_RATE, Field::u16)?;
    if sampling_rate == 0 {
        return Err(FormatError::corrupt(hdr::SAMPLING_RATE.offset, "sampling rate is zero"));
    }
    let bytes_per_sample = field(buf, hdr::BYTES_PER_SAMPLE, Field::u16)?;
    let sample_width = SampleWidth::from_bytes(bytes_per_sample as usize).ok_or_else(|| {
        FormatError::corrupt(
            hdr::BYTES_PER_SAMPLE.offset,
            format!("unsupported sample width {bytes_per_sample}"),
        )
    })?;
    let compression = field(buf, hdr::COMPRESSION, Field::u16)?;
    if compression != 0 {
        return Err(FormatError::corrupt(hdr::COMPRESSION.offset, "compressed data is not supported"));
    }
    let data_start = u64::from(field(buf, hdr::DATA_START, Field::u32)?);
    if data_start < hdr::FIXED_SIZE as u64 {
        return Err(FormatError::corrupt(
            hdr::DATA_START.offset,
            format!("data start {data_start} inside the fixed header"),
        ));
    }

    let date = |f: Field| field(buf, f, Field::u8).map(u32::from);
    let (day, month, year) = (date(hdr::START_DAY)?, date(hdr::START_MONTH)?, date(hdr::START_YEAR)?);
    let (hour, minute, second) = (
        date(hdr::START_HOUR)?,
        date(hdr::START_MINUTE)?,
        date(hdr::START_SECOND)?,
    );
    let recording_start = NaiveDate::from_ymd_opt(hdr::YEAR_BASE + year as i32, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(|| FormatError::corrupt(hdr::START_DAY.offset, "invalid recording date"))?;

    // anonymised files leave the birth date zeroed
    let birth = |f: Field| field(buf, f, Field::u8);
    let birth_date = NaiveDate::from_ymd_opt(
        hdr::YEAR_BASE + i32::from(birth(hdr::BIRTH_YEAR)?),
        u32::from(birth(hdr::BIRTH_MONTH)?),
        u32::from(birth(hdr::BIRTH_DAY)?),
    );

    let channels = read_channels(buf, &zones, channel_count as usize)?;
    let notes = read_notes(buf, find_zone(&zones, zone::NOTE)?)?;
    let markers = read_markers(buf, find_zone(&zones, zone::TRIGGER)?)?;

    let header = RecordingHeader {
        sampling_rate: f64::from(sampling_rate),
        channels,
        sample_width,
        recording_start,
        birth_date,
        version: header_type,
        title: field(buf, hdr::TITLE, Field::text)?,
        laboratory: field(buf, hdr::LABORATORY, Field::text)?,
        surname: field(buf, hdr::SURNAME, Field::text)?,
        first_name: field(buf, hdr::FIRST_NAME, Field::text)?,
        acquisition_unit: field(buf, hdr::ACQUISITION_UNIT, Field::i16)?,
        file_type: field(buf, hdr::FILE_TYPE, Field::u16)?,
    };

    Ok(HeaderRegion {
        header,
        markers,
        notes,
        data_start,
    })
}

fn read_channels(
    buf: &[u8],
    zones: &[(String, Zone)],
    count: usize,
) -> Result<Vec<ChannelDescriptor>, FormatError> {
    let order_zone = find_zone(zones, zone::ORDER)?;
    let order_bytes = zone_bytes(buf, order_zone, "ORDER zone")?;
    let labcod = zone_bytes(buf, find_zone(zones, zone::LABCOD)?, "LABCOD zone")?;

    (0..count)
        .map(|i| {
            let index = order::ENTRY.u16(order_bytes, i * order::SIZE).ok_or_else(|| {
                FormatError::corrupt(order_zone.position, format!("ORDER zone too short for channel {i}"))
            })? as usize;
            let base = index * electrode::SIZE;
            if base + electrode::SIZE > labcod.len() {
                return Err(FormatError::corrupt(
                    order_zone.position + i * order::SIZE,
                    format!("channel {i} refers to missing electrode record {index}"),
                ));
            }
            // The length check above covers every field below
            let i32_at = |f: Field| f.i32(labcod, base).unwrap_or_default();
            let u16_at = |f: Field| f.u16(labcod, base).unwrap_or_default();
            let desc = ChannelDescriptor {
                label: electrode::POSITIVE_INPUT.text(labcod, base).unwrap_or_default(),
                reference: electrode::NEGATIVE_INPUT.text(labcod, base).unwrap_or_default(),
                logic_min: i32_at(electrode::LOGIC_MIN),
                logic_max: i32_at(electrode::LOGIC_MAX),
                logic_ground: i32_at(electrode::LOGIC_GROUND),
                physical_min: i32_at(electrode::PHYSICAL_MIN),
                physical_max: i32_at(electrode::PHYSICAL_MAX),
                unit: MeasurementUnit::from_code(electrode::UNITS.i16(labcod, base).unwrap_or_default()),
                high_pass_limit: u16_at(electrode::HIGH_PASS_LIMIT),
                low_pass_limit: u16_at(electrode::LOW_PASS_LIMIT),
            };
            if desc.logic_max < desc.logic_min {
                return Err(FormatError::corrupt(
                    order_zone.position + i * order::SIZE,
                    format!("channel {} has inverted logic range", desc.name()),
                ));
            }
            Ok(desc)
        })
        .collect()
}

fn read_notes(buf: &[u8], z: Zone) -> Result<Vec<Note>, FormatError> {
    let bytes = zone_bytes(buf, z, "NOTE zone")?;
    Ok(bytes
        .chunks_exact(note::SIZE)
        .map_while(|rec| {
            let sample = note::SAMPLE.u32(rec, 0)?;
            (sample != 0).then(|| Note {
                sample: u64::from(sample),
                text: note::TEXT.text(rec, 0).unwrap_or_default(),
            })
        })
        .collect())
}

fn read_markers(buf: &[u8], z: Zone) -> Result<Vec<Marker>, FormatError> {
    let bytes = zone_bytes(buf, z, "TRIGGER zone")?;
    Ok(bytes
        .chunks_exact(trigger::SIZE)
        .map_while(|rec| {
            let sample = trigger::SAMPLE.u32(rec, 0)?;
            let code = trigger::CODE.u16(rec, 0)?;
            (sample != trigger::END_SAMPLE || code != trigger::END_CODE).then_some(Marker {
                sample: u64::from(sample),
                code,
            })
        })
        .collect())
}

/// Lazy TRC reader over any seekable byte source.
///
/// Opening reads only the header region. Samples are fetched on demand.
pub struct TrcReader<R> {
    inner: R,
    region: HeaderRegion,
    sample_count: u64,
}

impl TrcReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        TrcReader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> TrcReader<R> {
    pub fn new(mut inner: R) -> Result<Self, FormatError> {
        let file_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        if file_len < hdr::FIXED_SIZE as u64 {
            return Err(FormatError::TruncatedFile {
                region: "fixed header",
                needed: hdr::FIXED_SIZE as u64,
                actual: file_len,
            });
        }

        let mut region = vec![0u8; hdr::FIXED_SIZE];
        inner.read_exact(&mut region)?;
        let data_start = u64::from(field(&region, hdr::DATA_START, Field::u32)?);
        if data_start > file_len {
            return Err(FormatError::TruncatedFile {
                region: "data start",
                needed: data_start,
                actual: file_len,
            });
        }
        if data_start > hdr::FIXED_SIZE as u64 {
            region.resize(data_start as usize, 0);
            inner.read_exact(&mut region[hdr::FIXED_SIZE..])?;
        }

        let region = parse_header_region(&region)?;
        let frame = frame_size(&region.header);
        let data_len = file_len - region.data_start;
        if data_len % frame != 0 {
            return Err(FormatError::TruncatedFile {
                region: "data",
                needed: (data_len / frame + 1) * frame,
                actual: data_len,
            });
        }

        Ok(TrcReader {
            inner,
            sample_count: data_len / frame,
            region,
        })
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.region.header
    }

    pub fn markers(&self) -> &[Marker] {
        &self.region.markers
    }

    pub fn notes(&self) -> &[Note] {
        &self.region.notes
    }

    pub fn data_start(&self) -> u64 {
        self.region.data_start
    }

    /// Samples per channel
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Read `count` samples per channel starting at sample `start`
    pub fn read_samples(&mut self, start: u64, count: u64) -> Result<SampleBlock, FormatError> {
        let end = start.saturating_add(count);
        if end > self.sample_count {
            return Err(FormatError::OutOfRange {
                start,
                end,
                available: self.sample_count,
            });
        }
        let frame = frame_size(&self.region.header);
        let mut bytes = vec![0u8; (count * frame) as usize];
        self.inner
            .seek(SeekFrom::Start(self.region.data_start + start * frame))?;
        self.inner.read_exact(&mut bytes)?;

        let header = &self.region.header;
        SampleBlock::from_interleaved(start, header.channel_count(), header.sample_width, &bytes)
            .ok_or_else(|| FormatError::corrupt(hdr::DATA_START.offset, "data region misaligned"))
    }

    pub fn read_all(&mut self) -> Result<SampleBlock, FormatError> {
        self.read_samples(0, self.sample_count)
    }

    pub fn into_recording(mut self) -> Result<Recording, FormatError> {
        let samples = self.read_all()?;
        Ok(Recording {
            header: self.region.header,
            markers: self.region.markers,
            notes: self.region.notes,
            samples,
        })
    }

    pub fn into_parts(self) -> (R, HeaderRegion) {
        (self.inner, self.region)
    }
}

fn frame_size(header: &RecordingHeader) -> u64 {
    (header.channel_count() * header.sample_width.bytes()) as u64
}
