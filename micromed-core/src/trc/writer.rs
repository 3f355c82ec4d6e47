use chrono::{Datelike, Timelike};
use std::io::Write;

use crate::error::FormatError;
use crate::layout::{electrode, header as hdr, latin1_bytes, note, order, trigger, zone, Field};
use crate::types::{Marker, Note, RecordingHeader, SampleBlock};

/// Writes System98 TRC files and header regions
pub struct TrcWriter<'a> {
    header: &'a RecordingHeader,
    markers: &'a [Marker],
    notes: &'a [Note],
}

fn unencodable(field: &'static str, reason: impl Into<String>) -> FormatError {
    FormatError::Unencodable {
        field,
        reason: reason.into(),
    }
}

fn checked_text(field: Field, value: &str) -> Result<Vec<u8>, FormatError> {
    let bytes = latin1_bytes(value);
    if bytes.len() > field.width {
        return Err(unencodable(
            field.name,
            format!("'{value}' is longer than {} bytes", field.width),
        ));
    }
    Ok(bytes)
}

impl<'a> TrcWriter<'a> {
    pub fn new(header: &'a RecordingHeader) -> Self {
        TrcWriter {
            header,
            markers: &[],
            notes: &[],
        }
    }

    pub fn with_markers(mut self, markers: &'a [Marker]) -> Self {
        self.markers = markers;
        self
    }

    /// Notes at sample 0 cannot be stored: a zero sample ends the note list
    pub fn with_notes(mut self, notes: &'a [Note]) -> Self {
        self.notes = notes;
        self
    }

    /// Everything up to the data start: fixed header, zone table and zones
    pub fn header_region(&self) -> Result<Vec<u8>, FormatError> {
        let h = self.header;
        let channel_count = u16::try_from(h.channel_count())
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| unencodable("channel count", format!("{}", h.channel_count())))?;
        let rate = h.sampling_rate;
        if rate.fract() != 0.0 || !(1.0..=f64::from(u16::MAX)).contains(&rate) {
            return Err(unencodable("sampling rate", format!("{rate} Hz is not a u16 integer")));
        }

        let sizes = [
            (zone::ORDER, h.channel_count() * order::SIZE),
            (zone::LABCOD, h.channel_count() * electrode::SIZE),
            (zone::NOTE, (self.notes.len() + 1) * note::SIZE),
            (zone::TRIGGER, (self.markers.len() + 1) * trigger::SIZE),
        ];
        let mut zones = Vec::with_capacity(hdr::ZONE_COUNT);
        let mut position = hdr::FIRST_ZONE;
        for name in zone::NAMES {
            let length = sizes
                .iter()
                .find(|(n, _)| *n == name)
                .map_or(0, |(_, len)| *len);
            zones.push((name, position, length));
            position += length;
        }
        let data_start = position;
        let mut buf = vec![0u8; data_start];

        hdr::TITLE.put(&mut buf, 0, &checked_text(hdr::TITLE, &h.title)?);
        hdr::LABORATORY.put(&mut buf, 0, &checked_text(hdr::LABORATORY, &h.laboratory)?);
        hdr::SURNAME.put(&mut buf, 0, &checked_text(hdr::SURNAME, &h.surname)?);
        hdr::FIRST_NAME.put(&mut buf, 0, &checked_text(hdr::FIRST_NAME, &h.first_name)?);

        let start = h.recording_start;
        let year = u8::try_from(start.year() - hdr::YEAR_BASE)
            .map_err(|_| unencodable("recording start", format!("year {} out of range", start.year())))?;
        let date = [
            (hdr::START_DAY, start.day() as u8),
            (hdr::START_MONTH, start.month() as u8),
            (hdr::START_YEAR, year),
            (hdr::START_HOUR, start.hour() as u8),
            (hdr::START_MINUTE, start.minute() as u8),
            (hdr::START_SECOND, start.second() as u8),
        ];
        for (f, v) in date {
            f.put(&mut buf, 0, &[v]);
        }

        if let Some(born) = h.birth_date {
            let year = u8::try_from(born.year() - hdr::YEAR_BASE)
                .map_err(|_| unencodable("birth date", format!("year {} out of range", born.year())))?;
            hdr::BIRTH_MONTH.put(&mut buf, 0, &[born.month() as u8]);
            hdr::BIRTH_DAY.put(&mut buf, 0, &[born.day() as u8]);
            hdr::BIRTH_YEAR.put(&mut buf, 0, &[year]);
        }

        hdr::ACQUISITION_UNIT.put(&mut buf, 0, &h.acquisition_unit.to_le_bytes());
        hdr::FILE_TYPE.put_u16(&mut buf, 0, h.file_type);
        hdr::DATA_START.put_u32(&mut buf, 0, data_start as u32);
        hdr::CHANNEL_COUNT.put_u16(&mut buf, 0, channel_count);
        hdr::MULTIPLEXER.put_u16(&mut buf, 0, channel_count * h.sample_width.bytes() as u16);
        hdr::SAMPLING_RATE.put_u16(&mut buf, 0, rate as u16);
        hdr::BYTES_PER_SAMPLE.put_u16(&mut buf, 0, h.sample_width.bytes() as u16);
        hdr::HEADER_TYPE.put(&mut buf, 0, &h.version.to_le_bytes());

        for (i, (name, position, length)) in zones.iter().enumerate() {
            let base = hdr::ZONE_TABLE + i * zone::SIZE;
            zone::NAME.put(&mut buf, base, format!("{name:<8}").as_bytes());
            zone::POSITION.put_u32(&mut buf, base, *position as u32);
            zone::LENGTH.put_u32(&mut buf, base, *length as u32);
        }
        let zone_start = |name: &str| {
            zones
                .iter()
                .find(|(n, ..)| *n == name)
                .map_or(0, |(_, position, _)| *position)
        };

        let order_base = zone_start(zone::ORDER);
        let labcod_base = zone_start(zone::LABCOD);
        for (i, ch) in h.channels.iter().enumerate() {
            order::ENTRY.put_u16(&mut buf, order_base + i * order::SIZE, i as u16);

            let base = labcod_base + i * electrode::SIZE;
            electrode::STATUS.put(&mut buf, base, &[1]);
            electrode::POSITIVE_INPUT.put(&mut buf, base, &checked_text(electrode::POSITIVE_INPUT, &ch.label)?);
            electrode::NEGATIVE_INPUT.put(&mut buf, base, &checked_text(electrode::NEGATIVE_INPUT, &ch.reference)?);
            for (f, v) in [
                (electrode::LOGIC_MIN, ch.logic_min),
                (electrode::LOGIC_MAX, ch.logic_max),
                (electrode::LOGIC_GROUND, ch.logic_ground),
                (electrode::PHYSICAL_MIN, ch.physical_min),
                (electrode::PHYSICAL_MAX, ch.physical_max),
            ] {
                f.put(&mut buf, base, &v.to_le_bytes());
            }
            electrode::UNITS.put(&mut buf, base, &ch.unit.code().to_le_bytes());
            electrode::HIGH_PASS_LIMIT.put_u16(&mut buf, base, ch.high_pass_limit);
            electrode::LOW_PASS_LIMIT.put_u16(&mut buf, base, ch.low_pass_limit);
            electrode::RATE_COEFFICIENT.put_u16(&mut buf, base, 1);
        }

        let note_base = zone_start(zone::NOTE);
        for (i, n) in self.notes.iter().enumerate() {
            let sample = u32::try_from(n.sample)
                .ok()
                .filter(|&s| s != 0)
                .ok_or_else(|| unencodable("note sample", format!("{}", n.sample)))?;
            let base = note_base + i * note::SIZE;
            note::SAMPLE.put_u32(&mut buf, base, sample);
            note::TEXT.put(&mut buf, base, &checked_text(note::TEXT, &n.text)?);
        }
        // The zeroed record after the last note ends the list

        let trigger_base = zone_start(zone::TRIGGER);
        for (i, m) in self.markers.iter().enumerate() {
            let sample = u32::try_from(m.sample)
                .ok()
                .filter(|&s| s != trigger::END_SAMPLE)
                .ok_or_else(|| unencodable("marker sample", format!("{}", m.sample)))?;
            let base = trigger_base + i * trigger::SIZE;
            trigger::SAMPLE.put_u32(&mut buf, base, sample);
            trigger::CODE.put_u16(&mut buf, base, m.code);
        }
        let end = trigger_base + self.markers.len() * trigger::SIZE;
        trigger::SAMPLE.put_u32(&mut buf, end, trigger::END_SAMPLE);
        trigger::CODE.put_u16(&mut buf, end, trigger::END_CODE);

        Ok(buf)
    }

    pub fn write<W: Write>(&self, out: &mut W, samples: &SampleBlock) -> Result<(), FormatError> {
        if samples.width() != self.header.sample_width {
            return Err(unencodable(
                "samples",
                format!("{} samples in a {} file", samples.width(), self.header.sample_width),
            ));
        }
        if samples.channel_count() != self.header.channel_count() {
            return Err(unencodable(
                "samples",
                format!(
                    "{} channels in a {} channel file",
                    samples.channel_count(),
                    self.header.channel_count()
                ),
            ));
        }
        out.write_all(&self.header_region()?)?;
        let mut data = Vec::new();
        samples.write_interleaved(&mut data);
        out.write_all(&data)?;
        Ok(())
    }

    pub fn to_bytes(&self, samples: &SampleBlock) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::new();
        self.write(&mut out, samples)?;
        Ok(out)
    }
}
