//! Field layout table for the TRC header region and the wire frames.
//!
//! Every byte offset used by the TRC reader, the TRC writer and the frame
//! codec is declared here once, together with its width and type.
//!
//! ```text
//! TRC file (System98, header type 4)
//! ┌──────────────────────────────┐ 0
//! │ fixed header (title .. type) │
//! ├──────────────────────────────┤ 176
//! │ zone table, 15 × 16 bytes    │
//! ├──────────────────────────────┤ 640 (as written by TrcWriter)
//! │ ORDER, LABCOD, NOTE, TRIGGER │
//! ├──────────────────────────────┤ data start
//! │ interleaved samples          │
//! └──────────────────────────────┘
//! ```

use std::ops::Range;

/// Semantic type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// ISO-8859-1 text, NUL or space padded
    Text,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    U16Be,
    U32Be,
    U64Be,
}

/// One entry of the layout table: where a value lives relative to the start
/// of its record, and how it is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
    pub kind: FieldType,
}

impl Field {
    pub const fn new(name: &'static str, offset: usize, width: usize, kind: FieldType) -> Self {
        Field {
            name,
            offset,
            width,
            kind,
        }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.width
    }

    /// Absolute byte range of this field inside a record starting at `base`
    pub fn range(&self, base: usize) -> Range<usize> {
        base + self.offset..base + self.end()
    }

    pub fn bytes<'a>(&self, buf: &'a [u8], base: usize) -> Option<&'a [u8]> {
        buf.get(self.range(base))
    }

    fn array<const N: usize>(&self, buf: &[u8], base: usize) -> Option<[u8; N]> {
        debug_assert_eq!(self.width, N, "field {} read with wrong width", self.name);
        self.bytes(buf, base)?.try_into().ok()
    }

    pub fn u8(&self, buf: &[u8], base: usize) -> Option<u8> {
        self.array::<1>(buf, base).map(|b| b[0])
    }

    pub fn i8(&self, buf: &[u8], base: usize) -> Option<i8> {
        self.array(buf, base).map(i8::from_le_bytes)
    }

    pub fn u16(&self, buf: &[u8], base: usize) -> Option<u16> {
        match self.kind {
            FieldType::U16Be => self.array(buf, base).map(u16::from_be_bytes),
            _ => self.array(buf, base).map(u16::from_le_bytes),
        }
    }

    pub fn i16(&self, buf: &[u8], base: usize) -> Option<i16> {
        self.array(buf, base).map(i16::from_le_bytes)
    }

    pub fn u32(&self, buf: &[u8], base: usize) -> Option<u32> {
        match self.kind {
            FieldType::U32Be => self.array(buf, base).map(u32::from_be_bytes),
            _ => self.array(buf, base).map(u32::from_le_bytes),
        }
    }

    pub fn i32(&self, buf: &[u8], base: usize) -> Option<i32> {
        self.array(buf, base).map(i32::from_le_bytes)
    }

    pub fn f32(&self, buf: &[u8], base: usize) -> Option<f32> {
        self.array(buf, base).map(f32::from_le_bytes)
    }

    pub fn u64(&self, buf: &[u8], base: usize) -> Option<u64> {
        self.array(buf, base).map(u64::from_be_bytes)
    }

    pub fn text(&self, buf: &[u8], base: usize) -> Option<String> {
        self.bytes(buf, base).map(latin1_string)
    }

    /// Copy `value` into the field, truncating or zero padding to its width.
    /// Writes that fall outside `buf` are ignored.
    pub fn put(&self, buf: &mut [u8], base: usize, value: &[u8]) {
        if let Some(dst) = buf.get_mut(self.range(base)) {
            let n = value.len().min(dst.len());
            dst[..n].copy_from_slice(&value[..n]);
            dst[n..].fill(0);
        }
    }

    pub fn put_u16(&self, buf: &mut [u8], base: usize, value: u16) {
        match self.kind {
            FieldType::U16Be => self.put(buf, base, &value.to_be_bytes()),
            _ => self.put(buf, base, &value.to_le_bytes()),
        }
    }

    pub fn put_u32(&self, buf: &mut [u8], base: usize, value: u32) {
        match self.kind {
            FieldType::U32Be => self.put(buf, base, &value.to_be_bytes()),
            _ => self.put(buf, base, &value.to_le_bytes()),
        }
    }

    pub fn put_u64(&self, buf: &mut [u8], base: usize, value: u64) {
        self.put(buf, base, &value.to_be_bytes());
    }

    pub fn put_text(&self, buf: &mut [u8], base: usize, value: &str) {
        self.put(buf, base, &latin1_bytes(value));
    }
}

/// Decode ISO-8859-1 bytes up to the first NUL, trimming padding
pub fn latin1_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let s: String = bytes[..end].iter().map(|&b| b as char).collect();
    s.trim().to_string()
}

/// Encode text as ISO-8859-1; characters outside Latin-1 become '?'
pub fn latin1_bytes(value: &str) -> Vec<u8> {
    value
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

// =============================================================================
// TRC fixed header
// =============================================================================

/// Montage, video and MPEG fields have no reader or writer use; they are
/// listed so that the record layout is complete.
pub mod header {
    use super::{Field, FieldType::*};

    pub const TITLE: Field = Field::new("title", 0, 32, Text);
    pub const LABORATORY: Field = Field::new("laboratory", 32, 32, Text);
    pub const SURNAME: Field = Field::new("surname", 64, 22, Text);
    pub const FIRST_NAME: Field = Field::new("first name", 86, 20, Text);
    pub const BIRTH_MONTH: Field = Field::new("birth month", 106, 1, U8);
    pub const BIRTH_DAY: Field = Field::new("birth day", 107, 1, U8);
    pub const BIRTH_YEAR: Field = Field::new("birth year", 108, 1, U8);
    pub const START_DAY: Field = Field::new("start day", 128, 1, U8);
    pub const START_MONTH: Field = Field::new("start month", 129, 1, U8);
    pub const START_YEAR: Field = Field::new("start year", 130, 1, U8);
    pub const START_HOUR: Field = Field::new("start hour", 131, 1, U8);
    pub const START_MINUTE: Field = Field::new("start minute", 132, 1, U8);
    pub const START_SECOND: Field = Field::new("start second", 133, 1, U8);
    pub const ACQUISITION_UNIT: Field = Field::new("acquisition unit", 134, 2, I16);
    pub const FILE_TYPE: Field = Field::new("file type", 136, 2, U16);
    pub const DATA_START: Field = Field::new("data start", 138, 4, U32);
    pub const CHANNEL_COUNT: Field = Field::new("channel count", 142, 2, U16);
    pub const MULTIPLEXER: Field = Field::new("multiplexer", 144, 2, U16);
    pub const SAMPLING_RATE: Field = Field::new("sampling rate", 146, 2, U16);
    pub const BYTES_PER_SAMPLE: Field = Field::new("bytes per sample", 148, 2, U16);
    pub const COMPRESSION: Field = Field::new("compression", 150, 2, U16);
    pub const MONTAGES: Field = Field::new("montages", 152, 2, U16);
    pub const VIDEO_BEGIN: Field = Field::new("video begin", 154, 4, U32);
    pub const MPEG_DELAY: Field = Field::new("mpeg delay", 158, 2, U16);
    pub const HEADER_TYPE: Field = Field::new("header type", 175, 1, I8);

    pub const ZONE_TABLE: usize = 176;
    pub const ZONE_COUNT: usize = 15;
    /// Bytes up to the end of the zone table
    pub const FIXED_SIZE: usize = ZONE_TABLE + ZONE_COUNT * super::zone::SIZE;
    /// Where TrcWriter places the first zone
    pub const FIRST_ZONE: usize = 640;

    /// System98 header type, the only one with the zone table above
    pub const SYSTEM98: i8 = 4;
    pub const YEAR_BASE: i32 = 1900;
}

/// One 16-byte entry of the zone table
pub mod zone {
    use super::{Field, FieldType::*};

    pub const NAME: Field = Field::new("zone name", 0, 8, Text);
    pub const POSITION: Field = Field::new("zone position", 8, 4, U32);
    pub const LENGTH: Field = Field::new("zone length", 12, 4, U32);
    pub const SIZE: usize = 16;

    pub const ORDER: &str = "ORDER";
    pub const LABCOD: &str = "LABCOD";
    pub const NOTE: &str = "NOTE";
    pub const TRIGGER: &str = "TRIGGER";

    /// Zone names in table order
    pub const NAMES: [&str; super::header::ZONE_COUNT] = [
        "ORDER", "LABCOD", "NOTE", "FLAGS", "TRONCA", "IMPED_B", "IMPED_E", "MONTAGE",
        "COMPRESS", "AVERAGE", "HISTORY", "DVIDEO", "EVENT A", "EVENT B", "TRIGGER",
    ];
}

/// ORDER zone: one u16 per channel, indexing the LABCOD records
pub mod order {
    use super::{Field, FieldType::*};

    pub const ENTRY: Field = Field::new("order entry", 0, 2, U16);
    pub const SIZE: usize = 2;
}

/// LABCOD zone: one 128-byte electrode record per input. Filter types,
/// position and coordinate fields are listed for completeness only.
pub mod electrode {
    use super::{Field, FieldType::*};

    pub const STATUS: Field = Field::new("status", 0, 1, U8);
    pub const TYPE: Field = Field::new("type", 1, 1, U8);
    pub const POSITIVE_INPUT: Field = Field::new("positive input", 2, 6, Text);
    pub const NEGATIVE_INPUT: Field = Field::new("negative input", 8, 6, Text);
    pub const LOGIC_MIN: Field = Field::new("logic min", 14, 4, I32);
    pub const LOGIC_MAX: Field = Field::new("logic max", 18, 4, I32);
    pub const LOGIC_GROUND: Field = Field::new("logic ground", 22, 4, I32);
    pub const PHYSICAL_MIN: Field = Field::new("physical min", 26, 4, I32);
    pub const PHYSICAL_MAX: Field = Field::new("physical max", 30, 4, I32);
    pub const UNITS: Field = Field::new("units", 34, 2, I16);
    pub const HIGH_PASS_LIMIT: Field = Field::new("high pass limit", 36, 2, U16);
    pub const HIGH_PASS_TYPE: Field = Field::new("high pass type", 38, 2, U16);
    pub const LOW_PASS_LIMIT: Field = Field::new("low pass limit", 40, 2, U16);
    pub const LOW_PASS_TYPE: Field = Field::new("low pass type", 42, 2, U16);
    pub const RATE_COEFFICIENT: Field = Field::new("rate coefficient", 44, 2, U16);
    pub const POSITION: Field = Field::new("position", 46, 2, U16);
    pub const LATITUDE: Field = Field::new("latitude", 48, 4, F32);
    pub const LONGITUDE: Field = Field::new("longitude", 52, 4, F32);
    pub const PRESENT_IN_MAP: Field = Field::new("present in map", 56, 1, U8);
    pub const IS_IN_AVERAGE: Field = Field::new("is in average", 57, 1, U8);
    pub const DESCRIPTION: Field = Field::new("description", 58, 32, Text);
    pub const X: Field = Field::new("x", 90, 4, F32);
    pub const Y: Field = Field::new("y", 94, 4, F32);
    pub const Z: Field = Field::new("z", 98, 4, F32);
    pub const COORDINATE_TYPE: Field = Field::new("coordinate type", 102, 2, U16);
    pub const SIZE: usize = 128;
}

/// NOTE zone: list ends at the first record with sample 0
pub mod note {
    use super::{Field, FieldType::*};

    pub const SAMPLE: Field = Field::new("note sample", 0, 4, U32);
    pub const TEXT: Field = Field::new("note text", 4, 40, Text);
    pub const SIZE: usize = 44;
}

/// TRIGGER zone: list ends at the sentinel record
pub mod trigger {
    use super::{Field, FieldType::*};

    pub const SAMPLE: Field = Field::new("trigger sample", 0, 4, U32);
    pub const CODE: Field = Field::new("trigger code", 4, 2, U16);
    pub const SIZE: usize = 6;
    pub const END_SAMPLE: u32 = 0xFFFF_FFFF;
    pub const END_CODE: u16 = 0xFFFF;
}

// =============================================================================
// Wire frames
// =============================================================================

/// Frame header shared by every frame kind
pub mod frame {
    use super::{Field, FieldType::*};

    pub const KIND: Field = Field::new("frame kind", 0, 1, U8);
    pub const LENGTH: Field = Field::new("payload length", 1, 4, U32Be);
    pub const HEADER_SIZE: usize = 5;
    /// Largest payload a decoder accepts
    pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;
}

pub mod data_frame {
    use super::{Field, FieldType::*};

    pub const START: Field = Field::new("start sample", 0, 8, U64Be);
    pub const CHANNELS: Field = Field::new("channel count", 8, 2, U16Be);
    pub const WIDTH: Field = Field::new("sample width", 10, 1, U8);
    pub const PREFIX: usize = 11;
}

pub mod marker_frame {
    use super::{Field, FieldType::*};

    pub const SAMPLE: Field = Field::new("marker sample", 0, 8, U64Be);
    pub const CODE: Field = Field::new("marker code", 8, 2, U16Be);
    pub const SIZE: usize = 10;
}

pub mod note_frame {
    use super::{Field, FieldType::*};

    pub const SAMPLE: Field = Field::new("note sample", 0, 8, U64Be);
    pub const TEXT_LENGTH: Field = Field::new("note length", 8, 2, U16Be);
    pub const PREFIX: usize = 10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_text() {
        assert_eq!(latin1_string(b"Fp1\0\0\0"), "Fp1");
        assert_eq!(latin1_string(b"  G2  "), "G2");
        assert_eq!(latin1_string(&[0x4D, 0xFC, 0x6C, 0x6C]), "Müll");
        assert_eq!(latin1_bytes("Müll€"), vec![0x4D, 0xFC, 0x6C, 0x6C, b'?']);
    }

    #[test]
    fn test_fields_do_not_overlap() {
        let fixed = [
            header::TITLE,
            header::LABORATORY,
            header::SURNAME,
            header::FIRST_NAME,
            header::BIRTH_MONTH,
            header::BIRTH_DAY,
            header::BIRTH_YEAR,
            header::START_DAY,
            header::START_MONTH,
            header::START_YEAR,
            header::START_HOUR,
            header::START_MINUTE,
            header::START_SECOND,
            header::ACQUISITION_UNIT,
            header::FILE_TYPE,
            header::DATA_START,
            header::CHANNEL_COUNT,
            header::MULTIPLEXER,
            header::SAMPLING_RATE,
            header::BYTES_PER_SAMPLE,
            header::COMPRESSION,
            header::MONTAGES,
            header::VIDEO_BEGIN,
            header::MPEG_DELAY,
            header::HEADER_TYPE,
        ];
        for pair in fixed.windows(2) {
            assert!(pair[0].end() <= pair[1].offset, "{} overlaps {}", pair[0].name, pair[1].name);
        }
        assert!(header::HEADER_TYPE.end() <= header::ZONE_TABLE);
        assert_eq!(header::FIXED_SIZE, 416);
        assert!(electrode::COORDINATE_TYPE.end() <= electrode::SIZE);
    }

    #[test]
    fn test_endianness_follows_field_type() {
        let mut buf = [0u8; 8];
        frame::LENGTH.put_u32(&mut buf, 0, 0x0102_0304);
        assert_eq!(&buf[1..5], &[1, 2, 3, 4]);
        assert_eq!(frame::LENGTH.u32(&buf, 0), Some(0x0102_0304));

        header::DATA_START.put_u32(&mut buf, 0, 0x0102_0304);
        // DATA_START lives at 138, far outside this buffer
        assert_eq!(header::DATA_START.u32(&buf, 0), None);
        trigger::SAMPLE.put_u32(&mut buf, 0, 0x0102_0304);
        assert_eq!(&buf[0..4], &[4, 3, 2, 1]);
    }
}
