//! Wire formats spoken by the device.
//!
//! Each [Scheme] turns one complete frame into a [Message] (never failing:
//! bad frames come back as invalid messages) and turns a [Message] back into
//! a frame.
mod binary;
pub(crate) mod readable;
mod rtcm;

pub use binary::BinaryScheme;
pub use readable::{ConfigMode, ReadableScheme};
pub use rtcm::RtcmScheme;

use crate::{
    error::Error,
    message::{Message, ParseError, Value},
};

/// Outcome of probing a buffer that starts on a frame marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// A whole frame of this many bytes is available
    Complete(usize),
    /// More bytes are needed
    Incomplete,
    /// The marker does not start a plausible frame
    Invalid,
}

pub trait Scheme: Sync {
    /// Bytes that open every frame.
    fn preamble(&self) -> &'static [u8];

    /// Probes `buf` (starting at a preamble) for a frame boundary.
    fn frame_len(&self, buf: &[u8]) -> FrameLen;

    /// Decodes one complete frame.
    fn parse_message(&self, raw: &[u8]) -> Message;

    /// Encodes one message, frame markers and checksum included.
    fn build_message_general(&self, msg: &Message) -> Result<Vec<u8>, Error>;
}

/// Tagged scheme choice, selected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchemeKind {
    #[default]
    Readable,
    Rtcm,
    Binary,
}

impl SchemeKind {
    pub const ALL: [Self; 3] = [Self::Readable, Self::Rtcm, Self::Binary];

    pub fn scheme(&self) -> &'static dyn Scheme {
        match self {
            Self::Readable => &ReadableScheme,
            Self::Rtcm => &RtcmScheme,
            Self::Binary => &BinaryScheme,
        }
    }

    /// Scheme designated by the "mfm" (message format) configuration value.
    pub fn from_mfm(value: &[u8]) -> Option<Self> {
        match value {
            b"1" => Some(Self::Readable),
            b"4" => Some(Self::Rtcm),
            _ => None,
        }
    }
}

impl std::fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Readable => write!(f, "ASCII"),
            Self::Rtcm => write!(f, "RTCM"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// Little endian integer widths used by binary payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Width {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

impl Width {
    pub fn size(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 => 4,
            Self::I64 | Self::U64 => 8,
        }
    }

    fn signed(&self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    fn read(&self, bytes: &[u8]) -> i128 {
        let mut le = [0u8; 8];
        le[..bytes.len()].copy_from_slice(bytes);
        match self {
            Self::I8 => bytes[0] as i8 as i128,
            Self::U8 => bytes[0] as i128,
            Self::I16 => i16::from_le_bytes([le[0], le[1]]) as i128,
            Self::U16 => u16::from_le_bytes([le[0], le[1]]) as i128,
            Self::I32 => i32::from_le_bytes([le[0], le[1], le[2], le[3]]) as i128,
            Self::U32 => u32::from_le_bytes([le[0], le[1], le[2], le[3]]) as i128,
            Self::I64 => i64::from_le_bytes(le) as i128,
            Self::U64 => u64::from_le_bytes(le) as i128,
        }
    }

    fn range(&self) -> (i128, i128) {
        match self {
            Self::I8 => (i8::MIN as i128, i8::MAX as i128),
            Self::U8 => (0, u8::MAX as i128),
            Self::I16 => (i16::MIN as i128, i16::MAX as i128),
            Self::U16 => (0, u16::MAX as i128),
            Self::I32 => (i32::MIN as i128, i32::MAX as i128),
            Self::U32 => (0, u32::MAX as i128),
            Self::I64 => (i64::MIN as i128, i64::MAX as i128),
            Self::U64 => (0, u64::MAX as i128),
        }
    }

    fn write(&self, value: i128, out: &mut Vec<u8>) -> bool {
        let (min, max) = self.range();
        if value < min || value > max {
            return false;
        }
        // two's complement truncation is exact once in range
        let bytes = (value as i64).to_le_bytes();
        let bytes = if matches!(self, Self::U64) {
            (value as u64).to_le_bytes()
        } else {
            bytes
        };
        out.extend_from_slice(&bytes[..self.size()]);
        true
    }
}

/// One entry of a binary payload layout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BinField {
    pub name: &'static str,
    pub width: Width,
    pub scale: Option<f64>,
}

pub(crate) const fn raw(name: &'static str, width: Width) -> BinField {
    BinField {
        name,
        width,
        scale: None,
    }
}

pub(crate) const fn scaled(name: &'static str, width: Width, scale: f64) -> BinField {
    BinField {
        name,
        width,
        scale: Some(scale),
    }
}

pub(crate) fn layout_size(layout: &[BinField]) -> usize {
    layout.iter().map(|f| f.width.size()).sum()
}

/// Decodes `payload` according to `layout`. Scaled entries become floats,
/// the others keep their integer signedness.
pub(crate) fn decode_layout(
    msg: &mut Message,
    layout: &[BinField],
    payload: &[u8],
) -> Result<(), ParseError> {
    if payload.len() < layout_size(layout) {
        return Err(ParseError::FieldDecode);
    }
    let mut offset = 0;
    for field in layout {
        let size = field.width.size();
        let value = field.width.read(&payload[offset..offset + size]);
        offset += size;
        let value = match field.scale {
            Some(scale) => Value::Float(value as f64 * scale),
            None if field.width.signed() => Value::Int(value as i64),
            None => Value::UInt(value as u64),
        };
        msg.set(field.name, value);
    }
    Ok(())
}

/// Encodes `msg` fields according to `layout`.
pub(crate) fn encode_layout(
    msg: &Message,
    layout: &[BinField],
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    for field in layout {
        let value = msg
            .get(field.name)
            .ok_or_else(|| Error::Encode(field.name.to_string()))?;
        let int = match (field.scale, value) {
            (Some(scale), value) => value
                .as_f64()
                .map(|v| (v / scale).round() as i128),
            (None, Value::Int(v)) => Some(*v as i128),
            (None, Value::UInt(v)) => Some(*v as i128),
            (None, Value::Float(v)) => Some(v.round() as i128),
            (None, Value::Text(_)) => None,
        }
        .ok_or_else(|| Error::Encode(field.name.to_string()))?;
        if !field.width.write(int, out) {
            return Err(Error::Encode(field.name.to_string()));
        }
    }
    Ok(())
}

/// Heading flag bits, least significant first.
pub(crate) const HEADING_FLAGS: [&str; 10] = [
    "gnssFixOK",
    "diffSoln",
    "relPosValid",
    "carrSoln_bit1",
    "carrSoln_bit2",
    "isMoving",
    "refPosMiss",
    "refObsMiss",
    "relPosHeading_Valid",
    "relPos_Normalized",
];

/// Expands the HDG "flags" word into one field per bit, plus "carrSoln".
pub(crate) fn extract_heading_flags(msg: &mut Message) {
    let Some(flags) = msg.u64("flags") else {
        return;
    };
    for (bit, name) in HEADING_FLAGS.iter().enumerate() {
        msg.set(name, ((flags >> bit) & 1) as i64);
    }
    let carr = 2 * ((flags >> 4) & 1) + ((flags >> 3) & 1);
    msg.set("carrSoln", carr as i64);
}

/// Adds millisecond time fields next to nanosecond ones.
pub(crate) fn derive_ms_times(msg: &mut Message) {
    for (ns, ms) in [
        ("imu_time_ns", "imu_time_ms"),
        ("sync_time_ns", "sync_time_ms"),
        ("odometer_time_ns", "odometer_time_ms"),
    ] {
        if let Some(t) = msg.f64(ns) {
            msg.set(ms, t / 1.0E6);
        }
    }
}

/// Splits the packed carrier solution / fix type byte.
pub(crate) fn unpack_carrsoln_and_fix(msg: &mut Message) {
    if let Some(packed) = msg.u64("carrsoln_and_fix") {
        msg.set("carrier_solution_status", (packed / 16) as i64);
        msg.set("gnss_fix_type", (packed % 16) as i64);
    }
}

#[cfg(test)]
mod test {
    use super::{
        decode_layout, encode_layout, extract_heading_flags, raw, scaled,
        unpack_carrsoln_and_fix, SchemeKind, Width,
    };
    use crate::message::{Message, MsgType, ParseError};

    #[test]
    fn test_layout_codec() {
        let layout = [
            raw("time", Width::U64),
            scaled("lat", Width::I32, 1.0E-7),
            raw("count", Width::I8),
        ];
        let mut payload = Vec::new();
        payload.extend_from_slice(&1234u64.to_le_bytes());
        payload.extend_from_slice(&(-373_000_000i32).to_le_bytes());
        payload.push(0xFE);

        let mut msg = Message::new(MsgType::GPS);
        decode_layout(&mut msg, &layout, &payload).unwrap();
        assert_eq!(msg.u64("time"), Some(1234));
        assert!((msg.f64("lat").unwrap() + 37.3).abs() < 1.0E-9);
        assert_eq!(msg.i64("count"), Some(-2));

        let mut out = Vec::new();
        encode_layout(&msg, &layout, &mut out).unwrap();
        assert_eq!(out, payload);

        let mut short = Message::new(MsgType::GPS);
        assert_eq!(
            decode_layout(&mut short, &layout, &payload[..5]),
            Err(ParseError::FieldDecode)
        );
    }

    #[test]
    fn test_encode_out_of_range() {
        let layout = [raw("sats", Width::U8)];
        let msg = Message::new(MsgType::GPS).with("sats", 300i64);
        let mut out = Vec::new();
        assert!(encode_layout(&msg, &layout, &mut out).is_err());
    }

    #[test]
    fn test_carrsoln_unpack() {
        let mut msg = Message::new(MsgType::GPS).with("carrsoln_and_fix", 0x25u64);
        unpack_carrsoln_and_fix(&mut msg);
        assert_eq!(msg.i64("carrier_solution_status"), Some(2));
        assert_eq!(msg.i64("gnss_fix_type"), Some(5));
    }

    #[test]
    fn test_heading_flags() {
        // gnssFixOK, relPosValid, carrSoln_bit2, relPosHeading_Valid
        let mut msg = Message::new(MsgType::HDG).with("flags", 0b01_0001_0101i64);
        extract_heading_flags(&mut msg);
        assert_eq!(msg.i64("gnssFixOK"), Some(1));
        assert_eq!(msg.i64("diffSoln"), Some(0));
        assert_eq!(msg.i64("relPosValid"), Some(1));
        assert_eq!(msg.i64("carrSoln_bit1"), Some(0));
        assert_eq!(msg.i64("carrSoln_bit2"), Some(1));
        assert_eq!(msg.i64("relPosHeading_Valid"), Some(1));
        assert_eq!(msg.i64("carrSoln"), Some(2));
    }

    #[test]
    fn test_mfm() {
        assert_eq!(SchemeKind::from_mfm(b"1"), Some(SchemeKind::Readable));
        assert_eq!(SchemeKind::from_mfm(b"4"), Some(SchemeKind::Rtcm));
        assert_eq!(SchemeKind::from_mfm(b"9"), None);
    }
}
