//! Comma separated ASCII frames: `#APTYP,field,field*CS\r\n`
use crate::{
    error::Error,
    message::{Configurations, Message, MsgType, ParseError},
    scheme::{extract_heading_flags, FrameLen, Scheme},
};

const START: u8 = b'#';
const NMEA_START: u8 = b'$';
const END: &[u8] = b"\r\n";
const TALKER: &[u8] = b"AP";
const CHECKSUM_SEPARATOR: u8 = b'*';
const SEPARATOR: u8 = b',';
const HEADER_LEN: usize = 5;

/// Frames longer than this without a terminator are noise.
const MAX_FRAME_LEN: usize = 1024;

/// CFG / VEH / SEN access modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    ReadRam,
    WriteRam,
    ReadFlash,
    WriteFlash,
}

impl ConfigMode {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::ReadRam => b"r",
            Self::WriteRam => b"w",
            Self::ReadFlash => b"R",
            Self::WriteFlash => b"W",
        }
    }

    fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"r" => Some(Self::ReadRam),
            b"w" => Some(Self::WriteRam),
            b"R" => Some(Self::ReadFlash),
            b"W" => Some(Self::WriteFlash),
            _ => None,
        }
    }

    fn is_read(&self) -> bool {
        matches!(self, Self::ReadRam | Self::ReadFlash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Int,
    Float,
    Text,
    /// hhmmss.ss, expanded to _hours, _minutes, _seconds
    Time,
    /// (d)ddmm.mmmmm, expanded to _degrees, _minutes
    Degrees,
}

type Layout = &'static [(&'static str, Kind)];

const IMU_NO_SYNC: Layout = &[
    ("imu_time_ms", Kind::Float),
    ("accel_x_g", Kind::Float),
    ("accel_y_g", Kind::Float),
    ("accel_z_g", Kind::Float),
    ("angrate_x_dps", Kind::Float),
    ("angrate_y_dps", Kind::Float),
    ("angrate_z_dps", Kind::Float),
    ("fog_angrate_z_dps", Kind::Float),
    ("odometer_speed_mps", Kind::Float),
    ("odometer_time_ms", Kind::Float),
    ("temperature_c", Kind::Float),
];

const IMU_WITH_SYNC: Layout = &[
    ("imu_time_ms", Kind::Float),
    ("sync_time_ms", Kind::Float),
    ("accel_x_g", Kind::Float),
    ("accel_y_g", Kind::Float),
    ("accel_z_g", Kind::Float),
    ("angrate_x_dps", Kind::Float),
    ("angrate_y_dps", Kind::Float),
    ("angrate_z_dps", Kind::Float),
    ("fog_angrate_z_dps", Kind::Float),
    ("odometer_speed_mps", Kind::Float),
    ("odometer_time_ms", Kind::Float),
    ("temperature_c", Kind::Float),
];

const IMU_3FOG: Layout = &[
    ("imu_time_ms", Kind::Float),
    ("accel_x_g", Kind::Float),
    ("accel_y_g", Kind::Float),
    ("accel_z_g", Kind::Float),
    ("angrate_x_dps", Kind::Float),
    ("angrate_y_dps", Kind::Float),
    ("angrate_z_dps", Kind::Float),
    ("fog_angrate_x_dps", Kind::Float),
    ("fog_angrate_y_dps", Kind::Float),
    ("fog_angrate_z_dps", Kind::Float),
    ("odometer_speed_mps", Kind::Float),
    ("odometer_time_ms", Kind::Float),
    ("temperature_c", Kind::Float),
];

const IM1: Layout = &[
    ("imu_time_ms", Kind::Float),
    ("sync_time_ms", Kind::Float),
    ("accel_x_g", Kind::Float),
    ("accel_y_g", Kind::Float),
    ("accel_z_g", Kind::Float),
    ("angrate_x_dps", Kind::Float),
    ("angrate_y_dps", Kind::Float),
    ("angrate_z_dps", Kind::Float),
    ("fog_angrate_z_dps", Kind::Float),
    ("temperature_c", Kind::Float),
];

// GP2 (second antenna) shares this layout
const GPS: Layout = &[
    ("imu_time_ms", Kind::Float),
    ("gps_time_ns", Kind::Int),
    ("lat_deg", Kind::Float),
    ("lon_deg", Kind::Float),
    ("alt_ellipsoid_m", Kind::Float),
    ("alt_msl_m", Kind::Float),
    ("speed_mps", Kind::Float),
    ("heading_deg", Kind::Float),
    ("accuracy_horizontal_m", Kind::Float),
    ("accuracy_vertical_m", Kind::Float),
    ("PDOP", Kind::Float),
    ("gnss_fix_type", Kind::Int),
    ("num_sats", Kind::Int),
    ("speed_accuracy_mps", Kind::Float),
    ("heading_accuracy_deg", Kind::Float),
    ("carrier_solution_status", Kind::Int),
];

const INS: Layout = &[
    ("imu_time_ms", Kind::Int),
    ("gps_time_ns", Kind::Int),
    ("ins_solution_status", Kind::Int),
    ("lat_deg", Kind::Float),
    ("lon_deg", Kind::Float),
    ("alt_m", Kind::Float),
    ("velocity_0_mps", Kind::Float),
    ("velocity_1_mps", Kind::Float),
    ("velocity_2_mps", Kind::Float),
    ("attitude_0_deg", Kind::Float),
    ("attitude_1_deg", Kind::Float),
    ("attitude_2_deg", Kind::Float),
    ("zupt_flag", Kind::Int),
];

// older firmware emits a blank field when position is not initialized
const INS_EXTRA_COMMA: Layout = &[
    ("imu_time_ms", Kind::Int),
    ("gps_time_ns", Kind::Int),
    ("extra_comma", Kind::Int),
    ("ins_solution_status", Kind::Int),
    ("lat_deg", Kind::Float),
    ("lon_deg", Kind::Float),
    ("alt_m", Kind::Float),
    ("velocity_0_mps", Kind::Float),
    ("velocity_1_mps", Kind::Float),
    ("velocity_2_mps", Kind::Float),
    ("attitude_0_deg", Kind::Float),
    ("attitude_1_deg", Kind::Float),
    ("attitude_2_deg", Kind::Float),
    ("zupt_flag", Kind::Int),
];

const HDG: Layout = &[
    ("imu_time_ms", Kind::Float),
    ("gps_time_ns", Kind::Int),
    ("relPosN_m", Kind::Float),
    ("relPosE_m", Kind::Float),
    ("relPosD_m", Kind::Float),
    ("relPosLen_m", Kind::Float),
    ("relPosHeading_deg", Kind::Float),
    ("relPosLenAcc_m", Kind::Float),
    ("relPosHeadingAcc_deg", Kind::Float),
    ("flags", Kind::Int),
];

const GGA: Layout = &[
    ("time", Kind::Time),
    ("lat", Kind::Degrees),
    ("lat_dir", Kind::Text),
    ("lon", Kind::Degrees),
    ("lon_dir", Kind::Text),
    ("quality", Kind::Int),
    ("num_sats", Kind::Int),
    ("hdop", Kind::Float),
    ("alt_msl_m", Kind::Float),
    ("alt_unit", Kind::Text),
    ("geoid_sep_m", Kind::Float),
    ("geoid_unit", Kind::Text),
    ("diff_age_s", Kind::Float),
    ("diff_station", Kind::Text),
];

const ERR: Layout = &[("err", Kind::Int)];
const VER: Layout = &[("ver", Kind::Text)];
const SER: Layout = &[("ser", Kind::Text)];
const PID: Layout = &[("pid", Kind::Text)];
const IHW: Layout = &[("ihw", Kind::Int)];
const FHW: Layout = &[("fhw", Kind::Int)];
const FSN: Layout = &[("fsn", Kind::Int)];
const CODE: Layout = &[("code", Kind::Int)];
const ODO: Layout = &[("speed", Kind::Float)];
const UNL: Layout = &[("password", Kind::Text)];

/// Candidate layouts per type. Types with several candidates are told apart
/// by their field count.
fn layouts(msgtype: MsgType) -> Option<&'static [Layout]> {
    let layouts: &'static [Layout] = match msgtype {
        MsgType::IMU => &[IMU_WITH_SYNC, IMU_NO_SYNC, IMU_3FOG],
        MsgType::INS => &[INS, INS_EXTRA_COMMA],
        MsgType::IM1 => &[IM1],
        MsgType::GPS | MsgType::GP2 => &[GPS],
        MsgType::HDG => &[HDG],
        MsgType::GGA => &[GGA],
        MsgType::ERR => &[ERR],
        MsgType::VER => &[VER],
        MsgType::SER => &[SER],
        MsgType::PID => &[PID],
        MsgType::IHW => &[IHW],
        MsgType::FHW => &[FHW],
        MsgType::FSN => &[FSN],
        MsgType::RST | MsgType::PNG => &[CODE],
        MsgType::ODO => &[ODO],
        MsgType::UNL => &[UNL],
        _ => return None,
    };
    Some(layouts)
}

fn is_named_pairs(msgtype: MsgType) -> bool {
    matches!(
        msgtype,
        MsgType::CFG | MsgType::VEH | MsgType::SEN | MsgType::STA
    )
}

/// XOR of every byte.
pub(crate) fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Frame split into its parts, before validation.
struct Frame<'a> {
    msgtype: MsgType,
    payload: &'a [u8],
    checksum_input: &'a [u8],
    checksum: u8,
}

fn split_frame(raw: &[u8]) -> Result<Frame<'_>, ParseError> {
    let body = match raw.first() {
        Some(&START) | Some(&NMEA_START) => &raw[1..],
        _ => raw,
    };
    let body = body.strip_suffix(END).unwrap_or(body);

    // last separator: payload bytes never move it
    let sep = body
        .iter()
        .rposition(|b| *b == CHECKSUM_SEPARATOR)
        .ok_or(ParseError::Framing)?;

    let checksum = body
        .get(sep + 1..sep + 3)
        .and_then(|hex| std::str::from_utf8(hex).ok())
        .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        .ok_or(ParseError::Framing)?;

    let checksum_input = &body[..sep];
    if checksum_input.len() < HEADER_LEN {
        return Err(ParseError::Framing);
    }

    let msgtype = MsgType::from_bytes(&checksum_input[2..HEADER_LEN]).unwrap_or(MsgType::UNKNOWN);
    let payload = &checksum_input[HEADER_LEN..];
    let payload = payload.strip_prefix(&[SEPARATOR]).unwrap_or(payload);

    Ok(Frame {
        msgtype,
        payload,
        checksum_input,
        checksum,
    })
}

fn text(part: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(part).map_err(|_| ParseError::FieldDecode)
}

fn parse_int(text: &str) -> Result<i64, ParseError> {
    text.parse::<i64>().map_err(|_| ParseError::FieldDecode)
}

fn parse_float(text: &str) -> Result<f64, ParseError> {
    text.parse::<f64>().map_err(|_| ParseError::FieldDecode)
}

fn set_field(msg: &mut Message, name: &str, kind: Kind, part: &[u8]) -> Result<(), ParseError> {
    match kind {
        Kind::Text => msg.set(name, part),
        Kind::Int => msg.set(name, parse_int(text(part)?)?),
        Kind::Float => msg.set(name, parse_float(text(part)?)?),
        Kind::Time => {
            let text = text(part)?;
            let hours = text.get(..2).ok_or(ParseError::FieldDecode)?;
            let minutes = text.get(2..4).ok_or(ParseError::FieldDecode)?;
            let seconds = text.get(4..).ok_or(ParseError::FieldDecode)?;
            msg.set(&format!("{}_hours", name), parse_int(hours)?);
            msg.set(&format!("{}_minutes", name), parse_int(minutes)?);
            msg.set(&format!("{}_seconds", name), parse_float(seconds)?);
        },
        Kind::Degrees => {
            // two minute digits always precede the decimal point
            let text = text(part)?;
            let split = text
                .find('.')
                .and_then(|dot| dot.checked_sub(2))
                .ok_or(ParseError::FieldDecode)?;
            msg.set(&format!("{}_degrees", name), parse_int(&text[..split])?);
            msg.set(&format!("{}_minutes", name), parse_float(&text[split..])?);
        },
    }
    Ok(())
}

fn decode_fields(msg: &mut Message, layout: Layout, parts: &[&[u8]]) -> Result<(), ParseError> {
    if parts.len() > layout.len() {
        return Err(ParseError::LengthMismatch { found: parts.len() });
    }
    for (part, (name, kind)) in parts.iter().zip(layout.iter()) {
        // blank fields are simply absent
        if !part.is_empty() {
            set_field(msg, name, *kind, part)?;
        }
    }
    Ok(())
}

fn decode_named_pairs(msg: &mut Message, payload: &[u8]) -> Result<(), ParseError> {
    if payload.is_empty() {
        msg.set_configurations(Configurations::default());
        return Ok(());
    }

    let mut tokens = payload.split(|b| *b == SEPARATOR).collect::<Vec<_>>();

    // requests lead with a single character mode, names are never that short
    let mode = tokens.first().and_then(|t| ConfigMode::from_token(t));
    if let Some(mode) = mode {
        msg.set("mode", mode.as_bytes());
        tokens.remove(0);
    }

    let name = |token: &[u8]| String::from_utf8(token.to_vec()).map_err(|_| ParseError::FieldDecode);

    let mut configurations = Vec::with_capacity(tokens.len());

    if mode.is_some_and(|m| m.is_read()) {
        for token in tokens {
            configurations.push((name(token)?, Vec::new()));
        }
    } else {
        if tokens.len() % 2 != 0 {
            return Err(ParseError::LengthMismatch {
                found: tokens.len(),
            });
        }
        for pair in tokens.chunks(2) {
            configurations.push((name(pair[0])?, pair[1].to_vec()));
        }
    }

    msg.set_configurations(Configurations(configurations));
    Ok(())
}

fn encode_value(msg: &Message, name: &str, kind: Kind) -> Option<Vec<u8>> {
    match kind {
        Kind::Time => {
            let hours = msg.i64(&format!("{}_hours", name))?;
            let minutes = msg.i64(&format!("{}_minutes", name))?;
            let seconds = msg.f64(&format!("{}_seconds", name))?;
            let pad = if seconds < 10.0 { "0" } else { "" };
            Some(format!("{:02}{:02}{}{}", hours, minutes, pad, seconds).into_bytes())
        },
        Kind::Degrees => {
            let degrees = msg.i64(&format!("{}_degrees", name))?;
            let minutes = msg.f64(&format!("{}_minutes", name))?;
            let pad = if minutes < 10.0 { "0" } else { "" };
            let mut minutes = minutes.to_string();
            if !minutes.contains('.') {
                minutes.push_str(".0");
            }
            Some(format!("{}{}{}", degrees, pad, minutes).into_bytes())
        },
        Kind::Text => msg.bytes(name).map(|b| b.to_vec()),
        Kind::Int | Kind::Float => msg.get(name).map(|v| v.to_string().into_bytes()),
    }
}

/// Encodes with the candidate layout covering most of the message fields.
/// Returns None when the message carries none of them.
fn encode_fields(msg: &Message, layouts: &[Layout]) -> Option<Vec<u8>> {
    let mut best: Option<(usize, Vec<Option<Vec<u8>>>)> = None;

    for layout in layouts {
        let values = layout
            .iter()
            .map(|(name, kind)| encode_value(msg, name, *kind))
            .collect::<Vec<_>>();

        let present = values.iter().filter(|v| v.is_some()).count();
        if best.as_ref().is_none_or(|(count, _)| present > *count) {
            best = Some((present, values));
        }
    }

    let (present, values) = best?;
    if present == 0 {
        return None;
    }

    let mut payload = Vec::new();
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            payload.push(SEPARATOR);
        }
        if let Some(value) = value {
            payload.extend_from_slice(&value);
        }
    }
    Some(payload)
}

fn encode_named_pairs(msg: &Message) -> Result<Option<Vec<u8>>, Error> {
    let empty = Configurations::default();
    let configurations = msg.configurations().unwrap_or(&empty);

    let mode = match msg.bytes("mode") {
        Some(token) => Some(ConfigMode::from_token(token).ok_or(Error::Encode("mode".to_string()))?),
        None => None,
    };

    let mut tokens: Vec<&[u8]> = Vec::new();
    if let Some(mode) = mode {
        tokens.push(mode.as_bytes());
    }
    for (name, value) in configurations.iter() {
        tokens.push(name.as_bytes());
        if !mode.is_some_and(|m| m.is_read()) {
            tokens.push(value);
        }
    }

    if tokens.is_empty() {
        Ok(None)
    } else {
        Ok(Some(tokens.join(&SEPARATOR)))
    }
}

/// `#APTYP,...*CS\r\n` frames, used for every command and optionally for output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadableScheme;

impl ReadableScheme {
    /// Compares the transmitted checksum, marking `msg` invalid on mismatch.
    fn check_valid(&self, frame: &Frame, msg: &mut Message) -> bool {
        if checksum(frame.checksum_input) != frame.checksum {
            msg.fail(ParseError::Checksum);
        }
        msg.valid
    }

    fn decode_payload_for_type(&self, msg: &mut Message, msgtype: MsgType, payload: &[u8]) {
        let result = if is_named_pairs(msgtype) {
            decode_named_pairs(msg, payload)
        } else if msgtype == MsgType::ECH {
            msg.set("contents", payload);
            Ok(())
        } else if let Some(layouts) = layouts(msgtype) {
            let parts = payload.split(|b| *b == SEPARATOR).collect::<Vec<_>>();
            let layout = if layouts.len() == 1 {
                Some(layouts[0])
            } else {
                layouts.iter().find(|l| l.len() == parts.len()).copied()
            };
            match layout {
                Some(layout) => decode_fields(msg, layout, &parts),
                None => Err(ParseError::LengthMismatch { found: parts.len() }),
            }
        } else {
            Err(ParseError::UnknownType)
        };

        match result {
            Ok(_) => {
                if msgtype == MsgType::HDG {
                    extract_heading_flags(msg);
                }
            },
            Err(e) => msg.fail(e),
        }
    }

    fn build_payload_for_type(&self, msg: &Message) -> Result<Option<Vec<u8>>, Error> {
        let msgtype = msg.msgtype;
        if is_named_pairs(msgtype) {
            encode_named_pairs(msg)
        } else if msgtype == MsgType::ECH {
            Ok(msg.bytes("contents").map(|c| c.to_vec()))
        } else if let Some(layouts) = layouts(msgtype) {
            Ok(encode_fields(msg, layouts))
        } else {
            Err(Error::UnknownMessageType(msgtype))
        }
    }
}

impl Scheme for ReadableScheme {
    fn preamble(&self) -> &'static [u8] {
        &[START]
    }

    fn frame_len(&self, buf: &[u8]) -> FrameLen {
        for (i, byte) in buf.iter().enumerate().skip(1) {
            match byte {
                b'\n' => {
                    if buf[i - 1] == b'\r' {
                        return FrameLen::Complete(i + 1);
                    }
                    return FrameLen::Invalid;
                },
                b'\r' | 0x20..=0x7e => {},
                _ => return FrameLen::Invalid,
            }
            if i >= MAX_FRAME_LEN {
                return FrameLen::Invalid;
            }
        }
        FrameLen::Incomplete
    }

    fn parse_message(&self, raw: &[u8]) -> Message {
        let frame = match split_frame(raw) {
            Ok(frame) => frame,
            Err(e) => return Message::invalid(MsgType::UNKNOWN, e, raw),
        };

        let mut msg = Message::new(frame.msgtype);
        msg.raw = raw.to_vec();

        if self.check_valid(&frame, &mut msg) {
            self.decode_payload_for_type(&mut msg, frame.msgtype, frame.payload);
        }
        msg
    }

    fn build_message_general(&self, msg: &Message) -> Result<Vec<u8>, Error> {
        let payload = self.build_payload_for_type(msg)?;

        let mut data = TALKER.to_vec();
        data.extend_from_slice(msg.msgtype.as_bytes());
        if let Some(payload) = payload.filter(|p| !p.is_empty()) {
            data.push(SEPARATOR);
            data.extend_from_slice(&payload);
        }

        let mut frame = Vec::with_capacity(data.len() + 6);
        frame.push(START);
        frame.extend_from_slice(&data);
        frame.push(CHECKSUM_SEPARATOR);
        frame.extend_from_slice(format!("{:02X}", checksum(&data)).as_bytes());
        frame.extend_from_slice(END);
        Ok(frame)
    }
}

#[cfg(test)]
mod test {
    use super::{checksum, ConfigMode, ReadableScheme};
    use crate::{
        message::{Configurations, Message, MsgType, ParseError},
        scheme::{FrameLen, Scheme},
    };

    fn frame(body: &str) -> Vec<u8> {
        format!("#{}*{:02X}\r\n", body, checksum(body.as_bytes())).into_bytes()
    }

    #[test]
    fn test_parse_ins() {
        let raw = frame("APINS,1234567,1361746447249999872,2,37.3990838,-121.9791725,12.5,0.1,-0.2,0.03,1.5,-2.25,180.0,1");
        let msg = ReadableScheme.parse_message(&raw);
        assert!(msg.valid, "{:?}", msg.error);
        assert_eq!(msg.msgtype, MsgType::INS);
        assert_eq!(msg.i64("imu_time_ms"), Some(1234567));
        assert_eq!(msg.i64("gps_time_ns"), Some(1361746447249999872));
        assert_eq!(msg.i64("ins_solution_status"), Some(2));
        assert_eq!(msg.f64("lat_deg"), Some(37.3990838));
        assert_eq!(msg.f64("attitude_2_deg"), Some(180.0));
        assert_eq!(msg.i64("zupt_flag"), Some(1));
        assert_eq!(msg.raw, raw);
    }

    #[test]
    fn test_parse_ins_extra_comma() {
        let raw = frame("APINS,1234567,1361746447249999872,,0,,,,,,,,,0");
        let msg = ReadableScheme.parse_message(&raw);
        assert!(msg.valid);
        assert_eq!(msg.i64("ins_solution_status"), Some(0));
        assert_eq!(msg.i64("zupt_flag"), Some(0));
        assert!(!msg.has("lat_deg"));
        assert!(!msg.has("extra_comma"));
    }

    #[test]
    fn test_imu_disambiguation() {
        let no_sync = frame("APIMU,100.5,0.01,0.02,1.0,0.1,0.2,0.3,0.25,0,0,35.5");
        let msg = ReadableScheme.parse_message(&no_sync);
        assert!(msg.valid);
        assert!(!msg.has("sync_time_ms"));
        assert_eq!(msg.f64("accel_x_g"), Some(0.01));
        assert_eq!(msg.f64("temperature_c"), Some(35.5));

        let with_sync = frame("APIMU,100.5,99.0,0.01,0.02,1.0,0.1,0.2,0.3,0.25,0,0,35.5");
        let msg = ReadableScheme.parse_message(&with_sync);
        assert!(msg.valid);
        assert_eq!(msg.f64("sync_time_ms"), Some(99.0));
        assert_eq!(msg.f64("accel_x_g"), Some(0.01));

        let three_fog = frame("APIMU,100.5,0.01,0.02,1.0,0.1,0.2,0.3,0.4,0.5,0.6,0,0,35.5");
        let msg = ReadableScheme.parse_message(&three_fog);
        assert!(msg.valid);
        assert_eq!(msg.f64("fog_angrate_x_dps"), Some(0.4));
        assert_eq!(msg.f64("fog_angrate_z_dps"), Some(0.6));

        // no IMU layout has 9 fields
        let odd = frame("APIMU,100.5,0.01,0.02,1.0,0.1,0.2,0.3,0.25,35.5");
        let msg = ReadableScheme.parse_message(&odd);
        assert!(!msg.valid);
        assert_eq!(msg.error, Some(ParseError::LengthMismatch { found: 9 }));
        assert_eq!(msg.fields().count(), 0);
    }

    #[test]
    fn test_checksum_failure() {
        let mut raw = frame("APPNG,0");
        let last = raw.len() - 3;
        raw[last] = if raw[last] == b'0' { b'1' } else { b'0' };
        let msg = ReadableScheme.parse_message(&raw);
        assert!(!msg.valid);
        assert_eq!(msg.error, Some(ParseError::Checksum));
    }

    #[test]
    fn test_single_byte_flips() {
        let raw = frame("APGPS,1000.5,1361746447249999872,37.39,-121.97,-28.06,1.82,0.03,232.68,5.87,5.87,1.26,3,20,0.5,1.2,2");
        // checksummed region: after '#', before '*'
        let star = raw.iter().rposition(|b| *b == b'*').unwrap();
        for i in 1..star {
            for flip in [0x01u8, 0x20, 0x80] {
                let mut corrupted = raw.clone();
                corrupted[i] ^= flip;
                let msg = ReadableScheme.parse_message(&corrupted);
                assert!(!msg.valid, "byte {} flip {:02x}", i, flip);
                assert_eq!(msg.error, Some(ParseError::Checksum), "byte {}", i);
            }
        }
    }

    #[test]
    fn test_heading_flags() {
        let raw = frame("APHDG,977410.011,1361746447249999872,0.5,0.25,0.0,1.5,45.5,0.01,0.2,277");
        let msg = ReadableScheme.parse_message(&raw);
        assert!(msg.valid);
        assert_eq!(msg.i64("flags"), Some(277));
        assert_eq!(msg.i64("gnssFixOK"), Some(1));
        assert_eq!(msg.i64("relPosValid"), Some(1));
        assert_eq!(msg.i64("carrSoln"), Some(2));
        assert_eq!(msg.i64("relPosHeading_Valid"), Some(1));
        assert_eq!(msg.i64("relPos_Normalized"), Some(0));
    }

    #[test]
    fn test_named_pairs() {
        let raw = frame("APCFG,odr,100,orn,+X+Y+Z");
        let msg = ReadableScheme.parse_message(&raw);
        assert!(msg.valid);
        let cfg = msg.configurations().unwrap();
        assert_eq!(cfg.get("odr"), Some(b"100".as_slice()));
        assert_eq!(cfg.get("orn"), Some(b"+X+Y+Z".as_slice()));
        assert!(!msg.has("mode"));

        let raw = frame("APSTA,errs,0,warnings,0,overall,PEACHY!");
        let msg = ReadableScheme.parse_message(&raw);
        assert_eq!(
            msg.configurations().unwrap().get("overall"),
            Some(b"PEACHY!".as_slice())
        );

        let raw = frame("APCFG,odr,100,orn");
        let msg = ReadableScheme.parse_message(&raw);
        assert!(!msg.valid);
        assert_eq!(msg.error, Some(ParseError::LengthMismatch { found: 3 }));
    }

    #[test]
    fn test_build_requests() {
        let req = Message::new(MsgType::CFG)
            .with("mode", ConfigMode::WriteRam.as_bytes())
            .with_configurations(Configurations::pairs(&[("odr", "100"), ("msg", "IMU")]));
        let bytes = ReadableScheme.build_message_general(&req).unwrap();
        assert_eq!(bytes, frame("APCFG,w,odr,100,msg,IMU"));

        let req = Message::new(MsgType::CFG)
            .with("mode", ConfigMode::ReadFlash.as_bytes())
            .with_configurations(Configurations::names(&["mfm", "odr"]));
        let bytes = ReadableScheme.build_message_general(&req).unwrap();
        assert_eq!(bytes, frame("APCFG,R,mfm,odr"));

        let bytes = ReadableScheme.build_message_general(&Message::new(MsgType::PNG)).unwrap();
        assert_eq!(bytes, frame("APPNG"));

        let req = Message::new(MsgType::RST).with("code", 0i64);
        let bytes = ReadableScheme.build_message_general(&req).unwrap();
        assert_eq!(bytes, frame("APRST,0"));

        let req = Message::new(MsgType::ODO).with("speed", 1.25);
        let bytes = ReadableScheme.build_message_general(&req).unwrap();
        assert_eq!(bytes, frame("APODO,1.25"));

        let req = Message::new(MsgType(*b"XYZ"));
        assert!(ReadableScheme.build_message_general(&req).is_err());

        let req = Message::new(MsgType::CFG).with("mode", "x");
        assert!(ReadableScheme.build_message_general(&req).is_err());
    }

    #[test]
    fn test_round_trip() {
        for body in [
            "APINS,1234567,1361746447249999872,2,37.3990838,-121.9791725,12.5,0.1,-0.2,0.03,1.5,-2.25,180,1",
            "APIMU,100.5,99,0.01,0.02,1,0.1,0.2,0.3,0.25,0,0,35.5",
            "APIMU,100.5,0.01,0.02,1,0.1,0.2,0.3,0.4,0.5,0.6,0,0,35.5",
            "APIM1,100.5,99,0.01,0.02,1,0.1,0.2,0.3,0.25,35.5",
            "APGP2,1000.5,1361746447249999872,37.39,-121.97,-28.06,1.82,0.03,232.68,5.87,5.87,1.26,3,20,0.5,1.2,2",
            "APHDG,977410.011,1361746447249999872,0.5,0.25,0,1.5,45.5,0.01,0.2,277",
            "APCFG,odr,100,orn,+X+Y+Z",
            "APCFG,r,odr,orn",
            "APVEH,W,gpa,1.5",
            "APSTA,errs,0,warnings,0,overall,PEACHY!",
            "APVER,1.2.3",
            "APPID,EVK-1234",
            "APERR,4",
            "APPNG,0",
            "APECH,hello there",
            "APGGA,123519.25,4807.03800,N,01131.00000,E,4,08,0.90,545.40,M,,M,,",
        ] {
            let raw = frame(body);
            let parsed = ReadableScheme.parse_message(&raw);
            assert!(parsed.valid, "{}: {:?}", body, parsed.error);
            let rebuilt = ReadableScheme.build_message_general(&parsed).unwrap();
            let reparsed = ReadableScheme.parse_message(&rebuilt);
            assert!(reparsed.same_content(&parsed), "{}", body);
        }
    }

    #[test]
    fn test_nmea_gga() {
        let raw = b"$GNGGA,123519.25,4807.03800,N,01131.00000,E,4,08,0.90,545.40,M,,M,,*";
        let mut raw = raw.to_vec();
        let cs = checksum(&raw[1..raw.len() - 1]);
        raw.extend_from_slice(format!("{:02X}\r\n", cs).as_bytes());

        let msg = ReadableScheme.parse_message(&raw);
        assert!(msg.valid, "{:?}", msg.error);
        assert_eq!(msg.msgtype, MsgType::GGA);
        assert_eq!(msg.i64("time_hours"), Some(12));
        assert_eq!(msg.i64("time_minutes"), Some(35));
        assert_eq!(msg.f64("time_seconds"), Some(19.25));
        assert_eq!(msg.i64("lat_degrees"), Some(48));
        assert_eq!(msg.f64("lat_minutes"), Some(7.038));
        assert_eq!(msg.i64("lon_degrees"), Some(11));
        assert_eq!(msg.f64("lon_minutes"), Some(31.0));
        assert_eq!(msg.bytes("lat_dir"), Some(b"N".as_slice()));
        assert_eq!(msg.i64("quality"), Some(4));
        assert_eq!(msg.i64("num_sats"), Some(8));
        assert_eq!(msg.f64("alt_msl_m"), Some(545.4));
    }

    #[test]
    fn test_unknown_type() {
        let msg = ReadableScheme.parse_message(&frame("APXYZ,1,2"));
        assert!(!msg.valid);
        assert_eq!(msg.error, Some(ParseError::UnknownType));
    }

    #[test]
    fn test_bad_field() {
        let msg = ReadableScheme.parse_message(&frame("APERR,four"));
        assert!(!msg.valid);
        assert_eq!(msg.error, Some(ParseError::FieldDecode));
    }

    #[test]
    fn test_frame_len() {
        let raw = frame("APPNG,0");
        assert_eq!(ReadableScheme.frame_len(&raw), FrameLen::Complete(raw.len()));
        assert_eq!(ReadableScheme.frame_len(&raw[..6]), FrameLen::Incomplete);
        assert_eq!(ReadableScheme.frame_len(b"#AP\xd3\x00"), FrameLen::Invalid);
    }
}
