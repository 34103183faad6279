//! Compact binary frames: `C5 50 | type | length | payload | ck_a ck_b`
//!
//! The two checksum bytes are the running sums over type, length and payload.
use crate::{
    error::Error,
    message::{Message, MsgType, ParseError},
    scheme::{
        decode_layout, derive_ms_times, encode_layout, extract_heading_flags, raw, scaled,
        unpack_carrsoln_and_fix, BinField, FrameLen, Scheme, Width,
    },
};

const PREAMBLE: [u8; 2] = [0xc5, 0x50];
const HEADER_LEN: usize = 4;
const CHECKSUM_LEN: usize = 2;

const TYPE_CAL: u8 = 1;
const TYPE_IMU: u8 = 2;
const TYPE_GPS: u8 = 3;
const TYPE_GP2: u8 = 4;
const TYPE_HDG: u8 = 5;
const TYPE_INS: u8 = 6;

const MEMS_SCALE: f64 = 0.0000305;
const ACCEL_FIELDS: [&str; 3] = ["accel_x_g", "accel_y_g", "accel_z_g"];
const RATE_FIELDS: [&str; 3] = ["angrate_x_dps", "angrate_y_dps", "angrate_z_dps"];

const IMU: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("sync_time_ns", Width::U64),
    raw("odometer_time_ns", Width::U64),
    scaled("accel_x_g", Width::I16, MEMS_SCALE),
    scaled("accel_y_g", Width::I16, MEMS_SCALE),
    scaled("accel_z_g", Width::I16, MEMS_SCALE),
    scaled("angrate_x_dps", Width::I16, MEMS_SCALE),
    scaled("angrate_y_dps", Width::I16, MEMS_SCALE),
    scaled("angrate_z_dps", Width::I16, MEMS_SCALE),
    scaled("fog_angrate_z_dps", Width::I32, 1.0E-7),
    scaled("odometer_speed_mps", Width::I16, 1.0E-2),
    scaled("temperature_c", Width::I16, 1.0E-2),
    raw("mems_ranges", Width::U16),
    raw("fog_range", Width::U16),
];

const INS: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("gps_time_ns", Width::U64),
    scaled("lat_deg", Width::I32, 1.0E-7),
    scaled("lon_deg", Width::I32, 1.0E-7),
    scaled("alt_m", Width::I32, 1.0E-2),
    scaled("velocity_north_mps", Width::I16, 1.0E-2),
    scaled("velocity_east_mps", Width::I16, 1.0E-2),
    scaled("velocity_down_mps", Width::I16, 1.0E-2),
    scaled("roll_deg", Width::I16, 1.0E-2),
    scaled("pitch_deg", Width::I16, 1.0E-2),
    scaled("heading_deg", Width::I16, 1.0E-2),
    raw("zupt_flag", Width::U8),
    raw("ins_solution_status", Width::U8),
];

// GP2 shares this layout
const GPS: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("gps_time_ns", Width::U64),
    scaled("lat_deg", Width::I32, 1.0E-7),
    scaled("lon_deg", Width::I32, 1.0E-7),
    scaled("alt_ellipsoid_m", Width::I32, 1.0E-2),
    scaled("alt_msl_m", Width::I32, 1.0E-2),
    scaled("speed_mps", Width::I16, 1.0E-2),
    scaled("heading_deg", Width::I16, 1.0E-2),
    scaled("accuracy_horizontal_m", Width::U16, 1.0E-3),
    scaled("accuracy_vertical_m", Width::U16, 1.0E-3),
    scaled("PDOP", Width::U16, 1.0E-2),
    scaled("speed_accuracy_mps", Width::U16, 1.0E-3),
    scaled("heading_accuracy_deg", Width::U16, 1.0E-2),
    raw("num_sats", Width::U8),
    raw("carrsoln_and_fix", Width::U8),
];

const HDG: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("gps_time_ns", Width::U64),
    scaled("relPosN_m", Width::I16, 1.0E-2),
    scaled("relPosE_m", Width::I16, 1.0E-2),
    scaled("relPosD_m", Width::I16, 1.0E-2),
    scaled("relPosLen_m", Width::I16, 1.0E-2),
    scaled("relPosHeading_deg", Width::I16, 1.0E-2),
    scaled("relPosLenAcc_m", Width::U16, 1.0E-4),
    scaled("relPosHeadingAcc_deg", Width::U16, 1.0E-2),
    raw("flags", Width::U16),
];

fn equivalent_type(code: u8) -> Option<MsgType> {
    match code {
        TYPE_CAL => Some(MsgType::CAL),
        TYPE_IMU => Some(MsgType::IMU),
        TYPE_GPS => Some(MsgType::GPS),
        TYPE_GP2 => Some(MsgType::GP2),
        TYPE_HDG => Some(MsgType::HDG),
        TYPE_INS => Some(MsgType::INS),
        _ => None,
    }
}

/// Running sums over `data`, modulo 256.
pub(crate) fn checksum(data: &[u8]) -> [u8; 2] {
    let (a, b) = data.iter().fold((0u8, 0u8), |(a, b), byte| {
        let a = a.wrapping_add(*byte);
        (a, b.wrapping_add(a))
    });
    [a, b]
}

/// Accel range lives in the upper 5 bits, rate range in the lower 11.
fn mems_ranges(msg: &Message) -> Option<(f64, f64)> {
    let ranges = msg.u64("mems_ranges")?;
    Some(((ranges >> 11) as f64, (ranges & 0x7ff) as f64))
}

fn apply_mems_ranges(msg: &mut Message) {
    let Some((accel_range, rate_range)) = mems_ranges(msg) else {
        return;
    };
    msg.set("accel_range", accel_range as i64);
    msg.set("rate_range", rate_range as i64);
    for (fields, range) in [(ACCEL_FIELDS, accel_range), (RATE_FIELDS, rate_range)] {
        for field in fields {
            if let Some(value) = msg.f64(field) {
                msg.set(field, value * range);
            }
        }
    }
}

/// Compact binary output.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryScheme;

impl BinaryScheme {
    fn check_valid(&self, checksum_input: &[u8], transmitted: &[u8], msg: &mut Message) -> bool {
        if checksum(checksum_input) != transmitted {
            msg.fail(ParseError::Checksum);
        }
        msg.valid
    }

    fn decode_payload_for_type(&self, msg: &mut Message, code: u8, payload: &[u8]) {
        let result = match code {
            TYPE_IMU => decode_layout(msg, IMU, payload).map(|_| apply_mems_ranges(msg)),
            TYPE_GPS | TYPE_GP2 => {
                decode_layout(msg, GPS, payload).map(|_| unpack_carrsoln_and_fix(msg))
            },
            TYPE_HDG => decode_layout(msg, HDG, payload).map(|_| extract_heading_flags(msg)),
            TYPE_INS => decode_layout(msg, INS, payload),
            _ => {
                msg.set("payload", payload);
                Ok(())
            },
        };
        match result {
            Ok(_) => derive_ms_times(msg),
            Err(e) => msg.fail(e),
        }
    }
}

impl Scheme for BinaryScheme {
    fn preamble(&self) -> &'static [u8] {
        &PREAMBLE
    }

    fn frame_len(&self, buf: &[u8]) -> FrameLen {
        if buf.len() < HEADER_LEN {
            return FrameLen::Incomplete;
        }
        if equivalent_type(buf[2]).is_none() {
            return FrameLen::Invalid;
        }
        let total = HEADER_LEN + buf[3] as usize + CHECKSUM_LEN;
        if buf.len() < total {
            FrameLen::Incomplete
        } else {
            FrameLen::Complete(total)
        }
    }

    fn parse_message(&self, raw: &[u8]) -> Message {
        if !raw.starts_with(&PREAMBLE) || raw.len() < HEADER_LEN + CHECKSUM_LEN {
            return Message::invalid(MsgType::UNKNOWN, ParseError::Framing, raw);
        }

        let code = raw[2];
        let total = HEADER_LEN + raw[3] as usize + CHECKSUM_LEN;
        let frame = if raw.len() >= total { &raw[..total] } else { raw };
        let (body, transmitted) = frame.split_at(frame.len() - CHECKSUM_LEN);

        let mut msg = Message::new(equivalent_type(code).unwrap_or(MsgType::UNKNOWN));
        msg.raw = frame.to_vec();

        if !self.check_valid(&body[PREAMBLE.len()..], transmitted, &mut msg) {
            return msg;
        }
        if frame.len() < total {
            msg.fail(ParseError::Framing);
            return msg;
        }
        if equivalent_type(code).is_none() {
            msg.fail(ParseError::UnknownType);
            return msg;
        }

        self.decode_payload_for_type(&mut msg, code, &body[HEADER_LEN..]);
        msg
    }

    fn build_message_general(&self, msg: &Message) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::new();

        let code = match msg.msgtype {
            MsgType::IMU => {
                // transmitted values are pre range scaling
                let mut unscaled = msg.clone();
                if let Some((accel_range, rate_range)) = mems_ranges(msg) {
                    for (fields, range) in [(ACCEL_FIELDS, accel_range), (RATE_FIELDS, rate_range)] {
                        for field in fields {
                            if let Some(value) = msg.f64(field).filter(|_| range != 0.0) {
                                unscaled.set(field, value / range);
                            }
                        }
                    }
                }
                encode_layout(&unscaled, IMU, &mut payload)?;
                TYPE_IMU
            },
            MsgType::GPS | MsgType::GP2 => {
                let mut packed = msg.clone();
                if !msg.has("carrsoln_and_fix") {
                    let carrier = msg.u64("carrier_solution_status").unwrap_or(0);
                    let fix = msg.u64("gnss_fix_type").unwrap_or(0);
                    packed.set("carrsoln_and_fix", carrier * 16 + fix % 16);
                }
                encode_layout(&packed, GPS, &mut payload)?;
                if msg.msgtype == MsgType::GP2 { TYPE_GP2 } else { TYPE_GPS }
            },
            MsgType::HDG => {
                encode_layout(msg, HDG, &mut payload)?;
                TYPE_HDG
            },
            MsgType::INS => {
                encode_layout(msg, INS, &mut payload)?;
                TYPE_INS
            },
            MsgType::CAL => {
                payload.extend_from_slice(msg.bytes("payload").unwrap_or_default());
                TYPE_CAL
            },
            other => return Err(Error::UnknownMessageType(other)),
        };

        let len = u8::try_from(payload.len()).map_err(|_| Error::Encode("length".to_string()))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
        frame.extend_from_slice(&PREAMBLE);
        frame.push(code);
        frame.push(len);
        frame.extend_from_slice(&payload);
        let ck = checksum(&frame[PREAMBLE.len()..]);
        frame.extend_from_slice(&ck);
        Ok(frame)
    }
}
