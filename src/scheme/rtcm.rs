//! RTCM 3 style frames, carrying proprietary (company 4058) messages.
//!
//! `0xD3 | 6 reserved bits + 10 bit length | 12 bit company + 4 bit subtype | payload | CRC24Q`
//!
//! The length covers the two type bytes and the payload. Payload integers are little endian.
use crc::{Crc, CRC_24_LTE_A};

use crate::{
    error::Error,
    message::{Message, MsgType, ParseError},
    scheme::{
        decode_layout, derive_ms_times, encode_layout, extract_heading_flags, raw, scaled,
        BinField, FrameLen, Scheme, Width,
    },
};

const PREAMBLE: u8 = 0xD3;
const HEADER_LEN: usize = 3;
const TYPE_LEN: usize = 2;
const CRC_LEN: usize = 3;
const MAX_LEN: usize = 0x3ff;
const COMPANY_ID: u16 = 4058;

/// CRC-24Q: polynomial 0x864CFB, no reflection, no final xor
const CRC24Q: Crc<u32> = Crc::<u32>::new(&CRC_24_LTE_A);

const SUBTYPE_IMU: u8 = 1;
const SUBTYPE_GPS: u8 = 2;
const SUBTYPE_HDG: u8 = 3;
const SUBTYPE_INS: u8 = 4;
const SUBTYPE_HPP: u8 = 5;
const SUBTYPE_IM1: u8 = 6;
const SUBTYPE_UBX1: u8 = 14;
const SUBTYPE_UBX2: u8 = 15;

const ACCEL_SCALE: f64 = 15.0 / 2147483648.0;
const RATE_SCALE: f64 = 450.0 / 2147483648.0;

const IMU_WITH_SYNC: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("sync_time_ns", Width::U64),
    raw("odometer_time_ns", Width::I64),
    scaled("accel_x_g", Width::I32, ACCEL_SCALE),
    scaled("accel_y_g", Width::I32, ACCEL_SCALE),
    scaled("accel_z_g", Width::I32, ACCEL_SCALE),
    scaled("angrate_x_dps", Width::I32, RATE_SCALE),
    scaled("angrate_y_dps", Width::I32, RATE_SCALE),
    scaled("angrate_z_dps", Width::I32, RATE_SCALE),
    scaled("fog_angrate_z_dps", Width::I32, RATE_SCALE),
    scaled("odometer_speed_mps", Width::I16, 1.0E-2),
    scaled("temperature_c", Width::I16, 1.0E-2),
];

const IMU_NO_SYNC: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("odometer_time_ns", Width::I64),
    scaled("accel_x_g", Width::I32, ACCEL_SCALE),
    scaled("accel_y_g", Width::I32, ACCEL_SCALE),
    scaled("accel_z_g", Width::I32, ACCEL_SCALE),
    scaled("angrate_x_dps", Width::I32, RATE_SCALE),
    scaled("angrate_y_dps", Width::I32, RATE_SCALE),
    scaled("angrate_z_dps", Width::I32, RATE_SCALE),
    scaled("fog_angrate_z_dps", Width::I32, RATE_SCALE),
    scaled("odometer_speed_mps", Width::I16, 1.0E-2),
    scaled("temperature_c", Width::I16, 1.0E-2),
];

const IM1: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("sync_time_ns", Width::U64),
    scaled("accel_x_g", Width::I32, ACCEL_SCALE),
    scaled("accel_y_g", Width::I32, ACCEL_SCALE),
    scaled("accel_z_g", Width::I32, ACCEL_SCALE),
    scaled("angrate_x_dps", Width::I32, RATE_SCALE),
    scaled("angrate_y_dps", Width::I32, RATE_SCALE),
    scaled("angrate_z_dps", Width::I32, RATE_SCALE),
    scaled("fog_angrate_z_dps", Width::I32, RATE_SCALE),
    scaled("temperature_c", Width::I16, 1.0E-2),
];

const GPS: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("gps_time_ns", Width::U64),
    scaled("lat_deg", Width::I32, 1.0E-7),
    scaled("lon_deg", Width::I32, 1.0E-7),
    scaled("alt_ellipsoid_m", Width::I32, 1.0E-3),
    scaled("alt_msl_m", Width::I32, 1.0E-3),
    scaled("speed_mps", Width::I32, 1.0E-3),
    scaled("heading_deg", Width::I32, 1.0E-3),
    scaled("accuracy_horizontal_m", Width::U32, 1.0E-3),
    scaled("accuracy_vertical_m", Width::U32, 1.0E-3),
    scaled("heading_accuracy_deg", Width::U32, 1.0E-5),
    scaled("speed_accuracy_mps", Width::U32, 1.0E-3),
    scaled("PDOP", Width::U16, 1.0E-2),
    raw("gnss_fix_type", Width::U8),
    raw("num_sats", Width::U8),
    raw("carrier_solution_status", Width::U8),
    raw("antenna_id", Width::U8),
];

const HDG: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("gps_time_ns", Width::U64),
    scaled("relPosN_m", Width::I32, 1.0E-2),
    scaled("relPosE_m", Width::I32, 1.0E-2),
    scaled("relPosD_m", Width::I32, 1.0E-2),
    scaled("relPosLen_m", Width::I32, 1.0E-2),
    scaled("relPosHeading_deg", Width::I32, 1.0E-5),
    scaled("relPosLenAcc_m", Width::I32, 1.0E-4),
    scaled("relPosHeadingAcc_deg", Width::U32, 1.0E-5),
    raw("flags", Width::U16),
];

const INS: &[BinField] = &[
    raw("imu_time_ns", Width::U64),
    raw("gps_time_ns", Width::U64),
    scaled("lat_deg", Width::I32, 1.0E-7),
    scaled("lon_deg", Width::I32, 1.0E-7),
    scaled("alt_m", Width::I32, 1.0E-3),
    scaled("velocity_0_mps", Width::I32, 1.0E-3),
    scaled("velocity_1_mps", Width::I32, 1.0E-3),
    scaled("velocity_2_mps", Width::I32, 1.0E-3),
    scaled("attitude_0_deg", Width::I32, 1.0E-5),
    scaled("attitude_1_deg", Width::I32, 1.0E-5),
    scaled("attitude_2_deg", Width::I32, 1.0E-5),
    raw("zupt_flag", Width::U8),
    raw("ins_solution_status", Width::U8),
];

fn equivalent_type(subtype: u8) -> Option<MsgType> {
    match subtype {
        SUBTYPE_IMU => Some(MsgType::IMU),
        SUBTYPE_GPS => Some(MsgType::GPS),
        SUBTYPE_HDG => Some(MsgType::HDG),
        SUBTYPE_INS => Some(MsgType::INS),
        SUBTYPE_HPP => Some(MsgType::HPP),
        SUBTYPE_IM1 => Some(MsgType::IM1),
        SUBTYPE_UBX1 | SUBTYPE_UBX2 => Some(MsgType::UBX),
        _ => None,
    }
}

/// 10 bit length field, or None when reserved bits are set.
fn declared_len(buf: &[u8]) -> Option<usize> {
    if buf[1] & 0xfc != 0 {
        return None;
    }
    Some((((buf[1] & 0x03) as usize) << 8) | buf[2] as usize)
}

/// RTCM framed output.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcmScheme;

impl RtcmScheme {
    /// A valid frame has zero CRC residue over header, type, payload and CRC.
    fn check_valid(&self, frame: &[u8], msg: &mut Message) -> bool {
        if CRC24Q.checksum(frame) != 0 {
            msg.fail(ParseError::Checksum);
        }
        msg.valid
    }

    fn decode_payload_for_type(&self, msg: &mut Message, subtype: u8, payload: &[u8]) {
        let result = match subtype {
            SUBTYPE_IMU => decode_layout(msg, IMU_WITH_SYNC, payload)
                .or_else(|_| decode_layout(msg, IMU_NO_SYNC, payload)),
            SUBTYPE_IM1 => decode_layout(msg, IM1, payload),
            SUBTYPE_INS => decode_layout(msg, INS, payload),
            SUBTYPE_HDG => decode_layout(msg, HDG, payload).map(|_| extract_heading_flags(msg)),
            SUBTYPE_GPS => decode_layout(msg, GPS, payload).map(|_| {
                // second antenna reports as GP2
                if msg.u64("antenna_id").is_some_and(|id| id != 0) {
                    msg.msgtype = MsgType::GP2;
                }
            }),
            _ => {
                msg.set("payload", payload);
                if subtype == SUBTYPE_UBX2 {
                    msg.set("antenna_id", 1u64);
                }
                Ok(())
            },
        };
        match result {
            Ok(_) => derive_ms_times(msg),
            Err(e) => msg.fail(e),
        }
    }
}

impl Scheme for RtcmScheme {
    fn preamble(&self) -> &'static [u8] {
        &[PREAMBLE]
    }

    fn frame_len(&self, buf: &[u8]) -> FrameLen {
        if buf.len() < HEADER_LEN {
            return FrameLen::Incomplete;
        }
        let Some(len) = declared_len(buf) else {
            return FrameLen::Invalid;
        };
        if len < TYPE_LEN {
            return FrameLen::Invalid;
        }
        let total = HEADER_LEN + len + CRC_LEN;
        if buf.len() < total {
            FrameLen::Incomplete
        } else {
            FrameLen::Complete(total)
        }
    }

    fn parse_message(&self, raw: &[u8]) -> Message {
        if raw.first() != Some(&PREAMBLE) || raw.len() < HEADER_LEN + TYPE_LEN {
            return Message::invalid(MsgType::UNKNOWN, ParseError::Framing, raw);
        }

        let len = (((raw[1] & 0x03) as usize) << 8) | raw[2] as usize;
        let total = HEADER_LEN + len + CRC_LEN;

        // frame bytes past the declared end are not ours
        let frame = if raw.len() >= total { &raw[..total] } else { raw };

        let company = ((raw[3] as u16) << 4) | (raw[4] >> 4) as u16;
        let subtype = raw[4] & 0x0f;

        let mut msg = Message::new(equivalent_type(subtype).unwrap_or(MsgType::UNKNOWN));
        msg.raw = frame.to_vec();

        if !self.check_valid(frame, &mut msg) {
            return msg;
        }
        if frame.len() < total || len < TYPE_LEN {
            msg.fail(ParseError::Framing);
            return msg;
        }
        if company != COMPANY_ID || equivalent_type(subtype).is_none() {
            msg.fail(ParseError::UnknownType);
            return msg;
        }

        let payload = &frame[HEADER_LEN + TYPE_LEN..total - CRC_LEN];
        self.decode_payload_for_type(&mut msg, subtype, payload);
        msg
    }

    fn build_message_general(&self, msg: &Message) -> Result<Vec<u8>, Error> {
        let mut gps = None;

        let (subtype, layout) = match msg.msgtype {
            MsgType::IMU if msg.has("sync_time_ns") => (SUBTYPE_IMU, IMU_WITH_SYNC),
            MsgType::IMU => (SUBTYPE_IMU, IMU_NO_SYNC),
            MsgType::IM1 => (SUBTYPE_IM1, IM1),
            MsgType::INS => (SUBTYPE_INS, INS),
            MsgType::HDG => (SUBTYPE_HDG, HDG),
            MsgType::GPS | MsgType::GP2 => {
                if !msg.has("antenna_id") {
                    let antenna = if msg.msgtype == MsgType::GP2 { 1u64 } else { 0 };
                    gps = Some(msg.clone().with("antenna_id", antenna));
                }
                (SUBTYPE_GPS, GPS)
            },
            other => return Err(Error::UnknownMessageType(other)),
        };
        let msg = gps.as_ref().unwrap_or(msg);

        let word = (COMPANY_ID << 4) | subtype as u16;
        let mut body = word.to_be_bytes().to_vec();
        encode_layout(msg, layout, &mut body)?;

        let len = body.len();
        if len > MAX_LEN {
            return Err(Error::Encode("length".to_string()));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + len + CRC_LEN);
        frame.push(PREAMBLE);
        frame.push(((len >> 8) & 0x03) as u8);
        frame.push((len & 0xff) as u8);
        frame.extend_from_slice(&body);

        let crc = CRC24Q.checksum(&frame);
        frame.extend_from_slice(&crc.to_be_bytes()[1..]);
        Ok(frame)
    }
}
