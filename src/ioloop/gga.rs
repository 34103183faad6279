//! Position sentence some casters expect from their clients.
use hifitime::prelude::Epoch;

use crate::{
    message::{Message, MsgType},
    scheme::readable::checksum,
};

/// GGA quality indicator per carrier solution status: none, float, fixed.
fn quality(carrier_solution_status: i64) -> u8 {
    match carrier_solution_status {
        1 => 5,
        2 => 4,
        _ => 1,
    }
}

/// `DDMM.MMMMM` (or `DDDMM.MMMMM` with `width` 3) and hemisphere.
fn coordinate(value: f64, width: usize, positive: char, negative: char) -> (String, char) {
    let abs = value.abs();
    let degrees = abs.trunc();
    let minutes = 60.0 * (abs - degrees);
    let hemisphere = if value > 0.0 { positive } else { negative };
    (
        format!("{:0width$}{:08.5}", degrees as u32, minutes, width = width),
        hemisphere,
    )
}

/// `$GNGGA` sentence from a valid GPS fix.
pub fn build_gga(gps: &Message) -> Option<Vec<u8>> {
    if !gps.valid || (gps.msgtype != MsgType::GPS && gps.msgtype != MsgType::GP2) {
        return None;
    }

    let gps_time_ns = gps.u64("gps_time_ns")?;
    let lat = gps.f64("lat_deg")?;
    let lon = gps.f64("lon_deg")?;
    let num_sats = gps.i64("num_sats")?;
    let pdop = gps.f64("PDOP")?;
    let alt_msl = gps.f64("alt_msl_m")?;
    let carrier = gps.i64("carrier_solution_status").unwrap_or_default();

    let (_, _, _, hh, mm, ss, ns) = Epoch::from_gpst_nanoseconds(gps_time_ns).to_gregorian_utc();
    let centis = ns / 10_000_000;

    let (lat, ns_hemisphere) = coordinate(lat, 2, 'N', 'S');
    let (lon, ew_hemisphere) = coordinate(lon, 3, 'E', 'W');

    let fix = if num_sats >= 4 { quality(carrier) } else { 0 };

    // HDOP is not reported, PDOP is close enough
    let payload = format!(
        "GNGGA,{:02}{:02}{:02}.{:02},{},{},{},{},{},{:02},{:.2},{:.2},M,,M,,",
        hh, mm, ss, centis, lat, ns_hemisphere, lon, ew_hemisphere, fix, num_sats, pdop, alt_msl
    );

    Some(format!("${}*{:02X}\r\n", payload, checksum(payload.as_bytes())).into_bytes())
}
