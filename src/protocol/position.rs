//! Navigation sub-records: `EGTS_SR_POS_DATA` and `EGTS_SR_EXT_POS_DATA`.
//!
//! Values are kept in their wire representation so a decoded sub-record
//! encodes back to identical bytes; accessors convert to physical units.

use bytes::BufMut;
use chrono::{DateTime, TimeZone, Utc};

use super::subrecord::{SubrecordPayload, SubrecordType};
use super::{check_bits, Reader};
use crate::error::ProtocolError;

/// Unix timestamp of 2010-01-01T00:00:00Z, the protocol time origin.
pub const EGTS_EPOCH: i64 = 1_262_304_000;

/// Convert protocol seconds to UTC.
pub fn egts_time(seconds: u32) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(EGTS_EPOCH + i64::from(seconds), 0).single()
}

/// Convert UTC to protocol seconds. Times before 2010 clamp to zero.
pub fn to_egts_time(time: DateTime<Utc>) -> u32 {
    let secs = time.timestamp() - EGTS_EPOCH;
    u32::try_from(secs.max(0)).unwrap_or(u32::MAX)
}

/// `FLG` byte of `EGTS_SR_POS_DATA`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PosFlags(pub u8);

impl PosFlags {
    pub const VALID: u8 = 0x01;
    pub const FIX_3D: u8 = 0x02;
    /// Coordinate system: set for PZ-90.02, clear for WGS-84.
    pub const PZ90: u8 = 0x04;
    pub const BLACK_BOX: u8 = 0x08;
    pub const MOVING: u8 = 0x10;
    pub const SOUTH: u8 = 0x20;
    pub const WEST: u8 = 0x40;
    pub const ALTITUDE: u8 = 0x80;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_valid(self) -> bool {
        self.contains(Self::VALID)
    }

    fn with(self, bit: u8, on: bool) -> Self {
        if on {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }
}

const LAT_SCALE: f64 = 90.0 / 4_294_967_295.0;
const LON_SCALE: f64 = 180.0 / 4_294_967_295.0;

const SPEED_MASK: u16 = 0x3FFF;
const ALTS_BIT: u16 = 0x4000;
const DIRH_BIT: u16 = 0x8000;

/// `EGTS_SR_POS_DATA`: basic navigation fix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PosData {
    /// Seconds since 2010-01-01 UTC (`NTM`).
    pub navigation_time: u32,
    /// Latitude modulus scaled to `0..=u32::MAX` over 0..90 degrees.
    pub latitude_raw: u32,
    /// Longitude modulus scaled to `0..=u32::MAX` over 0..180 degrees.
    pub longitude_raw: u32,
    /// Hemisphere, validity and fix bits. `ALTITUDE` follows `altitude`.
    pub flags: PosFlags,
    /// Speed in 0.1 km/h, 14 bits.
    pub speed: u16,
    /// Course in degrees, 9 bits.
    pub direction: u16,
    /// Odometer in 0.1 km, 24 bits.
    pub odometer: u32,
    pub digital_inputs: u8,
    /// Reason the fix was sent (`SRC`).
    pub source: u8,
    /// Altitude modulus in metres, 24 bits.
    pub altitude: Option<u32>,
    /// Altitude sign (`ALTS`): set when below sea level.
    pub altitude_negative: bool,
    /// Source data (`SRCD`), present for some `SRC` values.
    pub source_data: Option<u16>,
}

impl PosData {
    /// Build a valid fix from physical units.
    pub fn from_degrees(time: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        let flags = PosFlags(PosFlags::VALID)
            .with(PosFlags::SOUTH, latitude < 0.0)
            .with(PosFlags::WEST, longitude < 0.0);
        Self {
            navigation_time: to_egts_time(time),
            latitude_raw: scale_to_raw(latitude.abs(), LAT_SCALE),
            longitude_raw: scale_to_raw(longitude.abs(), LON_SCALE),
            flags,
            ..Default::default()
        }
    }

    pub fn with_altitude(mut self, metres: i32) -> Self {
        self.altitude = Some(metres.unsigned_abs().min(0x00FF_FFFF));
        self.altitude_negative = metres < 0;
        self
    }

    pub fn with_motion(mut self, speed_kmh: f64, course: u16) -> Self {
        self.speed = scale_to_raw(speed_kmh * 10.0, 1.0).min(u32::from(SPEED_MASK)) as u16;
        self.direction = course % 360;
        self
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        egts_time(self.navigation_time)
    }

    pub fn latitude(&self) -> f64 {
        let v = f64::from(self.latitude_raw) * LAT_SCALE;
        if self.flags.contains(PosFlags::SOUTH) {
            -v
        } else {
            v
        }
    }

    pub fn longitude(&self) -> f64 {
        let v = f64::from(self.longitude_raw) * LON_SCALE;
        if self.flags.contains(PosFlags::WEST) {
            -v
        } else {
            v
        }
    }

    /// Signed altitude in metres.
    pub fn altitude_m(&self) -> Option<i32> {
        let alt = i32::try_from(self.altitude?).ok()?;
        Some(if self.altitude_negative { -alt } else { alt })
    }

    pub fn speed_kmh(&self) -> f64 {
        f64::from(self.speed) / 10.0
    }

    pub fn is_valid(&self) -> bool {
        self.flags.is_valid()
    }
}

fn scale_to_raw(value: f64, scale: f64) -> u32 {
    let raw = (value / scale).round();
    if raw <= 0.0 {
        0
    } else if raw >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        raw as u32
    }
}

impl SubrecordPayload for PosData {
    const TYPE: SubrecordType = SubrecordType::POS_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let navigation_time = r.u32("NTM")?;
        let latitude_raw = r.u32("LAT")?;
        let longitude_raw = r.u32("LONG")?;
        let raw_flags = PosFlags(r.u8("FLG")?);
        let spd = r.u16("SPD")?;
        let dir = r.u8("DIR")?;
        let odometer = r.u24("ODM")?;
        let digital_inputs = r.u8("DIN")?;
        let source = r.u8("SRC")?;
        let altitude = if raw_flags.contains(PosFlags::ALTITUDE) {
            Some(r.u24("ALT")?)
        } else {
            None
        };
        let source_data = if r.is_empty() { None } else { Some(r.u16("SRCD")?) };
        r.finish("EGTS_SR_POS_DATA", data.len())?;

        let dirh = if spd & DIRH_BIT != 0 { 0x100 } else { 0 };
        Ok(Self {
            navigation_time,
            latitude_raw,
            longitude_raw,
            // ALTE is carried by `altitude`
            flags: raw_flags.with(PosFlags::ALTITUDE, false),
            speed: spd & SPEED_MASK,
            direction: dirh | u16::from(dir),
            odometer,
            digital_inputs,
            source,
            altitude,
            altitude_negative: spd & ALTS_BIT != 0,
            source_data,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        check_bits("SPD", u32::from(self.speed), 14)?;
        check_bits("DIR", u32::from(self.direction), 9)?;
        check_bits("ODM", self.odometer, 24)?;
        if let Some(alt) = self.altitude {
            check_bits("ALT", alt, 24)?;
        }

        let flags = self.flags.with(PosFlags::ALTITUDE, self.altitude.is_some());
        let mut spd = self.speed;
        if self.altitude_negative {
            spd |= ALTS_BIT;
        }
        if self.direction & 0x100 != 0 {
            spd |= DIRH_BIT;
        }

        buf.put_u32_le(self.navigation_time);
        buf.put_u32_le(self.latitude_raw);
        buf.put_u32_le(self.longitude_raw);
        buf.put_u8(flags.0);
        buf.put_u16_le(spd);
        buf.put_u8((self.direction & 0xFF) as u8);
        buf.put_uint_le(u64::from(self.odometer), 3);
        buf.put_u8(self.digital_inputs);
        buf.put_u8(self.source);
        if let Some(alt) = self.altitude {
            buf.put_uint_le(u64::from(alt), 3);
        }
        if let Some(srcd) = self.source_data {
            buf.put_u16_le(srcd);
        }
        Ok(())
    }
}

mod ext_flags {
    pub const VFE: u8 = 0x01;
    pub const HFE: u8 = 0x02;
    pub const PFE: u8 = 0x04;
    pub const SFE: u8 = 0x08;
    pub const NSFE: u8 = 0x10;
}

/// `EGTS_SR_EXT_POS_DATA`: dilution of precision and satellite data.
///
/// DOP values are in hundredths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtPosData {
    pub vdop: Option<u16>,
    pub hdop: Option<u16>,
    pub pdop: Option<u16>,
    pub satellites: Option<u8>,
    /// Bit mask of navigation systems in use (GLONASS, GPS, ...).
    pub navigation_system: Option<u16>,
}

impl SubrecordPayload for ExtPosData {
    const TYPE: SubrecordType = SubrecordType::EXT_POS_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let flags = r.u8("EXT_POS_DATA flags")?;
        let has = |bit: u8| flags & bit != 0;

        let vdop = if has(ext_flags::VFE) { Some(r.u16("VDOP")?) } else { None };
        let hdop = if has(ext_flags::HFE) { Some(r.u16("HDOP")?) } else { None };
        let pdop = if has(ext_flags::PFE) { Some(r.u16("PDOP")?) } else { None };
        let satellites = if has(ext_flags::SFE) { Some(r.u8("SAT")?) } else { None };
        let navigation_system = if has(ext_flags::NSFE) { Some(r.u16("NS")?) } else { None };
        r.finish("EGTS_SR_EXT_POS_DATA", data.len())?;

        Ok(Self {
            vdop,
            hdop,
            pdop,
            satellites,
            navigation_system,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let mut flags = 0;
        for (present, bit) in [
            (self.vdop.is_some(), ext_flags::VFE),
            (self.hdop.is_some(), ext_flags::HFE),
            (self.pdop.is_some(), ext_flags::PFE),
            (self.satellites.is_some(), ext_flags::SFE),
            (self.navigation_system.is_some(), ext_flags::NSFE),
        ] {
            if present {
                flags |= bit;
            }
        }
        buf.put_u8(flags);
        for dop in [self.vdop, self.hdop, self.pdop].into_iter().flatten() {
            buf.put_u16_le(dop);
        }
        if let Some(sat) = self.satellites {
            buf.put_u8(sat);
        }
        if let Some(ns) = self.navigation_system {
            buf.put_u16_le(ns);
        }
        Ok(())
    }
}
