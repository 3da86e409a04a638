//! Sensor and counter sub-records of the telematics service.
//!
//! Flag-gated layouts follow one rule: a flag byte with one bit per slot,
//! then one value for every set bit, lowest bit first.

use bytes::BufMut;

use super::subrecord::{SubrecordPayload, SubrecordType};
use super::{check_bits, Reader};
use crate::error::ProtocolError;

/// Eight flag-gated slots.
pub type Slots<T> = [Option<T>; 8];

fn slot_flags<T>(slots: &Slots<T>) -> u8 {
    slots
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_some())
        .fold(0, |acc, (i, _)| acc | (1 << i))
}

fn read_slots<T: Copy>(
    r: &mut Reader<'_>,
    flags: u8,
    what: &'static str,
    mut read: impl FnMut(&mut Reader<'_>, &'static str) -> Result<T, ProtocolError>,
) -> Result<Slots<T>, ProtocolError> {
    let mut slots = [None; 8];
    for (i, slot) in slots.iter_mut().enumerate() {
        if flags & (1 << i) != 0 {
            *slot = Some(read(r, what)?);
        }
    }
    Ok(slots)
}

fn put_u24(buf: &mut Vec<u8>, field: &'static str, value: u32) -> Result<(), ProtocolError> {
    check_bits(field, value, 24)?;
    buf.put_uint_le(u64::from(value), 3);
    Ok(())
}

/// `EGTS_SR_AD_SENSORS_DATA`: digital inputs, outputs and analog sensors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdSensorsData {
    /// Additional digital input bytes (`ADIO1..8`).
    pub digital_inputs: Slots<u8>,
    /// Digital output states (`DOUT`).
    pub digital_outputs: u8,
    /// Analog sensor values (`ANS1..8`), 24 bits each.
    pub analog_sensors: Slots<u32>,
}

impl AdSensorsData {
    /// Present analog sensors as `(number, value)`, numbered from 1.
    pub fn analog_values(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        numbered(&self.analog_sensors)
    }
}

fn numbered<T: Copy>(slots: &Slots<T>) -> impl Iterator<Item = (u8, T)> + '_ {
    (1u8..).zip(slots.iter()).filter_map(|(n, v)| v.map(|v| (n, v)))
}

impl SubrecordPayload for AdSensorsData {
    const TYPE: SubrecordType = SubrecordType::AD_SENSORS_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let dioe = r.u8("DIOE")?;
        let digital_outputs = r.u8("DOUT")?;
        let asfe = r.u8("ASFE")?;
        let digital_inputs = read_slots(&mut r, dioe, "ADIO", |r, w| r.u8(w))?;
        let analog_sensors = read_slots(&mut r, asfe, "ANS", |r, w| r.u24(w))?;
        r.finish("EGTS_SR_AD_SENSORS_DATA", data.len())?;
        Ok(Self {
            digital_inputs,
            digital_outputs,
            analog_sensors,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.put_u8(slot_flags(&self.digital_inputs));
        buf.put_u8(self.digital_outputs);
        buf.put_u8(slot_flags(&self.analog_sensors));
        for v in self.digital_inputs.iter().flatten() {
            buf.put_u8(*v);
        }
        for v in self.analog_sensors.iter().flatten() {
            put_u24(buf, "ANS", *v)?;
        }
        Ok(())
    }
}

/// `EGTS_SR_COUNTERS_DATA`: up to eight 24-bit counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountersData {
    pub counters: Slots<u32>,
}

impl SubrecordPayload for CountersData {
    const TYPE: SubrecordType = SubrecordType::COUNTERS_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let cfe = r.u8("CFE")?;
        let counters = read_slots(&mut r, cfe, "CN", |r, w| r.u24(w))?;
        r.finish("EGTS_SR_COUNTERS_DATA", data.len())?;
        Ok(Self { counters })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.put_u8(slot_flags(&self.counters));
        for v in self.counters.iter().flatten() {
            put_u24(buf, "CN", *v)?;
        }
        Ok(())
    }
}

/// `EGTS_SR_STATE_DATA`: terminal mode and supply voltages (0.1 V units).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateData {
    pub state: u8,
    pub main_power_voltage: u8,
    pub backup_battery_voltage: u8,
    pub internal_battery_voltage: u8,
    /// Navigation module enabled (`NMS`).
    pub navigation_enabled: bool,
    /// Internal battery in use (`IBU`).
    pub internal_battery_used: bool,
    /// Backup battery in use (`BBU`).
    pub backup_battery_used: bool,
    /// Flag bits above `NMS`, kept as received.
    pub reserved_flags: u8,
}

const STATE_FLAG_MASK: u8 = 0x07;

impl SubrecordPayload for StateData {
    const TYPE: SubrecordType = SubrecordType::STATE_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let state = r.u8("ST")?;
        let main_power_voltage = r.u8("MPSV")?;
        let backup_battery_voltage = r.u8("BBV")?;
        let internal_battery_voltage = r.u8("IBV")?;
        let flags = r.u8("STATE_DATA flags")?;
        r.finish("EGTS_SR_STATE_DATA", data.len())?;
        Ok(Self {
            state,
            main_power_voltage,
            backup_battery_voltage,
            internal_battery_voltage,
            navigation_enabled: flags & 0x04 != 0,
            internal_battery_used: flags & 0x02 != 0,
            backup_battery_used: flags & 0x01 != 0,
            reserved_flags: flags & !STATE_FLAG_MASK,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let flags = u8::from(self.navigation_enabled) << 2
            | u8::from(self.internal_battery_used) << 1
            | u8::from(self.backup_battery_used)
            | self.reserved_flags & !STATE_FLAG_MASK;
        buf.put_u8(self.state);
        buf.put_u8(self.main_power_voltage);
        buf.put_u8(self.backup_battery_voltage);
        buf.put_u8(self.internal_battery_voltage);
        buf.put_u8(flags);
        Ok(())
    }
}

/// `EGTS_SR_LOOPIN_DATA`: loop input states, one byte per present loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopinData {
    pub states: Slots<u8>,
}

impl SubrecordPayload for LoopinData {
    const TYPE: SubrecordType = SubrecordType::LOOPIN_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let life = r.u8("LIFE")?;
        let states = read_slots(&mut r, life, "LIS", |r, w| r.u8(w))?;
        r.finish("EGTS_SR_LOOPIN_DATA", data.len())?;
        Ok(Self { states })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.put_u8(slot_flags(&self.states));
        for v in self.states.iter().flatten() {
            buf.put_u8(*v);
        }
        Ok(())
    }
}

/// Unpack a 12-bit number and 4-bit state from two bytes.
///
/// Byte 0 holds the low nibble of the number in its high half and the
/// state in its low half; byte 1 holds the number's upper 8 bits.
fn unpack_nibble_pair(b0: u8, b1: u8) -> (u16, u8) {
    let number = u16::from(b1) << 4 | u16::from(b0 >> 4);
    (number, b0 & 0x0F)
}

fn pack_nibble_pair(
    what: &'static str,
    number: u16,
    state: u8,
    buf: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    check_bits(what, u32::from(number), 12)?;
    check_bits(what, u32::from(state), 4)?;
    buf.put_u8(((number & 0x0F) as u8) << 4 | state);
    buf.put_u8((number >> 4) as u8);
    Ok(())
}

/// `EGTS_SR_ABS_DIG_SENS_DATA`: state of one digital sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbsDigSensData {
    /// Sensor number, 12 bits.
    pub number: u16,
    /// Sensor state, 4 bits.
    pub state: u8,
}

impl SubrecordPayload for AbsDigSensData {
    const TYPE: SubrecordType = SubrecordType::ABS_DIG_SENS_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let (number, state) = unpack_nibble_pair(r.u8("DSST")?, r.u8("DSN")?);
        r.finish("EGTS_SR_ABS_DIG_SENS_DATA", data.len())?;
        Ok(Self { number, state })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        pack_nibble_pair("DSN", self.number, self.state, buf)
    }
}

/// `EGTS_SR_ABS_LOOPIN_DATA`: state of one loop input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbsLoopinData {
    pub number: u16,
    pub state: u8,
}

impl SubrecordPayload for AbsLoopinData {
    const TYPE: SubrecordType = SubrecordType::ABS_LOOPIN_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let (number, state) = unpack_nibble_pair(r.u8("LIS")?, r.u8("LIN")?);
        r.finish("EGTS_SR_ABS_LOOPIN_DATA", data.len())?;
        Ok(Self { number, state })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        pack_nibble_pair("LIN", self.number, self.state, buf)
    }
}

/// `EGTS_SR_ABS_AN_SENS_DATA`: value of one analog sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbsAnSensData {
    pub number: u8,
    /// 24-bit value.
    pub value: u32,
}

impl SubrecordPayload for AbsAnSensData {
    const TYPE: SubrecordType = SubrecordType::ABS_AN_SENS_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let s = Self {
            number: r.u8("ASN")?,
            value: r.u24("ASV")?,
        };
        r.finish("EGTS_SR_ABS_AN_SENS_DATA", data.len())?;
        Ok(s)
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.put_u8(self.number);
        put_u24(buf, "ASV", self.value)
    }
}

/// `EGTS_SR_ABS_CNTR_DATA`: value of one counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbsCntrData {
    pub number: u8,
    /// 24-bit value.
    pub value: u32,
}

impl SubrecordPayload for AbsCntrData {
    const TYPE: SubrecordType = SubrecordType::ABS_CNTR_DATA;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let s = Self {
            number: r.u8("CN")?,
            value: r.u24("CNV")?,
        };
        r.finish("EGTS_SR_ABS_CNTR_DATA", data.len())?;
        Ok(s)
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.put_u8(self.number);
        put_u24(buf, "CNV", self.value)
    }
}

/// Unit of a liquid level reading (`LLSVU`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LiquidLevelUnit {
    /// Raw sensor value, not calibrated.
    #[default]
    Uncalibrated,
    /// 0.1 % of tank volume.
    Percent,
    /// 0.1 litre.
    Litres,
    Reserved,
}

impl LiquidLevelUnit {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Uncalibrated,
            1 => Self::Percent,
            2 => Self::Litres,
            _ => Self::Reserved,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Uncalibrated => 0,
            Self::Percent => 1,
            Self::Litres => 2,
            Self::Reserved => 3,
        }
    }
}

/// Liquid level payload: a calibrated value or raw sensor bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidLevelData {
    Value(u32),
    /// Raw data as sent by the sensor (`RDF` set), up to 512 bytes.
    Raw(Vec<u8>),
}

impl Default for LiquidLevelData {
    fn default() -> Self {
        Self::Value(0)
    }
}

const MAX_LIQUID_RAW: usize = 512;

/// `EGTS_SR_LIQUID_LEVEL_SENSOR`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiquidLevelSensor {
    /// Sensor number, 3 bits.
    pub number: u8,
    pub error: bool,
    pub unit: LiquidLevelUnit,
    /// Sensor bus address (`MADDR`).
    pub module_address: u16,
    pub data: LiquidLevelData,
    /// Reserved top bit of the flag byte.
    pub reserved: bool,
}

impl LiquidLevelSensor {
    /// Calibrated value, if the sensor sent one.
    pub fn value(&self) -> Option<u32> {
        match self.data {
            LiquidLevelData::Value(v) => Some(v),
            LiquidLevelData::Raw(_) => None,
        }
    }
}

impl SubrecordPayload for LiquidLevelSensor {
    const TYPE: SubrecordType = SubrecordType::LIQUID_LEVEL_SENSOR;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let flags = r.u8("LIQUID_LEVEL_SENSOR flags")?;
        let module_address = r.u16("MADDR")?;
        let raw = flags & 0x08 != 0;
        let data_field = if raw {
            let bytes = r.rest();
            if bytes.len() > MAX_LIQUID_RAW {
                return Err(ProtocolError::TooLarge {
                    what: "LLSD",
                    size: bytes.len(),
                    max: MAX_LIQUID_RAW,
                });
            }
            LiquidLevelData::Raw(bytes.to_vec())
        } else {
            LiquidLevelData::Value(r.u32("LLSD")?)
        };
        r.finish("EGTS_SR_LIQUID_LEVEL_SENSOR", data.len())?;

        Ok(Self {
            number: flags & 0x07,
            error: flags & 0x40 != 0,
            unit: LiquidLevelUnit::from_bits(flags >> 4),
            module_address,
            data: data_field,
            reserved: flags & 0x80 != 0,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        check_bits("LLSN", u32::from(self.number), 3)?;
        let raw = matches!(self.data, LiquidLevelData::Raw(_));
        let flags = u8::from(self.reserved) << 7
            | u8::from(self.error) << 6
            | self.unit.bits() << 4
            | u8::from(raw) << 3
            | self.number;
        buf.put_u8(flags);
        buf.put_u16_le(self.module_address);
        match &self.data {
            LiquidLevelData::Value(v) => buf.put_u32_le(*v),
            LiquidLevelData::Raw(bytes) => {
                if bytes.len() > MAX_LIQUID_RAW {
                    return Err(ProtocolError::TooLarge {
                        what: "LLSD",
                        size: bytes.len(),
                        max: MAX_LIQUID_RAW,
                    });
                }
                buf.extend_from_slice(bytes);
            }
        }
        Ok(())
    }
}

/// `EGTS_SR_PASSENGERS_COUNTERS`: per-door boarding counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassengersCountersData {
    /// Doors released (`DRL`) bit mask.
    pub doors_released: u8,
    pub module_address: u16,
    /// `(in, out)` per door, or raw bytes when the raw flag is set.
    pub counts: PassengerCounts,
    /// Flag bits other than the raw data flag, kept as received.
    pub reserved_flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassengerCounts {
    Doors(Slots<(u8, u8)>),
    Raw(Vec<u8>),
}

impl Default for PassengerCounts {
    fn default() -> Self {
        Self::Doors([None; 8])
    }
}

impl SubrecordPayload for PassengersCountersData {
    const TYPE: SubrecordType = SubrecordType::PASSENGERS_COUNTERS;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let flags = r.u8("PASSENGERS_COUNTERS flags")?;
        let dpr = r.u8("DPR")?;
        let doors_released = r.u8("DRL")?;
        let module_address = r.u16("MADDR")?;
        let counts = if flags & 0x01 != 0 {
            PassengerCounts::Raw(r.rest().to_vec())
        } else {
            PassengerCounts::Doors(read_slots(&mut r, dpr, "IPQ/OPQ", |r, w| {
                Ok((r.u8(w)?, r.u8(w)?))
            })?)
        };
        r.finish("EGTS_SR_PASSENGERS_COUNTERS", data.len())?;
        Ok(Self {
            doors_released,
            module_address,
            counts,
            reserved_flags: flags & !0x01,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let (raw, dpr) = match &self.counts {
            PassengerCounts::Doors(doors) => (false, slot_flags(doors)),
            PassengerCounts::Raw(_) => (true, 0),
        };
        buf.put_u8(u8::from(raw) | self.reserved_flags & !0x01);
        buf.put_u8(dpr);
        buf.put_u8(self.doors_released);
        buf.put_u16_le(self.module_address);
        match &self.counts {
            PassengerCounts::Doors(doors) => {
                for (inbound, outbound) in doors.iter().flatten() {
                    buf.put_u8(*inbound);
                    buf.put_u8(*outbound);
                }
            }
            PassengerCounts::Raw(bytes) => buf.extend_from_slice(bytes),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<P: SubrecordPayload>(p: &P) -> Vec<u8> {
        let mut buf = Vec::new();
        p.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_abs_dig_sens_nibble_layout() {
        let s = AbsDigSensData {
            number: 0xABC,
            state: 0x5,
        };
        assert_eq!(encode(&s), [0xC5, 0xAB]);
        assert_eq!(AbsDigSensData::decode(&[0xC5, 0xAB]).unwrap(), s);
    }

    #[test]
    fn test_abs_loopin_rejects_wide_values() {
        let s = AbsLoopinData {
            number: 0x1000,
            state: 0,
        };
        assert!(s.encode(&mut Vec::new()).is_err());
        let s = AbsLoopinData {
            number: 1,
            state: 0x10,
        };
        assert!(s.encode(&mut Vec::new()).is_err());
        assert!(AbsLoopinData::decode(&[0x01]).is_err());
    }

    #[test]
    fn test_ad_sensors_flag_order() {
        let mut ad = AdSensorsData::default();
        ad.digital_inputs[1] = Some(0x11);
        ad.digital_outputs = 0x80;
        ad.analog_sensors[0] = Some(0x0001_0203);
        ad.analog_sensors[7] = Some(7);

        let bytes = encode(&ad);
        assert_eq!(
            bytes,
            [0x02, 0x80, 0x81, 0x11, 0x03, 0x02, 0x01, 0x07, 0x00, 0x00]
        );
        assert_eq!(AdSensorsData::decode(&bytes).unwrap(), ad);
        assert_eq!(ad.analog_values().collect::<Vec<_>>(), vec![(1, 0x0001_0203), (8, 7)]);
    }

    #[test]
    fn test_ad_sensors_missing_value() {
        // ASFE announces two analog sensors, only one follows
        let bytes = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00];
        assert_eq!(
            AdSensorsData::decode(&bytes),
            Err(ProtocolError::UnexpectedEof("ANS"))
        );
    }

    #[test]
    fn test_loopin_one_byte_per_loop() {
        let bytes = [0x05, 0x01, 0x02];
        let l = LoopinData::decode(&bytes).unwrap();
        assert_eq!(l.states[0], Some(1));
        assert_eq!(l.states[1], None);
        assert_eq!(l.states[2], Some(2));
        assert_eq!(encode(&l), bytes);
    }

    #[test]
    fn test_state_data_flags() {
        let st = StateData::decode(&[2, 120, 40, 37, 0x05]).unwrap();
        assert!(st.navigation_enabled);
        assert!(!st.internal_battery_used);
        assert!(st.backup_battery_used);
        assert_eq!(encode(&st), [2, 120, 40, 37, 0x05]);
    }

    #[test]
    fn test_liquid_level_value_and_raw() {
        let llc = LiquidLevelSensor {
            number: 1,
            error: true,
            unit: LiquidLevelUnit::Litres,
            module_address: 0x0102,
            data: LiquidLevelData::Value(500),
            reserved: false,
        };
        let bytes = encode(&llc);
        assert_eq!(bytes, [0x61, 0x02, 0x01, 0xF4, 0x01, 0x00, 0x00]);
        assert_eq!(LiquidLevelSensor::decode(&bytes).unwrap(), llc);
        assert_eq!(llc.value(), Some(500));

        let raw = LiquidLevelSensor {
            data: LiquidLevelData::Raw(vec![9, 8, 7]),
            ..llc
        };
        let bytes = encode(&raw);
        assert_eq!(bytes[0] & 0x08, 0x08);
        assert_eq!(LiquidLevelSensor::decode(&bytes).unwrap(), raw);
        assert_eq!(raw.value(), None);
    }

    #[test]
    fn test_counters_roundtrip_sparse() {
        let mut c = CountersData::default();
        c.counters[3] = Some(0x00FF_FFFF);
        let bytes = encode(&c);
        assert_eq!(bytes, [0x08, 0xFF, 0xFF, 0xFF]);
        assert_eq!(CountersData::decode(&bytes).unwrap(), c);

        c.counters[0] = Some(0x0100_0000);
        assert!(c.encode(&mut Vec::new()).is_err());
    }

    #[test]
    fn test_passenger_doors() {
        let mut doors = [None; 8];
        doors[0] = Some((3, 1));
        doors[2] = Some((0, 4));
        let pc = PassengersCountersData {
            doors_released: 0x05,
            module_address: 7,
            counts: PassengerCounts::Doors(doors),
            reserved_flags: 0,
        };
        let bytes = encode(&pc);
        assert_eq!(bytes, [0x00, 0x05, 0x05, 0x07, 0x00, 3, 1, 0, 4]);
        assert_eq!(PassengersCountersData::decode(&bytes).unwrap(), pc);
    }

    #[test]
    fn test_reserved_flag_bits_survive_reencoding() {
        let state = [2, 120, 40, 37, 0xA4];
        let st = StateData::decode(&state).unwrap();
        assert!(st.navigation_enabled);
        assert_eq!(st.reserved_flags, 0xA0);
        assert_eq!(encode(&st), state);

        let liquid = [0xA2, 0x01, 0x00, 0x10, 0x00, 0x00, 0x00];
        let llc = LiquidLevelSensor::decode(&liquid).unwrap();
        assert!(llc.reserved);
        assert_eq!(llc.unit, LiquidLevelUnit::Litres);
        assert_eq!(llc.number, 2);
        assert_eq!(encode(&llc), liquid);

        let passengers = [0x80, 0x01, 0x00, 0x02, 0x00, 5, 6];
        let pc = PassengersCountersData::decode(&passengers).unwrap();
        assert_eq!(pc.reserved_flags, 0x80);
        assert_eq!(encode(&pc), passengers);
    }
}
