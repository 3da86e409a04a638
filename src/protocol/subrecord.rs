//! Sub-record dispatch.
//!
//! Every sub-record on the wire is `SRT (1) | SRL (2) | SRD (SRL bytes)`.
//! The type code selects one payload variant; codes nobody registered are
//! kept as opaque bytes so a packet with unfamiliar sub-records still decodes,
//! re-encodes byte-for-byte, and can be acknowledged per record.

use std::fmt;

use bytes::BufMut;

use super::identity::{AuthInfo, DispatcherIdentity, RecordResponse, ResultCodeData, TermIdentity};
use super::position::{ExtPosData, PosData};
use super::sensors::{
    AbsAnSensData, AbsCntrData, AbsDigSensData, AbsLoopinData, AdSensorsData, CountersData,
    LiquidLevelSensor, LoopinData, PassengersCountersData, StateData,
};
use super::{wire_len, Reader};
use crate::error::ProtocolError;

/// A sub-record payload with its own bit-level layout.
pub trait SubrecordPayload: Sized {
    /// Type code (`SRT`) this payload is registered under.
    const TYPE: SubrecordType;

    /// Decode from exactly the `SRD` bytes; trailing bytes are an error.
    fn decode(data: &[u8]) -> Result<Self, ProtocolError>;

    /// Append the `SRD` bytes.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError>;
}

/// Sub-record type code (`SRT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubrecordType(pub u8);

impl SubrecordType {
    pub const RECORD_RESPONSE: Self = Self(0);
    pub const TERM_IDENTITY: Self = Self(1);
    pub const DISPATCHER_IDENTITY: Self = Self(6);
    pub const AUTH_INFO: Self = Self(7);
    pub const RESULT_CODE: Self = Self(9);
    pub const POS_DATA: Self = Self(16);
    pub const EXT_POS_DATA: Self = Self(17);
    pub const AD_SENSORS_DATA: Self = Self(18);
    pub const COUNTERS_DATA: Self = Self(19);
    pub const STATE_DATA: Self = Self(20);
    pub const LOOPIN_DATA: Self = Self(22);
    pub const ABS_DIG_SENS_DATA: Self = Self(23);
    pub const ABS_AN_SENS_DATA: Self = Self(24);
    pub const ABS_CNTR_DATA: Self = Self(25);
    pub const ABS_LOOPIN_DATA: Self = Self(26);
    pub const LIQUID_LEVEL_SENSOR: Self = Self(27);
    pub const PASSENGERS_COUNTERS: Self = Self(28);

    /// Protocol name of the type code, if it is one we understand.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::RECORD_RESPONSE => "EGTS_SR_RECORD_RESPONSE",
            Self::TERM_IDENTITY => "EGTS_SR_TERM_IDENTITY",
            Self::DISPATCHER_IDENTITY => "EGTS_SR_DISPATCHER_IDENTITY",
            Self::AUTH_INFO => "EGTS_SR_AUTH_INFO",
            Self::RESULT_CODE => "EGTS_SR_RESULT_CODE",
            Self::POS_DATA => "EGTS_SR_POS_DATA",
            Self::EXT_POS_DATA => "EGTS_SR_EXT_POS_DATA",
            Self::AD_SENSORS_DATA => "EGTS_SR_AD_SENSORS_DATA",
            Self::COUNTERS_DATA => "EGTS_SR_COUNTERS_DATA",
            Self::STATE_DATA => "EGTS_SR_STATE_DATA",
            Self::LOOPIN_DATA => "EGTS_SR_LOOPIN_DATA",
            Self::ABS_DIG_SENS_DATA => "EGTS_SR_ABS_DIG_SENS_DATA",
            Self::ABS_AN_SENS_DATA => "EGTS_SR_ABS_AN_SENS_DATA",
            Self::ABS_CNTR_DATA => "EGTS_SR_ABS_CNTR_DATA",
            Self::ABS_LOOPIN_DATA => "EGTS_SR_ABS_LOOPIN_DATA",
            Self::LIQUID_LEVEL_SENSOR => "EGTS_SR_LIQUID_LEVEL_SENSOR",
            Self::PASSENGERS_COUNTERS => "EGTS_SR_PASSENGERS_COUNTERS",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for SubrecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "SRT={}", self.0),
        }
    }
}

/// Decoded sub-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subrecord {
    RecordResponse(RecordResponse),
    TermIdentity(TermIdentity),
    DispatcherIdentity(DispatcherIdentity),
    AuthInfo(AuthInfo),
    ResultCode(ResultCodeData),
    PosData(PosData),
    ExtPosData(ExtPosData),
    AdSensorsData(AdSensorsData),
    CountersData(CountersData),
    StateData(StateData),
    LoopinData(LoopinData),
    AbsDigSensData(AbsDigSensData),
    AbsAnSensData(AbsAnSensData),
    AbsCntrData(AbsCntrData),
    AbsLoopinData(AbsLoopinData),
    LiquidLevelSensor(LiquidLevelSensor),
    PassengersCounters(PassengersCountersData),
    /// Type code without a registered decoder; raw `SRD` bytes.
    Unknown { subrecord_type: u8, data: Vec<u8> },
}

impl Subrecord {
    /// Decode one payload selected by its type code.
    pub fn decode(subrecord_type: u8, data: &[u8]) -> Result<Self, ProtocolError> {
        let sr = match SubrecordType(subrecord_type) {
            SubrecordType::RECORD_RESPONSE => Self::RecordResponse(RecordResponse::decode(data)?),
            SubrecordType::TERM_IDENTITY => Self::TermIdentity(TermIdentity::decode(data)?),
            SubrecordType::DISPATCHER_IDENTITY => {
                Self::DispatcherIdentity(DispatcherIdentity::decode(data)?)
            }
            SubrecordType::AUTH_INFO => Self::AuthInfo(AuthInfo::decode(data)?),
            SubrecordType::RESULT_CODE => Self::ResultCode(ResultCodeData::decode(data)?),
            SubrecordType::POS_DATA => Self::PosData(PosData::decode(data)?),
            SubrecordType::EXT_POS_DATA => Self::ExtPosData(ExtPosData::decode(data)?),
            SubrecordType::AD_SENSORS_DATA => Self::AdSensorsData(AdSensorsData::decode(data)?),
            SubrecordType::COUNTERS_DATA => Self::CountersData(CountersData::decode(data)?),
            SubrecordType::STATE_DATA => Self::StateData(StateData::decode(data)?),
            SubrecordType::LOOPIN_DATA => Self::LoopinData(LoopinData::decode(data)?),
            SubrecordType::ABS_DIG_SENS_DATA => Self::AbsDigSensData(AbsDigSensData::decode(data)?),
            SubrecordType::ABS_AN_SENS_DATA => Self::AbsAnSensData(AbsAnSensData::decode(data)?),
            SubrecordType::ABS_CNTR_DATA => Self::AbsCntrData(AbsCntrData::decode(data)?),
            SubrecordType::ABS_LOOPIN_DATA => Self::AbsLoopinData(AbsLoopinData::decode(data)?),
            SubrecordType::LIQUID_LEVEL_SENSOR => {
                Self::LiquidLevelSensor(LiquidLevelSensor::decode(data)?)
            }
            SubrecordType::PASSENGERS_COUNTERS => {
                Self::PassengersCounters(PassengersCountersData::decode(data)?)
            }
            _ => Self::Unknown {
                subrecord_type,
                data: data.to_vec(),
            },
        };
        Ok(sr)
    }

    /// Append this payload's `SRD` bytes.
    pub fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Self::RecordResponse(p) => p.encode(buf),
            Self::TermIdentity(p) => p.encode(buf),
            Self::DispatcherIdentity(p) => p.encode(buf),
            Self::AuthInfo(p) => p.encode(buf),
            Self::ResultCode(p) => p.encode(buf),
            Self::PosData(p) => p.encode(buf),
            Self::ExtPosData(p) => p.encode(buf),
            Self::AdSensorsData(p) => p.encode(buf),
            Self::CountersData(p) => p.encode(buf),
            Self::StateData(p) => p.encode(buf),
            Self::LoopinData(p) => p.encode(buf),
            Self::AbsDigSensData(p) => p.encode(buf),
            Self::AbsAnSensData(p) => p.encode(buf),
            Self::AbsCntrData(p) => p.encode(buf),
            Self::AbsLoopinData(p) => p.encode(buf),
            Self::LiquidLevelSensor(p) => p.encode(buf),
            Self::PassengersCounters(p) => p.encode(buf),
            Self::Unknown { data, .. } => {
                buf.extend_from_slice(data);
                Ok(())
            }
        }
    }

    /// Type code this sub-record is written under.
    pub fn subrecord_type(&self) -> SubrecordType {
        match self {
            Self::RecordResponse(_) => RecordResponse::TYPE,
            Self::TermIdentity(_) => TermIdentity::TYPE,
            Self::DispatcherIdentity(_) => DispatcherIdentity::TYPE,
            Self::AuthInfo(_) => AuthInfo::TYPE,
            Self::ResultCode(_) => ResultCodeData::TYPE,
            Self::PosData(_) => PosData::TYPE,
            Self::ExtPosData(_) => ExtPosData::TYPE,
            Self::AdSensorsData(_) => AdSensorsData::TYPE,
            Self::CountersData(_) => CountersData::TYPE,
            Self::StateData(_) => StateData::TYPE,
            Self::LoopinData(_) => LoopinData::TYPE,
            Self::AbsDigSensData(_) => AbsDigSensData::TYPE,
            Self::AbsAnSensData(_) => AbsAnSensData::TYPE,
            Self::AbsCntrData(_) => AbsCntrData::TYPE,
            Self::AbsLoopinData(_) => AbsLoopinData::TYPE,
            Self::LiquidLevelSensor(_) => LiquidLevelSensor::TYPE,
            Self::PassengersCounters(_) => PassengersCountersData::TYPE,
            Self::Unknown { subrecord_type, .. } => SubrecordType(*subrecord_type),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }

    /// Encoded size including the 3-byte sub-record header.
    pub fn encoded_len(&self) -> Result<usize, ProtocolError> {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload)?;
        Ok(3 + payload.len())
    }
}

/// Decode a record's `RD` field into its sub-records.
pub(crate) fn decode_set(data: &[u8]) -> Result<Vec<Subrecord>, ProtocolError> {
    let mut reader = Reader::new(data);
    let mut set = Vec::new();

    while !reader.is_empty() {
        let srt = reader.u8("SRT")?;
        let srl = usize::from(reader.u16("SRL")?);
        if srl > reader.remaining() {
            return Err(ProtocolError::LengthMismatch {
                what: "sub-record",
                declared: srl,
                actual: reader.remaining(),
            });
        }
        let payload = reader.bytes(srl, "SRD")?;
        set.push(Subrecord::decode(srt, payload)?);
    }

    Ok(set)
}

/// Encode sub-records, computing each `SRL` from the payload.
pub(crate) fn encode_set(set: &[Subrecord], buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let mut payload = Vec::new();
    for sr in set {
        payload.clear();
        sr.encode_payload(&mut payload)?;
        buf.put_u8(sr.subrecord_type().0);
        buf.put_u16_le(wire_len("sub-record", payload.len())?);
        buf.extend_from_slice(&payload);
    }
    Ok(())
}
