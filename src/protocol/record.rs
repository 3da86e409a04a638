//! Service data records (`SDR`).

use bytes::BufMut;

use super::subrecord::{self, Subrecord};
use super::{wire_len, Reader};
use crate::error::ProtocolError;

/// Ordered records of one packet. Order is the reply correlation order.
pub type ServiceDataSet = Vec<ServiceDataRecord>;

/// Record flags carried in `RFL` that are not derived from optional fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFlags {
    /// Source service is on the terminal side (`SSOD`).
    pub source_on_device: bool,
    /// Recipient service is on the terminal side (`RSOD`).
    pub recipient_on_device: bool,
    /// Record belongs to a group (`GRP`).
    pub group: bool,
    /// Record processing priority (`RPP`), 2 bits.
    pub priority: u8,
}

const SSOD: u8 = 0x80;
const RSOD: u8 = 0x40;
const GRP: u8 = 0x20;
const TMFE: u8 = 0x04;
const EVFE: u8 = 0x02;
const OBFE: u8 = 0x01;

impl RecordFlags {
    fn from_byte(b: u8) -> Self {
        Self {
            source_on_device: b & SSOD != 0,
            recipient_on_device: b & RSOD != 0,
            group: b & GRP != 0,
            priority: (b >> 3) & 0x03,
        }
    }

    fn to_byte(self) -> u8 {
        let mut b = (self.priority & 0x03) << 3;
        if self.source_on_device {
            b |= SSOD;
        }
        if self.recipient_on_device {
            b |= RSOD;
        }
        if self.group {
            b |= GRP;
        }
        b
    }
}

/// One service data record and its sub-records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDataRecord {
    /// Record number (`RN`), echoed back in the acknowledgement.
    pub record_number: u16,
    pub flags: RecordFlags,
    /// Object identifier (`OID`), present when `OBFE` is set.
    pub object_id: Option<u32>,
    /// Event identifier (`EVID`), present when `EVFE` is set.
    pub event_id: Option<u32>,
    /// Record time (`TM`), seconds since 2010-01-01 UTC.
    pub time: Option<u32>,
    /// Source service type (`SST`).
    pub source_service: u8,
    /// Recipient service type (`RST`).
    pub recipient_service: u8,
    pub subrecords: Vec<Subrecord>,
}

impl ServiceDataRecord {
    /// Record addressed from and to the same service.
    pub fn new(record_number: u16, service: u8, subrecords: Vec<Subrecord>) -> Self {
        Self {
            record_number,
            source_service: service,
            recipient_service: service,
            subrecords,
            ..Default::default()
        }
    }

    /// Object identifier from the record header, or else from a
    /// `TERM_IDENTITY` sub-record inside it.
    pub fn object_id_hint(&self) -> Option<u32> {
        self.object_id.or_else(|| {
            self.subrecords.iter().find_map(|sr| match sr {
                Subrecord::TermIdentity(ti) => Some(ti.terminal_id),
                _ => None,
            })
        })
    }

    pub fn has_unknown_subrecords(&self) -> bool {
        self.subrecords.iter().any(Subrecord::is_unknown)
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let rl = usize::from(r.u16("RL")?);
        let record_number = r.u16("RN")?;
        let rfl = r.u8("RFL")?;
        let object_id = if rfl & OBFE != 0 { Some(r.u32("OID")?) } else { None };
        let event_id = if rfl & EVFE != 0 { Some(r.u32("EVID")?) } else { None };
        let time = if rfl & TMFE != 0 { Some(r.u32("TM")?) } else { None };
        let source_service = r.u8("SST")?;
        let recipient_service = r.u8("RST")?;

        if rl > r.remaining() {
            return Err(ProtocolError::LengthMismatch {
                what: "service data record",
                declared: rl,
                actual: r.remaining(),
            });
        }
        let subrecords = subrecord::decode_set(r.bytes(rl, "RD")?)?;

        Ok(Self {
            record_number,
            flags: RecordFlags::from_byte(rfl),
            object_id,
            event_id,
            time,
            source_service,
            recipient_service,
            subrecords,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let mut rd = Vec::new();
        subrecord::encode_set(&self.subrecords, &mut rd)?;

        let mut rfl = self.flags.to_byte();
        if self.object_id.is_some() {
            rfl |= OBFE;
        }
        if self.event_id.is_some() {
            rfl |= EVFE;
        }
        if self.time.is_some() {
            rfl |= TMFE;
        }

        buf.put_u16_le(wire_len("record data", rd.len())?);
        buf.put_u16_le(self.record_number);
        buf.put_u8(rfl);
        for v in [self.object_id, self.event_id, self.time].into_iter().flatten() {
            buf.put_u32_le(v);
        }
        buf.put_u8(self.source_service);
        buf.put_u8(self.recipient_service);
        buf.extend_from_slice(&rd);
        Ok(())
    }
}

/// Decode records until the buffer is exhausted.
pub(crate) fn decode_records(data: &[u8]) -> Result<ServiceDataSet, ProtocolError> {
    let mut r = Reader::new(data);
    let mut records = Vec::new();
    while !r.is_empty() {
        records.push(ServiceDataRecord::decode(&mut r)?);
    }
    Ok(records)
}

pub(crate) fn encode_records(
    records: &[ServiceDataRecord],
    buf: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    for record in records {
        record.encode(buf)?;
    }
    Ok(())
}
