//! Transport layer packet: header, routing and frame data.

use bytes::BufMut;
use thiserror::Error;

use super::record::{decode_records, encode_records, ServiceDataSet};
use super::{
    frame_checksum, header_checksum, packet_len, wire_len, Reader, ResultCode, FIXED_HEADER_SIZE,
    FRAME_CHECKSUM_SIZE, HEADER_LEN, MAX_FRAME_DATA_LEN, PROTOCOL_MARKER, ROUTED_HEADER_LEN,
};
use crate::error::ProtocolError;

/// Packet type identifier (`PT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Acknowledgement of a received packet.
    Response = 0,
    /// Application data.
    AppData = 1,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Response),
            1 => Some(Self::AppData),
            _ => None,
        }
    }
}

/// Header flag fields other than the route flag, which follows `routing`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// Header prefix (`PRF`), 2 bits.
    pub prefix: u8,
    /// Encryption algorithm (`ENA`), 2 bits. Zero means plain text.
    pub encryption: u8,
    /// Frame data is compressed (`CMP`).
    pub compressed: bool,
    /// Routing priority (`PR`), 2 bits.
    pub priority: u8,
}

const RTE: u8 = 0x20;

impl PacketFlags {
    fn from_byte(b: u8) -> Self {
        Self {
            prefix: b >> 6,
            encryption: (b >> 3) & 0x03,
            compressed: b & 0x04 != 0,
            priority: b & 0x03,
        }
    }

    fn to_byte(self, routed: bool) -> u8 {
        (self.prefix & 0x03) << 6
            | u8::from(routed) << 5
            | (self.encryption & 0x03) << 3
            | u8::from(self.compressed) << 2
            | (self.priority & 0x03)
    }
}

/// Routing fields present when the route flag is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Routing {
    /// Sender address (`PRA`).
    pub peer_address: u16,
    /// Recipient address (`RCA`).
    pub recipient_address: u16,
    /// Remaining hops (`TTL`).
    pub ttl: u8,
}

/// Frame data of a `RESPONSE` packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtResponse {
    /// Identifier of the packet being acknowledged (`RPID`).
    pub response_packet_id: u16,
    /// Packet-level processing result (`PR`).
    pub processing_result: u8,
    /// Per-record acknowledgements.
    pub records: ServiceDataSet,
}

impl PtResponse {
    pub fn result(&self) -> ResultCode {
        ResultCode::from(self.processing_result)
    }
}

/// Services frame data (`SFRD`), selected by packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    AppData(ServiceDataSet),
    Response(PtResponse),
}

/// A complete EGTS transport packet.
///
/// Length fields and checksums are not stored: they are computed by
/// [`Packet::encode`] and verified by [`Packet::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Security key id (`SKID`).
    pub security_key_id: u8,
    pub flags: PacketFlags,
    /// Header encoding method (`HE`).
    pub header_encoding: u8,
    /// Packet identifier (`PID`), wraps at `u16::MAX`.
    pub packet_id: u16,
    pub routing: Option<Routing>,
    pub frame: Frame,
}

/// A decode error together with whatever could be recovered for the reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct DecodeFailure {
    /// Packet identifier, if the fixed header was readable.
    pub packet_id: Option<u16>,
    pub error: ProtocolError,
}

impl DecodeFailure {
    pub fn result_code(&self) -> ResultCode {
        self.error.result_code()
    }
}

impl Packet {
    pub fn app_data(packet_id: u16, records: ServiceDataSet) -> Self {
        Self {
            security_key_id: 0,
            flags: PacketFlags::default(),
            header_encoding: 0,
            packet_id,
            routing: None,
            frame: Frame::AppData(records),
        }
    }

    pub fn response(
        packet_id: u16,
        response_packet_id: u16,
        result: ResultCode,
        records: ServiceDataSet,
    ) -> Self {
        Self {
            frame: Frame::Response(PtResponse {
                response_packet_id,
                processing_result: result.into(),
                records,
            }),
            ..Self::app_data(packet_id, Vec::new())
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self.frame {
            Frame::AppData(_) => PacketType::AppData,
            Frame::Response(_) => PacketType::Response,
        }
    }

    /// Records carried by the packet, whatever its type.
    pub fn records(&self) -> &[super::ServiceDataRecord] {
        match &self.frame {
            Frame::AppData(records) => records,
            Frame::Response(resp) => &resp.records,
        }
    }

    pub fn header_len(&self) -> u8 {
        if self.routing.is_some() {
            ROUTED_HEADER_LEN
        } else {
            HEADER_LEN
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut sfrd = Vec::new();
        match &self.frame {
            Frame::AppData(records) => encode_records(records, &mut sfrd)?,
            Frame::Response(resp) => {
                sfrd.put_u16_le(resp.response_packet_id);
                sfrd.put_u8(resp.processing_result);
                encode_records(&resp.records, &mut sfrd)?;
            }
        }
        if sfrd.len() > MAX_FRAME_DATA_LEN {
            return Err(ProtocolError::TooLarge {
                what: "frame data",
                size: sfrd.len(),
                max: MAX_FRAME_DATA_LEN,
            });
        }
        let fdl = wire_len("frame data", sfrd.len())?;

        let hl = self.header_len();
        let mut buf = Vec::with_capacity(usize::from(hl) + sfrd.len() + FRAME_CHECKSUM_SIZE);
        buf.put_u8(PROTOCOL_MARKER);
        buf.put_u8(self.security_key_id);
        buf.put_u8(self.flags.to_byte(self.routing.is_some()));
        buf.put_u8(hl);
        buf.put_u8(self.header_encoding);
        buf.put_u16_le(fdl);
        buf.put_u16_le(self.packet_id);
        buf.put_u8(self.packet_type() as u8);
        if let Some(routing) = &self.routing {
            buf.put_u16_le(routing.peer_address);
            buf.put_u16_le(routing.recipient_address);
            buf.put_u8(routing.ttl);
        }
        buf.put_u8(header_checksum(&buf));

        if !sfrd.is_empty() {
            buf.extend_from_slice(&sfrd);
            buf.put_u16_le(frame_checksum(&sfrd));
        }
        Ok(buf)
    }

    /// Decode one complete packet.
    ///
    /// Never panics. On failure the packet identifier is reported whenever
    /// the fixed header was readable, so the caller can still acknowledge.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeFailure> {
        let fail = |packet_id, error| DecodeFailure { packet_id, error };

        let Some(&marker) = data.first() else {
            return Err(fail(None, ProtocolError::UnexpectedEof("PRV")));
        };
        if marker != PROTOCOL_MARKER {
            return Err(fail(None, ProtocolError::InvalidMarker(marker)));
        }
        let Some(fixed) = data.get(..FIXED_HEADER_SIZE) else {
            return Err(fail(None, ProtocolError::UnexpectedEof("packet header")));
        };
        let packet_id = u16::from_le_bytes([fixed[7], fixed[8]]);

        Self::decode_with_id(data, packet_id).map_err(|error| fail(Some(packet_id), error))
    }

    fn decode_with_id(data: &[u8], packet_id: u16) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        r.u8("PRV")?;
        let security_key_id = r.u8("SKID")?;
        let flag_byte = r.u8("packet flags")?;
        let hl = r.u8("HL")?;
        let header_encoding = r.u8("HE")?;
        let fdl = usize::from(r.u16("FDL")?);
        r.u16("PID")?;
        let pt = r.u8("PT")?;

        let routed = flag_byte & RTE != 0;
        let expected_hl = if routed { ROUTED_HEADER_LEN } else { HEADER_LEN };
        if hl != expected_hl {
            return Err(ProtocolError::InvalidHeaderLength {
                expected: expected_hl,
                got: hl,
            });
        }

        let routing = if routed {
            Some(Routing {
                peer_address: r.u16("PRA")?,
                recipient_address: r.u16("RCA")?,
                ttl: r.u8("TTL")?,
            })
        } else {
            None
        };

        let declared_hcs = r.u8("HCS")?;
        let computed_hcs = header_checksum(&data[..usize::from(hl) - 1]);
        if declared_hcs != computed_hcs {
            return Err(ProtocolError::HeaderChecksum {
                declared: declared_hcs,
                computed: computed_hcs,
            });
        }

        if fdl > MAX_FRAME_DATA_LEN {
            return Err(ProtocolError::TooLarge {
                what: "frame data",
                size: fdl,
                max: MAX_FRAME_DATA_LEN,
            });
        }

        let mut fixed = [0u8; FIXED_HEADER_SIZE];
        fixed.copy_from_slice(&data[..FIXED_HEADER_SIZE]);
        let total = packet_len(&fixed).unwrap_or(data.len());
        if data.len() != total {
            return Err(ProtocolError::LengthMismatch {
                what: "packet",
                declared: total,
                actual: data.len(),
            });
        }

        let flags = PacketFlags::from_byte(flag_byte);
        if flags.encryption != 0 {
            return Err(ProtocolError::Encrypted(flags.encryption));
        }
        if flags.compressed {
            return Err(ProtocolError::Compressed);
        }

        let packet_type = PacketType::from_u8(pt).ok_or(ProtocolError::UnsupportedPacketType(pt))?;

        let sfrd = if fdl > 0 {
            let sfrd = r.bytes(fdl, "SFRD")?;
            let declared = r.u16("SFRCS")?;
            let computed = frame_checksum(sfrd);
            if declared != computed {
                return Err(ProtocolError::FrameChecksum { declared, computed });
            }
            sfrd
        } else {
            &[]
        };

        let frame = match packet_type {
            PacketType::AppData => Frame::AppData(decode_records(sfrd)?),
            PacketType::Response => {
                let mut fr = Reader::new(sfrd);
                let response_packet_id = fr.u16("RPID")?;
                let processing_result = fr.u8("PR")?;
                Frame::Response(PtResponse {
                    response_packet_id,
                    processing_result,
                    records: decode_records(fr.rest())?,
                })
            }
        };

        Ok(Self {
            security_key_id,
            flags,
            header_encoding,
            packet_id,
            routing,
            frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        egts_time, service, AbsAnSensData, AbsCntrData, AbsDigSensData, AbsLoopinData,
        AdSensorsData, AuthInfo, CountersData, DispatcherIdentity, ExtPosData, LiquidLevelData,
        LiquidLevelSensor, LiquidLevelUnit, LoopinData, PassengerCounts, PassengersCountersData,
        PosData, RecordResponse, ResultCodeData, ServiceDataRecord, StateData, Subrecord,
        TermIdentity,
    };

    /// APPDATA from a terminal: POS_DATA with altitude, EXT_POS_DATA and
    /// ABS_CNTR_DATA in one record carrying OID and TM.
    const TERMINAL_FRAME: &str = "0100030b0038003401014429005f008502c23b0069f6b910020210180069f6b910\
                                  b143ff9e733b3a35832200ac00000000009500001104000a7800091904006e915f01eacc";

    fn every_subrecord() -> Vec<Subrecord> {
        let mut ad = AdSensorsData::default();
        ad.digital_inputs[2] = Some(0x0F);
        ad.analog_sensors[0] = Some(1200);
        let mut counters = CountersData::default();
        counters.counters[1] = Some(77);
        let mut loops = LoopinData::default();
        loops.states[4] = Some(3);
        let mut doors = [None; 8];
        doors[1] = Some((4, 2));

        vec![
            Subrecord::RecordResponse(RecordResponse::new(3, ResultCode::Ok)),
            Subrecord::TermIdentity(TermIdentity {
                terminal_id: 38741609,
                imei: Some(*b"866795038741609"),
                buffer_size: Some(1024),
                ..Default::default()
            }),
            Subrecord::DispatcherIdentity(DispatcherIdentity {
                dispatcher_type: 0,
                dispatcher_id: 7,
                description: b"ops".to_vec(),
            }),
            Subrecord::AuthInfo(AuthInfo {
                user_name: "user".into(),
                password: "secret".into(),
                server_sequence: Some("seq".into()),
            }),
            Subrecord::ResultCode(ResultCodeData { code: 0 }),
            Subrecord::PosData(
                PosData::from_degrees(egts_time(100).unwrap(), 55.0, 37.0)
                    .with_altitude(150)
                    .with_motion(61.2, 270),
            ),
            Subrecord::ExtPosData(ExtPosData {
                hdop: Some(80),
                satellites: Some(12),
                navigation_system: Some(2),
                ..Default::default()
            }),
            Subrecord::AdSensorsData(ad),
            Subrecord::CountersData(counters),
            Subrecord::StateData(StateData {
                state: 2,
                main_power_voltage: 120,
                navigation_enabled: true,
                reserved_flags: 0x20,
                ..Default::default()
            }),
            Subrecord::LoopinData(loops),
            Subrecord::AbsDigSensData(AbsDigSensData { number: 0x123, state: 1 }),
            Subrecord::AbsAnSensData(AbsAnSensData { number: 4, value: 0x00_1234 }),
            Subrecord::AbsCntrData(AbsCntrData { number: 110, value: 90_001 }),
            Subrecord::AbsLoopinData(AbsLoopinData { number: 9, state: 2 }),
            Subrecord::LiquidLevelSensor(LiquidLevelSensor {
                number: 1,
                unit: LiquidLevelUnit::Litres,
                module_address: 1,
                data: LiquidLevelData::Value(370),
                ..Default::default()
            }),
            Subrecord::PassengersCounters(PassengersCountersData {
                doors_released: 0x02,
                module_address: 5,
                counts: PassengerCounts::Doors(doors),
                reserved_flags: 0,
            }),
            Subrecord::Unknown {
                subrecord_type: 99,
                data: vec![0xDE, 0xAD],
            },
        ]
    }

    fn routed(mut packet: Packet) -> Packet {
        packet.routing = Some(Routing {
            peer_address: 0x0102,
            recipient_address: 0x0304,
            ttl: 5,
        });
        packet.flags.priority = 2;
        packet
    }

    #[test]
    fn test_empty_app_data_has_no_checksum_trailer() {
        let bytes = Packet::app_data(7, Vec::new()).encode().unwrap();
        assert_eq!(bytes.len(), usize::from(HEADER_LEN));
        assert_eq!(&bytes[5..7], &[0, 0]);
        assert_eq!(Packet::decode(&bytes).unwrap(), Packet::app_data(7, Vec::new()));
    }

    #[test]
    fn test_response_layout() {
        let records = vec![ServiceDataRecord::new(
            1,
            service::TELEDATA,
            vec![Subrecord::RecordResponse(RecordResponse::new(9, ResultCode::Ok))],
        )];
        let packet = Packet::response(2, 0x0100, ResultCode::Ok, records);
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes[0], PROTOCOL_MARKER);
        assert_eq!(bytes[3], HEADER_LEN);
        assert_eq!(bytes[9], PacketType::Response as u8);
        assert_eq!(&bytes[11..14], &[0x00, 0x01, 0x00]);
        assert_eq!(bytes[10], header_checksum(&bytes[..10]));

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        match decoded.frame {
            Frame::Response(resp) => assert!(resp.result().is_ok()),
            Frame::AppData(_) => panic!("expected response"),
        }
    }

    #[test]
    fn test_routed_header() {
        let mut packet = Packet::app_data(1, Vec::new());
        packet.routing = Some(Routing {
            peer_address: 1,
            recipient_address: 2,
            ttl: 3,
        });
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), usize::from(ROUTED_HEADER_LEN));
        assert_eq!(bytes[2] & RTE, RTE);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_wrong_header_length_keeps_packet_id() {
        let mut bytes = Packet::app_data(0x1234, Vec::new()).encode().unwrap();
        bytes[3] = 12;
        let err = Packet::decode(&bytes).unwrap_err();
        assert_eq!(err.packet_id, Some(0x1234));
        assert_eq!(err.result_code(), ResultCode::IncorrectHeaderForm);
    }

    #[test]
    fn test_bad_marker_has_no_packet_id() {
        let err = Packet::decode(&[0x02; 11]).unwrap_err();
        assert_eq!(err.packet_id, None);
        assert_eq!(err.error, ProtocolError::InvalidMarker(0x02));
        assert!(Packet::decode(&[]).is_err());
        assert!(Packet::decode(&[0x01, 0, 0]).unwrap_err().packet_id.is_none());
    }

    #[test]
    fn test_unknown_packet_type() {
        let mut bytes = Packet::app_data(5, Vec::new()).encode().unwrap();
        bytes[9] = 2;
        bytes[10] = header_checksum(&bytes[..10]);
        let err = Packet::decode(&bytes).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::UnsupportedType);
    }

    #[test]
    fn test_encrypted_packet_rejected() {
        let mut packet = Packet::app_data(5, Vec::new());
        packet.flags.encryption = 1;
        let bytes = packet.encode().unwrap();
        assert_eq!(
            Packet::decode(&bytes).unwrap_err().result_code(),
            ResultCode::DecryptError
        );
    }

    #[test]
    fn test_every_subrecord_in_one_packet() {
        let mut record = ServiceDataRecord::new(12, service::TELEDATA, every_subrecord());
        record.object_id = Some(38741609);
        record.time = Some(100);
        let packet = routed(Packet::app_data(0xFFFF, vec![record]));

        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[3], ROUTED_HEADER_LEN);
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.records()[0].subrecords.len(), 18);
    }

    #[test]
    fn test_routed_response_with_records() {
        let records = vec![ServiceDataRecord::new(
            1,
            service::TELEDATA,
            vec![
                Subrecord::RecordResponse(RecordResponse::new(40, ResultCode::Ok)),
                Subrecord::RecordResponse(RecordResponse::new(41, ResultCode::ServiceDenied)),
            ],
        )];
        let packet = routed(Packet::response(9, 0x0A0B, ResultCode::Ok, records));
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
        let Frame::Response(resp) = decoded.frame else {
            panic!("expected response");
        };
        assert_eq!(resp.response_packet_id, 0x0A0B);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let packet = routed(Packet::app_data(
            4,
            vec![ServiceDataRecord::new(1, service::TELEDATA, every_subrecord())],
        ));
        assert_eq!(packet.encode().unwrap(), packet.encode().unwrap());

        let bytes = hex::decode(TERMINAL_FRAME).unwrap();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.packet_id, 0x0134);
        assert_eq!(decoded.flags.priority, 3);
        let record = &decoded.records()[0];
        assert_eq!(record.object_id, Some(0x003B_C202));
        assert_eq!(record.subrecords.len(), 3);
        let Subrecord::PosData(pos) = &record.subrecords[0] else {
            panic!("expected POS_DATA");
        };
        assert_eq!(pos.altitude_m(), Some(149));
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn test_any_flipped_byte_is_rejected() {
        let mut record = ServiceDataRecord::new(
            3,
            service::TELEDATA,
            vec![
                Subrecord::PosData(PosData::from_degrees(egts_time(500).unwrap(), 59.9, 30.3)),
                Subrecord::AbsCntrData(AbsCntrData { number: 110, value: 7 }),
            ],
        );
        record.object_id = Some(12);
        let packet = routed(Packet::app_data(0x2468, vec![record]));
        let bytes = packet.encode().unwrap();

        for i in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0xFF;
            let err = Packet::decode(&corrupted).expect_err(&format!("byte {i} flipped"));
            match i {
                0 => assert_eq!(err.packet_id, None, "byte {i}"),
                7 | 8 => assert!(err.packet_id.is_some(), "byte {i}"),
                _ => assert_eq!(err.packet_id, Some(0x2468), "byte {i}"),
            }
        }
    }
}
