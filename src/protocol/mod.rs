//! EGTS wire protocol (GOST R 54619 / GOST 33472 transport layer).
//!
//! ## Packet Format
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │ PRV (1) │ SKID (1) │ Flags (1) │ HL (1) │ HE (1) │ FDL (2) │ PID (2)    │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │ PT (1) │ [PRA (2) │ RCA (2) │ TTL (1)] │ HCS (1)                       │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │ SFRD (FDL bytes)                               │ SFRCS (2, if FDL > 0) │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! SFRD is a list of service data records for `APPDATA` packets, or a
//! response section followed by records for `RESPONSE` packets. Each record
//! holds a list of type-tagged sub-records. All integers are little-endian.

mod codec;
mod identity;
mod packet;
mod position;
mod record;
mod sensors;
mod subrecord;

pub use codec::{decode_packet, encode_packet, PacketCodec};
pub use identity::{AuthInfo, DispatcherIdentity, RecordResponse, ResultCodeData, TermIdentity};
pub use packet::{DecodeFailure, Frame, Packet, PacketFlags, PacketType, PtResponse, Routing};
pub use position::{egts_time, to_egts_time, ExtPosData, PosData, PosFlags, EGTS_EPOCH};
pub use record::{RecordFlags, ServiceDataRecord, ServiceDataSet};
pub use sensors::{
    AbsAnSensData, AbsCntrData, AbsDigSensData, AbsLoopinData, AdSensorsData, CountersData,
    LiquidLevelData, LiquidLevelSensor, LiquidLevelUnit, LoopinData, PassengerCounts,
    PassengersCountersData, Slots, StateData,
};
pub use subrecord::{Subrecord, SubrecordPayload, SubrecordType};

use byteorder::{LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_16_IBM_3740, CRC_8_NRSC_5};

use crate::error::ProtocolError;

/// First byte of every EGTS packet (protocol version 1).
pub const PROTOCOL_MARKER: u8 = 0x01;

/// Bytes read before the full packet length is known.
pub const FIXED_HEADER_SIZE: usize = 10;

/// Header length without routing fields, checksum included.
pub const HEADER_LEN: u8 = 11;

/// Header length with routing fields, checksum included.
pub const ROUTED_HEADER_LEN: u8 = 16;

/// Size of the frame data checksum trailer.
pub const FRAME_CHECKSUM_SIZE: usize = 2;

/// Maximum frame data length allowed by the protocol.
pub const MAX_FRAME_DATA_LEN: usize = 65_517;

const HEADER_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);
const FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Header checksum: CRC-8, polynomial 0x31, initial value 0xFF.
pub fn header_checksum(data: &[u8]) -> u8 {
    HEADER_CRC.checksum(data)
}

/// Frame data checksum: CRC-16 CCITT, polynomial 0x1021, initial value 0xFFFF.
pub fn frame_checksum(data: &[u8]) -> u16 {
    FRAME_CRC.checksum(data)
}

/// Total packet size announced by a fixed header.
///
/// Returns `None` if the buffer does not start with the EGTS marker.
pub fn packet_len(header: &[u8; FIXED_HEADER_SIZE]) -> Option<usize> {
    if header[0] != PROTOCOL_MARKER {
        return None;
    }
    let header_len = usize::from(header[3]);
    let frame_len = usize::from(u16::from_le_bytes([header[5], header[6]]));
    if frame_len == 0 {
        Some(header_len)
    } else {
        Some(header_len + frame_len + FRAME_CHECKSUM_SIZE)
    }
}

/// EGTS processing result codes (`EGTS_PC_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    InProgress,
    UnsupportedProtocol,
    DecryptError,
    ProcessingDenied,
    IncorrectHeaderForm,
    IncorrectDataForm,
    UnsupportedType,
    NotEnoughParams,
    DoubleProcessing,
    SourceDenied,
    HeaderCrcError,
    DataCrcError,
    InvalidDataLength,
    ServiceDenied,
    Other(u8),
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

impl From<u8> for ResultCode {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::InProgress,
            128 => Self::UnsupportedProtocol,
            129 => Self::DecryptError,
            130 => Self::ProcessingDenied,
            131 => Self::IncorrectHeaderForm,
            132 => Self::IncorrectDataForm,
            133 => Self::UnsupportedType,
            134 => Self::NotEnoughParams,
            135 => Self::DoubleProcessing,
            136 => Self::SourceDenied,
            137 => Self::HeaderCrcError,
            138 => Self::DataCrcError,
            139 => Self::InvalidDataLength,
            149 => Self::ServiceDenied,
            other => Self::Other(other),
        }
    }
}

impl From<ResultCode> for u8 {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::Ok => 0,
            ResultCode::InProgress => 1,
            ResultCode::UnsupportedProtocol => 128,
            ResultCode::DecryptError => 129,
            ResultCode::ProcessingDenied => 130,
            ResultCode::IncorrectHeaderForm => 131,
            ResultCode::IncorrectDataForm => 132,
            ResultCode::UnsupportedType => 133,
            ResultCode::NotEnoughParams => 134,
            ResultCode::DoubleProcessing => 135,
            ResultCode::SourceDenied => 136,
            ResultCode::HeaderCrcError => 137,
            ResultCode::DataCrcError => 138,
            ResultCode::InvalidDataLength => 139,
            ResultCode::ServiceDenied => 149,
            ResultCode::Other(v) => v,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, u8::from(*self))
    }
}

/// Service types carried in record headers.
pub mod service {
    pub const AUTH: u8 = 1;
    pub const TELEDATA: u8 = 2;
    pub const COMMANDS: u8 = 4;
    pub const FIRMWARE: u8 = 9;
    pub const ECALL: u8 = 10;
}

/// Bounds-checked little-endian reader over a borrowed slice.
///
/// Every read reports which field ran past the end instead of panicking.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        self.buf
            .read_u8()
            .map_err(|_| ProtocolError::UnexpectedEof(what))
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        self.buf
            .read_u16::<LittleEndian>()
            .map_err(|_| ProtocolError::UnexpectedEof(what))
    }

    pub(crate) fn u24(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        self.buf
            .read_u24::<LittleEndian>()
            .map_err(|_| ProtocolError::UnexpectedEof(what))
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        self.buf
            .read_u32::<LittleEndian>()
            .map_err(|_| ProtocolError::UnexpectedEof(what))
    }

    pub(crate) fn bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < len {
            return Err(ProtocolError::UnexpectedEof(what));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N, what)?);
        Ok(out)
    }

    /// Read a NUL-terminated string; the terminator is consumed.
    pub(crate) fn cstring(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::UnexpectedEof(what))?;
        let s = std::str::from_utf8(&self.buf[..end])
            .map_err(|e| ProtocolError::InvalidField {
                field: what,
                reason: e.to_string(),
            })?
            .to_owned();
        self.buf = &self.buf[end + 1..];
        Ok(s)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    /// Fail if anything is left unread.
    pub(crate) fn finish(self, what: &'static str, declared: usize) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::LengthMismatch {
                what,
                declared,
                actual: declared - self.buf.len(),
            })
        }
    }
}

/// Check that a value fits a bit field before packing it.
pub(crate) fn check_bits(field: &'static str, value: u32, bits: u32) -> Result<(), ProtocolError> {
    if value >> bits != 0 {
        return Err(ProtocolError::InvalidField {
            field,
            reason: format!("{value} does not fit in {bits} bits"),
        });
    }
    Ok(())
}

/// Convert a payload length to the u16 the wire carries.
pub(crate) fn wire_len(what: &'static str, len: usize) -> Result<u16, ProtocolError> {
    u16::try_from(len).map_err(|_| ProtocolError::TooLarge {
        what,
        size: len,
        max: usize::from(u16::MAX),
    })
}
