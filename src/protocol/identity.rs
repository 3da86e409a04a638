//! Authentication service sub-records and the record acknowledgement.

use bytes::BufMut;

use super::subrecord::{SubrecordPayload, SubrecordType};
use super::{Reader, ResultCode};
use crate::error::ProtocolError;

/// `EGTS_SR_RECORD_RESPONSE`: acknowledgement of one service data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordResponse {
    /// Record number being confirmed (`CRN`).
    pub confirmed_record_number: u16,
    /// Processing status (`RST`).
    pub record_status: u8,
}

impl RecordResponse {
    pub fn new(confirmed_record_number: u16, status: ResultCode) -> Self {
        Self {
            confirmed_record_number,
            record_status: status.into(),
        }
    }

    pub fn status(&self) -> ResultCode {
        ResultCode::from(self.record_status)
    }
}

impl SubrecordPayload for RecordResponse {
    const TYPE: SubrecordType = SubrecordType::RECORD_RESPONSE;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let rr = Self {
            confirmed_record_number: r.u16("CRN")?,
            record_status: r.u8("RST")?,
        };
        r.finish("EGTS_SR_RECORD_RESPONSE", data.len())?;
        Ok(rr)
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.put_u16_le(self.confirmed_record_number);
        buf.put_u8(self.record_status);
        Ok(())
    }
}

/// `EGTS_SR_TERM_IDENTITY`: terminal identification sent on login.
///
/// Each optional field is present on the wire exactly when it is `Some`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermIdentity {
    pub terminal_id: u32,
    /// Home dispatcher id (`HDID`).
    pub home_dispatcher_id: Option<u16>,
    pub imei: Option<[u8; 15]>,
    pub imsi: Option<[u8; 16]>,
    /// Language code (`LNGC`), ISO 639-2.
    pub language_code: Option<[u8; 3]>,
    /// Network identifier (`NID`): MCC and MNC.
    pub network_id: Option<[u8; 3]>,
    /// Receive buffer size (`BS`).
    pub buffer_size: Option<u16>,
    pub msisdn: Option<[u8; 15]>,
    /// Terminal requests the simple sequence of authorization (`SSRA`).
    pub simple_auth: bool,
}

mod term_flags {
    pub const HDIDE: u8 = 0x01;
    pub const IMEIE: u8 = 0x02;
    pub const IMSIE: u8 = 0x04;
    pub const LNGCE: u8 = 0x08;
    pub const SSRA: u8 = 0x10;
    pub const NIDE: u8 = 0x20;
    pub const BSE: u8 = 0x40;
    pub const MNE: u8 = 0x80;
}

impl TermIdentity {
    /// IMEI as a number, if present and made of ASCII digits.
    pub fn imei_number(&self) -> Option<u64> {
        let imei = self.imei.as_ref()?;
        std::str::from_utf8(imei).ok()?.trim().parse().ok()
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        let mut set = |present: bool, bit: u8| {
            if present {
                flags |= bit;
            }
        };
        set(self.home_dispatcher_id.is_some(), term_flags::HDIDE);
        set(self.imei.is_some(), term_flags::IMEIE);
        set(self.imsi.is_some(), term_flags::IMSIE);
        set(self.language_code.is_some(), term_flags::LNGCE);
        set(self.simple_auth, term_flags::SSRA);
        set(self.network_id.is_some(), term_flags::NIDE);
        set(self.buffer_size.is_some(), term_flags::BSE);
        set(self.msisdn.is_some(), term_flags::MNE);
        flags
    }
}

impl SubrecordPayload for TermIdentity {
    const TYPE: SubrecordType = SubrecordType::TERM_IDENTITY;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let terminal_id = r.u32("TID")?;
        let flags = r.u8("TERM_IDENTITY flags")?;
        let has = |bit: u8| flags & bit != 0;

        let home_dispatcher_id = if has(term_flags::HDIDE) { Some(r.u16("HDID")?) } else { None };
        let imei = if has(term_flags::IMEIE) { Some(r.array("IMEI")?) } else { None };
        let imsi = if has(term_flags::IMSIE) { Some(r.array("IMSI")?) } else { None };
        let language_code = if has(term_flags::LNGCE) { Some(r.array("LNGC")?) } else { None };
        let network_id = if has(term_flags::NIDE) { Some(r.array("NID")?) } else { None };
        let buffer_size = if has(term_flags::BSE) { Some(r.u16("BS")?) } else { None };
        let msisdn = if has(term_flags::MNE) { Some(r.array("MSISDN")?) } else { None };

        r.finish("EGTS_SR_TERM_IDENTITY", data.len())?;

        Ok(Self {
            terminal_id,
            home_dispatcher_id,
            imei,
            imsi,
            language_code,
            network_id,
            buffer_size,
            msisdn,
            simple_auth: has(term_flags::SSRA),
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.put_u32_le(self.terminal_id);
        buf.put_u8(self.flags());
        if let Some(hdid) = self.home_dispatcher_id {
            buf.put_u16_le(hdid);
        }
        if let Some(imei) = &self.imei {
            buf.extend_from_slice(imei);
        }
        if let Some(imsi) = &self.imsi {
            buf.extend_from_slice(imsi);
        }
        if let Some(lngc) = &self.language_code {
            buf.extend_from_slice(lngc);
        }
        if let Some(nid) = &self.network_id {
            buf.extend_from_slice(nid);
        }
        if let Some(bs) = self.buffer_size {
            buf.put_u16_le(bs);
        }
        if let Some(msisdn) = &self.msisdn {
            buf.extend_from_slice(msisdn);
        }
        Ok(())
    }
}

/// `EGTS_SR_DISPATCHER_IDENTITY`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherIdentity {
    pub dispatcher_type: u8,
    pub dispatcher_id: u32,
    /// Free-form description (`DSCR`), up to 255 bytes.
    pub description: Vec<u8>,
}

impl SubrecordPayload for DispatcherIdentity {
    const TYPE: SubrecordType = SubrecordType::DISPATCHER_IDENTITY;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        Ok(Self {
            dispatcher_type: r.u8("DT")?,
            dispatcher_id: r.u32("DID")?,
            description: r.rest().to_vec(),
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        if self.description.len() > 255 {
            return Err(ProtocolError::TooLarge {
                what: "DSCR",
                size: self.description.len(),
                max: 255,
            });
        }
        buf.put_u8(self.dispatcher_type);
        buf.put_u32_le(self.dispatcher_id);
        buf.extend_from_slice(&self.description);
        Ok(())
    }
}

/// `EGTS_SR_AUTH_INFO`: user name and password, optionally a server sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub user_name: String,
    pub password: String,
    pub server_sequence: Option<String>,
}

impl SubrecordPayload for AuthInfo {
    const TYPE: SubrecordType = SubrecordType::AUTH_INFO;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let user_name = r.cstring("UNM")?;
        let password = r.cstring("UPSW")?;
        let server_sequence = if r.is_empty() { None } else { Some(r.cstring("SS")?) };
        r.finish("EGTS_SR_AUTH_INFO", data.len())?;
        Ok(Self {
            user_name,
            password,
            server_sequence,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let fields = [
            Some(("UNM", &self.user_name)),
            Some(("UPSW", &self.password)),
            self.server_sequence.as_ref().map(|ss| ("SS", ss)),
        ];
        for (field, value) in fields.into_iter().flatten() {
            if value.as_bytes().contains(&0) {
                return Err(ProtocolError::InvalidField {
                    field,
                    reason: "contains a NUL byte".into(),
                });
            }
            buf.extend_from_slice(value.as_bytes());
            buf.put_u8(0);
        }
        Ok(())
    }
}

/// `EGTS_SR_RESULT_CODE`: authorization outcome sent by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCodeData {
    pub code: u8,
}

impl From<ResultCode> for ResultCodeData {
    fn from(code: ResultCode) -> Self {
        Self { code: code.into() }
    }
}

impl SubrecordPayload for ResultCodeData {
    const TYPE: SubrecordType = SubrecordType::RESULT_CODE;

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let code = r.u8("RCD")?;
        r.finish("EGTS_SR_RESULT_CODE", data.len())?;
        Ok(Self { code })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.put_u8(self.code);
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
    fn test_term_identity_with_imei() {
        let data = [
            0x39, 0x30, 0x00, 0x00, // TID 12345
            0x02, // IMEIE
            b'3', b'5', b'6', b'3', b'0', b'7', b'0', b'4', b'2', b'4', b'4', b'1', b'0', b'1', b'3',
        ];
        let ti = TermIdentity::decode(&data).unwrap();
        assert_eq!(ti.terminal_id, 12345);
        assert_eq!(ti.imei_number(), Some(356_307_042_441_013));
        assert!(ti.imsi.is_none());
        assert_eq!(encode(&ti), data);
    }

    #[test]
    fn test_term_identity_field_order() {
        let ti = TermIdentity {
            terminal_id: 1,
            home_dispatcher_id: Some(0x0102),
            buffer_size: Some(0x0304),
            simple_auth: true,
            ..Default::default()
        };
        let bytes = encode(&ti);
        assert_eq!(bytes, [1, 0, 0, 0, 0x51, 0x02, 0x01, 0x04, 0x03]);
        assert_eq!(TermIdentity::decode(&bytes).unwrap(), ti);
    }

    #[test]
    fn test_term_identity_truncated_optional() {
        // BSE set but the buffer size is missing
        let data = [1, 0, 0, 0, 0x40, 0x01];
        assert_eq!(
            TermIdentity::decode(&data),
            Err(ProtocolError::UnexpectedEof("BS"))
        );
    }

    #[test]
    fn test_auth_info() {
        let ai = AuthInfo::decode(b"user\0secret\0").unwrap();
        assert_eq!(ai.user_name, "user");
        assert_eq!(ai.password, "secret");
        assert_eq!(ai.server_sequence, None);

        let with_ss = AuthInfo {
            server_sequence: Some("seq".into()),
            ..ai
        };
        assert_eq!(encode(&with_ss), b"user\0secret\0seq\0");
        assert_eq!(AuthInfo::decode(b"user\0secret\0seq\0").unwrap(), with_ss);

        // no lossy replacement of the user name
        assert!(AuthInfo::decode(b"\xC3\0secret\0").is_err());
    }

    #[test]
    fn test_dispatcher_identity_description_tail() {
        let data = [0x00, 0x07, 0x00, 0x00, 0x00, b'o', b'p', b's'];
        let di = DispatcherIdentity::decode(&data).unwrap();
        assert_eq!(di.dispatcher_id, 7);
        assert_eq!(di.description, b"ops");
        assert_eq!(encode(&di), data);
    }

    #[test]
    fn test_record_response_layout() {
        let rr = RecordResponse::new(0x0A0B, ResultCode::Ok);
        assert_eq!(encode(&rr), [0x0B, 0x0A, 0x00]);
        assert!(rr.status().is_ok());
        assert!(RecordResponse::decode(&[0x0B, 0x0A]).is_err());
    }
}
