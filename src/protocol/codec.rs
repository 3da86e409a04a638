//! Packet encoding and decoding.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::DecodeFailure;
use super::{packet_len, Packet, FIXED_HEADER_SIZE, MAX_FRAME_DATA_LEN};
use crate::error::ProtocolError;

/// Encode a packet to bytes.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    packet.encode()
}

/// Decode one complete packet from bytes.
pub fn decode_packet(data: &[u8]) -> Result<Packet, DecodeFailure> {
    Packet::decode(data)
}

/// Tokio codec for EGTS framing over a byte stream.
///
/// The total length is taken from the fixed header, so the codec waits for
/// exactly one packet before decoding it.
pub struct PacketCodec {
    max_frame_len: usize,
}

impl PacketCodec {
    /// Create a new codec with default settings.
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_DATA_LEN,
        }
    }

    /// Create a codec with a custom frame data limit.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = crate::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        // Need the fixed header to determine packet size
        if src.len() < FIXED_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FIXED_HEADER_SIZE];
        header.copy_from_slice(&src[..FIXED_HEADER_SIZE]);
        let Some(total_len) = packet_len(&header) else {
            return Err(ProtocolError::InvalidMarker(src[0]).into());
        };

        let frame_len = usize::from(u16::from_le_bytes([header[5], header[6]]));
        if frame_len > self.max_frame_len {
            return Err(ProtocolError::TooLarge {
                what: "frame data",
                size: frame_len,
                max: self.max_frame_len,
            }
            .into());
        }

        // Wait for complete packet
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let packet_data = src.split_to(total_len);
        let packet = Packet::decode(&packet_data).map_err(|failure| failure.error)?;

        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let encoded = item.encode()?;
        dst.reserve(encoded.len());
        dst.put_slice(&encoded);

        Ok(())
    }
}
