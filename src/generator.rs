//! Test packet generator, the client side of a terminal session.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{
    service, AuthInfo, Frame, LiquidLevelData, LiquidLevelSensor, LiquidLevelUnit, Packet,
    PacketCodec, PosData, PtResponse, ServiceDataRecord, Subrecord,
};

const GENERATOR_EVENT_ID: u32 = 3436;

/// What the generated packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `AUTH_INFO` on the auth service.
    Auth,
    /// A single `POS_DATA`.
    Telemetry,
    /// `POS_DATA` plus a liquid level sensor.
    Mixed,
}

impl FromStr for PacketKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auth" => Ok(Self::Auth),
            "tele" | "telemetry" => Ok(Self::Telemetry),
            "mixed" => Ok(Self::Mixed),
            other => Err(Error::InvalidConfig(format!(
                "unknown packet kind {other:?}, expected auth, tele or mixed"
            ))),
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auth => "auth",
            Self::Telemetry => "tele",
            Self::Mixed => "mixed",
        })
    }
}

/// Parameters of one generated packet.
#[derive(Debug, Clone)]
pub struct PacketSpec {
    pub kind: PacketKind,
    pub packet_id: u16,
    pub object_id: u32,
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Level reported by sensor 1 in mixed packets.
    pub liquid_level: u32,
}

impl PacketSpec {
    pub fn build(&self) -> Packet {
        let (service, subrecords) = match self.kind {
            PacketKind::Auth => (
                service::AUTH,
                vec![Subrecord::AuthInfo(AuthInfo {
                    user_name: "test".into(),
                    password: "test".into(),
                    server_sequence: None,
                })],
            ),
            PacketKind::Telemetry => (service::TELEDATA, vec![Subrecord::PosData(self.position())]),
            PacketKind::Mixed => (
                service::TELEDATA,
                vec![
                    Subrecord::PosData(self.position()),
                    Subrecord::LiquidLevelSensor(LiquidLevelSensor {
                        number: 1,
                        error: false,
                        unit: LiquidLevelUnit::Uncalibrated,
                        module_address: 1,
                        data: LiquidLevelData::Value(self.liquid_level),
                        reserved: false,
                    }),
                ],
            ),
        };

        let mut record = ServiceDataRecord::new(1, service, subrecords);
        record.object_id = Some(self.object_id);
        record.event_id = Some(GENERATOR_EVENT_ID);
        record.flags.priority = 2;

        let mut packet = Packet::app_data(self.packet_id, vec![record]);
        packet.flags.priority = 2;
        packet
    }

    fn position(&self) -> PosData {
        PosData::from_degrees(self.time, self.latitude, self.longitude)
            .with_altitude(30)
            .with_motion(3.4, 172)
    }
}

/// Send `packet` to `addr` and wait for the `RESPONSE` acknowledging it.
pub async fn send_packet(addr: SocketAddr, packet: Packet, timeout: Duration) -> Result<PtResponse> {
    let exchange = async {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, PacketCodec::new());
        let packet_id = packet.packet_id;
        framed.send(packet).await?;

        while let Some(reply) = framed.next().await {
            match reply?.frame {
                Frame::Response(resp) if resp.response_packet_id == packet_id => return Ok(resp),
                other => debug!(?other, "Skipping unrelated packet"),
            }
        }
        Err(Error::ConnectionClosed)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::ConnectionTimeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec(kind: PacketKind) -> PacketSpec {
        PacketSpec {
            kind,
            packet_id: 7,
            object_id: 12,
            time: Utc.with_ymd_and_hms(2021, 12, 16, 9, 12, 0).unwrap(),
            latitude: 45.0,
            longitude: 60.344,
            liquid_level: 80,
        }
    }

    #[test]
    fn test_kinds_parse() {
        assert_eq!("auth".parse::<PacketKind>().unwrap(), PacketKind::Auth);
        assert_eq!("tele".parse::<PacketKind>().unwrap(), PacketKind::Telemetry);
        assert_eq!("mixed".parse::<PacketKind>().unwrap(), PacketKind::Mixed);
        assert!("data".parse::<PacketKind>().is_err());
    }

    #[test]
    fn test_built_packets_survive_the_wire() {
        for kind in [PacketKind::Auth, PacketKind::Telemetry, PacketKind::Mixed] {
            let packet = spec(kind).build();
            let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
            assert_eq!(decoded, packet, "{kind}");
            assert_eq!(decoded.records()[0].object_id, Some(12));
        }
    }

    #[test]
    fn test_mixed_packet_contents() {
        let packet = spec(PacketKind::Mixed).build();
        let record = &packet.records()[0];
        assert_eq!(record.source_service, service::TELEDATA);
        assert_eq!(record.subrecords.len(), 2);
        let Subrecord::PosData(pos) = &record.subrecords[0] else {
            panic!("expected position first");
        };
        assert_eq!(pos.timestamp(), Some(spec(PacketKind::Mixed).time));
        assert!((pos.latitude() - 45.0).abs() < 1e-5);
    }
}
