//! Terminal session tests checking what lands in the readings file.
//!
//! These tests validate:
//! 1. The object id announced by TERM_IDENTITY carries over to later records
//! 2. Telemetry sub-records are merged into one stored reading
//! 3. Seeded vehicles are matched and rejected vehicles are not stored

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use egts_receiver::config::Config;
use egts_receiver::protocol::{
    service, AbsAnSensData, AbsCntrData, ExtPosData, Frame, LiquidLevelData, LiquidLevelSensor,
    LiquidLevelUnit, Packet, PacketCodec, PosData, ServiceDataRecord, Subrecord, TermIdentity,
};
use egts_receiver::receiver::{Receiver, Stores};
use egts_receiver::store::{Seed, StoredReading};
use egts_receiver::types::{ModerationStatus, Provider, ProviderId, Vehicle, VehicleId};

fn vehicle(id: i64, imei: &str, status: ModerationStatus) -> Vehicle {
    Vehicle {
        id: VehicleId(id),
        imei: imei.into(),
        oid: None,
        name: Some(format!("truck {id}")),
        provider_id: ProviderId(1),
        moderation_status: status,
    }
}

fn config(dir: &std::path::Path, seed: &Seed) -> Config {
    let seed_path = dir.join("seed.json");
    seed.save(&seed_path).unwrap();

    let mut config = Config::default();
    config.server.listen_addrs = vec!["127.0.0.1:0".parse().unwrap()];
    config.recording.month_start = 1;
    config.recording.month_end = 12;
    config.storage.seed_file = Some(seed_path);
    config.storage.readings_file = Some(dir.join("readings.jsonl"));
    config.providers = vec![Provider {
        id: ProviderId(1),
        name: "loopback".into(),
        ip_patterns: vec!["127.*".into()],
    }];
    config
}

fn session_packet(oid: u32) -> Packet {
    let time = Utc.with_ymd_and_hms(2024, 7, 1, 8, 0, 0).unwrap();

    let identity = ServiceDataRecord::new(
        1,
        service::AUTH,
        vec![Subrecord::TermIdentity(TermIdentity {
            terminal_id: oid,
            ..Default::default()
        })],
    );

    // no OID in the telemetry record itself
    let telemetry = ServiceDataRecord::new(
        2,
        service::TELEDATA,
        vec![
            Subrecord::PosData(
                PosData::from_degrees(time, 59.93863, 30.31413)
                    .with_altitude(12)
                    .with_motion(42.5, 90),
            ),
            Subrecord::ExtPosData(ExtPosData {
                satellites: Some(11),
                hdop: Some(90),
                ..Default::default()
            }),
            Subrecord::AbsAnSensData(AbsAnSensData { number: 3, value: 1500 }),
            Subrecord::LiquidLevelSensor(LiquidLevelSensor {
                number: 2,
                error: false,
                unit: LiquidLevelUnit::Litres,
                module_address: 1,
                data: LiquidLevelData::Value(37),
                ..Default::default()
            }),
            Subrecord::AbsCntrData(AbsCntrData {
                number: 110,
                value: 90_001,
            }),
        ],
    );

    Packet::app_data(17, vec![identity, telemetry])
}

async fn exchange(addr: std::net::SocketAddr, packet: Packet) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, PacketCodec::new());
    framed.send(packet).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(reply.frame, Frame::Response(_)));
}

fn read_lines(path: &std::path::Path) -> Vec<StoredReading> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn test_session_reading_written_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let seed = Seed {
        vehicles: vec![vehicle(8, "352093081234567", ModerationStatus::Approved)],
        ..Default::default()
    };
    let config = config(dir.path(), &seed);
    let readings_path = config.storage.readings_file.clone().unwrap();

    let (store, stores) = Stores::open(&config).await.unwrap();
    let running = Receiver::new(config, stores).start().await.unwrap();
    exchange(running.local_addrs()[0], session_packet(1_234_567)).await;
    let stats = running.shutdown().await.unwrap();
    assert_eq!(stats.saved, 1);

    let lines = read_lines(&readings_path);
    assert_eq!(lines.len(), 1);
    let stored = &lines[0];
    assert_eq!(stored.vehicle_id, VehicleId(8));
    assert_eq!(stored.reading.oid, 1_234_567);
    assert_eq!(stored.reading.packet_id, 90_001);
    assert_eq!(stored.reading.altitude, Some(12));
    assert_eq!(stored.reading.course, 90);
    assert_eq!(stored.reading.satellites, Some(11));
    assert_eq!(stored.reading.hdop, Some(90));
    assert_eq!(stored.reading.pdop, None);
    assert_eq!(stored.reading.analog_sensors.len(), 1);
    assert_eq!(stored.reading.analog_sensors[0].value, 1500);
    assert_eq!(stored.reading.liquid_sensors[0].value_l, Some(370));
    assert_eq!(stored.reading.liquid_sensors[0].value_mm, None);

    // the matched vehicle remembers the object id
    let vehicles = store.snapshot().vehicles;
    assert_eq!(vehicles[0].oid, Some(1_234_567));
    assert_eq!(store.point_count(), 1);
}

#[tokio::test]
async fn test_rejected_vehicle_not_written() {
    let dir = tempfile::tempdir().unwrap();
    let seed = Seed {
        vehicles: vec![vehicle(3, "352093087654321", ModerationStatus::Rejected)],
        ..Default::default()
    };
    let config = config(dir.path(), &seed);
    let readings_path = config.storage.readings_file.clone().unwrap();

    let (store, stores) = Stores::open(&config).await.unwrap();
    let running = Receiver::new(config, stores).start().await.unwrap();
    exchange(running.local_addrs()[0], session_packet(7_654_321)).await;
    let stats = running.shutdown().await.unwrap();

    assert_eq!(stats.saved, 0);
    assert_eq!(stats.skipped, 1);
    assert!(read_lines(&readings_path).is_empty());
    assert_eq!(store.point_count(), 0);
}

#[tokio::test]
async fn test_bad_schedule_fails_before_binding() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), &Seed::default());
    config.schedule.simplify = "every day".into();

    let (_store, stores) = Stores::open(&config).await.unwrap();
    let Err(err) = Receiver::new(config, stores).start().await else {
        panic!("start should fail");
    };
    assert!(matches!(err, egts_receiver::Error::Schedule { .. }));
}

#[tokio::test]
async fn test_shared_store_sees_saved_points() {
    let dir = tempfile::tempdir().unwrap();
    let seed = Seed {
        vehicles: vec![vehicle(1, "1000", ModerationStatus::Approved)],
        ..Default::default()
    };
    let config = config(dir.path(), &seed);

    let (store, stores) = Stores::open(&config).await.unwrap();
    assert!(Arc::strong_count(&store) > 1);
    let running = Receiver::new(config, stores).start().await.unwrap();
    exchange(running.local_addrs()[0], session_packet(1000)).await;
    running.shutdown().await.unwrap();

    let points = store.points();
    assert_eq!(points.len(), 1);
    assert!((points[0].latitude - 59.93863).abs() < 1e-5);
}
