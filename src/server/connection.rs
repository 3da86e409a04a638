//! Per-connection EGTS session.
//!
//! ```text
//!   AwaitHeader ──▶ AwaitBody ──▶ Dispatch ──┐
//!        ▲                                    │
//!        └────────────────────────────────────┘
//!   any state ──(EOF, timeout, I/O error, bad marker)──▶ Closed
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, ProtocolError, Result};
use crate::pipeline::{ReadingJob, ReadingSender};
use crate::protocol::{
    packet_len, service, AbsCntrData, LiquidLevelSensor, LiquidLevelUnit, Packet, PacketType,
    RecordResponse, ResultCode, ResultCodeData, ServiceDataRecord, Subrecord, FIXED_HEADER_SIZE,
};
use crate::types::{AnalogSensor, ConnectionId, LiquidSensor, NavigationReading};

/// Counter carrying the terminal's own packet number.
const PACKET_NUMBER_COUNTER: u8 = 110;
/// Counter carrying the high byte of the terminal's packet number.
const PACKET_NUMBER_HIGH_COUNTER: u8 = 111;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitHeader,
    AwaitBody,
    Dispatch,
    Closed,
}

/// What one APPDATA packet produced.
#[derive(Debug, Default)]
pub struct Dispatched {
    /// One `RECORD_RESPONSE` per processed record.
    pub responses: Vec<Subrecord>,
    pub readings: Vec<NavigationReading>,
    /// A `TERM_IDENTITY` or `AUTH_INFO` sub-record was seen.
    pub authenticated: bool,
    /// Source service of the first accepted record, echoed in the reply
    /// record. `TELEDATA` when every record was denied.
    pub service: u8,
}

/// Drives one terminal connection until it closes.
pub struct ConnectionHandler<S> {
    id: ConnectionId,
    peer: SocketAddr,
    stream: S,
    read_timeout: Option<Duration>,
    readings: ReadingSender,
    state: ConnectionState,
    /// Object id learned from an earlier record on this connection.
    object_id: Option<u32>,
    next_packet_id: u16,
    next_record_number: u16,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        stream: S,
        read_timeout: Option<Duration>,
        readings: ReadingSender,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            read_timeout,
            readings,
            state: ConnectionState::AwaitHeader,
            object_id: None,
            next_packet_id: 0,
            next_record_number: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serve the connection. Returns once the peer is gone.
    pub async fn run(mut self) -> Result<()> {
        info!("Connection opened");
        let result = self.serve().await;
        self.state = ConnectionState::Closed;
        match &result {
            Ok(()) => info!("Connection closed by peer"),
            Err(Error::ConnectionTimeout) => warn!("Read timed out, closing connection"),
            Err(e) if e.should_close_connection() => warn!(error = %e, "Closing connection"),
            Err(e) => error!(error = %e, "Connection failed"),
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let Some(bytes) = self.read_packet().await? else {
                return Ok(());
            };
            self.state = ConnectionState::Dispatch;
            self.dispatch(&bytes).await?;
            self.state = ConnectionState::AwaitHeader;
        }
    }

    /// Read one whole packet. `None` on a clean close before a header.
    async fn read_packet(&mut self) -> Result<Option<Vec<u8>>> {
        self.state = ConnectionState::AwaitHeader;
        let mut header = [0u8; FIXED_HEADER_SIZE];
        match self.read_exact_timed(&mut header).await {
            Ok(()) => {}
            Err(Error::ConnectionClosed) => return Ok(None),
            Err(e) => return Err(e),
        }

        let Some(total) = packet_len(&header) else {
            return Err(ProtocolError::InvalidMarker(header[0]).into());
        };

        self.state = ConnectionState::AwaitBody;
        let mut packet = header.to_vec();
        packet.resize(total.max(FIXED_HEADER_SIZE), 0);
        self.read_exact_timed(&mut packet[FIXED_HEADER_SIZE..]).await?;
        Ok(Some(packet))
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let read = self.stream.read_exact(buf);
        let result = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| Error::ConnectionTimeout)?,
            None => read.await,
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
            Err(e) => Err(e.into()),
        }
    }

    async fn dispatch(&mut self, bytes: &[u8]) -> Result<()> {
        let received_at = Utc::now();
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(failure) => {
                let code = failure.result_code();
                warn!(error = %failure, %code, "Failed to decode packet");
                trace!(bytes = %hex::encode(bytes), "Undecodable packet");
                let reply = Packet::response(
                    self.take_packet_id(),
                    failure.packet_id.unwrap_or(0),
                    code,
                    Vec::new(),
                );
                return self.send(&reply).await;
            }
        };

        match packet.packet_type() {
            PacketType::Response => {
                debug!(packet_id = packet.packet_id, "Response packet received");
                Ok(())
            }
            PacketType::AppData => {
                let dispatched = self.process_records(packet.records(), packet.packet_id, received_at);

                let mut records = Vec::new();
                if !dispatched.responses.is_empty() {
                    let mut record = ServiceDataRecord::new(
                        self.take_record_number(),
                        dispatched.service,
                        dispatched.responses,
                    );
                    record.flags.group = true;
                    records.push(record);
                }
                let reply = Packet::response(
                    self.take_packet_id(),
                    packet.packet_id,
                    ResultCode::Ok,
                    records,
                );
                self.send(&reply).await?;

                if dispatched.authenticated {
                    let ack = Packet::app_data(
                        self.take_packet_id(),
                        vec![ServiceDataRecord::new(
                            self.take_record_number(),
                            service::AUTH,
                            vec![Subrecord::ResultCode(ResultCodeData::from(ResultCode::Ok))],
                        )],
                    );
                    self.send(&ack).await?;
                    debug!("Authentication result sent");
                }

                // acknowledged already, a full queue only delays the next read
                for reading in dispatched.readings {
                    let job = ReadingJob::new(reading, self.peer.ip());
                    if let Err(e) = self.readings.submit(job).await {
                        warn!(error = %e, "Reading not queued");
                    }
                }
                Ok(())
            }
        }
    }

    /// Acknowledge every record and pull readings out of the accepted ones.
    pub fn process_records(
        &mut self,
        records: &[ServiceDataRecord],
        packet_id: u16,
        received_at: DateTime<Utc>,
    ) -> Dispatched {
        let mut out = Dispatched::default();
        let mut reply_service = None;

        for record in records {
            let status = record_status(record);
            out.responses.push(Subrecord::RecordResponse(RecordResponse::new(
                record.record_number,
                status,
            )));

            if status == ResultCode::ServiceDenied {
                warn!(
                    record = record.record_number,
                    service = record.source_service,
                    "Service not supported"
                );
                continue;
            }
            reply_service.get_or_insert(record.source_service);

            if let Some(oid) = record.object_id_hint() {
                self.object_id = Some(oid);
            }
            out.authenticated |= record
                .subrecords
                .iter()
                .any(|sr| matches!(sr, Subrecord::TermIdentity(_) | Subrecord::AuthInfo(_)));

            if status != ResultCode::Ok {
                debug!(record = record.record_number, %status, "Record not accepted");
                continue;
            }
            let Some(oid) = self.object_id else {
                if has_position(record) {
                    warn!(record = record.record_number, "Position without object id, dropped");
                }
                continue;
            };
            if let Some(reading) = build_reading(record, oid, packet_id, received_at) {
                out.readings.push(reading);
            }
        }
        out.service = reply_service.unwrap_or(service::TELEDATA);
        out
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.encode()?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        id
    }

    fn take_record_number(&mut self) -> u16 {
        let rn = self.next_record_number;
        self.next_record_number = self.next_record_number.wrapping_add(1);
        rn
    }
}

fn record_status(record: &ServiceDataRecord) -> ResultCode {
    if !matches!(record.source_service, service::AUTH | service::TELEDATA) {
        ResultCode::ServiceDenied
    } else if record.has_unknown_subrecords() {
        ResultCode::UnsupportedType
    } else {
        ResultCode::Ok
    }
}

fn has_position(record: &ServiceDataRecord) -> bool {
    record
        .subrecords
        .iter()
        .any(|sr| matches!(sr, Subrecord::PosData(_)))
}

/// Navigation reading for a record carrying `POS_DATA`, merged with the
/// other telemetry sub-records of the same record.
pub fn build_reading(
    record: &ServiceDataRecord,
    oid: u32,
    packet_id: u16,
    received_at: DateTime<Utc>,
) -> Option<NavigationReading> {
    let pos = record.subrecords.iter().find_map(|sr| match sr {
        Subrecord::PosData(pos) => Some(pos),
        _ => None,
    })?;

    let mut reading = NavigationReading {
        oid,
        packet_id: u32::from(packet_id),
        sent_at: pos.timestamp().unwrap_or(received_at),
        received_at,
        latitude: pos.latitude(),
        longitude: pos.longitude(),
        altitude: pos.altitude_m(),
        speed: pos.speed_kmh(),
        course: pos.direction,
        satellites: None,
        pdop: None,
        hdop: None,
        vdop: None,
        navigation_system: None,
        analog_sensors: Vec::new(),
        liquid_sensors: Vec::new(),
    };

    for sr in &record.subrecords {
        match sr {
            Subrecord::ExtPosData(ext) => {
                reading.satellites = ext.satellites;
                reading.pdop = ext.pdop;
                reading.hdop = ext.hdop;
                reading.vdop = ext.vdop;
                reading.navigation_system = ext.navigation_system;
            }
            Subrecord::AdSensorsData(ad) => reading
                .analog_sensors
                .extend(ad.analog_values().map(|(number, value)| AnalogSensor { number, value })),
            Subrecord::AbsAnSensData(abs) => reading.analog_sensors.push(AnalogSensor {
                number: abs.number,
                value: abs.value,
            }),
            Subrecord::AbsCntrData(counter) => apply_packet_counter(&mut reading, counter),
            Subrecord::LiquidLevelSensor(lls) => reading.liquid_sensors.push(liquid_sensor(lls)),
            _ => {}
        }
    }
    Some(reading)
}

fn apply_packet_counter(reading: &mut NavigationReading, counter: &AbsCntrData) {
    match counter.number {
        PACKET_NUMBER_COUNTER => reading.packet_id = counter.value,
        PACKET_NUMBER_HIGH_COUNTER => {
            reading.packet_id = (reading.packet_id & 0x00FF_FFFF) | ((counter.value & 0xFF) << 24);
        }
        _ => {}
    }
}

fn liquid_sensor(lls: &LiquidLevelSensor) -> LiquidSensor {
    let value = lls.value();
    let (value_mm, value_l) = match lls.unit {
        LiquidLevelUnit::Uncalibrated | LiquidLevelUnit::Percent => (value, None),
        // stored as value * 10
        LiquidLevelUnit::Litres => (None, value.map(|v| v.saturating_mul(10))),
        LiquidLevelUnit::Reserved => (None, None),
    };
    LiquidSensor {
        number: lls.number,
        error: lls.error,
        value_mm,
        value_l,
    }
}
