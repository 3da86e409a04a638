//! Core types used throughout the receiver.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a terminal connection, used in log spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(
    /// Vehicle row identifier.
    VehicleId,
    "vehicle"
);
id_type!(
    /// Provider row identifier.
    ProviderId,
    "provider"
);
id_type!(
    /// Stored track point identifier.
    PointId,
    "point"
);

/// Moderation state of a vehicle. Readings of rejected vehicles are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ModerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ModerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModerationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("invalid moderation status: {other:?}")),
        }
    }
}

/// A tracked vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    /// Device IMEI as a decimal string.
    pub imei: String,
    /// Last object identifier resolved to this vehicle.
    #[serde(default)]
    pub oid: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    pub provider_id: ProviderId,
    #[serde(default)]
    pub moderation_status: ModerationStatus,
}

/// Fields of a vehicle about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVehicle {
    pub imei: String,
    pub oid: Option<u32>,
    pub name: Option<String>,
    pub provider_id: ProviderId,
    pub moderation_status: ModerationStatus,
}

impl NewVehicle {
    /// Placeholder for an object id nothing matched: pending moderation.
    pub fn placeholder(oid: u32, provider_id: ProviderId) -> Self {
        Self {
            imei: oid.to_string(),
            oid: Some(oid),
            name: None,
            provider_id,
            moderation_status: ModerationStatus::Pending,
        }
    }
}

/// A telematics provider and the source addresses its terminals connect from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    /// Exact IPv4 addresses or patterns with `*` as the last segment.
    pub ip_patterns: Vec<String>,
}

/// One analog sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalogSensor {
    pub number: u8,
    pub value: u32,
}

/// One liquid level sensor value, in millimetres or litres depending on unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidSensor {
    pub number: u8,
    pub error: bool,
    pub value_mm: Option<u32>,
    pub value_l: Option<u32>,
}

/// A position report extracted from one service data record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationReading {
    /// Object identifier reported by the terminal.
    pub oid: u32,
    /// Packet identifier, or the terminal's own number when it sends one.
    pub packet_id: u32,
    /// Fix time reported by the terminal.
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level, if reported.
    pub altitude: Option<i32>,
    /// Speed in km/h.
    pub speed: f64,
    /// Course in degrees.
    pub course: u16,
    pub satellites: Option<u8>,
    pub pdop: Option<u16>,
    pub hdop: Option<u16>,
    pub vdop: Option<u16>,
    pub navigation_system: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analog_sensors: Vec<AnalogSensor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub liquid_sensors: Vec<LiquidSensor>,
}

impl NavigationReading {
    pub fn position(&self) -> crate::geometry::Position {
        crate::geometry::Position::new(self.latitude, self.longitude, self.altitude)
    }
}

/// A persisted track point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub id: PointId,
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Points of one vehicle ordered by time.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub vehicle_id: VehicleId,
    pub points: Vec<TrackPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moderation_status_serde() {
        let json = serde_json::to_string(&ModerationStatus::Rejected).unwrap();
        assert_eq!(json, "\"rejected\"");
        let parsed: ModerationStatus = serde_json::from_str("\"approved\"").unwrap();
        assert_eq!(parsed, ModerationStatus::Approved);
        assert!(serde_json::from_str::<ModerationStatus>("\"banned\"").is_err());
        assert_eq!("pending".parse::<ModerationStatus>(), Ok(ModerationStatus::Pending));
    }

    #[test]
    fn test_placeholder_vehicle() {
        let v = NewVehicle::placeholder(4242, ProviderId(3));
        assert_eq!(v.imei, "4242");
        assert_eq!(v.oid, Some(4242));
        assert_eq!(v.moderation_status, ModerationStatus::Pending);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(VehicleId(7).to_string(), "vehicle#7");
        assert_eq!(ConnectionId::new().to_string().len(), 8);
    }

    #[test]
    fn test_vehicle_defaults_from_json() {
        let v: Vehicle =
            serde_json::from_str(r#"{"id": 1, "imei": "356307042441013", "provider_id": 2}"#)
                .unwrap();
        assert_eq!(v.oid, None);
        assert_eq!(v.moderation_status, ModerationStatus::Pending);
    }
}
