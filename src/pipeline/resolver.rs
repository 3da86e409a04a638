//! Vehicle identity resolution.
//!
//! Terminals report an object id that is not guaranteed to equal anything
//! stored. Resolution narrows by provider (from the source address), tries
//! an exact cached match, then falls back to a prefix/suffix heuristic
//! against each vehicle's IMEI.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::store::VehicleStore;
use crate::types::{NewVehicle, Provider, ProviderId, Vehicle, VehicleId};

/// A provider address pattern: an exact address or a dotted prefix ending
/// in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPattern {
    Exact(IpAddr),
    /// Leading IPv4 octets; the remaining octets are free.
    Prefix(Vec<u8>),
    /// Anything else. Never matches.
    Invalid,
}

impl IpPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if let Ok(ip) = pattern.parse::<IpAddr>() {
            return Self::Exact(ip);
        }

        let segments: Vec<&str> = pattern.split('.').collect();
        if segments.len() > 4 || segments.last() != Some(&"*") {
            return Self::Invalid;
        }
        let prefix: Option<Vec<u8>> = segments[..segments.len() - 1]
            .iter()
            .map(|s| s.parse::<u8>().ok())
            .collect();
        match prefix {
            Some(prefix) => Self::Prefix(prefix),
            None => Self::Invalid,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Exact(exact) => normalize(*exact) == normalize(ip),
            Self::Prefix(prefix) => match normalize(ip) {
                IpAddr::V4(v4) => v4.octets().starts_with(prefix),
                IpAddr::V6(_) => false,
            },
            Self::Invalid => false,
        }
    }
}

/// Treat IPv4-mapped IPv6 peers (dual-stack listeners) as IPv4.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), |v4: Ipv4Addr| IpAddr::V4(v4)),
        v4 => v4,
    }
}

/// Provider for a source address: exact patterns across all providers win
/// over wildcard patterns.
pub fn provider_for_ip(providers: &[Provider], ip: IpAddr) -> Option<&Provider> {
    let matching = |exact: bool| {
        providers.iter().find(|p| {
            p.ip_patterns.iter().any(|raw| {
                let pattern = IpPattern::parse(raw);
                pattern.is_exact() == exact && pattern.matches(ip)
            })
        })
    };
    matching(true).or_else(|| matching(false))
}

fn byte_count(n: u64) -> u32 {
    if n == 0 {
        1
    } else {
        (u64::BITS - n.leading_zeros()).div_ceil(8)
    }
}

fn digit_count(n: u64) -> u32 {
    n.checked_ilog10().map_or(1, |d| d + 1)
}

fn low_bytes_mask(n: u32) -> u64 {
    if n >= 8 {
        u64::MAX
    } else {
        (1u64 << (n * 8)) - 1
    }
}

fn is_byte_suffix(a: u64, b: u64, n: u32) -> bool {
    if n >= byte_count(b) {
        return a == b;
    }
    a == b & low_bytes_mask(n)
}

fn is_byte_prefix(a: u64, b: u64, n: u32) -> bool {
    let width = byte_count(b);
    if n >= width {
        return a == b;
    }
    a == (b >> ((width - n) * 8)) & low_bytes_mask(n)
}

fn is_digit_prefix(a: u64, b: u64, n: u32) -> bool {
    let shift = digit_count(b).saturating_sub(n);
    10u64.checked_pow(shift).is_some_and(|div| a == b / div)
}

fn is_digit_suffix(a: u64, b: u64, n: u32) -> bool {
    match 10u64.checked_pow(n) {
        Some(m) => a == b % m,
        None => a == b,
    }
}

/// Whether object id `a` may be a fragment of IMEI `b`.
///
/// True when `a`'s minimal big-endian byte representation is a prefix or
/// suffix of `b`'s, or `a`'s decimal digits are a prefix or suffix of
/// `b`'s. Widths are taken from `a`. Any of the four tests is enough.
pub fn is_part_of(a: u64, b: u64) -> bool {
    let bytes = byte_count(a);
    let digits = digit_count(a);
    is_byte_suffix(a, b, bytes)
        || is_byte_prefix(a, b, bytes)
        || is_digit_suffix(a, b, digits)
        || is_digit_prefix(a, b, digits)
}

/// How an object id was mapped to a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A vehicle already carried this object id.
    Cached(VehicleId),
    /// One vehicle matched the IMEI heuristic.
    Matched(VehicleId),
    /// Nothing matched; a pending placeholder was created.
    Created(VehicleId),
}

impl Resolution {
    pub fn vehicle_id(self) -> VehicleId {
        match self {
            Self::Cached(id) | Self::Matched(id) | Self::Created(id) => id,
        }
    }
}

/// Maps `(object id, provider)` to a vehicle.
pub struct VehicleResolver {
    vehicles: Arc<dyn VehicleStore>,
}

impl VehicleResolver {
    pub fn new(vehicles: Arc<dyn VehicleStore>) -> Self {
        Self { vehicles }
    }

    /// Resolve an object id reported through `provider`.
    pub async fn resolve(
        &self,
        oid: u32,
        provider: ProviderId,
    ) -> Result<Resolution, ResolveError> {
        let exact = self.vehicles.find_vehicles_by_oid(oid, provider).await?;
        let (candidates, cached) = if exact.is_empty() {
            let all = self.vehicles.find_vehicles_by_provider(provider).await?;
            (filter_by_oid(oid, all), false)
        } else {
            (exact, true)
        };

        match candidates.as_slice() {
            [] => {
                let id = self
                    .vehicles
                    .insert_vehicle(NewVehicle::placeholder(oid, provider))
                    .await?;
                warn!(oid, %provider, vehicle = %id, "Unknown object id, created placeholder vehicle");
                Ok(Resolution::Created(id))
            }
            [vehicle] if cached => Ok(Resolution::Cached(vehicle.id)),
            [vehicle] => {
                if vehicle.oid != Some(oid) {
                    self.vehicles.update_vehicle_oid(vehicle.id, oid).await?;
                }
                debug!(oid, vehicle = %vehicle.id, imei = %vehicle.imei, "Object id matched by IMEI");
                Ok(Resolution::Matched(vehicle.id))
            }
            many => Err(ResolveError::Ambiguous {
                oid,
                candidates: many.len(),
            }),
        }
    }
}

fn filter_by_oid(oid: u32, vehicles: Vec<Vehicle>) -> Vec<Vehicle> {
    vehicles
        .into_iter()
        .filter(|v| match v.imei.trim().parse::<u64>() {
            Ok(imei) => is_part_of(u64::from(oid), imei),
            Err(_) => {
                debug!(vehicle = %v.id, imei = %v.imei, "IMEI is not numeric, skipped");
                false
            }
        })
        .collect()
}
