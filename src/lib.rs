//! # EGTS receiver
//!
//! Receiver for the EGTS telematics transport protocol (GOST R 54619 /
//! 33472) used by vehicle navigation terminals.
//!
//! Terminals connect over TCP from whitelisted provider addresses, send
//! navigation records and get every packet acknowledged. Readings are
//! matched to a vehicle, deduplicated against the last known position and
//! handed to the storage sink. Scheduled jobs refresh the position cache
//! and thin stored tracks.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Terminals (TCP, EGTS transport)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Server: provider whitelist, connection limit             │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐                       │
//! │  │  Conn 1  │  │  Conn 2  │  │  Conn N  │  decode, acknowledge  │
//! │  └──────────┘  └──────────┘  └──────────┘                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          Reading queue (bounded) and worker pool                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Plausibility, recording window, vehicle resolution, dedup      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Stores: vehicles, providers, tracks, reading sink        │
//! └─────────────────────────────────────────────────────────────────┘
//!   Scheduler: position cache refresh, track simplification

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]        // Wire constants
#![allow(clippy::cast_possible_truncation)]  // Bit fields
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]       // Coordinate scaling
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::suboptimal_flops)]
#![allow(clippy::similar_names)]             // lat/lon, oid/pid
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::use_self)]
#![allow(clippy::redundant_pub_crate)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::future_not_send)]
#![allow(clippy::struct_excessive_bools)]    // Wire flag fields
#![allow(clippy::match_same_arms)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::ignored_unit_patterns)]

pub mod config;
pub mod error;
pub mod generator;
pub mod geometry;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{ReadingPipeline, SaveOutcome, VehicleResolver};
    pub use crate::protocol::{Packet, PacketCodec, ServiceDataRecord, Subrecord};
    pub use crate::receiver::{Receiver, RunningReceiver, Stores};
    pub use crate::server::{Server, SignalHandler};
    pub use crate::store::{MemoryStore, PersistenceSink, ProviderStore, TrackStore, VehicleStore};
    pub use crate::types::*;
}
