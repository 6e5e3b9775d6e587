//! Tripmap ingest engine.
//!
//! Turns a directory of recorded trips into a map of where each wireless
//! device was first heard. Every trip holds a GPS log and, per wireless
//! interface, a rotation of packet captures. The engine replays all of them
//! in trip order, attributes each packet to the GPS fix that follows it
//! within a short window, and keeps the first sighting of every address.
//!
//! # Modules
//!
//! - [`trips`] - Trip enumeration and interface discovery
//! - [`source`] - Threaded GPS and capture merge streams
//! - [`correlate`] - Fix-driven join of packets to positions
//! - [`pipeline`] - Deduplicating time map and session database
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────────┐
//! │   Fix Stream    │     │ Interface Streams (1..N) │  one thread each,
//! │ gps/nmea.log ×T │     │  wifi/wl*/pcap* ×T       │  bounded channels
//! └────────┬────────┘     └────────────┬─────────────┘
//!          │                           │
//!          ▼                           ▼
//! ┌─────────────────────────────────────────────────┐
//! │                   Correlator                    │  GPS time is the clock
//! └────────────────────────┬────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────┐
//! │ TimeMapBuilder  │  first sighting per address
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    SessionDb    │  processed trips + time map, JSON on disk
//! └─────────────────┘
//! ```

pub mod config;
pub mod correlate;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod source;
pub mod trips;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use config::{IngestConfig, TripLayout};
pub use correlate::{
    Correlator, CorrelatorStats, GpsPacketStream, InterfaceStream, StreamFailure,
};
pub use ingest::{Correlation, Ingest, IngestOutput, IngestStats};
pub use pipeline::{BuildStats, Insert, NamedPoint, SessionDb, TimeMap, TimeMapBuilder};
pub use source::{CaptureReplay, FixDecoder, NmeaDecoder, PcapReplay, SourceFailure};
pub use trips::{MissingCaptureDir, Trip, discover_interfaces, list_trips};
