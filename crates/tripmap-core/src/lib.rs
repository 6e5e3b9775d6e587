//! Core types and source decoders for the tripmap ingest engine.
//!
//! This crate provides:
//! - The data model: [`Fix`], [`Packet`] and the joined [`GpsPacket`]
//! - The GPS log decoder ([`NmeaReader`]) for RMC sentences
//! - The capture replay reader ([`PcapReader`]) for classic pcap files
//! - Prometheus metrics helpers
//! - Shared error types

pub mod capture;
mod error;
pub mod fix;
pub mod metrics;
mod record;

pub use capture::{
    LINKTYPE_ETHERNET, LINKTYPE_IEEE802_11, LINKTYPE_IEEE802_11_RADIOTAP, Packet, PcapReader,
    format_mac, open_capture,
};
#[cfg(any(test, feature = "test-support"))]
pub use capture::{PcapWriter, probe_request_frame};
pub use error::{Error, Result};
pub use fix::{Fix, NmeaReader, open_gps_log, parse_sentence};
pub use record::GpsPacket;
