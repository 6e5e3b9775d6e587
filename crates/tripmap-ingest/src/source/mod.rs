//! Merged source streams.
//!
//! Each stream runs on its own thread and feeds a bounded channel, so a
//! producer that gets ahead of the correlator blocks instead of buffering.
//! Streams are single-pass: they walk the trip list once, in order, and
//! close their channel when done.
//!
//! # Available Streams
//!
//! - [`spawn_fix_stream`] - every trip's GPS log, concatenated
//! - [`spawn_interface_stream`] - one interface's captures across every trip
//!
//! # Termination
//!
//! A producer stops when its input is exhausted, when a source fails to
//! open or decode (the failure is sent as the final item), or when its
//! receiver is dropped and the next send fails. Dropping a receiver is
//! therefore enough to stop a producer; no producer outlives its consumer
//! by more than one source read.

mod capture;
mod gps;

pub use capture::spawn_interface_stream;
pub use gps::spawn_fix_stream;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tripmap_core::{Fix, NmeaReader, Packet, PcapReader};

/// A source failure that ended a stream.
#[derive(Debug)]
pub struct SourceFailure {
    /// Trip whose source failed.
    pub trip: String,

    /// File that failed to open or decode.
    pub path: PathBuf,

    /// What went wrong.
    pub error: tripmap_core::Error,
}

/// Item carried by a stream channel. An `Err` is always the last item.
pub type StreamItem<T> = std::result::Result<T, SourceFailure>;

/// Opens a trip's GPS log as a lazy fix sequence.
pub trait FixDecoder: Send + Sync + 'static {
    /// The fix sequence of one log.
    type Fixes: Iterator<Item = tripmap_core::Result<Fix>> + Send + 'static;

    /// Open the log at `path`. A missing file must surface as an
    /// [`std::io::ErrorKind::NotFound`] I/O error.
    fn open(&self, path: &Path) -> tripmap_core::Result<Self::Fixes>;
}

/// Opens a capture file as a lazy packet sequence.
pub trait CaptureReplay: Send + Sync + 'static {
    /// The packet sequence of one capture file.
    type Packets: Iterator<Item = tripmap_core::Result<Packet>> + Send + 'static;

    /// Open the capture at `path`.
    fn open(&self, path: &Path) -> tripmap_core::Result<Self::Packets>;
}

/// NMEA RMC decoder over plain-text logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NmeaDecoder;

impl FixDecoder for NmeaDecoder {
    type Fixes = NmeaReader<BufReader<File>>;

    fn open(&self, path: &Path) -> tripmap_core::Result<Self::Fixes> {
        tripmap_core::open_gps_log(path)
    }
}

/// Classic pcap replay, gzipped or not.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcapReplay;

impl CaptureReplay for PcapReplay {
    type Packets = PcapReader<Box<dyn Read + Send>>;

    fn open(&self, path: &Path) -> tripmap_core::Result<Self::Packets> {
        tripmap_core::open_capture(path)
    }
}
