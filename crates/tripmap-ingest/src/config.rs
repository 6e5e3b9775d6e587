//! Ingest configuration.

use crate::trips::Trip;
use crate::{Error, Result};
use chrono::TimeDelta;
use std::path::PathBuf;

/// Where things live inside a trip directory.
///
/// ```text
/// <trip>/gps/nmea.log
/// <trip>/wifi/<interface>/pcap, pcap1.gz, pcap2.gz, ...
/// ```
#[derive(Debug, Clone)]
pub struct TripLayout {
    /// GPS log path relative to the trip directory.
    /// Default: "gps/nmea.log"
    pub gps_log: PathBuf,

    /// Capture subdirectory holding one directory per interface.
    /// Default: "wifi"
    pub capture_dir: PathBuf,

    /// Only capture directories whose name starts with this are interfaces.
    /// Default: "wl"
    pub interface_prefix: String,

    /// Capture file name prefix; the rest up to the first '.' is the sequence.
    /// Default: "pcap"
    pub capture_prefix: String,
}

impl Default for TripLayout {
    fn default() -> Self {
        Self {
            gps_log: PathBuf::from("gps/nmea.log"),
            capture_dir: PathBuf::from("wifi"),
            interface_prefix: "wl".to_string(),
            capture_prefix: "pcap".to_string(),
        }
    }
}

impl TripLayout {
    /// Path of a trip's GPS log.
    pub fn gps_log_path(&self, trip: &Trip) -> PathBuf {
        trip.path.join(&self.gps_log)
    }

    /// Path of a trip's capture subdirectory.
    pub fn capture_root(&self, trip: &Trip) -> PathBuf {
        trip.path.join(&self.capture_dir)
    }

    /// Path of one interface's capture directory within a trip.
    pub fn interface_dir(&self, trip: &Trip, interface: &str) -> PathBuf {
        self.capture_root(trip).join(interface)
    }
}

/// Configuration for an ingest run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Trip directory layout.
    pub layout: TripLayout,

    /// Maximum age of a packet relative to the fix that claims it.
    /// Default: 5 seconds (inclusive)
    pub staleness: TimeDelta,

    /// Merged GPS fix queue capacity.
    /// Default: 8
    pub fix_queue: usize,

    /// Per-directory packet queue capacity.
    /// Default: 16
    pub file_queue: usize,

    /// Per-interface packet queue capacity.
    /// Default: 32
    pub interface_queue: usize,

    /// Joined record queue capacity.
    /// Default: 64
    pub record_queue: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            layout: TripLayout::default(),
            staleness: TimeDelta::seconds(5),
            fix_queue: 8,
            file_queue: 16,
            interface_queue: 32,
            record_queue: 64,
        }
    }
}

impl IngestConfig {
    /// Check that the configuration can drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.staleness < TimeDelta::zero() {
            return Err(Error::Config(format!(
                "staleness window must not be negative, got {}",
                self.staleness
            )));
        }

        let queues = [
            ("fix_queue", self.fix_queue),
            ("file_queue", self.file_queue),
            ("interface_queue", self.interface_queue),
            ("record_queue", self.record_queue),
        ];
        if let Some((name, _)) = queues.iter().find(|(_, capacity)| *capacity == 0) {
            return Err(Error::Config(format!("{} must be at least 1", name)));
        }

        if self.layout.interface_prefix.is_empty() || self.layout.capture_prefix.is_empty() {
            return Err(Error::Config(
                "interface and capture prefixes must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
