//! End-to-end ingest of a log root.
//!
//! An [`Ingest`] wires the stages together for one run:
//!
//! 1. list trips and discover interfaces
//! 2. start the fix stream and one packet stream per interface
//! 3. correlate on a dedicated thread
//! 4. build the time map on the calling thread
//!
//! Source failures do not fail the run. They end their stream and show up in
//! [`IngestStats::failures`].

use crate::config::IngestConfig;
use crate::correlate::{
    Correlator, CorrelatorStats, GpsPacketStream, InterfaceStream, StreamFailure,
};
use crate::pipeline::{BuildStats, TimeMap, TimeMapBuilder};
use crate::source::{
    CaptureReplay, FixDecoder, NmeaDecoder, PcapReplay, spawn_fix_stream, spawn_interface_stream,
};
use crate::trips::{MissingCaptureDir, Trip, discover_interfaces, list_trips};
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Statistics for one ingest run.
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    /// Trips enumerated.
    pub trips: usize,

    /// Interfaces discovered, in name order.
    pub interfaces: Vec<String>,

    /// Correlation counts and stream failures.
    pub correlator: CorrelatorStats,

    /// Time map builder counts.
    pub builder: BuildStats,
}

impl IngestStats {
    /// Streams that ended early on a source failure.
    pub fn failures(&self) -> &[StreamFailure] {
        &self.correlator.failures
    }

    /// Earliest trip, by name, in which any stream failed.
    pub fn first_failed_trip(&self) -> Option<&str> {
        self.failures().iter().map(|f| f.trip.as_str()).min()
    }
}

/// Output of a completed run.
#[derive(Debug)]
pub struct IngestOutput {
    /// Every trip the run covered, in name order.
    pub trips: Vec<Trip>,

    /// Deduplicated, bucketed records.
    pub time_map: TimeMap,

    pub stats: IngestStats,
}

/// Correlated records of a set of trips, still being produced.
pub struct Correlation {
    /// Interfaces being replayed, in name order.
    pub interfaces: Vec<String>,

    /// The joined records.
    pub records: GpsPacketStream,
}

/// Ingest runner, generic over the GPS decoder and capture replay.
pub struct Ingest<D = NmeaDecoder, C = PcapReplay> {
    config: IngestConfig,
    decoder: Arc<D>,
    replay: Arc<C>,
    running: Option<Arc<AtomicBool>>,
}

impl Ingest {
    /// Ingest with the NMEA decoder and pcap replay.
    pub fn new(config: IngestConfig) -> Self {
        Self::with_sources(config, NmeaDecoder, PcapReplay)
    }
}

impl Default for Ingest {
    fn default() -> Self {
        Self::new(IngestConfig::default())
    }
}

impl<D: FixDecoder, C: CaptureReplay> Ingest<D, C> {
    /// Ingest with custom sources.
    pub fn with_sources(config: IngestConfig, decoder: D, replay: C) -> Self {
        Self {
            config,
            decoder: Arc::new(decoder),
            replay: Arc::new(replay),
            running: None,
        }
    }

    /// Abandon the run with [`Error::Cancelled`] once `running` is cleared.
    pub fn with_shutdown_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    fn cancelled(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.load(Ordering::SeqCst))
    }

    /// Start the source streams and correlator for `trips`.
    ///
    /// Trips must be in chronological (name) order. Dropping or finishing
    /// the returned stream stops every thread the run started.
    pub fn correlate(&self, trips: &[Trip]) -> Result<Correlation> {
        self.config.validate()?;
        let layout = &self.config.layout;

        let interfaces = discover_interfaces(trips, layout, MissingCaptureDir::Skip)?;
        debug!("Discovered interfaces: {:?}", interfaces);

        let fixes = spawn_fix_stream(
            trips.to_vec(),
            layout.clone(),
            Arc::clone(&self.decoder),
            self.config.fix_queue,
        );
        let streams = interfaces
            .iter()
            .map(|name| InterfaceStream {
                name: name.clone(),
                packets: spawn_interface_stream(
                    trips.to_vec(),
                    name.clone(),
                    layout.clone(),
                    Arc::clone(&self.replay),
                    self.config.file_queue,
                    self.config.interface_queue,
                ),
            })
            .collect();

        let mut correlator = Correlator::new(fixes, streams, self.config.staleness);
        if let Some(running) = &self.running {
            correlator = correlator.with_shutdown_flag(Arc::clone(running));
        }
        let records = correlator.spawn(self.config.record_queue);

        Ok(Correlation {
            interfaces,
            records,
        })
    }

    /// Ingest the given trips into a fresh time map.
    pub fn run_trips(&self, trips: Vec<Trip>) -> Result<IngestOutput> {
        info!("Ingesting {} trips", trips.len());
        let Correlation {
            interfaces,
            mut records,
        } = self.correlate(&trips)?;

        let mut builder = TimeMapBuilder::new();
        for record in &mut records {
            if self.cancelled() {
                break;
            }
            builder.push(record);
        }

        // Always join the correlator so no thread outlives the run.
        let correlator = records.finish()?;
        if self.cancelled() {
            info!("Ingest cancelled");
            return Err(Error::Cancelled);
        }

        let (time_map, builder_stats) = builder.finish();
        let stats = IngestStats {
            trips: trips.len(),
            interfaces,
            correlator,
            builder: builder_stats,
        };

        info!(
            "Ingest complete: {} trips, {} interfaces, {} records in {} buckets ({} duplicates)",
            stats.trips,
            stats.interfaces.len(),
            stats.builder.inserted,
            time_map.len(),
            stats.builder.duplicates
        );

        Ok(IngestOutput {
            trips,
            time_map,
            stats,
        })
    }

    /// Ingest every trip under `root`.
    pub fn run(&self, root: &Path) -> Result<IngestOutput> {
        let trips = list_trips(root)?;
        self.run_trips(trips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tripmap_core::{Fix, Packet};

    /// Sources backed by in-memory tables keyed by path.
    #[derive(Default)]
    struct Tables {
        fixes: Vec<(PathBuf, Vec<Fix>)>,
        packets: Vec<(PathBuf, Vec<Packet>)>,
    }

    fn not_found() -> tripmap_core::Error {
        std::io::Error::from(std::io::ErrorKind::NotFound).into()
    }

    impl FixDecoder for Tables {
        type Fixes = std::vec::IntoIter<tripmap_core::Result<Fix>>;

        fn open(&self, path: &Path) -> tripmap_core::Result<Self::Fixes> {
            let (_, fixes) = self.fixes.iter().find(|(p, _)| p == path).ok_or_else(not_found)?;
            Ok(fixes.iter().cloned().map(Ok).collect::<Vec<_>>().into_iter())
        }
    }

    impl CaptureReplay for Tables {
        type Packets = std::vec::IntoIter<tripmap_core::Result<Packet>>;

        fn open(&self, path: &Path) -> tripmap_core::Result<Self::Packets> {
            let (_, packets) = self.packets.iter().find(|(p, _)| p == path).ok_or_else(not_found)?;
            Ok(packets.iter().cloned().map(Ok).collect::<Vec<_>>().into_iter())
        }
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// Creates `<trip>/wifi/<iface>/pcap` so discovery and listing find it.
    fn trip_with_capture(root: &Path, trip: &str, iface: &str) -> PathBuf {
        let dir = root.join(trip).join("wifi").join(iface);
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("pcap");
        std::fs::write(&file, b"").unwrap();
        file
    }

    fn ingest_with(
        fixes: Vec<(PathBuf, Vec<Fix>)>,
        packets: Vec<(PathBuf, Vec<Packet>)>,
    ) -> Ingest<Tables, Tables> {
        let decoder = Tables {
            fixes,
            ..Tables::default()
        };
        let replay = Tables {
            packets,
            ..Tables::default()
        };
        Ingest::with_sources(IngestConfig::default(), decoder, replay)
    }

    // =========================================================================
    // Runs
    // =========================================================================

    #[test]
    fn test_run_joins_and_dedupes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let capture = trip_with_capture(root, "2018-03-23", "wlan0");

        let fixes = vec![(
            root.join("2018-03-23/gps/nmea.log"),
            vec![Fix::new(at(100), 10.0, 20.0), Fix::new(at(200), 11.0, 21.0)],
        )];
        let packets = vec![(
            capture,
            vec![Packet::new(at(98), "cc:cc"), Packet::new(at(199), "cc:cc")],
        )];

        let output = ingest_with(fixes, packets).run(root).unwrap();

        assert_eq!(output.trips.len(), 1);
        assert_eq!(output.stats.interfaces, vec!["wlan0".to_string()]);
        assert_eq!(output.time_map.bucket_of("cc:cc"), Some(100));
        assert_eq!(output.time_map.record_count(), 1);
        assert_eq!(output.stats.builder.duplicates, 1);
        assert!(output.stats.failures().is_empty());
    }

    #[test]
    fn test_empty_root() {
        let tmp = TempDir::new().unwrap();
        let output = Ingest::default().run(tmp.path()).unwrap();

        assert!(output.trips.is_empty());
        assert!(output.time_map.is_empty());
    }

    #[test]
    fn test_missing_root_is_enumeration_error() {
        let tmp = TempDir::new().unwrap();
        let err = Ingest::default().run(&tmp.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::Enumerate { .. }));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = IngestConfig {
            record_queue: 0,
            ..IngestConfig::default()
        };
        let err = Ingest::new(config).run(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    #[test]
    fn test_cleared_flag_cancels() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let capture = trip_with_capture(root, "a", "wlan0");

        let fixes = vec![(
            root.join("a/gps/nmea.log"),
            (0..1000).map(|s| Fix::new(at(1000 + s), 1.0, 2.0)).collect(),
        )];
        let packets = vec![(
            capture,
            (0..1000).map(|s| Packet::new(at(1000 + s), format!("m{}", s))).collect(),
        )];

        let running = Arc::new(AtomicBool::new(false));
        let err = ingest_with(fixes, packets)
            .with_shutdown_flag(running)
            .run(root)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_cleared_flag_stops_fix_only_correlation() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("a/gps")).unwrap();

        let fixes = vec![(
            root.join("a/gps/nmea.log"),
            (0..100_000).map(|s| Fix::new(at(1000 + s), 1.0, 2.0)).collect(),
        )];
        let ingest = ingest_with(fixes, vec![])
            .with_shutdown_flag(Arc::new(AtomicBool::new(false)));

        let trips = list_trips(root).unwrap();
        let correlation = ingest.correlate(&trips).unwrap();
        assert!(correlation.interfaces.is_empty());

        let stats = correlation.records.finish().unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.fixes_total, 0);

        let err = ingest.run(root).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    // =========================================================================
    // Stats
    // =========================================================================

    #[test]
    fn test_first_failed_trip() {
        let failure = |trip: &str| StreamFailure {
            stream: "wlan0".to_string(),
            trip: trip.to_string(),
            path: PathBuf::from("pcap"),
            error: "bad".to_string(),
        };

        let mut stats = IngestStats::default();
        assert_eq!(stats.first_failed_trip(), None);

        stats.correlator.failures = vec![failure("c"), failure("b")];
        assert_eq!(stats.first_failed_trip(), Some("b"));
    }
}
