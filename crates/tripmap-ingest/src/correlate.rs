//! Temporal correlator: joins packets to the GPS fix that covers them.
//!
//! The GPS stream is the clock. Each interface has one pending slot holding
//! the next packet not yet placed. For every usable fix:
//!
//! 1. Fill every empty slot whose stream is still open.
//! 2. For every pending packet not newer than the fix: emit it joined to the
//!    fix if it is at most `staleness` older, otherwise drop it as stale.
//!    Either way the slot is cleared.
//! 3. If any slot was cleared, go back to 1; otherwise take the next fix.
//!
//! A fix without a time or latitude is skipped outright. A fix whose
//! longitude alone is missing still claims due packets, but they are dropped
//! unplaced rather than held for a later fix.
//!
//! A packet newer than the fix stays pending across fixes until one catches
//! up with it. When the fix stream ends, pending packets are dropped and every
//! interface stream is read to its end, so a source failure queued behind a
//! never-due packet is still reported. When the consumer goes away or the
//! shutdown flag is cleared, the receivers are closed instead, which stops
//! their producers.
//!
//! Filling waits on all empty slots at once and takes whichever interface is
//! ready first, so one slow producer never holds up reading the others.

use crate::source::{SourceFailure, StreamItem};
use crate::{Error, Result};
use chrono::TimeDelta;
use crossbeam_channel::{Receiver, Select, Sender, bounded};
use metrics::counter;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tripmap_core::{Fix, GpsPacket, Packet};

/// Name under which GPS stream failures are reported.
pub const GPS_STREAM: &str = "gps";

/// One interface's packet stream.
pub struct InterfaceStream {
    /// Interface name, used in reports.
    pub name: String,

    /// The merged packet stream.
    pub packets: Receiver<StreamItem<Packet>>,
}

/// A stream that ended on a source failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    /// `gps` or the interface name.
    pub stream: String,

    /// Trip whose source failed.
    pub trip: String,

    /// File that failed.
    pub path: PathBuf,

    /// Rendered error.
    pub error: String,
}

impl StreamFailure {
    fn new(stream: &str, failure: SourceFailure) -> Self {
        Self {
            stream: stream.to_string(),
            trip: failure.trip,
            path: failure.path,
            error: failure.error.to_string(),
        }
    }
}

/// Statistics from a correlation run.
#[derive(Debug, Clone, Default)]
pub struct CorrelatorStats {
    /// Fixes read from the GPS stream.
    pub fixes_total: usize,

    /// Fixes skipped for lacking a time or latitude.
    pub fixes_unusable: usize,

    /// Packets read from all interfaces.
    pub packets_total: usize,

    /// Packets dropped for being older than the staleness window.
    pub packets_stale: usize,

    /// Due packets dropped because their fix had no longitude.
    pub packets_unplaced: usize,

    /// Packets joined to a fix and emitted.
    pub records_joined: usize,

    /// Packets never due: pending when the fix stream ended, or read while
    /// draining the interface streams afterwards.
    pub pending_discarded: usize,

    /// The run stopped early because the shutdown flag was cleared.
    pub cancelled: bool,

    /// Streams that ended early on a source failure.
    pub failures: Vec<StreamFailure>,
}

impl CorrelatorStats {
    fn record_failure(&mut self, stream: &str, failure: SourceFailure) {
        tracing::warn!(
            "Stream {} ended early in trip {}: {}",
            stream,
            failure.trip,
            failure.error
        );
        self.failures.push(StreamFailure::new(stream, failure));
    }

    fn publish(&self) {
        counter!("ingest_fixes_total").increment(self.fixes_total as u64);
        counter!("ingest_fixes_unusable_total").increment(self.fixes_unusable as u64);
        counter!("ingest_packets_total").increment(self.packets_total as u64);
        counter!("ingest_packets_stale_total").increment(self.packets_stale as u64);
        counter!("ingest_packets_unplaced_total").increment(self.packets_unplaced as u64);
        counter!("ingest_records_joined_total").increment(self.records_joined as u64);
        counter!("ingest_stream_failures_total").increment(self.failures.len() as u64);
    }
}

struct Slot {
    name: String,
    packets: Receiver<StreamItem<Packet>>,
    pending: Option<Packet>,
    open: bool,
}

/// Clock-driven join of one fix stream with N interface streams.
pub struct Correlator {
    fixes: Receiver<StreamItem<Fix>>,
    interfaces: Vec<InterfaceStream>,
    staleness: TimeDelta,
    running: Option<Arc<AtomicBool>>,
}

impl Correlator {
    /// Create a correlator. A packet joins a fix when
    /// `0 <= fix.time - packet.time <= staleness`.
    pub fn new(
        fixes: Receiver<StreamItem<Fix>>,
        interfaces: Vec<InterfaceStream>,
        staleness: TimeDelta,
    ) -> Self {
        Self {
            fixes,
            interfaces,
            staleness,
            running: None,
        }
    }

    /// Stop before the next fix once `running` is cleared.
    pub fn with_shutdown_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    /// Run on a new thread, emitting into a queue of `capacity` records.
    pub fn spawn(self, capacity: usize) -> GpsPacketStream {
        let (tx, rx) = bounded(capacity);
        let handle = thread::spawn(move || self.run(&tx));
        GpsPacketStream {
            records: rx,
            handle,
        }
    }

    /// Correlate until the fix stream ends, `output` is closed, or the
    /// shutdown flag is cleared.
    pub fn run(self, output: &Sender<GpsPacket>) -> CorrelatorStats {
        let Self {
            fixes,
            interfaces,
            staleness,
            running,
        } = self;
        let cancelled = || running.as_ref().is_some_and(|r| !r.load(Ordering::SeqCst));

        let mut stats = CorrelatorStats::default();
        let mut stopped = false;
        let mut slots: Vec<Slot> = interfaces
            .into_iter()
            .map(|stream| Slot {
                name: stream.name,
                packets: stream.packets,
                pending: None,
                open: true,
            })
            .collect();

        'fixes: for item in fixes.iter() {
            if cancelled() {
                tracing::debug!("Shutdown requested, stopping correlation");
                stats.cancelled = true;
                stopped = true;
                break;
            }

            let fix = match item {
                Ok(fix) => fix,
                Err(failure) => {
                    stats.record_failure(GPS_STREAM, failure);
                    break;
                }
            };
            stats.fixes_total += 1;

            let now = match fix.time {
                Some(now) if !fix.latitude.is_nan() => now,
                _ => {
                    stats.fixes_unusable += 1;
                    continue;
                }
            };

            loop {
                fill_slots(&mut slots, &mut stats);

                let mut cleared = false;
                for slot in &mut slots {
                    let Some(packet) = slot.pending.take_if(|p| p.time <= now) else {
                        continue;
                    };
                    cleared = true;

                    if now - packet.time > staleness {
                        stats.packets_stale += 1;
                        continue;
                    }
                    let Some(record) = GpsPacket::new(fix.clone(), packet) else {
                        stats.packets_unplaced += 1;
                        continue;
                    };
                    stats.records_joined += 1;
                    if output.send(record).is_err() {
                        tracing::debug!("Record consumer gone, stopping correlation");
                        stopped = true;
                        break 'fixes;
                    }
                }

                if !cleared {
                    break;
                }
            }
        }

        stats.pending_discarded = slots.iter().filter(|s| s.pending.is_some()).count();
        if !stopped {
            drain_slots(&mut slots, &mut stats);
        }
        stats.publish();
        tracing::debug!(
            "Correlation finished: {} fixes, {} packets, {} joined, {} stale",
            stats.fixes_total,
            stats.packets_total,
            stats.records_joined,
            stats.packets_stale
        );
        stats
    }
}

/// Read every open interface stream to its end, recording failures.
fn drain_slots(slots: &mut [Slot], stats: &mut CorrelatorStats) {
    for slot in slots.iter_mut().filter(|slot| slot.open) {
        for item in slot.packets.iter() {
            match item {
                Ok(_) => {
                    stats.packets_total += 1;
                    stats.pending_discarded += 1;
                }
                Err(failure) => {
                    stats.record_failure(&slot.name, failure);
                    break;
                }
            }
        }
        slot.open = false;
    }
}

/// Fill every empty, open slot, blocking until each has a packet or its
/// stream has ended.
fn fill_slots(slots: &mut [Slot], stats: &mut CorrelatorStats) {
    loop {
        let waiting: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.open && slot.pending.is_none())
            .map(|(i, _)| i)
            .collect();
        if waiting.is_empty() {
            return;
        }

        let (index, received) = {
            let mut select = Select::new();
            for &i in &waiting {
                select.recv(&slots[i].packets);
            }
            let operation = select.select();
            let index = waiting[operation.index()];
            (index, operation.recv(&slots[index].packets))
        };

        let slot = &mut slots[index];
        match received {
            Ok(Ok(packet)) => {
                stats.packets_total += 1;
                slot.pending = Some(packet);
            }
            Ok(Err(failure)) => {
                slot.open = false;
                stats.record_failure(&slot.name, failure);
            }
            Err(_) => {
                slot.open = false;
                tracing::debug!("Interface {} exhausted", slot.name);
            }
        }
    }
}

/// Lazy sequence of joined records produced by a running correlator.
pub struct GpsPacketStream {
    records: Receiver<GpsPacket>,
    handle: JoinHandle<CorrelatorStats>,
}

impl Iterator for GpsPacketStream {
    type Item = GpsPacket;

    fn next(&mut self) -> Option<GpsPacket> {
        self.records.recv().ok()
    }
}

impl GpsPacketStream {
    /// Stop consuming and wait for the correlator to finish.
    ///
    /// Safe to call before the stream is exhausted: the record queue is
    /// closed first, so the correlator stops at its next send.
    pub fn finish(self) -> Result<CorrelatorStats> {
        let Self { records, handle } = self;
        drop(records);
        handle
            .join()
            .map_err(|_| Error::WorkerPanicked("correlator"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn fix(secs: i64) -> Fix {
        Fix::new(at_ms(secs * 1000), 10.0, 20.0)
    }

    fn packet_ms(ms: i64, source: &str) -> Packet {
        Packet::new(at_ms(ms), source)
    }

    fn packet(secs: i64, source: &str) -> Packet {
        packet_ms(secs * 1000, source)
    }

    fn fix_stream(fixes: Vec<Fix>) -> Receiver<StreamItem<Fix>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        for fix in fixes {
            tx.send(Ok(fix)).unwrap();
        }
        rx
    }

    fn interface(name: &str, packets: Vec<Packet>) -> InterfaceStream {
        let (tx, rx) = crossbeam_channel::unbounded();
        for packet in packets {
            tx.send(Ok(packet)).unwrap();
        }
        InterfaceStream {
            name: name.to_string(),
            packets: rx,
        }
    }

    fn correlate(
        fixes: Vec<Fix>,
        interfaces: Vec<InterfaceStream>,
    ) -> (Vec<GpsPacket>, CorrelatorStats) {
        let mut stream =
            Correlator::new(fix_stream(fixes), interfaces, TimeDelta::seconds(5)).spawn(64);
        let records: Vec<GpsPacket> = (&mut stream).collect();
        (records, stream.finish().unwrap())
    }

    fn summary(records: &[GpsPacket]) -> Vec<(i64, String)> {
        records
            .iter()
            .map(|r| (r.bucket().unwrap(), r.source().to_string()))
            .collect()
    }

    // =========================================================================
    // Staleness window
    // =========================================================================

    #[test]
    fn test_recent_packet_joins_fix() {
        let (records, stats) = correlate(
            vec![fix(100)],
            vec![interface("wlan0", vec![packet(98, "AA:AA")])],
        );

        assert_eq!(summary(&records), vec![(100, "AA:AA".to_string())]);
        assert_eq!(records[0].fix().latitude, 10.0);
        assert_eq!(records[0].fix().longitude, 20.0);
        assert_eq!(stats.records_joined, 1);
    }

    #[test]
    fn test_stale_packet_is_discarded() {
        let (records, stats) = correlate(
            vec![fix(100), fix(101)],
            vec![interface("wlan0", vec![packet(90, "AA:AA")])],
        );

        assert!(records.is_empty());
        assert_eq!(stats.packets_stale, 1);
    }

    #[test]
    fn test_staleness_boundary_is_inclusive() {
        let (records, stats) = correlate(
            vec![fix(100)],
            vec![
                interface("wlan0", vec![packet_ms(95_000, "exact")]),
                interface("wlan1", vec![packet_ms(94_999, "late")]),
            ],
        );

        assert_eq!(summary(&records), vec![(100, "exact".to_string())]);
        assert_eq!(stats.packets_stale, 1);
    }

    #[test]
    fn test_packet_at_fix_time_joins() {
        let (records, _) = correlate(
            vec![fix(100)],
            vec![interface("wlan0", vec![packet(100, "same")])],
        );
        assert_eq!(summary(&records), vec![(100, "same".to_string())]);
    }

    // =========================================================================
    // Pending packets
    // =========================================================================

    #[test]
    fn test_future_packet_waits_for_later_fix() {
        let (records, _) = correlate(
            vec![fix(100), fix(101)],
            vec![interface("wlan0", vec![packet_ms(100_500, "BB:BB")])],
        );
        assert_eq!(summary(&records), vec![(101, "BB:BB".to_string())]);
    }

    #[test]
    fn test_packet_is_claimed_by_earliest_covering_fix() {
        let (records, _) = correlate(
            vec![fix(100), fix(101)],
            vec![interface("wlan0", vec![packet(99, "BB:BB")])],
        );
        assert_eq!(summary(&records), vec![(100, "BB:BB".to_string())]);
    }

    #[test]
    fn test_drain_loop_catches_up_backlog() {
        let (records, stats) = correlate(
            vec![fix(100)],
            vec![interface(
                "wlan0",
                vec![
                    packet(80, "old"),
                    packet(96, "a"),
                    packet(97, "b"),
                    packet(99, "c"),
                    packet(102, "future"),
                ],
            )],
        );

        assert_eq!(
            summary(&records),
            vec![
                (100, "a".to_string()),
                (100, "b".to_string()),
                (100, "c".to_string())
            ]
        );
        assert_eq!(stats.packets_stale, 1);
        assert_eq!(stats.pending_discarded, 1);
    }

    #[test]
    fn test_trailing_pending_packets_are_dropped() {
        let (records, stats) = correlate(
            vec![fix(100)],
            vec![interface("wlan0", vec![packet(200, "never")])],
        );
        assert!(records.is_empty());
        assert_eq!(stats.pending_discarded, 1);
    }

    // =========================================================================
    // Fix filtering
    // =========================================================================

    #[test]
    fn test_unusable_fixes_are_skipped() {
        let no_position = Fix::new(at_ms(100_000), f64::NAN, 20.0);
        let (records, stats) = correlate(
            vec![Fix::unfixed(), no_position, fix(102)],
            vec![interface("wlan0", vec![packet(99, "x")])],
        );

        assert_eq!(summary(&records), vec![(102, "x".to_string())]);
        assert_eq!(stats.fixes_total, 3);
        assert_eq!(stats.fixes_unusable, 2);
    }

    #[test]
    fn test_fix_without_longitude_drops_due_packets() {
        let no_longitude = Fix::new(at_ms(100_000), 10.0, f64::NAN);
        let (records, stats) = correlate(
            vec![no_longitude, fix(101)],
            vec![interface("wlan0", vec![packet(99, "x"), packet(101, "y")])],
        );

        assert_eq!(summary(&records), vec![(101, "y".to_string())]);
        assert_eq!(stats.fixes_unusable, 0);
        assert_eq!(stats.packets_unplaced, 1);
    }

    // =========================================================================
    // Multiple interfaces
    // =========================================================================

    #[test]
    fn test_future_packet_on_one_interface_does_not_block_another() {
        let (records, _) = correlate(
            vec![fix(100), fix(101), fix(102)],
            vec![
                interface("wlan0", vec![packet(500, "far")]),
                interface(
                    "wlan1",
                    vec![packet(99, "b1"), packet_ms(100_500, "b2"), packet(102, "b3")],
                ),
            ],
        );

        assert_eq!(
            summary(&records),
            vec![
                (100, "b1".to_string()),
                (101, "b2".to_string()),
                (102, "b3".to_string())
            ]
        );
    }

    #[test]
    fn test_slow_interface_does_not_reorder_output() {
        let (slow_tx, slow_rx) = crossbeam_channel::bounded(1);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            slow_tx.send(Ok(packet(99, "slow"))).unwrap();
        });

        let (records, _) = correlate(
            vec![fix(100)],
            vec![
                InterfaceStream {
                    name: "wlan0".to_string(),
                    packets: slow_rx,
                },
                interface("wlan1", vec![packet(98, "fast")]),
            ],
        );
        producer.join().unwrap();

        assert_eq!(
            summary(&records),
            vec![(100, "slow".to_string()), (100, "fast".to_string())]
        );
    }

    #[test]
    fn test_joined_records_respect_window() {
        // Deterministic pseudo-random packet times around a 1 Hz fix stream.
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut next = move |modulus: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % modulus) as i64
        };

        let fixes: Vec<Fix> = (0..200).map(|s| fix(1_000 + s)).collect();
        let interfaces: Vec<InterfaceStream> = (0..3)
            .map(|i| {
                let mut ms = 990_000;
                let packets = (0..150)
                    .map(|n| {
                        ms += next(3_000);
                        packet_ms(ms, &format!("{}:{}", i, n))
                    })
                    .collect();
                interface(&format!("wlan{}", i), packets)
            })
            .collect();

        let (records, stats) = correlate(fixes, interfaces);

        assert!(!records.is_empty());
        for record in &records {
            let fix_time = record.fix().time.unwrap();
            let delta = fix_time - record.packet().time;
            assert!(delta >= TimeDelta::zero(), "{:?}", record);
            assert!(delta <= TimeDelta::seconds(5), "{:?}", record);
        }
        assert_eq!(
            stats.records_joined
                + stats.packets_stale
                + stats.packets_unplaced
                + stats.pending_discarded,
            stats.packets_total
        );
    }

    // =========================================================================
    // Failures and termination
    // =========================================================================

    #[test]
    fn test_interface_failure_is_reported() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Ok(packet(99, "ok"))).unwrap();
        tx.send(Err(SourceFailure {
            trip: "2018-03-23T12:00:00Z".to_string(),
            path: PathBuf::from("wifi/wlan0/pcap1"),
            error: tripmap_core::Error::InvalidCapture("bad magic".to_string()),
        }))
        .unwrap();
        drop(tx);

        let (records, stats) = correlate(
            vec![fix(100), fix(101)],
            vec![InterfaceStream {
                name: "wlan0".to_string(),
                packets: rx,
            }],
        );

        assert_eq!(summary(&records), vec![(100, "ok".to_string())]);
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.failures[0].stream, "wlan0");
        assert_eq!(stats.failures[0].trip, "2018-03-23T12:00:00Z");
        assert!(stats.failures[0].error.contains("bad magic"));
    }

    fn failing_interface(name: &str, packets: Vec<Packet>, trip: &str) -> InterfaceStream {
        let (tx, rx) = crossbeam_channel::unbounded();
        for packet in packets {
            tx.send(Ok(packet)).unwrap();
        }
        tx.send(Err(SourceFailure {
            trip: trip.to_string(),
            path: PathBuf::from("wifi/wlan0/pcap1"),
            error: tripmap_core::Error::InvalidCapture("bad magic".to_string()),
        }))
        .unwrap();
        InterfaceStream {
            name: name.to_string(),
            packets: rx,
        }
    }

    #[test]
    fn test_failure_behind_pending_packet_is_reported() {
        let (records, stats) = correlate(
            vec![fix(100), fix(200)],
            vec![failing_interface(
                "wlan0",
                vec![packet(99, "a"), packet(300, "later"), packet(301, "later")],
                "b",
            )],
        );

        assert_eq!(summary(&records), vec![(100, "a".to_string())]);
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.failures[0].stream, "wlan0");
        assert_eq!(stats.failures[0].trip, "b");
        assert_eq!(stats.packets_total, 3);
        assert_eq!(stats.pending_discarded, 2);
    }

    #[test]
    fn test_gps_failure_ends_correlation() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Ok(fix(100))).unwrap();
        tx.send(Err(SourceFailure {
            trip: "b".to_string(),
            path: PathBuf::from("b/gps/nmea.log"),
            error: tripmap_core::Error::Io(std::io::Error::other("disk gone")),
        }))
        .unwrap();
        tx.send(Ok(fix(101))).unwrap();
        drop(tx);

        let mut stream = Correlator::new(
            rx,
            vec![interface("wlan0", vec![packet(100, "x")])],
            TimeDelta::seconds(5),
        )
        .spawn(8);
        let records: Vec<GpsPacket> = (&mut stream).collect();
        let stats = stream.finish().unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(stats.fixes_total, 1);
        assert_eq!(stats.failures[0].stream, GPS_STREAM);
    }

    #[test]
    fn test_finish_before_exhaustion() {
        let fixes: Vec<Fix> = (0..100).map(|s| fix(100 + s)).collect();
        let packets: Vec<Packet> = (0..100).map(|s| packet(100 + s, "x")).collect();

        let mut stream = Correlator::new(
            fix_stream(fixes),
            vec![interface("wlan0", packets)],
            TimeDelta::seconds(5),
        )
        .spawn(1);
        assert!(stream.next().is_some());

        let stats = stream.finish().unwrap();
        assert!(stats.records_joined < 100);
    }

    #[test]
    fn test_cleared_flag_stops_before_next_fix() {
        let fixes: Vec<Fix> = (0..1000).map(|s| fix(100 + s)).collect();
        let running = Arc::new(AtomicBool::new(false));

        let mut stream = Correlator::new(fix_stream(fixes), vec![], TimeDelta::seconds(5))
            .with_shutdown_flag(running)
            .spawn(8);
        assert!(stream.next().is_none());

        let stats = stream.finish().unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.fixes_total, 0);
    }

    #[test]
    fn test_cleared_flag_skips_drain() {
        let running = Arc::new(AtomicBool::new(false));
        let stats = Correlator::new(
            fix_stream(vec![fix(100)]),
            vec![failing_interface("wlan0", vec![packet(300, "x")], "a")],
            TimeDelta::seconds(5),
        )
        .with_shutdown_flag(running)
        .run(&crossbeam_channel::unbounded().0);

        assert!(stats.cancelled);
        assert!(stats.failures.is_empty());
    }

    #[test]
    fn test_no_interfaces() {
        let (records, stats) = correlate(vec![fix(100), fix(101)], vec![]);
        assert!(records.is_empty());
        assert_eq!(stats.fixes_total, 2);
    }
}
