//! Per-interface packet merge stream.
//!
//! ```text
//! trip A: wifi/wlan0/pcap, pcap1.gz ─┐ (directory thread, file_queue)
//! trip B: wifi/wlan0/pcap, ...       ─┼─▶ interface thread (interface_queue) ─▶ correlator
//! trip C: (no wlan0, skipped)        ─┘
//! ```
//!
//! The interface thread walks trips in order and, for each trip that
//! recorded the interface, starts a directory thread replaying that trip's
//! capture files in sequence order. Only one directory thread per interface
//! is alive at a time.

use super::{CaptureReplay, SourceFailure, StreamItem};
use crate::config::TripLayout;
use crate::trips::{Trip, capture_files};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tripmap_core::Packet;

/// Start a thread that replays one interface's captures across all trips.
///
/// The first capture file that fails to open or decode ends the stream with
/// a [`SourceFailure`]; later files and trips are not replayed.
pub fn spawn_interface_stream<C: CaptureReplay>(
    trips: Vec<Trip>,
    interface: String,
    layout: TripLayout,
    replay: Arc<C>,
    file_capacity: usize,
    capacity: usize,
) -> Receiver<StreamItem<Packet>> {
    let (tx, rx) = bounded(capacity);
    thread::spawn(move || {
        merge_interface(&trips, &interface, &layout, &replay, file_capacity, &tx)
    });
    rx
}

fn merge_interface<C: CaptureReplay>(
    trips: &[Trip],
    interface: &str,
    layout: &TripLayout,
    replay: &Arc<C>,
    file_capacity: usize,
    tx: &Sender<StreamItem<Packet>>,
) {
    for trip in trips {
        let dir = layout.interface_dir(trip, interface);
        if !dir.is_dir() {
            continue;
        }

        let files = match capture_files(&dir, &layout.capture_prefix) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!("Failed to list {}: {}", dir.display(), e);
                let _ = tx.send(Err(SourceFailure {
                    trip: trip.name.clone(),
                    path: dir,
                    error: e.into(),
                }));
                return;
            }
        };

        tracing::debug!(
            "Trip {}: replaying {} capture files for {}",
            trip.name,
            files.len(),
            interface
        );

        let packets = spawn_directory_replay(
            trip.name.clone(),
            files,
            Arc::clone(replay),
            file_capacity,
        );
        for item in packets {
            let failed = item.is_err();
            if tx.send(item).is_err() {
                tracing::debug!("Interface {} consumer gone, stopping", interface);
                return;
            }
            if failed {
                return;
            }
        }
    }
}

/// Replay one trip's capture files for an interface on its own thread.
fn spawn_directory_replay<C: CaptureReplay>(
    trip: String,
    files: Vec<PathBuf>,
    replay: Arc<C>,
    capacity: usize,
) -> Receiver<StreamItem<Packet>> {
    let (tx, rx) = bounded(capacity);
    thread::spawn(move || {
        for path in files {
            let packets = match replay.open(&path) {
                Ok(packets) => packets,
                Err(error) => {
                    tracing::warn!("Failed to open capture {}: {}", path.display(), error);
                    let _ = tx.send(Err(SourceFailure { trip, path, error }));
                    return;
                }
            };

            for packet in packets {
                match packet {
                    Ok(packet) => {
                        if tx.send(Ok(packet)).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        tracing::warn!("Failed reading capture {}: {}", path.display(), error);
                        let _ = tx.send(Err(SourceFailure { trip, path, error }));
                        return;
                    }
                }
            }
        }
    });
    rx
}
