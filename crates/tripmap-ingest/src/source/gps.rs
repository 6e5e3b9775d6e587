//! GPS fix merge stream.

use super::{FixDecoder, SourceFailure, StreamItem};
use crate::config::TripLayout;
use crate::trips::Trip;
use crossbeam_channel::{Receiver, Sender, bounded};
use std::io::ErrorKind;
use std::sync::Arc;
use std::thread;
use tripmap_core::Fix;

/// Start a thread that replays every trip's GPS log in trip order.
///
/// Trips without a GPS log contribute nothing. A log that fails to open or
/// decode ends the stream with a [`SourceFailure`].
pub fn spawn_fix_stream<D: FixDecoder>(
    trips: Vec<Trip>,
    layout: TripLayout,
    decoder: Arc<D>,
    capacity: usize,
) -> Receiver<StreamItem<Fix>> {
    let (tx, rx) = bounded(capacity);
    thread::spawn(move || merge_fixes(&trips, &layout, decoder.as_ref(), &tx));
    rx
}

fn merge_fixes<D: FixDecoder>(
    trips: &[Trip],
    layout: &TripLayout,
    decoder: &D,
    tx: &Sender<StreamItem<Fix>>,
) {
    for trip in trips {
        let path = layout.gps_log_path(trip);
        let fixes = match decoder.open(&path) {
            Ok(fixes) => fixes,
            Err(tripmap_core::Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("Trip {} has no GPS log", trip.name);
                continue;
            }
            Err(error) => {
                tracing::warn!("Failed to open GPS log {}: {}", path.display(), error);
                let _ = tx.send(Err(SourceFailure {
                    trip: trip.name.clone(),
                    path,
                    error,
                }));
                return;
            }
        };

        tracing::debug!("Replaying GPS log {}", path.display());
        let mut count = 0usize;
        for fix in fixes {
            match fix {
                Ok(fix) => {
                    if tx.send(Ok(fix)).is_err() {
                        tracing::debug!("GPS stream consumer gone, stopping");
                        return;
                    }
                    count += 1;
                }
                Err(error) => {
                    tracing::warn!("Failed reading GPS log {}: {}", path.display(), error);
                    let _ = tx.send(Err(SourceFailure {
                        trip: trip.name.clone(),
                        path,
                        error,
                    }));
                    return;
                }
            }
        }
        tracing::debug!("Trip {}: {} GPS sentences", trip.name, count);
    }
}
