//! Persisted session database.
//!
//! A session database is the set of processed trip names plus the time map
//! built from them. It is stored as one JSON document, gzip-compressed when
//! the file name ends in `.gz`, and replaced atomically on save.

use super::TimeMap;
use crate::ingest::{Ingest, IngestStats};
use crate::source::{CaptureReplay, FixDecoder};
use crate::{Error, Result};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Processed trips and their correlated time map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDb {
    trips: BTreeSet<String>,
    time_map: TimeMap,
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

fn temp_path(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("not a file path: {}", path.display()),
        ))
    })?;
    let mut temp = name.to_os_string();
    temp.push(".tmp");
    Ok(path.with_file_name(temp))
}

impl SessionDb {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a database saved by [`SessionDb::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let reader = BufReader::new(file);
        let db: Self = if is_gzip(path) {
            serde_json::from_reader(MultiGzDecoder::new(reader))
        } else {
            serde_json::from_reader(reader)
        }
        .map_err(|e| Error::Decode(format!("{}: {}", path.display(), e)))?;

        info!(
            "Loaded session database {} ({} trips, {} buckets)",
            path.display(),
            db.trips.len(),
            db.time_map.len()
        );
        Ok(db)
    }

    /// Load a database, or start an empty one if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(Error::NotFound(_)) => {
                info!("No session database at {}, starting fresh", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Save to `path`, replacing any existing file only once fully written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp = temp_path(path)?;
        if let Err(e) = self.write_to(&temp, is_gzip(path)) {
            if let Err(cleanup) = fs::remove_file(&temp) {
                warn!("Failed to remove {}: {}", temp.display(), cleanup);
            }
            return Err(e);
        }
        fs::rename(&temp, path)?;

        info!(
            "Saved session database {} ({} trips, {} buckets)",
            path.display(),
            self.trips.len(),
            self.time_map.len()
        );
        Ok(())
    }

    fn write_to(&self, path: &Path, gzip: bool) -> Result<()> {
        let serialization = |e: serde_json::Error| Error::Serialization(e.to_string());
        let mut writer = BufWriter::new(File::create(path)?);

        if gzip {
            let mut encoder = GzEncoder::new(&mut writer, Compression::default());
            serde_json::to_writer(&mut encoder, self).map_err(serialization)?;
            encoder.finish()?;
        } else {
            serde_json::to_writer(&mut writer, self).map_err(serialization)?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Ingest every trip under `root` with the default sources.
    pub fn add_trips(&mut self, root: &Path) -> Result<IngestStats> {
        self.add_trips_with(root, &Ingest::default())
    }

    /// Ingest every trip under `root` into this (empty) database.
    ///
    /// Adding to a database that already holds trips is not supported and
    /// fails with [`Error::IncrementalIngestUnsupported`] before anything is
    /// read. On success the time map is replaced and trips are marked as
    /// processed, except the earliest trip in which a stream failed and
    /// every trip after it. On any error the database is left unchanged.
    pub fn add_trips_with<D: FixDecoder, C: CaptureReplay>(
        &mut self,
        root: &Path,
        ingest: &Ingest<D, C>,
    ) -> Result<IngestStats> {
        if !self.trips.is_empty() {
            return Err(Error::IncrementalIngestUnsupported {
                trips: self.trips.len(),
            });
        }

        let output = ingest.run(root)?;
        let cutoff = output.stats.first_failed_trip();
        if let Some(trip) = cutoff {
            warn!("Trips from {} onward are not marked as processed", trip);
        }

        self.trips = output
            .trips
            .into_iter()
            .map(|trip| trip.name)
            .filter(|name| cutoff.is_none_or(|cutoff| name.as_str() < cutoff))
            .collect();
        self.time_map = output.time_map;
        Ok(output.stats)
    }

    /// Names of processed trips, in name order.
    pub fn trips(&self) -> impl Iterator<Item = &str> {
        self.trips.iter().map(String::as_str)
    }

    pub fn time_map(&self) -> &TimeMap {
        &self.time_map
    }

    /// Whether `trip` has been processed.
    pub fn is_processed(&self, trip: &str) -> bool {
        self.trips.contains(trip)
    }
}
