//! Trip directory enumeration and interface discovery.
//!
//! A log root holds one directory per recording session. Session directories
//! are named so that name order is chronological order (the recorder uses
//! RFC 3339 start times), so no filesystem timestamps are consulted.

use crate::config::TripLayout;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// One recording session directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Trip {
    /// Directory name, also the trip's identity in the session database.
    pub name: String,

    /// Full path to the directory.
    pub path: PathBuf,
}

impl Trip {
    /// A trip named `name` under `root`.
    pub fn new(name: impl Into<String>, root: &Path) -> Self {
        let name = name.into();
        let path = root.join(&name);
        Self { name, path }
    }
}

/// What to do when a trip has no capture subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingCaptureDir {
    /// The trip contributes no interfaces.
    Skip,
    /// Fail discovery with [`Error::Enumerate`].
    Fail,
}

/// List the trip directories under `root`, in name order.
///
/// Plain files at the root (such as a session database saved next to the
/// trips) are ignored, as are directories whose name is not UTF-8.
pub fn list_trips(root: &Path) -> Result<Vec<Trip>> {
    let enumerate = |source| Error::Enumerate {
        path: root.to_path_buf(),
        source,
    };

    let mut trips = Vec::new();
    for entry in fs::read_dir(root).map_err(enumerate)? {
        let entry = entry.map_err(enumerate)?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => trips.push(Trip { name, path }),
            Err(name) => tracing::warn!("Skipping trip with non UTF-8 name {:?}", name),
        }
    }

    trips.sort();
    Ok(trips)
}

/// Collect the distinct interface names recorded across `trips`.
///
/// Returned sorted so that interface indices are stable between runs.
pub fn discover_interfaces(
    trips: &[Trip],
    layout: &TripLayout,
    missing: MissingCaptureDir,
) -> Result<Vec<String>> {
    let mut interfaces = BTreeSet::new();

    for trip in trips {
        let dir = layout.capture_root(trip);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound && missing == MissingCaptureDir::Skip => {
                tracing::debug!("Trip {} has no capture directory", trip.name);
                continue;
            }
            Err(source) => return Err(Error::Enumerate { path: dir, source }),
        };

        for entry in entries {
            let entry = entry.map_err(|source| Error::Enumerate {
                path: dir.clone(),
                source,
            })?;
            if let Some(name) = entry.file_name().to_str()
                && name.starts_with(&layout.interface_prefix)
                && entry.path().is_dir()
            {
                interfaces.insert(name.to_string());
            }
        }
    }

    Ok(interfaces.into_iter().collect())
}

/// List an interface directory's capture files in sequence order.
///
/// `pcap`, `pcap1.gz`, `pcap2.gz`, ... `pcap10.gz`: the digits between the
/// prefix and the first '.' are the rotation number. Files without a number
/// come first; ties fall back to name order.
pub fn capture_files(dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<(Option<u64>, String)> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        let sequence = rest.split('.').next().and_then(|n| n.parse().ok());
        files.push((sequence, name));
    }

    files.sort();
    Ok(files.into_iter().map(|(_, name)| dir.join(name)).collect())
}
