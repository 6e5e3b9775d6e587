//! Timestamp-bucketed correlation results.
//!
//! The [`TimeMapBuilder`] keeps only the first record seen for each source
//! address, so every address lives in at most one bucket of the finished
//! [`TimeMap`].

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tripmap_core::GpsPacket;

/// Joined records keyed by the whole Unix second of their fix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeMap {
    buckets: BTreeMap<i64, Vec<GpsPacket>>,
}

impl TimeMap {
    /// Create an empty time map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a time map from records in correlation order.
    pub fn from_records(records: impl IntoIterator<Item = GpsPacket>) -> Self {
        let mut builder = TimeMapBuilder::new();
        for record in records {
            builder.push(record);
        }
        builder.finish().0
    }

    /// Records in one bucket, in insertion order.
    pub fn get(&self, second: i64) -> Option<&[GpsPacket]> {
        self.buckets.get(&second).map(Vec::as_slice)
    }

    /// Buckets in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &[GpsPacket])> {
        self.buckets.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of records across all buckets.
    pub fn record_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Bucket holding the given source address, if any.
    pub fn bucket_of(&self, source: &str) -> Option<i64> {
        self.buckets
            .iter()
            .find(|(_, records)| records.iter().any(|r| r.source() == source))
            .map(|(second, _)| *second)
    }

    /// One named point per bucket, for map display.
    pub fn points(&self) -> Vec<NamedPoint> {
        self.buckets
            .iter()
            .filter_map(|(second, records)| {
                let first = records.first()?;
                let name = records
                    .iter()
                    .map(GpsPacket::source)
                    .collect::<Vec<_>>()
                    .join(",");
                Some(NamedPoint {
                    name,
                    lat: first.fix().latitude,
                    lon: first.fix().longitude,
                    time: *second,
                })
            })
            .collect()
    }
}

/// A labelled location: every address first seen at one fix second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedPoint {
    /// Comma-joined source addresses.
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Unix seconds.
    pub time: i64,
}

/// Outcome of pushing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// Stored in the bucket for this second.
    Inserted(i64),
    /// Address already seen earlier in the run.
    Duplicate,
    /// Record has no usable fix position.
    Rejected,
}

/// Builder statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Single-owner builder for a [`TimeMap`].
#[derive(Debug, Default)]
pub struct TimeMapBuilder {
    map: TimeMap,
    seen: HashSet<String>,
    stats: BuildStats,
}

impl TimeMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record, keeping it only if its address is new.
    pub fn push(&mut self, record: GpsPacket) -> Insert {
        let second = match record.bucket() {
            Some(second) if !record.fix().longitude.is_nan() => second,
            _ => {
                tracing::warn!("Rejecting record without a usable fix: {:?}", record);
                self.stats.rejected += 1;
                return Insert::Rejected;
            }
        };

        if !self.seen.insert(record.source().to_string()) {
            self.stats.duplicates += 1;
            return Insert::Duplicate;
        }

        self.map.buckets.entry(second).or_default().push(record);
        self.stats.inserted += 1;
        Insert::Inserted(second)
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    /// Finish the run, publishing builder metrics.
    pub fn finish(self) -> (TimeMap, BuildStats) {
        counter!("ingest_records_inserted_total").increment(self.stats.inserted as u64);
        counter!("ingest_records_duplicate_total").increment(self.stats.duplicates as u64);
        gauge!("ingest_time_map_buckets").set(self.map.len() as f64);
        (self.map, self.stats)
    }
}
