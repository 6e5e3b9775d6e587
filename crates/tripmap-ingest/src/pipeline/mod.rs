//! Result stages of an ingest: the deduplicating time map and its persisted
//! session database.
//!
//! - [`TimeMapBuilder`] - Keeps the first sighting of each source address
//! - [`TimeMap`] - Records bucketed by whole fix second
//! - [`SessionDb`] - Processed trips plus the time map, saved as JSON
//!
//! # Architecture
//!
//! ```text
//! [Correlator] → [TimeMapBuilder] → [TimeMap] → [SessionDb] → JSON (.gz)
//!                       ↓
//!                  seen addresses
//! ```

mod session;
mod timemap;

pub use session::SessionDb;
pub use timemap::{BuildStats, Insert, NamedPoint, TimeMap, TimeMapBuilder};
