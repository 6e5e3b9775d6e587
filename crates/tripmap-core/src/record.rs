//! Joined (fix, packet) records.

use crate::capture::Packet;
use crate::fix::Fix;
use serde::{Deserialize, Serialize};

/// A packet paired with the fix that covers it.
///
/// Only constructible from a usable fix, so every record has a time and a
/// defined position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsPacket {
    fix: Fix,
    packet: Packet,
}

impl GpsPacket {
    /// Join a packet to a fix. Returns `None` if the fix is not usable.
    pub fn new(fix: Fix, packet: Packet) -> Option<Self> {
        fix.is_usable().then_some(Self { fix, packet })
    }

    /// The anchoring fix.
    pub fn fix(&self) -> &Fix {
        &self.fix
    }

    /// The captured packet.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Source address of the packet.
    pub fn source(&self) -> &str {
        &self.packet.source
    }

    /// Whole Unix seconds of the fix, rounded down.
    pub fn bucket(&self) -> Option<i64> {
        self.fix.time.map(|t| t.timestamp())
    }
}
