//! Packet capture replay.
//!
//! Replays classic libpcap files written by the capture daemon (one file per
//! rotation, optionally gzipped by tcpdump's `-z gzip`) as a lazy sequence of
//! [`Packet`]s carrying the capture time and the transmitter's hardware
//! address.
//!
//! Container parsing (magic, byte order, timestamp resolution, record
//! framing) is done by `pcap-file`; this module only decides which frames
//! carry a transmitter and where its address sits.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::bufread::MultiGzDecoder;
use pcap_file::PcapError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::Path;

/// Ethernet II frames.
pub const LINKTYPE_ETHERNET: u32 = 1;
/// Raw 802.11 frames.
pub const LINKTYPE_IEEE802_11: u32 = 105;
/// 802.11 frames behind a radiotap header (monitor mode).
pub const LINKTYPE_IEEE802_11_RADIOTAP: u32 = 127;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A captured frame reduced to what correlation needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Capture timestamp.
    pub time: DateTime<Utc>,

    /// Transmitter hardware address, `aa:bb:cc:dd:ee:ff`.
    pub source: String,
}

impl Packet {
    pub fn new(time: DateTime<Utc>, source: impl Into<String>) -> Self {
        Self {
            time,
            source: source.into(),
        }
    }
}

/// Render a hardware address in lowercase colon-separated form.
pub fn format_mac(addr: &[u8; 6]) -> String {
    addr.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn capture_error(error: PcapError) -> Error {
    match error {
        PcapError::IoError(e) => Error::Io(e),
        other => Error::InvalidCapture(other.to_string()),
    }
}

/// Lazy reader over a classic pcap stream.
///
/// Records whose frame carries no transmitter address (ACK, CTS, runts) are
/// skipped. The sequence ends without error at EOF, including a truncated
/// trailing record left by an interrupted capture. Any other I/O or format
/// error is yielded once and ends the sequence.
pub struct PcapReader<R: Read> {
    reader: pcap_file::pcap::PcapReader<R>,
    link_type: u32,
    done: bool,
}

impl<R: Read> PcapReader<R> {
    /// Read and validate the global header.
    pub fn new(reader: R) -> Result<Self> {
        let reader = pcap_file::pcap::PcapReader::new(reader).map_err(|e| match e {
            PcapError::IncompleteBuffer => {
                Error::InvalidCapture("file is shorter than a pcap header".to_string())
            }
            other => capture_error(other),
        })?;

        let link_type = u32::from(reader.header().datalink);
        match link_type {
            LINKTYPE_ETHERNET | LINKTYPE_IEEE802_11 | LINKTYPE_IEEE802_11_RADIOTAP => {}
            other => return Err(Error::UnsupportedLinkType(other)),
        }

        Ok(Self {
            reader,
            link_type,
            done: false,
        })
    }

    /// Link-layer type from the global header.
    pub fn link_type(&self) -> u32 {
        self.link_type
    }
}

impl<R: Read> Iterator for PcapReader<R> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let (timestamp, source) = match self.reader.next_packet() {
                Some(Ok(packet)) => (
                    packet.timestamp,
                    source_address(self.link_type, &packet.data),
                ),
                // Truncated trailing record, or a truncated gzip member.
                None | Some(Err(PcapError::IncompleteBuffer)) => {
                    self.done = true;
                    break;
                }
                Some(Err(PcapError::IoError(e))) if e.kind() == ErrorKind::UnexpectedEof => {
                    self.done = true;
                    break;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(capture_error(e)));
                }
            };

            let Some(addr) = source else {
                continue;
            };
            let seconds = timestamp.as_secs() as i64;
            let Some(time) = DateTime::from_timestamp(seconds, timestamp.subsec_nanos()) else {
                tracing::trace!("Skipping record with bad timestamp {:?}", timestamp);
                continue;
            };
            return Some(Ok(Packet::new(time, format_mac(&addr))));
        }
        None
    }
}

/// Open a capture file, gunzipping it if it starts with the gzip magic.
pub fn open_capture(path: &Path) -> Result<PcapReader<Box<dyn Read + Send>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    let source: Box<dyn Read + Send> = if gzipped {
        Box::new(MultiGzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    PcapReader::new(source)
}

/// Extract the transmitter address from a frame of the given link type.
fn source_address(link_type: u32, data: &[u8]) -> Option<[u8; 6]> {
    let addr = match link_type {
        LINKTYPE_ETHERNET => data.get(6..12),
        LINKTYPE_IEEE802_11 => dot11_transmitter(data),
        LINKTYPE_IEEE802_11_RADIOTAP => {
            let len = u16::from_le_bytes([*data.get(2)?, *data.get(3)?]) as usize;
            dot11_transmitter(data.get(len..)?)
        }
        _ => None,
    }?;
    addr.try_into().ok()
}

/// Address 2 of an 802.11 frame, absent on CTS and ACK control frames.
fn dot11_transmitter(frame: &[u8]) -> Option<&[u8]> {
    let control = *frame.first()?;
    let frame_type = (control >> 2) & 0x3;
    let subtype = control >> 4;
    if frame_type == 1 && (subtype == 12 || subtype == 13) {
        return None;
    }
    frame.get(10..16)
}

/// Writer for microsecond pcap files, for building capture fixtures.
#[cfg(any(test, feature = "test-support"))]
pub struct PcapWriter<W: std::io::Write> {
    writer: pcap_file::pcap::PcapWriter<W>,
}

#[cfg(any(test, feature = "test-support"))]
impl<W: std::io::Write> PcapWriter<W> {
    /// Write the global header.
    pub fn new(writer: W, link_type: u32) -> Result<Self> {
        let header = pcap_file::pcap::PcapHeader {
            datalink: pcap_file::DataLink::from(link_type),
            ..Default::default()
        };
        let writer =
            pcap_file::pcap::PcapWriter::with_header(writer, header).map_err(capture_error)?;
        Ok(Self { writer })
    }

    /// Append one record.
    pub fn write_packet(&mut self, time: DateTime<Utc>, data: &[u8]) -> Result<()> {
        let timestamp =
            std::time::Duration::new(time.timestamp() as u64, time.timestamp_subsec_nanos());
        let packet = pcap_file::pcap::PcapPacket::new(timestamp, data.len() as u32, data);
        self.writer.write_packet(&packet).map_err(capture_error)?;
        Ok(())
    }

    /// Return the underlying writer.
    pub fn finish(self) -> Result<W> {
        let mut writer = self.writer.into_writer();
        std::io::Write::flush(&mut writer)?;
        Ok(writer)
    }
}

/// Build a minimal radiotap + 802.11 probe request from `source`.
///
/// The frame body is empty.
#[cfg(any(test, feature = "test-support"))]
pub fn probe_request_frame(source: [u8; 6]) -> Vec<u8> {
    let mut frame = vec![0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];
    // Frame control: management / probe request.
    frame.extend_from_slice(&[0x40, 0x00, 0x00, 0x00]);
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&source);
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&[0x00, 0x00]);
    frame
}
