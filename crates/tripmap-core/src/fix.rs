//! GPS fixes and the NMEA log decoder.
//!
//! A trip's GPS log is the raw sentence stream written by the receiver, one
//! sentence per line. Only RMC sentences carry a usable fix; every other
//! well-formed sentence decodes to an unfixed [`Fix`] so that consumers see
//! the log's cadence without having to special-case sentence types.
//!
//! # RMC Layout
//!
//! ```text
//! $GPRMC,hhmmss.ss,A,DDMM.MMMM,N,DDDMM.MMMM,W,knots,track,ddmmyy,magvar,E*CS
//!        [1]       [2] [3]     [4] [5]      [6] [7]  [8]   [9]
//! ```

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A timestamped GPS location sample.
///
/// `time` is `None` when the receiver has no clock yet, and a coordinate is
/// NaN when the receiver has no position. Both are valid, unusable fixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// UTC time of the fix.
    pub time: Option<DateTime<Utc>>,

    /// Latitude in decimal degrees (negative is south).
    pub latitude: f64,

    /// Longitude in decimal degrees (negative is west).
    pub longitude: f64,
}

impl Fix {
    /// Create a fix with a known time and position.
    pub fn new(time: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            time: Some(time),
            latitude,
            longitude,
        }
    }

    /// A fix with no time and no position.
    pub fn unfixed() -> Self {
        Self {
            time: None,
            latitude: f64::NAN,
            longitude: f64::NAN,
        }
    }

    /// Whether this fix can anchor a packet: it has a time and both coordinates.
    pub fn is_usable(&self) -> bool {
        self.time.is_some() && !self.latitude.is_nan() && !self.longitude.is_nan()
    }
}

/// Decode one NMEA sentence.
///
/// The trailing `*hh` checksum is stripped but not verified; receivers on the
/// rig write their own output and a corrupt line fails field parsing anyway.
pub fn parse_sentence(line: &str) -> Result<Fix> {
    let body = line
        .trim()
        .strip_prefix('$')
        .ok_or_else(|| Error::InvalidSentence("missing '$' prefix".to_string()))?;
    let body = body.split_once('*').map_or(body, |(fields, _checksum)| fields);

    let fields: Vec<&str> = body.split(',').collect();
    let id = fields[0];
    if id.len() < 3 || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::InvalidSentence(format!("bad sentence id '{}'", id)));
    }

    if !id.ends_with("RMC") {
        return Ok(Fix::unfixed());
    }

    if fields.len() < 10 {
        return Err(Error::InvalidSentence(format!(
            "RMC has {} fields, expected at least 10",
            fields.len()
        )));
    }

    Ok(Fix {
        time: parse_time(fields[1], fields[9])?,
        latitude: parse_coordinate(fields[3], fields[4], 2, "S", "latitude")?,
        longitude: parse_coordinate(fields[5], fields[6], 3, "W", "longitude")?,
    })
}

/// Combine `hhmmss[.fff]` and `ddmmyy` into a UTC timestamp.
fn parse_time(hms: &str, dmy: &str) -> Result<Option<DateTime<Utc>>> {
    if hms.is_empty() || dmy.is_empty() {
        return Ok(None);
    }

    let (whole, frac) = hms.split_once('.').unwrap_or((hms, ""));
    if whole.len() != 6 || !is_digits(whole) {
        return Err(invalid("time", format!("'{}' is not hhmmss", hms)));
    }
    if dmy.len() != 6 || !is_digits(dmy) {
        return Err(invalid("date", format!("'{}' is not ddmmyy", dmy)));
    }
    if !is_digits(frac) {
        return Err(invalid("time", format!("'{}' has a bad fraction", hms)));
    }

    let hour = two_digits(&whole[0..2]);
    let minute = two_digits(&whole[2..4]);
    let second = two_digits(&whole[4..6]);

    // Keep at most nanosecond precision.
    let frac = &frac[..frac.len().min(9)];
    let nanos = if frac.is_empty() {
        0
    } else {
        frac.parse::<u32>().unwrap_or(0) * 10u32.pow(9 - frac.len() as u32)
    };

    let day = two_digits(&dmy[0..2]);
    let month = two_digits(&dmy[2..4]);
    let year = 2000 + two_digits(&dmy[4..6]) as i32;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| invalid("date", format!("'{}' is not a calendar date", dmy)))?;
    let time = NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)
        .ok_or_else(|| invalid("time", format!("'{}' is not a time of day", hms)))?;

    Ok(Some(date.and_time(time).and_utc()))
}

/// Convert `D..DMM.MMMM` plus a hemisphere letter into signed decimal degrees.
fn parse_coordinate(
    value: &str,
    hemisphere: &str,
    degree_digits: usize,
    negative: &str,
    field: &'static str,
) -> Result<f64> {
    if value.is_empty() {
        return Ok(f64::NAN);
    }
    if value.len() <= degree_digits || !value.is_ascii() {
        return Err(invalid(field, format!("'{}' is too short", value)));
    }

    let (degrees, minutes) = value.split_at(degree_digits);
    let degrees: u32 = degrees
        .parse()
        .map_err(|_| invalid(field, format!("bad degrees in '{}'", value)))?;
    let minutes: f64 = minutes
        .parse()
        .map_err(|_| invalid(field, format!("bad minutes in '{}'", value)))?;

    let decimal = degrees as f64 + minutes / 60.0;
    Ok(if hemisphere == negative { -decimal } else { decimal })
}

fn is_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

/// Callers have already checked that `s` is two ASCII digits.
fn two_digits(s: &str) -> u32 {
    s.bytes().fold(0, |acc, b| acc * 10 + (b - b'0') as u32)
}

fn invalid(field: &'static str, reason: String) -> Error {
    Error::InvalidField { field, reason }
}

/// Lazy decoder over a GPS log.
///
/// Yields one [`Fix`] per decodable line, in file order. Undecodable lines are
/// skipped. An I/O error is yielded once and ends the sequence.
pub struct NmeaReader<R> {
    reader: R,
    line: Vec<u8>,
    line_number: usize,
    done: bool,
}

impl<R: BufRead> NmeaReader<R> {
    /// Wrap a buffered reader positioned at the start of a log.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(128),
            line_number: 0,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for NmeaReader<R> {
    type Item = Result<Fix>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.line_number += 1;
                    let text = String::from_utf8_lossy(&self.line);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match parse_sentence(text) {
                        Ok(fix) => return Some(Ok(fix)),
                        Err(e) => tracing::trace!("Line {}: skipped: {}", self.line_number, e),
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(Error::Io(e)));
                }
            }
        }
        None
    }
}

/// Open a GPS log file for decoding.
pub fn open_gps_log(path: &Path) -> Result<NmeaReader<BufReader<File>>> {
    let file = File::open(path)?;
    Ok(NmeaReader::new(BufReader::new(file)))
}
