//! Data structures representing parsed cluster records.
//!
//! This module defines the core types used throughout the application:
//! propagation spots, WWV solar-index announcements, and the
//! frequency-to-band mapping shared by both the parser and the statistics
//! collector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// The transmission mode decoded from a spot message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Continuous Wave (Morse code)
    Cw,
    /// FT8 digital mode
    Ft8,
    /// FT4 digital mode
    Ft4,
    /// Radio Teletype
    Rtty,
    /// Any PSK variant (PSK31, PSK63, ...)
    Psk,
    /// No mode token in the message; voice by convention
    Ssb,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Cw => write!(f, "CW"),
            Mode::Ft8 => write!(f, "FT8"),
            Mode::Ft4 => write!(f, "FT4"),
            Mode::Rtty => write!(f, "RTTY"),
            Mode::Psk => write!(f, "PSK"),
            Mode::Ssb => write!(f, "SSB"),
        }
    }
}

/// One observed propagation report, parsed from a `DX de ...` line.
///
/// The capture timestamp is assigned at parse time so that queue delays and
/// storage retries preserve the original observation time. Written once to
/// the datastore, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRecord {
    /// Reporting station (DE), skimmer `-#` marker stripped.
    pub de: String,

    /// Frequency in kHz.
    pub frequency_khz: f64,

    /// Reported station (DX), as it appeared on the wire.
    pub dx: String,

    /// Free-text message between the DX callsign and the time token.
    pub message: String,

    /// Continent of the reporting station.
    pub cont_de: String,

    /// Continent of the reported station.
    pub cont_dx: String,

    /// CQ zone of the reporting station.
    pub cq_de: u16,

    /// ITU zone of the reporting station.
    pub itu_de: u16,

    /// CQ zone of the reported station.
    pub cq_dx: u16,

    /// ITU zone of the reported station.
    pub itu_dx: u16,

    /// Decoded mode; [`Mode::Ssb`] when the message carried no mode token.
    pub mode: Mode,

    /// Decoded signal report in dB (or WPM for CW), absent when the message
    /// carried no report.
    pub signal_db: Option<i32>,

    /// Amateur band in meters derived from the frequency; 0 means unknown,
    /// never null.
    pub band: u16,

    /// UTC capture timestamp, set at parse time.
    pub time: DateTime<Utc>,
}

impl fmt::Display for SpotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DX de {}: {:>8.1} {} {} {}m {} [{} -> {}]",
            self.de,
            self.frequency_khz,
            self.dx,
            self.mode,
            self.band,
            self.time.format("%H%MZ"),
            self.cont_de,
            self.cont_dx,
        )
    }
}

/// One solar-index announcement, parsed from a `WWV de ...` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WwvRecord {
    /// Solar flux index.
    pub sfi: u16,

    /// Planetary A-index.
    pub a_index: u16,

    /// Planetary K-index.
    pub k_index: u16,

    /// Free-text geomagnetic conditions.
    pub conditions: String,

    /// UTC capture timestamp, set at parse time.
    pub time: DateTime<Utc>,
}

impl fmt::Display for WwvRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WWV: SFI={} A={} K={} {}",
            self.sfi, self.a_index, self.k_index, self.conditions
        )
    }
}

/// Frequency ranges in kHz mapped to bands in meters, most popular band
/// first.
const BANDS: &[(f64, f64, u16)] = &[
    (14000.0, 14350.0, 20),
    (7000.0, 7300.0, 40),
    (10100.0, 10150.0, 30),
    (3500.0, 4000.0, 80),
    (21000.0, 21450.0, 15),
    (18068.0, 18168.0, 17),
    (28000.0, 29700.0, 10),
    (50000.0, 54000.0, 6),
    (24890.0, 24990.0, 12),
    (1800.0, 2000.0, 160),
    (144000.0, 148000.0, 2),
    (69900.0, 70500.0, 4),
    (5330.0, 5410.0, 60),
    (472.0, 479.0, 630),
];

/// Derive the amateur band in meters for a frequency in kHz.
///
/// Returns 0 for frequencies outside every known allocation. Total: never
/// fails or panics for any input.
pub fn band_for_frequency(khz: f64) -> u16 {
    for &(min, max, band) in BANDS {
        if (min..=max).contains(&khz) {
            return band;
        }
    }
    warn!("no band for frequency {khz}");
    0
}
