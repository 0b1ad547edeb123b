//! Statistics tracking for the ingestion engine.
//!
//! This module provides structures for tracking various metrics about the
//! line stream and the storage pipeline: counts, signal distributions, and
//! breakdowns by band, mode, and continent.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::record::{Mode, SpotRecord};

/// Thread-safe statistics collector shared by the network task and the
/// persistence worker.
#[derive(Debug)]
pub struct IngestStats {
    /// Spot records parsed and handed to the write queue
    pub spots: AtomicU64,

    /// WWV records parsed and handed to the write queue
    pub wwv: AtomicU64,

    /// Lines that matched a protocol pattern but failed to parse
    pub parse_failures: AtomicU64,

    /// Spot lines rejected because a callsign had no DXCC allocation
    pub unresolved_calls: AtomicU64,

    /// Operator broadcast lines (logged, never stored)
    pub broadcast_lines: AtomicU64,

    /// Lines matching no protocol pattern
    pub other_lines: AtomicU64,

    /// Total bytes of raw input processed
    pub bytes_read: AtomicU64,

    /// Records dropped because the write queue was full
    pub queue_drops: AtomicU64,

    /// Batches committed to storage
    pub batches: AtomicU64,

    /// Rows committed to storage
    pub rows_written: AtomicU64,

    /// Batch write attempts deferred by a busy/locked database
    pub busy_retries: AtomicU64,

    /// Batches abandoned after the retry cap or a non-busy storage error
    pub abandoned_batches: AtomicU64,

    /// Connections given up on because the server went quiet
    pub reconnects: AtomicU64,

    /// Failed connection or login attempts
    pub connect_failures: AtomicU64,

    /// Histogram of signal reports (offset by 50 to handle negatives)
    signal_histogram: RwLock<Histogram<u64>>,

    /// Histogram of storage batch sizes
    batch_histogram: RwLock<Histogram<u64>>,

    /// Spots per band (meters; 0 = unknown)
    spots_by_band: RwLock<HashMap<u16, u64>>,

    /// Spots per mode
    spots_by_mode: RwLock<HashMap<Mode, u64>>,

    /// Spots per reporting continent
    spots_by_cont: RwLock<HashMap<String, u64>>,

    /// Top reporting stations
    top_spotters: RwLock<HashMap<String, u64>>,

    /// When stats collection started
    start_time: Instant,
}

impl IngestStats {
    /// Create a new statistics collector.
    pub fn new() -> Self {
        Self {
            spots: AtomicU64::new(0),
            wwv: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            unresolved_calls: AtomicU64::new(0),
            broadcast_lines: AtomicU64::new(0),
            other_lines: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            busy_retries: AtomicU64::new(0),
            abandoned_batches: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            // Signal histogram: -50 to +49 dB after offset removal
            signal_histogram: RwLock::new(
                Histogram::new_with_bounds(1, 100, 2).expect("Failed to create signal histogram"),
            ),
            // Batch sizes: one row up to a full queue drain
            batch_histogram: RwLock::new(
                Histogram::new_with_bounds(1, 100_000, 3)
                    .expect("Failed to create batch histogram"),
            ),
            spots_by_band: RwLock::new(HashMap::new()),
            spots_by_mode: RwLock::new(HashMap::new()),
            spots_by_cont: RwLock::new(HashMap::new()),
            top_spotters: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a successfully parsed spot.
    pub fn record_spot(&self, spot: &SpotRecord) {
        self.spots.fetch_add(1, Ordering::Relaxed);

        if let Some(signal) = spot.signal_db {
            let offset = (signal + 50).max(0) as u64;
            if let Ok(mut hist) = self.signal_histogram.write() {
                let _ = hist.record(offset.clamp(1, 99));
            }
        }

        if let Ok(mut map) = self.spots_by_band.write() {
            *map.entry(spot.band).or_insert(0) += 1;
        }
        if let Ok(mut map) = self.spots_by_mode.write() {
            *map.entry(spot.mode).or_insert(0) += 1;
        }
        if let Ok(mut map) = self.spots_by_cont.write() {
            *map.entry(spot.cont_de.clone()).or_insert(0) += 1;
        }
        if let Ok(mut map) = self.top_spotters.write() {
            *map.entry(spot.de.clone()).or_insert(0) += 1;
        }
    }

    /// Record a successfully parsed WWV announcement.
    pub fn record_wwv(&self) {
        self.wwv.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a parse failure.
    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a spot rejected for an unresolvable callsign.
    pub fn record_unresolved(&self) {
        self.unresolved_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an operator broadcast line.
    pub fn record_broadcast(&self) {
        self.broadcast_lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a line matching no protocol pattern.
    pub fn record_other(&self) {
        self.other_lines.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes processed.
    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a record dropped on a full write queue.
    pub fn record_queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed batch and its row count.
    pub fn record_batch(&self, rows: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        if let Ok(mut hist) = self.batch_histogram.write() {
            let _ = hist.record(rows.max(1));
        }
    }

    /// Record a batch write deferred by a busy database.
    pub fn record_busy_retry(&self) {
        self.busy_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch abandoned after the retry cap.
    pub fn record_abandoned_batch(&self) {
        self.abandoned_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a quiet-server reconnect.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connection or login attempt.
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the elapsed time since stats collection started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get the current spots per second rate.
    pub fn spots_per_second(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.spots.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let signal_percentiles = self.signal_histogram.read().ok().and_then(|h| {
            if h.is_empty() {
                return None;
            }
            Some(HistogramPercentiles {
                // Subtract 50 to get back to real dB values
                p50: h.value_at_quantile(0.50) as i64 - 50,
                p90: h.value_at_quantile(0.90) as i64 - 50,
                min: h.min() as i64 - 50,
                max: h.max() as i64 - 50,
                mean: h.mean() - 50.0,
            })
        });

        let batch_percentiles = self.batch_histogram.read().ok().and_then(|h| {
            if h.is_empty() {
                return None;
            }
            Some(HistogramPercentiles {
                p50: h.value_at_quantile(0.50) as i64,
                p90: h.value_at_quantile(0.90) as i64,
                min: h.min() as i64,
                max: h.max() as i64,
                mean: h.mean(),
            })
        });

        let spots_by_band = self
            .spots_by_band
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();

        let spots_by_mode = self
            .spots_by_mode
            .read()
            .map(|m| m.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default();

        let spots_by_cont = self
            .spots_by_cont
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();

        // Top 10 reporting stations
        let top_spotters = self
            .top_spotters
            .read()
            .map(|m| {
                let mut vec: Vec<_> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
                vec.sort_by(|a, b| b.1.cmp(&a.1));
                vec.truncate(10);
                vec
            })
            .unwrap_or_default();

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            spots: self.spots.load(Ordering::Relaxed),
            wwv: self.wwv.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            unresolved_calls: self.unresolved_calls.load(Ordering::Relaxed),
            broadcast_lines: self.broadcast_lines.load(Ordering::Relaxed),
            other_lines: self.other_lines.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            abandoned_batches: self.abandoned_batches.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            spots_per_second: self.spots_per_second(),
            signal_percentiles,
            batch_percentiles,
            spots_by_band,
            spots_by_mode,
            spots_by_cont,
            top_spotters,
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile values from a histogram.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramPercentiles {
    pub p50: i64,
    pub p90: i64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub spots: u64,
    pub wwv: u64,
    pub parse_failures: u64,
    pub unresolved_calls: u64,
    pub broadcast_lines: u64,
    pub other_lines: u64,
    pub bytes_read: u64,
    pub queue_drops: u64,
    pub batches: u64,
    pub rows_written: u64,
    pub busy_retries: u64,
    pub abandoned_batches: u64,
    pub reconnects: u64,
    pub connect_failures: u64,
    pub spots_per_second: f64,
    pub signal_percentiles: Option<HistogramPercentiles>,
    pub batch_percentiles: Option<HistogramPercentiles>,
    pub spots_by_band: HashMap<u16, u64>,
    pub spots_by_mode: HashMap<String, u64>,
    pub spots_by_cont: HashMap<String, u64>,
    pub top_spotters: Vec<(String, u64)>,
}

impl StatsSummary {
    /// JSON rendering for machine consumption.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f, "              DX CLUSTER INGEST STATISTICS")?;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f)?;
        writeln!(f, "Runtime: {:.1}s", self.elapsed_secs)?;
        writeln!(f, "Spots: {}", self.spots)?;
        writeln!(f, "WWV announcements: {}", self.wwv)?;
        writeln!(f, "Parse failures: {}", self.parse_failures)?;
        writeln!(f, "Unresolved callsigns: {}", self.unresolved_calls)?;
        writeln!(f, "Broadcast lines: {}", self.broadcast_lines)?;
        writeln!(f, "Other lines: {}", self.other_lines)?;
        writeln!(f, "Bytes read: {} KB", self.bytes_read / 1024)?;
        writeln!(f, "Rate: {:.1} spots/sec", self.spots_per_second)?;
        writeln!(f)?;
        writeln!(f, "Queue drops: {}", self.queue_drops)?;
        writeln!(
            f,
            "Batches: {} ({} rows)",
            self.batches, self.rows_written
        )?;
        writeln!(f, "Busy retries: {}", self.busy_retries)?;
        writeln!(f, "Abandoned batches: {}", self.abandoned_batches)?;
        writeln!(f, "Reconnects: {}", self.reconnects)?;
        writeln!(f, "Connect failures: {}", self.connect_failures)?;
        writeln!(f)?;

        if let Some(ref p) = self.signal_percentiles {
            writeln!(f, "Signal Distribution (dB):")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}", p.p50, p.p90)?;
            writeln!(f)?;
        }

        if let Some(ref p) = self.batch_percentiles {
            writeln!(f, "Batch Sizes (rows):")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}", p.p50, p.p90)?;
            writeln!(f)?;
        }

        if !self.spots_by_band.is_empty() {
            writeln!(f, "Spots by Band:")?;
            let mut bands: Vec<_> = self.spots_by_band.iter().collect();
            bands.sort_by(|a, b| b.1.cmp(a.1));
            for (band, count) in bands {
                writeln!(f, "  {}m: {}", band, count)?;
            }
            writeln!(f)?;
        }

        if !self.spots_by_mode.is_empty() {
            writeln!(f, "Spots by Mode:")?;
            let mut modes: Vec<_> = self.spots_by_mode.iter().collect();
            modes.sort_by(|a, b| b.1.cmp(a.1));
            for (mode, count) in modes {
                writeln!(f, "  {}: {}", mode, count)?;
            }
            writeln!(f)?;
        }

        if !self.spots_by_cont.is_empty() {
            writeln!(f, "Spots by Reporting Continent:")?;
            let mut conts: Vec<_> = self.spots_by_cont.iter().collect();
            conts.sort_by(|a, b| b.1.cmp(a.1));
            for (cont, count) in conts {
                writeln!(f, "  {}: {}", cont, count)?;
            }
            writeln!(f)?;
        }

        if !self.top_spotters.is_empty() {
            writeln!(f, "Top 10 Spotters:")?;
            for (i, (spotter, count)) in self.top_spotters.iter().enumerate() {
                writeln!(f, "  {}. {}: {}", i + 1, spotter, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Mode;
    use chrono::Utc;

    fn make_test_spot() -> SpotRecord {
        SpotRecord {
            de: "W1AW".to_string(),
            frequency_khz: 14025.0,
            dx: "K1ABC".to_string(),
            message: "FT8 +05dB".to_string(),
            cont_de: "NA".to_string(),
            cont_dx: "NA".to_string(),
            cq_de: 5,
            itu_de: 8,
            cq_dx: 5,
            itu_dx: 8,
            mode: Mode::Ft8,
            signal_db: Some(5),
            band: 20,
            time: Utc::now(),
        }
    }

    #[test]
    fn test_record_spot() {
        let stats = IngestStats::new();
        stats.record_spot(&make_test_spot());

        assert_eq!(stats.spots.load(Ordering::Relaxed), 1);
        let summary = stats.summary();
        assert_eq!(summary.spots_by_band.get(&20), Some(&1));
        assert_eq!(summary.spots_by_mode.get("FT8"), Some(&1));
        assert_eq!(summary.spots_by_cont.get("NA"), Some(&1));
    }

    #[test]
    fn test_summary_counts() {
        let stats = IngestStats::new();

        for _ in 0..10 {
            stats.record_spot(&make_test_spot());
        }
        stats.record_wwv();
        stats.record_parse_failure();
        stats.record_unresolved();
        stats.record_queue_drop();
        stats.record_batch(10);
        stats.record_busy_retry();
        stats.record_bytes(1000);

        let summary = stats.summary();
        assert_eq!(summary.spots, 10);
        assert_eq!(summary.wwv, 1);
        assert_eq!(summary.parse_failures, 1);
        assert_eq!(summary.unresolved_calls, 1);
        assert_eq!(summary.queue_drops, 1);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.rows_written, 10);
        assert_eq!(summary.busy_retries, 1);
        assert_eq!(summary.bytes_read, 1000);
    }

    #[test]
    fn test_spots_per_second() {
        let stats = IngestStats::new();
        for _ in 0..100 {
            stats.record_spot(&make_test_spot());
        }
        assert!(stats.spots_per_second() > 0.0);
    }

    #[test]
    fn test_summary_display_renders() {
        let stats = IngestStats::new();
        stats.record_spot(&make_test_spot());
        stats.record_batch(1);
        let text = stats.summary().to_string();
        assert!(text.contains("Spots: 1"));
        assert!(text.contains("20m: 1"));
    }

    #[test]
    fn test_summary_json_renders() {
        let stats = IngestStats::new();
        stats.record_spot(&make_test_spot());
        let json = stats.summary().to_json();
        assert!(json.contains("\"spots\": 1"));
    }
}
