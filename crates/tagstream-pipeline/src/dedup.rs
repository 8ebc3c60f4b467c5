use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use tracing::debug;

use tagstream_core::error::ConfigError;
use tagstream_core::Read;

/// Default deduplication window.
pub const DEFAULT_TIME_WINDOW_SECONDS: f64 = 5.0;
/// Default minimum RSSI difference for two reads to count as distinct.
pub const DEFAULT_SIGNAL_THRESHOLD_DBM: f64 = 3.0;
/// Default cap on the total number of buffered reads.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 10_000;

/// Sliding-window duplicate suppression for tag reads.
///
/// Recent reads are bucketed per tag behind a single mutex. An incoming
/// read is a duplicate of a buffered one when both fall inside the time
/// window and their signal strengths differ by less than the threshold.
/// Reads whose RSSI is outside the valid dBm range bypass duplicate
/// detection entirely; the quality filter is responsible for them.
pub struct ReadDeduplicator {
    time_window: Duration,
    time_window_seconds: f64,
    signal_threshold_dbm: f64,
    max_buffer_size: usize,
    buffer: Mutex<HashMap<String, Vec<Read>>>,
}

impl ReadDeduplicator {
    pub fn new(
        time_window_seconds: f64,
        signal_threshold_dbm: f64,
        max_buffer_size: usize,
    ) -> Result<Self, ConfigError> {
        if time_window_seconds <= 0.0 || !time_window_seconds.is_finite() {
            return Err(ConfigError::OutOfRange {
                var: "READ_WINDOW_SECONDS",
                value: time_window_seconds,
                constraint: "must be positive",
            });
        }
        if signal_threshold_dbm < 0.0 || !signal_threshold_dbm.is_finite() {
            return Err(ConfigError::OutOfRange {
                var: "SIGNAL_THRESHOLD_DBM",
                value: signal_threshold_dbm,
                constraint: "must be non-negative",
            });
        }
        if max_buffer_size == 0 {
            return Err(ConfigError::OutOfRange {
                var: "DEDUP_MAX_BUFFER_SIZE",
                value: 0.0,
                constraint: "must be at least 1",
            });
        }

        Ok(Self {
            time_window: Duration::milliseconds((time_window_seconds * 1000.0) as i64),
            time_window_seconds,
            signal_threshold_dbm,
            max_buffer_size,
            buffer: Mutex::new(HashMap::new()),
        })
    }

    /// Deduplicate a batch, preserving arrival order of survivors.
    ///
    /// The buffer cap is an explicit backpressure policy: once the total
    /// buffered count reaches the cap, reads for tags not already buffered
    /// are dropped. Reads on buffered tags are still matched, and distinct
    /// ones are emitted without being buffered.
    pub fn process_reads(&self, reads: Vec<Read>) -> Vec<Read> {
        if reads.is_empty() {
            return Vec::new();
        }

        let cutoff = Utc::now() - self.time_window;
        let mut survivors = Vec::with_capacity(reads.len());
        let mut duplicates = 0u64;
        let mut dropped = 0u64;

        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());

        buffer.retain(|_, bucket| {
            bucket.retain(|read| read.read_time > cutoff);
            !bucket.is_empty()
        });
        let mut total: usize = buffer.values().map(Vec::len).sum();

        for read in reads {
            let known_tag = match buffer.get(&read.rfid_tag) {
                Some(bucket) => {
                    if bucket.iter().any(|existing| self.is_duplicate(&read, existing)) {
                        duplicates += 1;
                        continue;
                    }
                    true
                }
                None => false,
            };

            if total >= self.max_buffer_size {
                if known_tag {
                    // Distinct read on a buffered tag: emit without
                    // buffering so the cap invariant holds.
                    survivors.push(read);
                } else {
                    dropped += 1;
                }
                continue;
            }

            buffer
                .entry(read.rfid_tag.clone())
                .or_default()
                .push(read.clone());
            total += 1;
            survivors.push(read);
        }

        metrics::counter!("rfid_dedup_duplicates_total").increment(duplicates);
        metrics::gauge!("rfid_dedup_buffer_size").set(total as f64);
        if dropped > 0 {
            metrics::counter!("rfid_dedup_dropped_total").increment(dropped);
            debug!(dropped, "dedup buffer at capacity, dropped reads for unseen tags");
        }

        survivors
    }

    fn is_duplicate(&self, read: &Read, existing: &Read) -> bool {
        if Read::validate_signal_strength(read.signal_strength).is_err()
            || Read::validate_signal_strength(existing.signal_strength).is_err()
        {
            return false;
        }

        let time_diff = (read.read_time - existing.read_time)
            .num_milliseconds()
            .abs() as f64
            / 1000.0;
        if time_diff > self.time_window_seconds {
            return false;
        }

        (read.signal_strength - existing.signal_strength).abs() < self.signal_threshold_dbm
    }

    /// Total reads currently buffered across all tags.
    pub fn buffered_total(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const TAG: &str = "E200123456789012345678AB";
    const TAG2: &str = "E200123456789012345678AC";

    fn read_at(tag: &str, offset_secs: f64, rssi: f64) -> Read {
        let base = Utc::now() - Duration::seconds(7);
        Read::at(
            tag,
            "r1",
            rssi,
            base + Duration::milliseconds((offset_secs * 1000.0) as i64),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_input_returns_empty() {
        let dedup = ReadDeduplicator::new(5.0, 3.0, 100).unwrap();
        assert!(dedup.process_reads(Vec::new()).is_empty());
    }

    #[test]
    fn test_first_read_of_a_tag_always_survives() {
        let dedup = ReadDeduplicator::new(5.0, 3.0, 100).unwrap();
        let out = dedup.process_reads(vec![read_at(TAG, 0.0, -50.0)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_window_and_signal_tie_breaking() {
        // Window 5s, threshold 3dBm. Four reads of the same tag:
        //   t=0.0 -50.0  first, survives
        //   t=1.0 -51.0  1s apart, 1dBm apart: duplicate
        //   t=2.0 -47.0  |Δ|=3 not < 3: distinct
        //   t=6.5 -50.0  6.5s from first (outside window); 4.5s from t=2.0
        //                but |Δ|=3 not < 3: distinct
        let dedup = ReadDeduplicator::new(5.0, 3.0, 100).unwrap();
        let out = dedup.process_reads(vec![
            read_at(TAG, 0.0, -50.0),
            read_at(TAG, 1.0, -51.0),
            read_at(TAG, 2.0, -47.0),
            read_at(TAG, 6.5, -50.0),
        ]);

        let signals: Vec<f64> = out.iter().map(|r| r.signal_strength).collect();
        assert_eq!(signals, vec![-50.0, -47.0, -50.0]);
    }

    #[test]
    fn test_output_is_a_subsequence_of_input() {
        let dedup = ReadDeduplicator::new(5.0, 3.0, 100).unwrap();
        let input = vec![
            read_at(TAG, 0.0, -50.0),
            read_at(TAG2, 0.5, -40.0),
            read_at(TAG, 1.0, -50.5),
            read_at(TAG2, 1.5, -44.0),
        ];
        let ids: Vec<_> = input.iter().map(|r| r.id).collect();
        let out = dedup.process_reads(input);

        let mut cursor = 0;
        for read in &out {
            let pos = ids[cursor..].iter().position(|id| *id == read.id);
            let pos = pos.expect("emitted read not found in remaining input");
            cursor += pos + 1;
        }
    }

    #[test]
    fn test_expired_reads_are_evicted_between_calls() {
        let dedup = ReadDeduplicator::new(5.0, 3.0, 100).unwrap();
        // A read already older than the window going in.
        let stale = Read::at(TAG, "r1", -50.0, Utc::now() - Duration::seconds(10)).unwrap();
        dedup.process_reads(vec![stale]);
        assert_eq!(dedup.buffered_total(), 1);

        // Next call cleans it out, so an identical-signal read survives.
        let fresh = Read::new(TAG, "r1", -50.0).unwrap();
        let out = dedup.process_reads(vec![fresh]);
        assert_eq!(out.len(), 1);
        assert_eq!(dedup.buffered_total(), 1);
    }

    #[test]
    fn test_cap_drops_unseen_tags_but_matches_existing() {
        // Fresh timestamps keep every read inside the window across calls.
        let dedup = ReadDeduplicator::new(5.0, 3.0, 1).unwrap();
        let fresh = |tag: &str, rssi: f64| Read::new(tag, "r1", rssi).unwrap();

        assert_eq!(dedup.process_reads(vec![fresh(TAG, -50.0)]).len(), 1);

        // Buffer is at capacity. An unseen tag is dropped outright.
        let out = dedup.process_reads(vec![fresh(TAG2, -40.0)]);
        assert!(out.is_empty());

        // A duplicate of the buffered tag is still recognized.
        let out = dedup.process_reads(vec![fresh(TAG, -50.5)]);
        assert!(out.is_empty());

        // A distinct read of the buffered tag is emitted, not buffered.
        let out = dedup.process_reads(vec![fresh(TAG, -44.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(dedup.buffered_total(), 1);
    }

    #[test]
    fn test_constructor_rejects_bad_parameters() {
        assert!(ReadDeduplicator::new(0.0, 3.0, 100).is_err());
        assert!(ReadDeduplicator::new(5.0, -1.0, 100).is_err());
        assert!(ReadDeduplicator::new(5.0, 3.0, 0).is_err());
    }
}
