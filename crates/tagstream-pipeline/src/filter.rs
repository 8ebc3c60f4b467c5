use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::join_all;
use lru::LruCache;
use tracing::{debug, warn};
use uuid::Uuid;

use tagstream_core::error::ConfigError;
use tagstream_core::{Read, MAX_SIGNAL_STRENGTH, MIN_SIGNAL_STRENGTH};

/// Default minimum quality score for acceptance.
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.7;
/// Default sub-batch size for concurrent scoring.
pub const DEFAULT_BATCH_SIZE: usize = 100;

const SIGNAL_WEIGHT: f64 = 0.6;
const TIME_WEIGHT: f64 = 0.4;
const CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_CAPACITY: usize = 10_000;

struct CachedScore {
    score: f64,
    computed_at: Instant,
}

/// Quality-based acceptance filter for tag reads.
///
/// Each read is scored in [0.0, 1.0] from its normalized signal strength
/// plus a reserved time factor; reads below the threshold are rejected.
/// Scores are memoized per read id with a TTL so replayed batches do not
/// pay for rescoring.
pub struct ReadFilter {
    quality_threshold: f64,
    batch_size: usize,
    cache: Option<Mutex<LruCache<Uuid, CachedScore>>>,
}

impl ReadFilter {
    pub fn new(quality_threshold: f64, batch_size: usize) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&quality_threshold) {
            return Err(ConfigError::OutOfRange {
                var: "QUALITY_THRESHOLD",
                value: quality_threshold,
                constraint: "must be within [0, 1]",
            });
        }
        if batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                var: "FILTER_BATCH_SIZE",
                value: 0.0,
                constraint: "must be at least 1",
            });
        }

        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity");
        Ok(Self {
            quality_threshold,
            batch_size,
            cache: Some(Mutex::new(LruCache::new(capacity))),
        })
    }

    /// Build a filter without the score memo, for callers that replay the
    /// same read ids with different expectations (tests, admin replays).
    pub fn without_cache(quality_threshold: f64, batch_size: usize) -> Result<Self, ConfigError> {
        let mut filter = Self::new(quality_threshold, batch_size)?;
        filter.cache = None;
        Ok(filter)
    }

    /// Score a batch and keep the reads meeting the threshold, preserving
    /// input order. Sub-batches are scored concurrently and concatenated
    /// back in original order.
    pub async fn apply_filters(&self, reads: Vec<Read>) -> Vec<Read> {
        if reads.is_empty() {
            return Vec::new();
        }

        let total = reads.len();
        let sub_batches: Vec<Vec<Read>> = reads
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        let scored = join_all(
            sub_batches
                .into_iter()
                .map(|batch| async move { self.filter_sub_batch(batch) }),
        )
        .await;

        let accepted: Vec<Read> = scored.into_iter().flatten().collect();
        debug!(total, accepted = accepted.len(), "quality filter applied");
        accepted
    }

    fn filter_sub_batch(&self, batch: Vec<Read>) -> Vec<Read> {
        batch
            .into_iter()
            .filter(|read| self.quality_score(read) >= self.quality_threshold)
            .collect()
    }

    /// Quality score for a single read, memoized when caching is enabled.
    pub fn quality_score(&self, read: &Read) -> f64 {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(&read.id) {
                if entry.computed_at.elapsed() < CACHE_TTL {
                    return entry.score;
                }
                cache.pop(&read.id);
            }
        }

        let score = compute_score(read);

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.put(
                read.id,
                CachedScore {
                    score,
                    computed_at: Instant::now(),
                },
            );
        }

        score
    }
}

fn compute_score(read: &Read) -> f64 {
    if Read::validate_signal_strength(read.signal_strength).is_err() {
        return 0.0;
    }

    let normalized_signal =
        (read.signal_strength - MIN_SIGNAL_STRENGTH) / (MAX_SIGNAL_STRENGTH - MIN_SIGNAL_STRENGTH);
    // Reserved hook for recency-weighted scoring; constant for now.
    let time_factor = 1.0;

    let score = SIGNAL_WEIGHT * normalized_signal + TIME_WEIGHT * time_factor;
    if !score.is_finite() {
        warn!(read_id = %read.id, "non-finite quality score, rejecting read");
        metrics::counter!("rfid_processor_errors_total", "error_type" => "filter").increment(1);
        return 0.0;
    }
    score
}
