use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tagstream_core::Read;

use crate::dedup::ReadDeduplicator;
use crate::filter::ReadFilter;
use crate::sink::SharedSink;

/// Configuration for the read processing pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ingress queue capacity; a full queue rejects with backpressure.
    pub queue_capacity: usize,
    /// Maximum reads gathered into one batch.
    pub batch_size: usize,
    /// Wall-clock bound on batch assembly.
    pub batch_timeout: Duration,
    /// Error rate over the rolling window that trips the breaker.
    pub error_rate_threshold: f64,
    /// Rolling window for the breaker's error rate.
    pub error_window: Duration,
    /// How long ingress stays rejected after a trip.
    pub trip_cooldown: Duration,
    /// Budget for draining the queue on shutdown.
    pub shutdown_deadline: Duration,
    /// Health monitor cadence.
    pub health_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout: Duration::from_secs(1),
            error_rate_threshold: 0.15,
            error_window: Duration::from_secs(300),
            trip_cooldown: Duration::from_secs(1),
            shutdown_deadline: Duration::from_secs(5),
            health_interval: Duration::from_secs(5),
        }
    }
}

/// Ingress rejection signals. Each is local and counted; none tears down
/// the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("ingress queue full, read rejected")]
    Backpressure,

    #[error("circuit open, ingress suspended")]
    CircuitOpen,

    #[error("pipeline is shutting down")]
    ShuttingDown,
}

/// Rolling-window error-rate circuit breaker.
///
/// Processed and error counts accumulate over a bounded window; when the
/// error rate exceeds the threshold the breaker opens for a cooldown,
/// then closes with fresh counters. The window roll keeps old failures
/// from tripping the breaker forever.
pub struct CircuitBreaker {
    threshold: f64,
    window: Duration,
    cooldown: Duration,
    state: Mutex<BreakerWindow>,
}

struct BreakerWindow {
    processed: u64,
    errors: u64,
    window_start: Instant,
    tripped_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: f64, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold,
            window,
            cooldown,
            state: Mutex::new(BreakerWindow {
                processed: 0,
                errors: 0,
                window_start: Instant::now(),
                tripped_at: None,
            }),
        }
    }

    pub fn record_processed(&self, count: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.roll(&mut state);
        state.processed += count;
    }

    pub fn record_error(&self, count: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.roll(&mut state);
        state.errors += count;

        let rate = state.errors as f64 / state.processed.max(1) as f64;
        if rate > self.threshold && state.tripped_at.is_none() {
            warn!(
                errors = state.errors,
                processed = state.processed,
                "error rate {:.1}% exceeded threshold, circuit opened",
                rate * 100.0
            );
            state.tripped_at = Some(Instant::now());
            state.processed = 0;
            state.errors = 0;
        }
    }

    /// Whether ingress is currently suspended. Closes the breaker once the
    /// cooldown has elapsed.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.tripped_at {
            Some(tripped_at) if tripped_at.elapsed() >= self.cooldown => {
                state.tripped_at = None;
                state.window_start = Instant::now();
                info!("circuit closed after cooldown, ingress resumed");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn roll(&self, state: &mut BreakerWindow) {
        if state.window_start.elapsed() >= self.window {
            state.processed = 0;
            state.errors = 0;
            state.window_start = Instant::now();
        }
    }
}

/// Point-in-time pipeline counters, for the health surface and tests.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub processed: u64,
    pub dropped: u64,
    pub errors: u64,
    pub queue_depth: usize,
    pub circuit_open: bool,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// The central read processing pipeline.
///
/// Adapters push single reads through [`ReadPipeline::process_read`]; a
/// worker gathers them into bounded batches, applies the quality filter
/// then the deduplicator, and publishes survivors to the sink. A full
/// queue is the sole backpressure surface; the circuit breaker isolates a
/// failing sink.
pub struct ReadPipeline {
    config: PipelineConfig,
    tx: mpsc::Sender<Read>,
    rx: Mutex<Option<mpsc::Receiver<Read>>>,
    filter: ReadFilter,
    dedup: ReadDeduplicator,
    sink: SharedSink,
    breaker: CircuitBreaker,
    counters: Counters,
    stopping: AtomicBool,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadPipeline {
    pub fn new(
        config: PipelineConfig,
        filter: ReadFilter,
        dedup: ReadDeduplicator,
        sink: SharedSink,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let breaker = CircuitBreaker::new(
            config.error_rate_threshold,
            config.error_window,
            config.trip_cooldown,
        );

        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            filter,
            dedup,
            sink,
            breaker,
            counters: Counters::default(),
            stopping: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the main loop and the health monitor.
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("pipeline already started");

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.push(tokio::spawn(Arc::clone(self).run_main_loop(rx)));
        workers.push(tokio::spawn(Arc::clone(self).run_health_monitor()));
        info!(
            queue_capacity = self.config.queue_capacity,
            batch_size = self.config.batch_size,
            "read pipeline started"
        );
    }

    /// Enqueue one read for processing. Non-blocking: a full queue or an
    /// open circuit rejects immediately.
    pub fn process_read(&self, read: Read) -> Result<(), PipelineError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(PipelineError::ShuttingDown);
        }

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rfid_processor_reads_received_total").increment(1);

        if self.breaker.is_open() {
            return Err(PipelineError::CircuitOpen);
        }

        match self.tx.try_send(read) {
            Ok(()) => {
                metrics::gauge!("rfid_processor_queue_size").set(self.queue_depth() as f64);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("rfid_processor_errors_total", "error_type" => "backpressure")
                    .increment(1);
                Err(PipelineError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Err(PipelineError::ShuttingDown),
        }
    }

    /// Stop ingress, drain the queue, and join the workers.
    pub async fn stop(&self) {
        info!("stopping read pipeline");
        self.stopping.store(true, Ordering::Release);
        self.cancel.cancel();

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }

        info!(
            processed = self.counters.processed.load(Ordering::Relaxed),
            dropped = self.counters.dropped.load(Ordering::Relaxed),
            "read pipeline stopped"
        );
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            received: self.counters.received.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            circuit_open: self.breaker.is_open(),
        }
    }

    fn queue_depth(&self) -> usize {
        self.config.queue_capacity - self.tx.capacity()
    }

    async fn run_main_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Read>) {
        info!("pipeline worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // While tripped the loop idles; ingress is already rejecting.
            if self.breaker.is_open() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            let (batch, closed) = self.gather_batch(&mut rx).await;
            if !batch.is_empty() {
                self.process_batch(batch).await;
            }
            if closed {
                break;
            }
        }

        self.drain(&mut rx).await;
        info!("pipeline worker exited");
    }

    /// Gather up to a batch of reads, bounded by the batch timeout.
    async fn gather_batch(&self, rx: &mut mpsc::Receiver<Read>) -> (Vec<Read>, bool) {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        let deadline = tokio::time::Instant::now() + self.config.batch_timeout;

        while batch.len() < self.config.batch_size {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                maybe_read = rx.recv() => match maybe_read {
                    Some(read) => batch.push(read),
                    None => return (batch, true),
                },
            }
        }

        (batch, false)
    }

    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    async fn process_batch(&self, batch: Vec<Read>) {
        let started = Instant::now();

        let filtered = self.filter.apply_filters(batch).await;
        let unique = self.dedup.process_reads(filtered);
        let survivors = unique.len();

        if survivors > 0 {
            let output: Vec<Read> = unique.into_iter().map(Read::into_processed).collect();
            match self.sink.publish(output).await {
                Ok(()) => {
                    self.counters
                        .processed
                        .fetch_add(survivors as u64, Ordering::Relaxed);
                    self.breaker.record_processed(survivors as u64);
                    metrics::counter!("rfid_processor_reads_processed_total")
                        .increment(survivors as u64);
                }
                Err(e) => {
                    error!("sink publish failed: {e}");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.breaker.record_error(1);
                    metrics::counter!("rfid_processor_errors_total", "error_type" => "sink")
                        .increment(1);
                }
            }
        }

        metrics::histogram!("rfid_processor_batch_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::gauge!("rfid_processor_queue_size").set(self.queue_depth() as f64);
        debug!(survivors, "batch processed");
    }

    /// Drain whatever is left in the queue, bounded by the shutdown
    /// deadline.
    async fn drain(&self, rx: &mut mpsc::Receiver<Read>) {
        let deadline = Instant::now() + self.config.shutdown_deadline;
        loop {
            let mut batch = Vec::with_capacity(self.config.batch_size);
            loop {
                match rx.try_recv() {
                    Ok(read) => {
                        batch.push(read);
                        if batch.len() >= self.config.batch_size {
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            self.process_batch(batch).await;

            if Instant::now() >= deadline {
                warn!("shutdown deadline reached with reads still queued");
                break;
            }
        }
    }

    async fn run_health_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let depth = self.queue_depth();
            metrics::gauge!("rfid_processor_queue_size").set(depth as f64);

            if depth * 10 > self.config.queue_capacity * 9 {
                warn!(
                    depth,
                    capacity = self.config.queue_capacity,
                    "ingress queue above 90% capacity"
                );
            }

            info!(
                queue = depth,
                processed = self.counters.processed.load(Ordering::Relaxed),
                errors = self.counters.errors.load(Ordering::Relaxed),
                "pipeline health check"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ReadSink;
    use async_trait::async_trait;

    const TAGS: [&str; 4] = [
        "E200123456789012345678A0",
        "E200123456789012345678A1",
        "E200123456789012345678A2",
        "E200123456789012345678A3",
    ];

    struct CollectingSink {
        published: Mutex<Vec<Read>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
            })
        }

        fn published(&self) -> Vec<Read> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReadSink for CollectingSink {
        async fn publish(&self, batch: Vec<Read>) -> anyhow::Result<()> {
            self.published.lock().unwrap().extend(batch);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ReadSink for FailingSink {
        async fn publish(&self, _batch: Vec<Read>) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    fn pipeline_with(config: PipelineConfig, sink: SharedSink) -> Arc<ReadPipeline> {
        let filter = ReadFilter::new(0.7, 100).unwrap();
        let dedup = ReadDeduplicator::new(5.0, 3.0, 10_000).unwrap();
        Arc::new(ReadPipeline::new(config, filter, dedup, sink))
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            batch_timeout: Duration::from_millis(20),
            health_interval: Duration::from_millis(50),
            trip_cooldown: Duration::from_millis(200),
            ..PipelineConfig::default()
        }
    }

    fn read(tag: &str, rssi: f64) -> Read {
        Read::new(tag, "r1", rssi).unwrap()
    }

    #[tokio::test]
    async fn test_backpressure_on_full_queue() {
        let config = PipelineConfig {
            queue_capacity: 2,
            ..PipelineConfig::default()
        };
        // Workers intentionally not started; nothing consumes the queue.
        let pipeline = pipeline_with(config, CollectingSink::new());

        assert!(pipeline.process_read(read(TAGS[0], -40.0)).is_ok());
        assert!(pipeline.process_read(read(TAGS[1], -40.0)).is_ok());
        assert_eq!(
            pipeline.process_read(read(TAGS[2], -40.0)),
            Err(PipelineError::Backpressure)
        );

        let stats = pipeline.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_end_to_end_processing_marks_reads_processed() {
        let sink = CollectingSink::new();
        let pipeline = pipeline_with(fast_config(), sink.clone());
        pipeline.start();

        for (i, tag) in TAGS.iter().enumerate() {
            pipeline
                .process_read(read(tag, -30.0 - i as f64))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        let published = sink.published();
        assert_eq!(published.len(), TAGS.len());
        assert!(published.iter().all(|r| r.is_processed));
        assert_eq!(pipeline.stats().processed, TAGS.len() as u64);

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_low_quality_reads_never_reach_sink() {
        let sink = CollectingSink::new();
        let pipeline = pipeline_with(fast_config(), sink.clone());
        pipeline.start();

        // Score 0.46, below the 0.7 threshold.
        pipeline.process_read(read(TAGS[0], -65.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(sink.published().is_empty());
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queued_reads() {
        let sink = CollectingSink::new();
        let config = PipelineConfig {
            // Long batch timeout: reads sit in the queue until drain.
            batch_timeout: Duration::from_secs(30),
            ..PipelineConfig::default()
        };
        let pipeline = pipeline_with(config, sink.clone());
        pipeline.start();

        // Give the worker a moment to block on recv, then flood.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for tag in TAGS {
            pipeline.process_read(read(tag, -30.0)).unwrap();
        }
        pipeline.stop().await;

        assert_eq!(sink.published().len(), TAGS.len());
    }

    #[test]
    fn test_breaker_trips_on_error_rate() {
        let breaker = CircuitBreaker::new(
            0.15,
            Duration::from_secs(300),
            Duration::from_millis(100),
        );
        breaker.record_processed(100);
        for _ in 0..20 {
            breaker.record_error(1);
        }
        assert!(breaker.is_open());
    }

    #[test]
    fn test_breaker_stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new(
            0.15,
            Duration::from_secs(300),
            Duration::from_millis(100),
        );
        breaker.record_processed(100);
        for _ in 0..10 {
            breaker.record_error(1);
        }
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_breaker_closes_after_cooldown() {
        let breaker = CircuitBreaker::new(
            0.15,
            Duration::from_secs(300),
            Duration::from_millis(100),
        );
        breaker.record_error(1);
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_sink_failures_open_circuit_and_ingress_recovers() {
        let pipeline = pipeline_with(fast_config(), Arc::new(FailingSink));
        pipeline.start();

        // One good read hits the failing sink: error rate 1/1 trips.
        pipeline.process_read(read(TAGS[0], -30.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            pipeline.process_read(read(TAGS[1], -30.0)),
            Err(PipelineError::CircuitOpen)
        );

        // Cooldown passes; ingress accepts again.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pipeline.process_read(read(TAGS[2], -30.0)).is_ok());

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_reads_still_count_as_received() {
        let config = PipelineConfig {
            queue_capacity: 1,
            ..PipelineConfig::default()
        };
        let pipeline = pipeline_with(config, CollectingSink::new());

        let _ = pipeline.process_read(read(TAGS[0], -40.0));
        let _ = pipeline.process_read(read(TAGS[1], -40.0));
        assert_eq!(pipeline.stats().received, 2);
        assert_eq!(pipeline.stats().dropped, 1);
    }
}
