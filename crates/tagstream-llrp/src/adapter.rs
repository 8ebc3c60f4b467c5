use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tagstream_core::reader::PowerLevel;
use tagstream_core::Read;
use tagstream_pipeline::{PipelineError, ReadPipeline};

use crate::client::LlrpClient;
use crate::error::LlrpError;
use crate::proto::{
    self, MSG_ADD_ROSPEC, MSG_ADD_ROSPEC_RESPONSE, MSG_ENABLE_ROSPEC, MSG_ENABLE_ROSPEC_RESPONSE,
    MSG_KEEPALIVE, MSG_KEEPALIVE_ACK, MSG_READER_EVENT_NOTIFICATION, MSG_RO_ACCESS_REPORT,
    MSG_SET_READER_CONFIG, MSG_SET_READER_CONFIG_RESPONSE, MSG_START_ROSPEC,
    MSG_START_ROSPEC_RESPONSE, ROSPEC_ID,
};

/// TCP connect budget per attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Local accumulation bound before draining to the pipeline.
pub const MICRO_BATCH_SIZE: usize = 100;
/// Maximum time a read sits in the local batch.
pub const MICRO_BATCH_TIMEOUT: Duration = Duration::from_millis(500);
/// RSSI assumed when a report omits PeakRSSI.
pub const DEFAULT_PEAK_RSSI: i8 = -70;

/// Receives per-reader ingest statistics from adapters.
///
/// Adapters reference their reader only by id; the session manager
/// implements this trait and folds the numbers into the reader's health
/// metrics under its own lock.
#[async_trait]
pub trait ReadObserver: Send + Sync {
    async fn record_reads(&self, reader_id: &str, count: usize, avg_signal: f64);
}

/// Observer that discards everything; for tests and standalone use.
pub struct NullObserver;

#[async_trait]
impl ReadObserver for NullObserver {
    async fn record_reads(&self, _reader_id: &str, _count: usize, _avg_signal: f64) {}
}

/// Owns exactly one LLRP session for exactly one reader.
///
/// [`ReaderAdapter::connect`] runs the configuration sequence;
/// [`ReaderAdapter::run`] turns tag reports into validated reads and
/// micro-batches them into the pipeline. Any transport or protocol error
/// ends the session with an error; the supervisor decides what happens
/// next.
pub struct ReaderAdapter {
    reader_id: String,
    addr: SocketAddr,
    power_level: PowerLevel,
    pipeline: Arc<ReadPipeline>,
    observer: Arc<dyn ReadObserver>,
    cancel: CancellationToken,
}

impl ReaderAdapter {
    pub fn new(
        reader_id: String,
        addr: SocketAddr,
        power_level: PowerLevel,
        pipeline: Arc<ReadPipeline>,
        observer: Arc<dyn ReadObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader_id,
            addr,
            power_level,
            pipeline,
            observer,
            cancel,
        }
    }

    /// Open the transport and push the reader configuration: transmit
    /// power, then the ROSpec lifecycle up to a started inventory.
    ///
    /// Failure at any step drops the client, closing the socket.
    #[instrument(skip(self), fields(reader_id = %self.reader_id, addr = %self.addr))]
    pub async fn connect(&self) -> Result<LlrpClient, LlrpError> {
        let result = self.configure().await;
        if let Err(e) = &result {
            metrics::counter!(
                "rfid_llrp_connection_errors_total",
                "reader_id" => self.reader_id.clone(),
                "error_type" => error_type(e)
            )
            .increment(1);
        }
        result
    }

    async fn configure(&self) -> Result<LlrpClient, LlrpError> {
        let mut client = LlrpClient::connect(self.addr, CONNECT_TIMEOUT).await?;

        client
            .transact(
                MSG_SET_READER_CONFIG,
                &proto::set_reader_config(self.power_level),
                MSG_SET_READER_CONFIG_RESPONSE,
            )
            .await?;
        client
            .transact(MSG_ADD_ROSPEC, &proto::add_rospec(), MSG_ADD_ROSPEC_RESPONSE)
            .await?;
        client
            .transact(
                MSG_ENABLE_ROSPEC,
                &proto::rospec_id_payload(ROSPEC_ID),
                MSG_ENABLE_ROSPEC_RESPONSE,
            )
            .await?;
        client
            .transact(
                MSG_START_ROSPEC,
                &proto::rospec_id_payload(ROSPEC_ID),
                MSG_START_ROSPEC_RESPONSE,
            )
            .await?;

        metrics::counter!("rfid_llrp_reader_connections", "status" => "connected").increment(1);
        info!("reader configured, inventory started");
        Ok(client)
    }

    /// Receive loop: translate RO_ACCESS_REPORTs into reads and drain
    /// them to the pipeline in micro-batches.
    ///
    /// Returns `Ok(())` only on cancellation. Any wire error flushes what
    /// is buffered and surfaces the error.
    #[instrument(skip(self, client), fields(reader_id = %self.reader_id))]
    pub async fn run(&self, mut client: LlrpClient) -> Result<(), LlrpError> {
        let mut batch: Vec<Read> = Vec::with_capacity(MICRO_BATCH_SIZE);
        let mut next_flush = tokio::time::Instant::now() + MICRO_BATCH_TIMEOUT;

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep_until(next_flush) => {
                    self.flush(&mut batch).await;
                    next_flush = tokio::time::Instant::now() + MICRO_BATCH_TIMEOUT;
                }
                received = client.recv() => {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => break Err(e),
                    };

                    match message.msg_type {
                        MSG_RO_ACCESS_REPORT => {
                            if let Err(e) = self.ingest_report(&message.payload, &mut batch) {
                                break Err(e);
                            }
                            if batch.len() >= MICRO_BATCH_SIZE {
                                self.flush(&mut batch).await;
                                next_flush = tokio::time::Instant::now() + MICRO_BATCH_TIMEOUT;
                            }
                        }
                        MSG_KEEPALIVE => {
                            if let Err(e) = client.send(MSG_KEEPALIVE_ACK, &[]).await {
                                break Err(e);
                            }
                        }
                        MSG_READER_EVENT_NOTIFICATION => {
                            debug!("reader event notification ignored");
                        }
                        other => {
                            debug!(msg_type = other, "unhandled LLRP message ignored");
                        }
                    }
                }
            }
        };

        self.flush(&mut batch).await;
        match result {
            Ok(()) => {
                client.close().await;
                info!("adapter cancelled, session closed");
                Ok(())
            }
            Err(e) => {
                metrics::counter!(
                    "rfid_llrp_connection_errors_total",
                    "reader_id" => self.reader_id.clone(),
                    "error_type" => error_type(&e)
                )
                .increment(1);
                Err(e)
            }
        }
    }

    fn ingest_report(&self, payload: &[u8], batch: &mut Vec<Read>) -> Result<(), LlrpError> {
        let reports = proto::decode_tag_reports(payload)?;
        for report in reports {
            let rssi = report.peak_rssi.unwrap_or(DEFAULT_PEAK_RSSI) as f64;
            match Read::new(&report.epc, &self.reader_id, rssi) {
                Ok(read) => batch.push(read),
                Err(e) => {
                    // Bad entries never take the session down.
                    debug!(%e, epc = %report.epc, "discarding invalid tag report entry");
                    metrics::counter!("rfid_processor_errors_total", "error_type" => "validation")
                        .increment(1);
                }
            }
        }
        Ok(())
    }

    /// Drain the local batch into pipeline ingress.
    ///
    /// Backpressure drops reads; an open circuit retains the remainder
    /// locally for the next flush tick, bounded by the micro-batch size
    /// (oldest dropped beyond it).
    async fn flush(&self, batch: &mut Vec<Read>) {
        if batch.is_empty() {
            return;
        }
        let started = Instant::now();
        let avg_signal =
            batch.iter().map(|r| r.signal_strength).sum::<f64>() / batch.len() as f64;

        let mut retained: Vec<Read> = Vec::new();
        let mut circuit_open = false;
        let mut submitted = 0usize;
        let mut dropped = 0u64;

        for read in batch.drain(..) {
            if circuit_open {
                retained.push(read);
                continue;
            }
            match self.pipeline.process_read(read.clone()) {
                Ok(()) => submitted += 1,
                Err(PipelineError::CircuitOpen) => {
                    circuit_open = true;
                    retained.push(read);
                }
                Err(PipelineError::Backpressure) | Err(PipelineError::ShuttingDown) => {
                    dropped += 1;
                }
            }
        }

        if retained.len() > MICRO_BATCH_SIZE {
            let excess = retained.len() - MICRO_BATCH_SIZE;
            retained.drain(..excess);
            dropped += excess as u64;
        }
        *batch = retained;

        if circuit_open {
            warn!(retained = batch.len(), "pipeline circuit open, retaining local batch");
        }
        if dropped > 0 {
            metrics::counter!(
                "rfid_llrp_reads_dropped_total",
                "reader_id" => self.reader_id.clone()
            )
            .increment(dropped);
        }
        if submitted > 0 {
            metrics::counter!("rfid_llrp_reads_total", "reader_id" => self.reader_id.clone())
                .increment(submitted as u64);
            metrics::histogram!(
                "rfid_llrp_processing_duration_seconds",
                "reader_id" => self.reader_id.clone()
            )
            .record(started.elapsed().as_secs_f64());
            self.observer
                .record_reads(&self.reader_id, submitted, avg_signal)
                .await;
        }
    }
}

fn error_type(e: &LlrpError) -> &'static str {
    match e {
        LlrpError::Io(_) => "io",
        LlrpError::ConnectTimeout => "timeout",
        LlrpError::Malformed(_) => "protocol",
        LlrpError::Status { .. } => "status",
        LlrpError::UnexpectedMessage { .. } => "protocol",
    }
}
