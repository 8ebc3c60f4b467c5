use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tagstream_core::bus::SharedEventBus;
use tagstream_core::error::ValidationError;
use tagstream_core::reader::{Reader, ReaderStatus};
use tagstream_core::{Read, TagEvent};
use tagstream_llrp::adapter::DEFAULT_PEAK_RSSI;
use tagstream_llrp::{LlrpClient, LlrpError, ReadObserver, ReaderAdapter, TagReport};
use tagstream_pipeline::{PipelineError, ReadPipeline};

use crate::health::{ReaderHealth, ServiceHealth};

/// Reconnect policy: base delay, doubling, jittered, bounded attempts
/// inside a total budget.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_BUDGET: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("reader {0} not found")]
    NotFound(String),

    #[error("reader {0} already registered")]
    AlreadyRegistered(String),

    #[error("reader failed registration health check")]
    HealthCheckFailed,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("connect failed: {0}")]
    Connect(#[from] LlrpError),
}

/// Outcome counts for a manually submitted batch of raw reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub submitted: usize,
    pub accepted: usize,
    pub invalid: usize,
    pub dropped: usize,
    pub circuit_open: usize,
}

struct ReaderEntry {
    reader: Mutex<Reader>,
    cancel: CancellationToken,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Registry and life-supervisor of readers.
///
/// The manager exclusively owns every [`Reader`] aggregate; adapters and
/// the admin surface reach reader state only through it. Each registered
/// reader gets a supervision task that restarts its adapter with
/// exponential backoff after transport errors.
pub struct SessionManager {
    readers: DashMap<String, Arc<ReaderEntry>>,
    pipeline: Arc<ReadPipeline>,
    bus: Option<SharedEventBus>,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(pipeline: Arc<ReadPipeline>, bus: Option<SharedEventBus>) -> Arc<Self> {
        Arc::new(Self {
            readers: DashMap::new(),
            pipeline,
            bus,
            cancel: CancellationToken::new(),
        })
    }

    /// Register a reader: health-gate it, bring its LLRP session up, and
    /// install it in the registry. Returns the reader state after the
    /// OFFLINE to ONLINE transition.
    ///
    /// A failed connect rejects the registration outright; the reconnect
    /// policy only applies to sessions that were once up.
    #[instrument(skip(self, reader), fields(reader_id = %reader.id))]
    pub async fn register(self: &Arc<Self>, reader: Reader) -> Result<Reader, SessionError> {
        if self.readers.contains_key(&reader.id) {
            return Err(SessionError::AlreadyRegistered(reader.id));
        }
        if !reader.heartbeat_ok() {
            return Err(SessionError::HealthCheckFailed);
        }

        let reader_id = reader.id.clone();
        let addr = SocketAddr::new(IpAddr::V4(reader.ip_address), reader.port);
        let power_level = reader.power_level;

        let entry = Arc::new(ReaderEntry {
            reader: Mutex::new(reader),
            cancel: self.cancel.child_token(),
            supervisor: std::sync::Mutex::new(None),
        });

        let adapter = ReaderAdapter::new(
            reader_id.clone(),
            addr,
            power_level,
            Arc::clone(&self.pipeline),
            Arc::clone(self) as Arc<dyn ReadObserver>,
            entry.cancel.clone(),
        );

        let client = adapter.connect().await?;
        self.set_status(&entry, ReaderStatus::Online, "Connected successfully")
            .await?;

        self.readers.insert(reader_id.clone(), Arc::clone(&entry));
        metrics::gauge!("rfid_session_active_readers").set(self.readers.len() as f64);

        let supervisor = tokio::spawn(Arc::clone(self).supervise(
            Arc::clone(&entry),
            adapter,
            client,
        ));
        *entry.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(supervisor);

        info!("reader registered");
        let reader = entry.reader.lock().await.clone();
        Ok(reader)
    }

    /// Transition a reader's status through the state machine, recording
    /// history and publishing the change.
    pub async fn update_status(
        &self,
        reader_id: &str,
        new_status: ReaderStatus,
        reason: &str,
    ) -> Result<(), SessionError> {
        let entry = self.entry(reader_id)?;
        self.set_status(&entry, new_status, reason).await
    }

    /// Cancel the reader's adapter, transition to OFFLINE, and remove it
    /// from the registry.
    pub async fn deregister(&self, reader_id: &str) -> Result<(), SessionError> {
        let (_, entry) = self
            .readers
            .remove(reader_id)
            .ok_or_else(|| SessionError::NotFound(reader_id.to_string()))?;

        entry.cancel.cancel();

        {
            let mut reader = entry.reader.lock().await;
            if reader.status.can_transition_to(ReaderStatus::Offline) {
                let old_status = reader.status;
                reader.update_status(ReaderStatus::Offline, "Deregistered")?;
                self.publish_status_change(&reader, old_status, "Deregistered");
            }
        }

        let supervisor = entry
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        metrics::gauge!("rfid_session_active_readers").set(self.readers.len() as f64);
        info!(reader_id, "reader deregistered");
        Ok(())
    }

    /// Fan a batch of raw reports into the pipeline on behalf of a
    /// registered reader. Used by the admin surface for tests and replay.
    pub async fn process_batch(
        &self,
        reader_id: &str,
        reports: Vec<TagReport>,
    ) -> Result<BatchSummary, SessionError> {
        // Reject unknown readers before doing any work.
        self.entry(reader_id)?;

        let mut summary = BatchSummary {
            submitted: reports.len(),
            ..BatchSummary::default()
        };
        let mut signal_sum = 0.0;

        for report in reports {
            let rssi = report.peak_rssi.unwrap_or(DEFAULT_PEAK_RSSI) as f64;
            match Read::new(&report.epc, reader_id, rssi) {
                Ok(read) => match self.pipeline.process_read(read) {
                    Ok(()) => {
                        summary.accepted += 1;
                        signal_sum += rssi;
                    }
                    Err(PipelineError::CircuitOpen) => summary.circuit_open += 1,
                    Err(PipelineError::Backpressure) | Err(PipelineError::ShuttingDown) => {
                        summary.dropped += 1
                    }
                },
                Err(e) => {
                    debug!(%e, "invalid report entry in manual batch");
                    summary.invalid += 1;
                }
            }
        }

        if summary.accepted > 0 {
            self.record_reads(
                reader_id,
                summary.accepted,
                signal_sum / summary.accepted as f64,
            )
            .await;
        }
        Ok(summary)
    }

    pub async fn health(&self, reader_id: &str) -> Result<ReaderHealth, SessionError> {
        let entry = self.entry(reader_id)?;
        let reader = entry.reader.lock().await;
        Ok(ReaderHealth::from_reader(&reader))
    }

    #[instrument(skip(self))]
    pub async fn health_all(&self) -> ServiceHealth {
        let entries: Vec<(String, Arc<ReaderEntry>)> = self
            .readers
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();

        let mut snapshots = std::collections::HashMap::with_capacity(entries.len());
        for (id, entry) in entries {
            let reader = entry.reader.lock().await;
            snapshots.insert(id, ReaderHealth::from_reader(&reader));
        }
        ServiceHealth::aggregate(snapshots)
    }

    /// Current state of one reader, for the admin surface.
    pub async fn reader_state(&self, reader_id: &str) -> Result<Reader, SessionError> {
        let entry = self.entry(reader_id)?;
        let reader = entry.reader.lock().await;
        Ok(reader.clone())
    }

    /// Cancel every session and wait for their supervisors to exit.
    pub async fn shutdown(&self) {
        info!("session manager shutting down");
        self.cancel.cancel();

        let ids: Vec<String> = self.readers.iter().map(|item| item.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.deregister(&id).await {
                warn!(reader_id = %id, %e, "deregister during shutdown failed");
            }
        }
    }

    fn entry(&self, reader_id: &str) -> Result<Arc<ReaderEntry>, SessionError> {
        self.readers
            .get(reader_id)
            .map(|item| Arc::clone(item.value()))
            .ok_or_else(|| SessionError::NotFound(reader_id.to_string()))
    }

    async fn set_status(
        &self,
        entry: &ReaderEntry,
        new_status: ReaderStatus,
        reason: &str,
    ) -> Result<(), SessionError> {
        let mut reader = entry.reader.lock().await;
        let old_status = reader.status;
        reader.update_status(new_status, reason)?;
        self.publish_status_change(&reader, old_status, reason);
        Ok(())
    }

    fn publish_status_change(&self, reader: &Reader, old_status: ReaderStatus, reason: &str) {
        if let Some(bus) = &self.bus {
            bus.publish(TagEvent::ReaderStatusChange {
                reader_id: reader.id.clone(),
                old_status,
                new_status: reader.status,
                reason: reason.to_string(),
                timestamp: reader.last_heartbeat,
            });
        }
    }

    /// Supervision loop for one reader's session: run the adapter, and on
    /// error mark the reader ERROR and attempt a bounded reconnect.
    async fn supervise(
        self: Arc<Self>,
        entry: Arc<ReaderEntry>,
        adapter: ReaderAdapter,
        mut client: LlrpClient,
    ) {
        loop {
            let session_error = match adapter.run(client).await {
                Ok(()) => break,
                Err(e) => e,
            };

            warn!(%session_error, "reader session ended with error");
            if let Err(e) = self
                .set_status(
                    &entry,
                    ReaderStatus::Error,
                    &format!("Transport error: {session_error}"),
                )
                .await
            {
                error!(%e, "failed to record error status");
            }
            if entry.cancel.is_cancelled() {
                return;
            }

            match self.reconnect(&entry, &adapter).await {
                Some(new_client) => {
                    // The matrix has no ERROR to ONLINE edge; pass through
                    // OFFLINE on the way back up.
                    if self
                        .set_status(&entry, ReaderStatus::Offline, "Reconnecting")
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if self
                        .set_status(&entry, ReaderStatus::Online, "Connected successfully")
                        .await
                        .is_err()
                    {
                        return;
                    }
                    client = new_client;
                }
                None => {
                    error!("reconnect attempts exhausted, reader left in ERROR");
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, entry: &ReaderEntry, adapter: &ReaderAdapter) -> Option<LlrpClient> {
        let mut policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(RECONNECT_BASE_DELAY)
            .with_multiplier(2.0)
            .with_max_elapsed_time(Some(RECONNECT_BUDGET))
            .build();

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let delay = policy.next_backoff()?;
            tokio::select! {
                _ = entry.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match adapter.connect().await {
                Ok(new_client) => {
                    info!(attempt, "reader reconnected");
                    return Some(new_client);
                }
                Err(e) => warn!(attempt, %e, "reconnect attempt failed"),
            }
        }
        None
    }
}

#[async_trait]
impl ReadObserver for SessionManager {
    async fn record_reads(&self, reader_id: &str, count: usize, avg_signal: f64) {
        let Ok(entry) = self.entry(reader_id) else {
            return;
        };
        let mut reader = entry.reader.lock().await;
        reader.record_reads(count as u64, avg_signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use tagstream_core::reader::PowerLevel;
    use tagstream_pipeline::{BusSink, PipelineConfig, ReadDeduplicator, ReadFilter};

    fn test_manager() -> Arc<SessionManager> {
        let bus = Arc::new(tagstream_core::EventBus::new(64));
        let pipeline = Arc::new(ReadPipeline::new(
            PipelineConfig::default(),
            ReadFilter::new(0.7, 100).unwrap(),
            ReadDeduplicator::new(5.0, 3.0, 10_000).unwrap(),
            Arc::new(BusSink::new(Arc::clone(&bus))),
        ));
        SessionManager::new(pipeline, Some(bus))
    }

    fn reader_at(port: u16) -> Reader {
        Reader::new(
            "bench-reader",
            Ipv4Addr::LOCALHOST,
            port,
            PowerLevel::Medium,
            1000,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_unreachable_reader() {
        let manager = test_manager();
        // Nothing listens here; connect is refused.
        let reader = reader_at(1);
        let reader_id = reader.id.clone();

        let result = manager.register(reader).await;
        assert!(matches!(result, Err(SessionError::Connect(_))));
        assert!(matches!(
            manager.reader_state(&reader_id).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_stale_heartbeat() {
        let manager = test_manager();
        let mut reader = reader_at(1);
        reader.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(120);

        assert!(matches!(
            manager.register(reader).await,
            Err(SessionError::HealthCheckFailed)
        ));
    }

    #[tokio::test]
    async fn test_operations_on_unknown_reader() {
        let manager = test_manager();
        assert!(matches!(
            manager
                .update_status("missing", ReaderStatus::Online, "x")
                .await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.deregister("missing").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.health("missing").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.process_batch("missing", Vec::new()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_health_all_empty_registry() {
        let manager = test_manager();
        let health = manager.health_all().await;
        assert_eq!(health.active_readers, 0);
    }
}
