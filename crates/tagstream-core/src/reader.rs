use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::read::Read;

/// Default LLRP port.
pub const DEFAULT_PORT: u16 = 5084;
/// Default inventory interval.
pub const DEFAULT_READ_INTERVAL_MS: u64 = 1000;
/// A reader whose heartbeat is older than this is considered unhealthy.
pub const HEARTBEAT_THRESHOLD_SECONDS: i64 = 60;
/// Status history entries kept per reader; older entries drop FIFO.
pub const STATUS_HISTORY_CAP: usize = 1000;

/// Reader operational state. Transitions are governed by
/// [`ReaderStatus::can_transition_to`]; anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReaderStatus {
    Online,
    Offline,
    Error,
    Maintenance,
}

impl ReaderStatus {
    pub fn can_transition_to(self, target: ReaderStatus) -> bool {
        use ReaderStatus::*;
        matches!(
            (self, target),
            (Offline, Online)
                | (Offline, Maintenance)
                | (Online, Offline)
                | (Online, Error)
                | (Online, Maintenance)
                | (Error, Offline)
                | (Error, Maintenance)
                | (Maintenance, Offline)
        )
    }
}

/// Transmit power setting with its corresponding dBm range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerLevel {
    Low,
    Medium,
    High,
}

impl PowerLevel {
    /// The (min, max) dBm range for this power level.
    pub fn dbm_range(self) -> (f64, f64) {
        match self {
            PowerLevel::Low => (-70.0, -55.0),
            PowerLevel::Medium => (-55.0, -35.0),
            PowerLevel::High => (-35.0, -20.0),
        }
    }
}

/// One entry in a reader's append-only status history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub timestamp: DateTime<Utc>,
    pub old_status: Option<ReaderStatus>,
    pub new_status: ReaderStatus,
    pub reason: String,
}

/// Running operational metrics for a reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub read_success_rate: f64,
    pub signal_strength_avg: f64,
    pub network_latency_ms: f64,
    pub error_count: u64,
    pub total_reads: u64,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            read_success_rate: 100.0,
            signal_strength_avg: -45.0,
            network_latency_ms: 0.0,
            error_count: 0,
            total_reads: 0,
        }
    }
}

/// A physical RFID reader device: connection settings, operational state
/// machine, and health bookkeeping.
///
/// The session manager exclusively owns each instance; adapters refer to a
/// reader by id and mutate only through the manager's status-update path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reader {
    pub id: String,
    pub name: String,
    pub ip_address: Ipv4Addr,
    pub port: u16,
    pub power_level: PowerLevel,
    pub read_interval_ms: u64,
    pub filtering_enabled: bool,
    pub status: ReaderStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub additional_params: HashMap<String, String>,
    pub status_history: Vec<StatusChange>,
    pub health_metrics: HealthMetrics,
}

impl Reader {
    pub fn new(
        name: &str,
        ip_address: Ipv4Addr,
        port: u16,
        power_level: PowerLevel,
        read_interval_ms: u64,
    ) -> Result<Self, ValidationError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyReaderName);
        }
        if port == 0 {
            return Err(ValidationError::InvalidPort(port as u32));
        }
        if read_interval_ms < 100 {
            return Err(ValidationError::InvalidReadInterval(read_interval_ms));
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            ip_address,
            port,
            power_level,
            read_interval_ms,
            filtering_enabled: true,
            status: ReaderStatus::Offline,
            last_heartbeat: now,
            additional_params: HashMap::new(),
            status_history: vec![StatusChange {
                timestamp: now,
                old_status: None,
                new_status: ReaderStatus::Offline,
                reason: "Initial configuration".to_string(),
            }],
            health_metrics: HealthMetrics::default(),
        })
    }

    /// Transition to a new status, recording the change in history.
    ///
    /// Enforces the transition matrix, refreshes the heartbeat, and bumps
    /// the error count when entering [`ReaderStatus::Error`].
    pub fn update_status(
        &mut self,
        new_status: ReaderStatus,
        reason: &str,
    ) -> Result<(), ValidationError> {
        if !self.status.can_transition_to(new_status) {
            return Err(ValidationError::InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        let old_status = self.status;
        self.status = new_status;
        self.last_heartbeat = Utc::now();

        self.status_history.push(StatusChange {
            timestamp: self.last_heartbeat,
            old_status: Some(old_status),
            new_status,
            reason: reason.to_string(),
        });
        if self.status_history.len() > STATUS_HISTORY_CAP {
            let excess = self.status_history.len() - STATUS_HISTORY_CAP;
            self.status_history.drain(..excess);
        }

        if new_status == ReaderStatus::Error {
            self.health_metrics.error_count += 1;
        }

        Ok(())
    }

    /// Fold a batch of observed reads into the rolling health metrics.
    pub fn record_reads(&mut self, count: u64, avg_signal: f64) {
        if count == 0 {
            return;
        }
        let m = &mut self.health_metrics;
        let n = m.total_reads as f64;
        let added = count as f64;
        m.signal_strength_avg = (m.signal_strength_avg * n + avg_signal * added) / (n + added);
        m.total_reads += count;
        self.last_heartbeat = Utc::now();
    }

    /// Seconds since the reader last gave a sign of life.
    pub fn heartbeat_age_seconds(&self) -> f64 {
        (Utc::now() - self.last_heartbeat).num_milliseconds() as f64 / 1000.0
    }

    pub fn heartbeat_ok(&self) -> bool {
        self.heartbeat_age_seconds() <= HEARTBEAT_THRESHOLD_SECONDS as f64
    }

    /// The most recent history entry that put the reader into ERROR.
    pub fn last_error(&self) -> Option<&StatusChange> {
        self.status_history
            .iter()
            .rev()
            .find(|entry| entry.new_status == ReaderStatus::Error)
    }

    /// Whether the rolling signal average is a plausible dBm value.
    pub fn signal_strength_ok(&self) -> bool {
        Read::validate_signal_strength(self.health_metrics.signal_strength_avg).is_ok()
    }
}
