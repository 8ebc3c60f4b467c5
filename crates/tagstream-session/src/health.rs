use std::collections::HashMap;

use serde::Serialize;

use tagstream_core::reader::{HealthMetrics, PowerLevel, Reader, ReaderStatus, StatusChange};

/// Point-in-time health snapshot for one reader.
#[derive(Debug, Clone, Serialize)]
pub struct ReaderHealth {
    pub status: ReaderStatus,
    pub is_online: bool,
    pub heartbeat_age_seconds: f64,
    pub heartbeat_ok: bool,
    pub power_level: PowerLevel,
    pub metrics: HealthMetrics,
    pub last_error: Option<StatusChange>,
    pub signal_strength_ok: bool,
}

impl ReaderHealth {
    pub fn from_reader(reader: &Reader) -> Self {
        Self {
            status: reader.status,
            is_online: reader.status == ReaderStatus::Online,
            heartbeat_age_seconds: reader.heartbeat_age_seconds(),
            heartbeat_ok: reader.heartbeat_ok(),
            power_level: reader.power_level,
            metrics: reader.health_metrics.clone(),
            last_error: reader.last_error().cloned(),
            signal_strength_ok: reader.signal_strength_ok(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.heartbeat_ok && self.status != ReaderStatus::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregate health across every registered reader.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub overall: OverallStatus,
    pub active_readers: usize,
    pub readers: HashMap<String, ReaderHealth>,
}

impl ServiceHealth {
    pub fn aggregate(readers: HashMap<String, ReaderHealth>) -> Self {
        let total = readers.len();
        let unhealthy = readers.values().filter(|h| !h.is_ok()).count();

        let overall = if unhealthy == 0 {
            OverallStatus::Healthy
        } else if unhealthy < total {
            OverallStatus::Degraded
        } else {
            OverallStatus::Unhealthy
        };

        Self {
            overall,
            active_readers: total,
            readers,
        }
    }
}
