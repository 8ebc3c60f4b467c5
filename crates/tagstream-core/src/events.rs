use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::read::Read;
use crate::reader::ReaderStatus;

/// Events published on the bus for downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TagEvent {
    /// A read that survived filtering and deduplication.
    CleanRead(Read),

    /// Reader operational state change.
    ReaderStatusChange {
        reader_id: String,
        old_status: ReaderStatus,
        new_status: ReaderStatus,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}
