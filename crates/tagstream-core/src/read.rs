use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Minimum acceptable signal strength in dBm.
pub const MIN_SIGNAL_STRENGTH: f64 = -70.0;
/// Maximum acceptable signal strength in dBm.
pub const MAX_SIGNAL_STRENGTH: f64 = -20.0;

/// Length of an EPC tag identifier in hex characters.
const TAG_HEX_LEN: usize = 24;

/// One observation of one tag by one reader at one instant.
///
/// All fields are validated at construction and never mutated afterwards;
/// the pipeline marks a read as processed by emitting a transformed copy
/// via [`Read::into_processed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Read {
    pub id: Uuid,
    pub rfid_tag: String,
    pub reader_id: String,
    pub signal_strength: f64,
    pub read_time: DateTime<Utc>,
    pub is_processed: bool,
}

impl Read {
    /// Construct a validated read observed right now.
    pub fn new(
        rfid_tag: &str,
        reader_id: &str,
        signal_strength: f64,
    ) -> Result<Self, ValidationError> {
        Self::at(rfid_tag, reader_id, signal_strength, Utc::now())
    }

    /// Construct a validated read with an explicit observation time.
    pub fn at(
        rfid_tag: &str,
        reader_id: &str,
        signal_strength: f64,
        read_time: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if !is_valid_tag(rfid_tag) {
            return Err(ValidationError::InvalidTag(rfid_tag.to_string()));
        }
        Self::validate_signal_strength(signal_strength)?;
        if reader_id.trim().is_empty() {
            return Err(ValidationError::EmptyReaderId);
        }

        Ok(Self {
            id: Uuid::new_v4(),
            rfid_tag: rfid_tag.to_ascii_uppercase(),
            reader_id: reader_id.to_string(),
            signal_strength,
            read_time,
            is_processed: false,
        })
    }

    /// Check a signal strength against the acceptable dBm range.
    ///
    /// Shared by read construction, duplicate detection, and reader health
    /// so the three never disagree about what "valid signal" means.
    pub fn validate_signal_strength(signal_strength: f64) -> Result<(), ValidationError> {
        if !signal_strength.is_finite()
            || signal_strength < MIN_SIGNAL_STRENGTH
            || signal_strength > MAX_SIGNAL_STRENGTH
        {
            return Err(ValidationError::SignalOutOfRange(signal_strength));
        }
        Ok(())
    }

    /// Consume the read, returning a copy flagged as pipeline output.
    pub fn into_processed(self) -> Self {
        Self {
            is_processed: true,
            ..self
        }
    }
}

fn is_valid_tag(tag: &str) -> bool {
    tag.len() == TAG_HEX_LEN && tag.bytes().all(|b| b.is_ascii_hexdigit())
}
