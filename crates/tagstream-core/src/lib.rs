pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod read;
pub mod reader;

pub use bus::EventBus;
pub use config::Config;
pub use error::{ConfigError, ValidationError};
pub use events::TagEvent;
pub use read::{Read, MAX_SIGNAL_STRENGTH, MIN_SIGNAL_STRENGTH};
pub use reader::{HealthMetrics, PowerLevel, Reader, ReaderStatus, StatusChange};
