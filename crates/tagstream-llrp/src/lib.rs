pub mod adapter;
pub mod client;
pub mod error;
pub mod proto;

pub use adapter::{NullObserver, ReadObserver, ReaderAdapter};
pub use client::{LlrpClient, LlrpMessage};
pub use error::LlrpError;
pub use proto::TagReport;
