pub mod dedup;
pub mod filter;
pub mod pipeline;
pub mod sink;

pub use dedup::ReadDeduplicator;
pub use filter::ReadFilter;
pub use pipeline::{PipelineConfig, PipelineError, PipelineStats, ReadPipeline};
pub use sink::{BusSink, ReadSink, SharedSink};
