use std::sync::Arc;

use async_trait::async_trait;

use tagstream_core::bus::SharedEventBus;
use tagstream_core::{Read, TagEvent};

/// Downstream consumer of clean reads.
///
/// The pipeline publishes each surviving batch exactly once; retry policy
/// is the sink's concern. A publish error is counted as a batch error but
/// the batch is not re-sent.
#[async_trait]
pub trait ReadSink: Send + Sync {
    async fn publish(&self, batch: Vec<Read>) -> anyhow::Result<()>;
}

pub type SharedSink = Arc<dyn ReadSink>;

/// Sink that fans clean reads out on the in-process event bus.
pub struct BusSink {
    bus: SharedEventBus,
}

impl BusSink {
    pub fn new(bus: SharedEventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ReadSink for BusSink {
    async fn publish(&self, batch: Vec<Read>) -> anyhow::Result<()> {
        for read in batch {
            self.bus.publish(TagEvent::CleanRead(read));
        }
        Ok(())
    }
}
