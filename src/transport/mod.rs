pub mod memory;

pub use memory::InMemoryBus;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Pub/sub seam between the runtime and the participant fleet. Real
/// deployments back this with a message broker; the demo and the tests run
/// over [`InMemoryBus`]. Payloads are JSON-encoded message envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<String>;
}
