use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::types::{ElementId, InstanceId};

/// What a handler gets to work with: the element's identity, the sequence
/// of the command driving it, and the input properties recorded when the
/// command was accepted. Reports must echo `sequence` so the outcome lands
/// on the command that asked for it, not on whatever superseded it.
#[derive(Debug, Clone)]
pub struct ElementContext {
    pub instance_id: InstanceId,
    pub element_id: ElementId,
    pub sequence: u64,
    pub in_properties: Map<String, Value>,
}

/// The per-technology backend seam. One implementation per participant,
/// driving whatever the participant manages (an HTTP endpoint, a Helm
/// chart, a policy engine).
///
/// `Ok(())` means the command was accepted: the handler has invoked, or
/// will eventually invoke, the [`StateReporter`](super::StateReporter) with
/// the outcome. On `Err` the intermediary reports the element FAILED at the
/// stable state the transition fell back from.
#[async_trait]
pub trait ElementHandler: Send + Sync {
    async fn deploy(&self, context: ElementContext) -> Result<()>;
    async fn undeploy(&self, context: ElementContext) -> Result<()>;
    async fn lock(&self, context: ElementContext) -> Result<()>;
    async fn unlock(&self, context: ElementContext) -> Result<()>;
    async fn delete(&self, context: ElementContext) -> Result<()>;
}
