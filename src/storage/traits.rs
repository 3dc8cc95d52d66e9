use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CompositionDefinition, CompositionInstance, DefinitionId, InstanceId, Participant,
    ParticipantId,
};

/// Persistence seam for the runtime's authoritative records. Saves replace
/// the whole record; callers serialize their own read-modify-write cycles.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    // Definition operations
    async fn save_definition(&self, definition: &CompositionDefinition) -> Result<()>;
    async fn find_definition(&self, id: DefinitionId) -> Result<Option<CompositionDefinition>>;

    // Instance operations
    async fn save_instance(&self, instance: &CompositionInstance) -> Result<()>;
    async fn find_instance(&self, id: InstanceId) -> Result<Option<CompositionInstance>>;
    async fn list_instances(&self) -> Result<Vec<CompositionInstance>>;
    async fn delete_instance(&self, id: InstanceId) -> Result<()>;

    // Participant operations
    async fn save_participant(&self, participant: &Participant) -> Result<()>;
    async fn find_participant(&self, id: ParticipantId) -> Result<Option<Participant>>;
    async fn list_participants(&self) -> Result<Vec<Participant>>;
    async fn delete_participant(&self, id: ParticipantId) -> Result<()>;
}
