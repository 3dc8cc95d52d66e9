use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CompositionDefinition, CompositionInstance, DefinitionId, InstanceId, Participant,
    ParticipantId,
};

use super::InstanceStore;

#[derive(Clone)]
pub struct InMemoryStore {
    definitions: Arc<RwLock<HashMap<DefinitionId, CompositionDefinition>>>,
    instances: Arc<RwLock<HashMap<InstanceId, CompositionInstance>>>,
    participants: Arc<RwLock<HashMap<ParticipantId, Participant>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            participants: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryStore {
    async fn save_definition(&self, definition: &CompositionDefinition) -> Result<()> {
        let mut definitions = self.definitions.write().unwrap();
        definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn find_definition(&self, id: DefinitionId) -> Result<Option<CompositionDefinition>> {
        let definitions = self.definitions.read().unwrap();
        Ok(definitions.get(&id).cloned())
    }

    async fn save_instance(&self, instance: &CompositionInstance) -> Result<()> {
        let mut instances = self.instances.write().unwrap();
        instances.insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn find_instance(&self, id: InstanceId) -> Result<Option<CompositionInstance>> {
        let instances = self.instances.read().unwrap();
        Ok(instances.get(&id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<CompositionInstance>> {
        let instances = self.instances.read().unwrap();
        Ok(instances.values().cloned().collect())
    }

    async fn delete_instance(&self, id: InstanceId) -> Result<()> {
        let mut instances = self.instances.write().unwrap();
        instances.remove(&id);
        Ok(())
    }

    async fn save_participant(&self, participant: &Participant) -> Result<()> {
        let mut participants = self.participants.write().unwrap();
        participants.insert(participant.participant_id, participant.clone());
        Ok(())
    }

    async fn find_participant(&self, id: ParticipantId) -> Result<Option<Participant>> {
        let participants = self.participants.read().unwrap();
        Ok(participants.get(&id).cloned())
    }

    async fn list_participants(&self) -> Result<Vec<Participant>> {
        let participants = self.participants.read().unwrap();
        Ok(participants.values().cloned().collect())
    }

    async fn delete_participant(&self, id: ParticipantId) -> Result<()> {
        let mut participants = self.participants.write().unwrap();
        participants.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Participant;

    fn create_test_definition() -> CompositionDefinition {
        CompositionDefinition {
            id: DefinitionId::new_v4(),
            name: "test-composition".to_string(),
            version: "1.0.0".to_string(),
            elements: vec![],
        }
    }

    #[tokio::test]
    async fn test_definition_round_trip() {
        let store = InMemoryStore::new();
        let definition = create_test_definition();

        store.save_definition(&definition).await.unwrap();
        let found = store.find_definition(definition.id).await.unwrap();

        assert_eq!(found.unwrap().name, "test-composition");
    }

    #[tokio::test]
    async fn test_instance_delete() {
        let store = InMemoryStore::new();
        let instance = CompositionInstance::new(DefinitionId::new_v4(), "demo".to_string());
        let id = instance.instance_id;

        store.save_instance(&instance).await.unwrap();
        assert!(store.find_instance(id).await.unwrap().is_some());

        store.delete_instance(id).await.unwrap();
        assert!(store.find_instance(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_participant_listing() {
        let store = InMemoryStore::new();
        let first = Participant::new(ParticipantId::new_v4(), vec!["a".to_string()]);
        let second = Participant::new(ParticipantId::new_v4(), vec!["b".to_string()]);

        store.save_participant(&first).await.unwrap();
        store.save_participant(&second).await.unwrap();

        assert_eq!(store.list_participants().await.unwrap().len(), 2);
    }
}
