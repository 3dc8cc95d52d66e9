pub mod dispatcher;
pub mod participants;
pub mod registry;
pub mod supervision;

pub use dispatcher::{CommandDispatcher, LifecycleCommand};
pub use participants::ParticipantRegistry;
pub use registry::InstanceRegistry;
pub use supervision::Supervisor;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::storage::InstanceStore;
use crate::transport::Transport;
use crate::types::{
    CompositionDefinition, CompositionInstance, DefinitionId, DeployState, ElementId, InstanceId,
    Message, MessageBody, Participant,
};

/// The orchestration runtime: one explicitly-constructed context object
/// holding the store and transport seams, the instance and participant
/// registries, the dispatcher and the supervisor.
pub struct Runtime {
    store: Arc<dyn InstanceStore>,
    transport: Arc<dyn Transport>,
    config: Config,
    registry: Arc<InstanceRegistry>,
    participants: Arc<ParticipantRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    supervisor: Arc<Supervisor>,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Self {
        let registry = Arc::new(InstanceRegistry::new(store.clone()));
        let participants = Arc::new(ParticipantRegistry::new(
            store.clone(),
            transport.clone(),
            config.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            registry.clone(),
            transport.clone(),
            config.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            registry.clone(),
            participants.clone(),
            dispatcher.clone(),
            config.clone(),
        ));

        Self {
            store,
            transport,
            config,
            registry,
            participants,
            dispatcher,
            supervisor,
        }
    }

    /// Subscribes to the shared topic, then spawns the inbound loop and the
    /// supervision loop. Each inbound message is handled on its own task, so
    /// independent instances reconcile concurrently.
    pub async fn start(self: &Arc<Self>) {
        let mut rx = self.transport.subscribe(&self.config.topic).await;

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            log::info!("runtime listening on topic {}", runtime.config.topic);
            while let Some(payload) = rx.recv().await {
                let runtime = Arc::clone(&runtime);
                tokio::spawn(async move {
                    runtime.route(&payload).await;
                });
            }
        });

        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            supervisor.run().await;
        });
    }

    async fn route(&self, payload: &str) {
        let msg = match Message::from_json(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("undecodable message dropped: {}", e);
                return;
            }
        };
        if let Err(e) = self.handle_message(msg).await {
            match e {
                // expected under at-least-once delivery on a shared topic
                OrchestratorError::StaleMessage { .. }
                | OrchestratorError::InstanceNotFound { .. }
                | OrchestratorError::ElementNotFound { .. } => {
                    log::debug!("message discarded: {}", e);
                }
                other => log::warn!("message handling failed: {}", other),
            }
        }
    }

    /// Routes one decoded message. Runtime-origin types reflected back by
    /// the shared topic fall through silently.
    pub async fn handle_message(&self, msg: Message) -> Result<()> {
        let message_id = msg.message_id;
        match (msg.participant_id, msg.body) {
            (Some(sender), MessageBody::ParticipantRegister(register)) => {
                self.participants
                    .handle_register(sender, register.supported_element_types, message_id)
                    .await
            }
            (Some(sender), MessageBody::ParticipantDeregister) => {
                self.participants.handle_deregister(sender, message_id).await
            }
            (Some(sender), MessageBody::ParticipantStatus(status)) => {
                self.participants.handle_status(sender, status).await
            }
            (None, MessageBody::ParticipantRegister(_))
            | (None, MessageBody::ParticipantDeregister)
            | (None, MessageBody::ParticipantStatus(_)) => {
                log::warn!("participant message {} carries no sender id", message_id);
                Ok(())
            }
            (_, MessageBody::AutomationCompositionAck(ack)) => self.registry.apply_ack(&ack).await,
            _ => Ok(()),
        }
    }

    pub async fn prime_definition(&self, definition: &CompositionDefinition) -> Result<()> {
        self.store.save_definition(definition).await?;
        log::info!("definition {} ({}) primed", definition.name, definition.id);
        Ok(())
    }

    pub async fn create_instance(
        &self,
        definition_id: DefinitionId,
        name: String,
    ) -> Result<CompositionInstance> {
        self.registry.create_instance(definition_id, name).await
    }

    pub async fn distribute(&self, instance_id: InstanceId) -> Result<()> {
        self.dispatcher.distribute(instance_id).await
    }

    pub async fn dispatch(&self, instance_id: InstanceId, command: LifecycleCommand) -> Result<()> {
        self.dispatcher.dispatch(instance_id, command).await
    }

    pub async fn update_element_properties(
        &self,
        instance_id: InstanceId,
        element_id: ElementId,
        properties: Map<String, Value>,
    ) -> Result<()> {
        self.registry
            .update_in_properties(instance_id, element_id, properties)
            .await
    }

    /// Commissioned instances were never distributed and are removed
    /// directly; anything else goes through the Deleting round trip so
    /// participants drop their local records.
    pub async fn delete_instance(&self, instance_id: InstanceId) -> Result<()> {
        let instance = self.registry.get_instance(instance_id).await?;
        if instance.deploy_state == DeployState::Commissioned {
            return self.registry.delete_instance(instance_id).await;
        }
        self.dispatcher
            .dispatch(instance_id, LifecycleCommand::Delete)
            .await
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<CompositionInstance> {
        self.registry.get_instance(instance_id).await
    }

    pub async fn list_instances(&self) -> Result<Vec<CompositionInstance>> {
        self.store.list_instances().await
    }

    pub async fn list_participants(&self) -> Result<Vec<Participant>> {
        self.store.list_participants().await
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }
}
