use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::protocol::{validate_deploy, validate_lock};
use crate::storage::InstanceStore;
use crate::transport::Transport;
use crate::types::{
    CompositionInstance, CompositionStateChange, CompositionUpdate, DeployState, ElementCommand,
    ElementUpdate, InstanceId, LockState, Message, MessageBody, ParticipantId, PendingOperation,
    StateChangeResult,
};

use super::registry::InstanceRegistry;

/// Operator-facing lifecycle commands. Deploy on an already-deployed
/// instance is the update path: participants re-apply the refreshed input
/// properties idempotently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Deploy,
    Undeploy,
    Lock,
    Unlock,
    Delete,
}

impl LifecycleCommand {
    fn targets(&self) -> (Option<DeployState>, Option<LockState>) {
        match self {
            LifecycleCommand::Deploy => (Some(DeployState::Deployed), None),
            LifecycleCommand::Undeploy => (Some(DeployState::Undeployed), None),
            LifecycleCommand::Delete => (Some(DeployState::Deleting), None),
            LifecycleCommand::Lock => (None, Some(LockState::Locked)),
            LifecycleCommand::Unlock => (None, Some(LockState::Unlocked)),
        }
    }
}

/// Fans lifecycle commands out to the participant fleet: validates the
/// transition, allocates sequence numbers, arms the pending-operation
/// deadlines, and publishes one batched StateChange per owning participant.
pub struct CommandDispatcher {
    store: Arc<dyn InstanceStore>,
    registry: Arc<InstanceRegistry>,
    transport: Arc<dyn Transport>,
    config: Config,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        registry: Arc<InstanceRegistry>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            config,
        }
    }

    pub async fn dispatch(&self, instance_id: InstanceId, command: LifecycleCommand) -> Result<()> {
        let _guard = self.registry.lock_instance(instance_id).await;

        let mut instance = self
            .store
            .find_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound { instance_id })?;
        if self.registry.has_pending(instance_id) {
            return Err(OrchestratorError::OperationInProgress { instance_id });
        }

        let (target_deploy, target_lock) = command.targets();
        let transitional_deploy = target_deploy
            .map(|t| validate_deploy(&instance, t))
            .transpose()?;
        let transitional_lock = target_lock
            .map(|t| validate_lock(&instance, t))
            .transpose()?;

        if instance.elements.is_empty() {
            return self.finish_empty(instance, command).await;
        }

        let now = Utc::now();
        let deadline = now + Duration::milliseconds(self.config.max_operation_wait_ms as i64);
        let mut ops = Vec::with_capacity(instance.elements.len());
        let mut batches: HashMap<ParticipantId, Vec<ElementCommand>> = HashMap::new();

        for element in instance.elements.values_mut() {
            let sequence = element.next_sequence();
            if let Some(state) = transitional_deploy {
                element.deploy_state = state;
            }
            if let Some(state) = transitional_lock {
                element.lock_state = state;
            }
            element.result = StateChangeResult::NoError;
            element.message.clear();
            element.last_updated = now;

            ops.push(PendingOperation {
                element_id: element.element_id,
                participant_id: element.participant_id,
                sequence,
                target_deploy,
                target_lock,
                issued_at: now,
                deadline,
                retries: 0,
            });
            batches
                .entry(element.participant_id)
                .or_default()
                .push(ElementCommand {
                    element_id: element.element_id,
                    sequence,
                    target_deploy,
                    target_lock,
                    in_properties: (target_deploy == Some(DeployState::Deployed))
                        .then(|| element.in_properties.clone()),
                });
        }

        if let Some(state) = transitional_deploy {
            instance.deploy_state = state;
        }
        if let Some(state) = transitional_lock {
            instance.lock_state = state;
        }
        instance.result = StateChangeResult::NoError;
        instance.last_updated = now;

        self.store.save_instance(&instance).await?;
        self.registry.insert_pending(instance_id, ops);

        let participant_count = batches.len();
        for (participant_id, elements) in batches {
            self.publish_state_change(instance_id, participant_id, elements)
                .await?;
        }
        log::info!(
            "dispatched {:?} for instance {} to {} participants",
            command,
            instance_id,
            participant_count
        );
        Ok(())
    }

    /// Pushes element definitions and input properties to the owning
    /// participants, one update message each. Issued before the first
    /// deploy; re-issuable any time a participant needs re-seeding.
    pub async fn distribute(&self, instance_id: InstanceId) -> Result<()> {
        let _guard = self.registry.lock_instance(instance_id).await;

        let instance = self
            .store
            .find_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound { instance_id })?;

        let mut batches: HashMap<ParticipantId, Vec<ElementUpdate>> = HashMap::new();
        for element in instance.elements.values() {
            batches
                .entry(element.participant_id)
                .or_default()
                .push(ElementUpdate {
                    element_id: element.element_id,
                    definition: element.definition.clone(),
                    definition_version: element.definition_version.clone(),
                    in_properties: element.in_properties.clone(),
                });
        }

        let participant_count = batches.len();
        for (participant_id, elements) in batches {
            let msg = Message::new(
                Some(participant_id),
                MessageBody::AutomationCompositionUpdate(CompositionUpdate {
                    instance_id,
                    elements,
                }),
            );
            self.transport
                .publish(&self.config.topic, msg.to_json()?)
                .await?;
        }
        log::info!(
            "distributed definitions for instance {} to {} participants",
            instance_id,
            participant_count
        );
        Ok(())
    }

    /// Also used by the supervisor to re-issue expired commands.
    pub(crate) async fn publish_state_change(
        &self,
        instance_id: InstanceId,
        participant_id: ParticipantId,
        elements: Vec<ElementCommand>,
    ) -> Result<()> {
        let msg = Message::new(
            Some(participant_id),
            MessageBody::AutomationCompositionStateChange(CompositionStateChange {
                instance_id,
                elements,
            }),
        );
        self.transport
            .publish(&self.config.topic, msg.to_json()?)
            .await
    }

    /// An instance with no elements has no participant round trip: it
    /// reaches the target stable state directly.
    async fn finish_empty(
        &self,
        mut instance: CompositionInstance,
        command: LifecycleCommand,
    ) -> Result<()> {
        let instance_id = instance.instance_id;
        match command {
            LifecycleCommand::Delete => {
                self.store.delete_instance(instance_id).await?;
                self.registry.forget(instance_id);
            }
            LifecycleCommand::Deploy => {
                instance.deploy_state = DeployState::Deployed;
                instance.lock_state = LockState::Locked;
                self.store.save_instance(&instance).await?;
            }
            LifecycleCommand::Undeploy => {
                instance.deploy_state = DeployState::Undeployed;
                instance.lock_state = LockState::Unlocked;
                self.store.save_instance(&instance).await?;
            }
            LifecycleCommand::Lock => {
                instance.lock_state = LockState::Locked;
                self.store.save_instance(&instance).await?;
            }
            LifecycleCommand::Unlock => {
                instance.lock_state = LockState::Unlocked;
                self.store.save_instance(&instance).await?;
            }
        }
        log::info!(
            "instance {} has no elements, {:?} completed directly",
            instance_id,
            command
        );
        Ok(())
    }
}
