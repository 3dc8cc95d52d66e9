use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::storage::InstanceStore;
use crate::types::{DeployState, ElementCommand, InstanceId, PendingOperation, StateChangeResult};

use super::dispatcher::CommandDispatcher;
use super::participants::ParticipantRegistry;
use super::registry::InstanceRegistry;

/// Periodic reconciliation sweep over participant liveness and in-flight
/// operations. Expired commands are re-issued up to the retry limit, then
/// concluded with a timeout verdict exactly once; operations owned by a
/// dead or unregistered participant are concluded immediately.
pub struct Supervisor {
    store: Arc<dyn InstanceStore>,
    registry: Arc<InstanceRegistry>,
    participants: Arc<ParticipantRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    config: Config,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        registry: Arc<InstanceRegistry>,
        participants: Arc<ParticipantRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            participants,
            dispatcher,
            config,
        }
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(
            self.config.supervision_interval_ms,
        ));
        loop {
            interval.tick().await;
            if let Err(e) = self.scan().await {
                log::error!("supervision cycle failed: {}", e);
            }
        }
    }

    /// One supervision cycle. Public so tests drive cycles deterministically
    /// instead of sleeping out real deadlines.
    pub async fn scan(&self) -> Result<()> {
        let now = Utc::now();
        let off_line: HashSet<_> = self.participants.scan(now).await?.into_iter().collect();
        let registered: HashSet<_> = self
            .store
            .list_participants()
            .await?
            .iter()
            .map(|p| p.participant_id)
            .collect();

        for instance_id in self.registry.instances_with_pending() {
            let _guard = self.registry.lock_instance(instance_id).await;

            for op in self.registry.pending_for(instance_id) {
                let owner_gone = off_line.contains(&op.participant_id)
                    || !registered.contains(&op.participant_id);

                if owner_gone {
                    let reason = OrchestratorError::ParticipantUnresponsive {
                        participant_id: op.participant_id,
                    };
                    self.conclude(instance_id, &op, &reason.to_string()).await?;
                } else if op.deadline <= now {
                    if op.retries < self.config.operation_retry_limit {
                        self.retry(instance_id, &op, now).await?;
                    } else {
                        let reason = format!("no report after {} attempts", op.retries + 1);
                        self.conclude(instance_id, &op, &reason).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn conclude(
        &self,
        instance_id: InstanceId,
        op: &PendingOperation,
        message: &str,
    ) -> Result<()> {
        match self
            .registry
            .apply_verdict(
                instance_id,
                op.element_id,
                op.sequence,
                StateChangeResult::Timeout,
                message,
            )
            .await
        {
            // the ack won the race against the verdict
            Err(OrchestratorError::StaleMessage { .. }) => {
                self.registry.remove_pending(instance_id, op.element_id);
                Ok(())
            }
            other => other,
        }
    }

    async fn retry(
        &self,
        instance_id: InstanceId,
        op: &PendingOperation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(mut instance) = self.store.find_instance(instance_id).await? else {
            self.registry.forget(instance_id);
            return Ok(());
        };
        let Some(element) = instance.elements.get_mut(&op.element_id) else {
            self.registry.remove_pending(instance_id, op.element_id);
            return Ok(());
        };

        let sequence = element.next_sequence();
        let in_properties = (op.target_deploy == Some(DeployState::Deployed))
            .then(|| element.in_properties.clone());
        element.last_updated = now;
        self.store.save_instance(&instance).await?;

        self.registry.insert_pending(
            instance_id,
            vec![PendingOperation {
                sequence,
                issued_at: now,
                deadline: now + Duration::milliseconds(self.config.max_operation_wait_ms as i64),
                retries: op.retries + 1,
                ..op.clone()
            }],
        );

        self.dispatcher
            .publish_state_change(
                instance_id,
                op.participant_id,
                vec![ElementCommand {
                    element_id: op.element_id,
                    sequence,
                    target_deploy: op.target_deploy,
                    target_lock: op.target_lock,
                    in_properties,
                }],
            )
            .await?;

        log::warn!(
            "re-issued command for element {} (retry {} of {})",
            op.element_id,
            op.retries + 1,
            self.config.operation_retry_limit
        );
        Ok(())
    }
}
