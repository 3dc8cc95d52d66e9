use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::config::IntermediaryConfig;
use crate::error::{OrchestratorError, Result};
use crate::protocol::{deploy_fallback, lock_fallback};
use crate::transport::Transport;
use crate::types::{
    CompositionStateChange, CompositionUpdate, DeployState, ElementCommand, ElementId, InstanceId,
    LockState, Message, MessageBody, ParticipantRegister, ParticipantState, StateChangeResult,
};

use super::handler::{ElementContext, ElementHandler};
use super::reporter::StateReporter;
use super::store::{CommandDisposition, ElementStore, LocalElement};

/// The protocol library each participant process embeds: consumes commands
/// for locally owned elements, drives the element handler, and keeps the
/// runtime informed through the reporter. One instance per process.
pub struct ParticipantIntermediary {
    config: IntermediaryConfig,
    transport: Arc<dyn Transport>,
    store: ElementStore,
    reporter: Arc<StateReporter>,
    handler: Arc<dyn ElementHandler>,
    executions: Mutex<HashMap<ElementId, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ParticipantIntermediary {
    pub fn new(
        config: IntermediaryConfig,
        transport: Arc<dyn Transport>,
        store: ElementStore,
        reporter: Arc<StateReporter>,
        handler: Arc<dyn ElementHandler>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            reporter,
            handler,
            executions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes, spawns the inbound and heartbeat loops, then announces
    /// this participant to the runtime.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut rx = self.transport.subscribe(&self.config.topic).await;

        let intermediary = Arc::clone(self);
        let inbound = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                intermediary.route(&payload).await;
            }
        });

        let reporter = Arc::clone(&self.reporter);
        let heart_beat_ms = self.config.heart_beat_ms;
        let heartbeat = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(heart_beat_ms));
            loop {
                interval.tick().await;
                if let Err(e) = reporter.publish_status().await {
                    log::error!("heartbeat failed: {}", e);
                }
            }
        });

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(inbound);
            tasks.push(heartbeat);
        }

        let msg = Message::new(
            Some(self.config.participant_id),
            MessageBody::ParticipantRegister(ParticipantRegister {
                supported_element_types: self.config.supported_element_types.clone(),
            }),
        );
        self.transport
            .publish(&self.config.topic, msg.to_json()?)
            .await?;
        log::info!("participant {} registering", self.config.participant_id);
        Ok(())
    }

    /// Announces departure and tears the loops down. In-flight handler work
    /// is aborted best-effort.
    pub async fn stop(&self) -> Result<()> {
        let msg = Message::new(
            Some(self.config.participant_id),
            MessageBody::ParticipantDeregister,
        );
        self.transport
            .publish(&self.config.topic, msg.to_json()?)
            .await?;
        self.reporter.set_state(ParticipantState::Terminated);

        for (_, handle) in self.executions.lock().unwrap().drain() {
            handle.abort();
        }
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        log::info!("participant {} stopped", self.config.participant_id);
        Ok(())
    }

    async fn route(self: &Arc<Self>, payload: &str) {
        let msg = match Message::from_json(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("undecodable message dropped: {}", e);
                return;
            }
        };
        if let Err(e) = self.handle_message(msg).await {
            log::warn!("message handling failed: {}", e);
        }
    }

    /// Routes one decoded message. Anything targeted at another participant,
    /// and every participant-origin type on the shared topic, falls through.
    pub async fn handle_message(self: &Arc<Self>, msg: Message) -> Result<()> {
        if let Some(target) = msg.participant_id {
            if target != self.config.participant_id {
                return Ok(());
            }
        }
        match msg.body {
            MessageBody::AutomationCompositionUpdate(update) => self.handle_update(update),
            MessageBody::AutomationCompositionStateChange(change) => {
                self.handle_state_change(change).await
            }
            MessageBody::ParticipantStatusReq => self.reporter.publish_status().await,
            MessageBody::ParticipantRegisterAck(_) => {
                self.reporter.set_state(ParticipantState::Passive);
                log::info!("participant {} registered", self.config.participant_id);
                Ok(())
            }
            MessageBody::ParticipantDeregisterAck(_) => {
                log::info!("participant {} deregistered", self.config.participant_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_update(&self, update: CompositionUpdate) -> Result<()> {
        let count = update.elements.len();
        for element in &update.elements {
            self.store.upsert_from_update(update.instance_id, element);
        }
        log::info!(
            "received {} element definitions for instance {}",
            count,
            update.instance_id
        );
        Ok(())
    }

    async fn handle_state_change(self: &Arc<Self>, change: CompositionStateChange) -> Result<()> {
        for command in change.elements {
            match self.store.record_command(&command) {
                CommandDisposition::Accept(element) => {
                    let element_id = element.element_id;
                    // a newer sequence supersedes whatever is still running
                    if let Some(stale) = self.executions.lock().unwrap().remove(&element_id) {
                        stale.abort();
                    }
                    let intermediary = Arc::clone(self);
                    let instance_id = change.instance_id;
                    let handle = tokio::spawn(async move {
                        intermediary.execute(instance_id, command, element).await;
                    });
                    let mut executions = self.executions.lock().unwrap();
                    executions.retain(|_, running| !running.is_finished());
                    executions.insert(element_id, handle);
                }
                CommandDisposition::ReAck(element) => {
                    log::debug!(
                        "re-acking completed sequence {} for element {}",
                        command.sequence,
                        command.element_id
                    );
                    self.reporter.publish_ack(&element).await?;
                }
                CommandDisposition::InFlight => {
                    log::debug!(
                        "sequence {} for element {} already in flight",
                        command.sequence,
                        command.element_id
                    );
                }
                CommandDisposition::Superseded => {
                    log::debug!(
                        "stale sequence {} for element {} ignored",
                        command.sequence,
                        command.element_id
                    );
                }
                CommandDisposition::Unknown => {
                    log::debug!("element {} not owned by this participant", command.element_id);
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, instance_id: InstanceId, command: ElementCommand, element: LocalElement) {
        let context = ElementContext {
            instance_id,
            element_id: element.element_id,
            sequence: command.sequence,
            in_properties: element.in_properties,
        };
        let outcome = match (command.target_deploy, command.target_lock) {
            (Some(DeployState::Deployed), _) => self.handler.deploy(context).await,
            (Some(DeployState::Undeployed), _) => self.handler.undeploy(context).await,
            (Some(DeployState::Deleting), _) => self.handler.delete(context).await,
            (_, Some(LockState::Locked)) => self.handler.lock(context).await,
            (_, Some(LockState::Unlocked)) => self.handler.unlock(context).await,
            _ => {
                log::warn!("command for element {} names no target state", command.element_id);
                return;
            }
        };
        if let Err(error) = outcome {
            self.report_failure(instance_id, &command, error).await;
        }
    }

    async fn report_failure(
        &self,
        instance_id: InstanceId,
        command: &ElementCommand,
        error: anyhow::Error,
    ) {
        let reason = OrchestratorError::ElementExecutionFailed {
            element_id: command.element_id,
            message: error.to_string(),
        }
        .to_string();

        let reported = if let Some(target) = command.target_deploy {
            self.reporter
                .deploy_state_changed(
                    instance_id,
                    command.element_id,
                    command.sequence,
                    deploy_fallback(target),
                    StateChangeResult::Failed,
                    &reason,
                )
                .await
        } else if let Some(target) = command.target_lock {
            self.reporter
                .lock_state_changed(
                    instance_id,
                    command.element_id,
                    command.sequence,
                    lock_fallback(target),
                    StateChangeResult::Failed,
                    &reason,
                )
                .await
        } else {
            Ok(())
        };
        if let Err(e) = reported {
            log::error!(
                "failed to report element {} failure: {}",
                command.element_id,
                e
            );
        }
    }
}
