//! End-to-end lifecycle tests over the shared in-memory topic.
//!
//! Runs the real runtime against in-process participant intermediaries:
//! - Deploy / unlock / lock / undeploy / delete convergence
//! - Failed handlers reporting the prior stable state
//! - Timeout verdicts for participants that accept but never report
//! - Stale sequence rejection
//! - Property updates pushed through a redeploy
//! - Definition loading from YAML

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};

use ensemble::participant::{
    ElementContext, ElementHandler, ElementStore, ParticipantIntermediary, StateReporter,
};
use ensemble::runtime::{LifecycleCommand, Runtime};
use ensemble::storage::InMemoryStore;
use ensemble::transport::InMemoryBus;
use ensemble::types::{
    CompositionDefinition, CompositionInstance, DefinitionId, DeployState, Element, ElementAck,
    ElementDefinition, InstanceId, LockState, ParticipantId, StateChangeResult,
};
use ensemble::{Config, IntermediaryConfig, OrchestratorError};

/// Scripted handler that reports success for every operation. Deploys can
/// be failed on demand through the shared flag.
struct ScriptedHandler {
    name: &'static str,
    reporter: Arc<StateReporter>,
    fail_deploys: Arc<AtomicBool>,
}

#[async_trait]
impl ElementHandler for ScriptedHandler {
    async fn deploy(&self, context: ElementContext) -> Result<()> {
        if self.fail_deploys.load(Ordering::SeqCst) {
            anyhow::bail!("scripted deploy failure on {}", self.name);
        }
        let mut out_properties = Map::new();
        out_properties.insert(
            "managed_by".to_string(),
            Value::String(self.name.to_string()),
        );
        self.reporter
            .element_out_properties(context.element_id, out_properties)
            .await?;
        self.reporter
            .deploy_state_changed(
                context.instance_id,
                context.element_id,
                context.sequence,
                DeployState::Deployed,
                StateChangeResult::NoError,
                "Deployed",
            )
            .await?;
        Ok(())
    }

    async fn undeploy(&self, context: ElementContext) -> Result<()> {
        self.reporter
            .deploy_state_changed(
                context.instance_id,
                context.element_id,
                context.sequence,
                DeployState::Undeployed,
                StateChangeResult::NoError,
                "Undeployed",
            )
            .await?;
        Ok(())
    }

    async fn lock(&self, context: ElementContext) -> Result<()> {
        self.reporter
            .lock_state_changed(
                context.instance_id,
                context.element_id,
                context.sequence,
                LockState::Locked,
                StateChangeResult::NoError,
                "Locked",
            )
            .await?;
        Ok(())
    }

    async fn unlock(&self, context: ElementContext) -> Result<()> {
        self.reporter
            .lock_state_changed(
                context.instance_id,
                context.element_id,
                context.sequence,
                LockState::Unlocked,
                StateChangeResult::NoError,
                "Unlocked",
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, context: ElementContext) -> Result<()> {
        self.reporter
            .deploy_state_changed(
                context.instance_id,
                context.element_id,
                context.sequence,
                DeployState::Deleting,
                StateChangeResult::NoError,
                "Deleted",
            )
            .await?;
        Ok(())
    }
}

/// Handler that accepts every command and never reports back.
struct SilentHandler;

#[async_trait]
impl ElementHandler for SilentHandler {
    async fn deploy(&self, _context: ElementContext) -> Result<()> {
        Ok(())
    }

    async fn undeploy(&self, _context: ElementContext) -> Result<()> {
        Ok(())
    }

    async fn lock(&self, _context: ElementContext) -> Result<()> {
        Ok(())
    }

    async fn unlock(&self, _context: ElementContext) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _context: ElementContext) -> Result<()> {
        Ok(())
    }
}

async fn start_runtime(config: &Config) -> (Arc<Runtime>, Arc<InMemoryBus>) {
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let runtime = Arc::new(Runtime::new(store, bus.clone(), config.clone()));
    runtime.start().await;
    (runtime, bus)
}

async fn spawn_scripted(
    config: &Config,
    bus: &Arc<InMemoryBus>,
    name: &'static str,
    supported: Vec<&str>,
) -> (ParticipantId, Arc<AtomicBool>) {
    let participant_id = ParticipantId::new_v4();
    let mut intermediary_config = IntermediaryConfig::new(
        participant_id,
        supported.into_iter().map(String::from).collect(),
    );
    intermediary_config.topic = config.topic.clone();

    let store = ElementStore::new();
    let reporter = Arc::new(StateReporter::new(
        &intermediary_config,
        bus.clone(),
        store.clone(),
    ));
    let fail_deploys = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(ScriptedHandler {
        name,
        reporter: reporter.clone(),
        fail_deploys: fail_deploys.clone(),
    });
    let intermediary = Arc::new(ParticipantIntermediary::new(
        intermediary_config,
        bus.clone(),
        store,
        reporter,
        handler,
    ));
    intermediary.start().await.unwrap();
    (participant_id, fail_deploys)
}

async fn spawn_silent(
    config: &Config,
    bus: &Arc<InMemoryBus>,
    supported: Vec<&str>,
) -> ParticipantId {
    let participant_id = ParticipantId::new_v4();
    let mut intermediary_config = IntermediaryConfig::new(
        participant_id,
        supported.into_iter().map(String::from).collect(),
    );
    intermediary_config.topic = config.topic.clone();

    let store = ElementStore::new();
    let reporter = Arc::new(StateReporter::new(
        &intermediary_config,
        bus.clone(),
        store.clone(),
    ));
    let intermediary = Arc::new(ParticipantIntermediary::new(
        intermediary_config,
        bus.clone(),
        store,
        reporter,
        Arc::new(SilentHandler),
    ));
    intermediary.start().await.unwrap();
    participant_id
}

async fn await_participants(runtime: &Arc<Runtime>, count: usize) {
    for _ in 0..400 {
        if runtime.list_participants().await.unwrap().len() >= count {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("{} participants never registered", count);
}

async fn await_converged(
    runtime: &Arc<Runtime>,
    instance_id: InstanceId,
    deploy: DeployState,
    lock: LockState,
) -> CompositionInstance {
    let mut last = None;
    for _ in 0..400 {
        let instance = runtime.get_instance(instance_id).await.unwrap();
        if instance.deploy_state == deploy
            && instance.lock_state == lock
            && instance.result == StateChangeResult::NoError
        {
            return instance;
        }
        last = Some(instance);
        sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "instance never reached {:?}/{:?}, last seen {:?}",
        deploy, lock, last
    );
}

async fn await_degraded(runtime: &Arc<Runtime>, instance_id: InstanceId) -> CompositionInstance {
    for _ in 0..400 {
        let instance = runtime.get_instance(instance_id).await.unwrap();
        if instance.result == StateChangeResult::Failed
            && !runtime.registry().has_pending(instance_id)
        {
            return instance;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("instance never degraded to FAILED");
}

async fn await_removed(runtime: &Arc<Runtime>, instance_id: InstanceId) {
    for _ in 0..400 {
        if runtime.get_instance(instance_id).await.is_err() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("instance was never removed");
}

fn checkout_definition() -> CompositionDefinition {
    let mut http_properties = Map::new();
    http_properties.insert("port".to_string(), Value::from(8443));

    CompositionDefinition {
        id: DefinitionId::new_v4(),
        name: "checkout-stack".to_string(),
        version: "1.0.0".to_string(),
        elements: vec![
            ElementDefinition {
                id: "org.ensemble.element.HttpService".to_string(),
                version: "1.0.0".to_string(),
                properties: http_properties,
            },
            ElementDefinition {
                id: "org.ensemble.element.Database".to_string(),
                version: "1.0.0".to_string(),
                properties: Map::new(),
            },
            ElementDefinition {
                id: "org.ensemble.element.PolicyGate".to_string(),
                version: "1.0.0".to_string(),
                properties: Map::new(),
            },
        ],
    }
}

fn element_of<'a>(instance: &'a CompositionInstance, element_type: &str) -> &'a Element {
    instance
        .elements
        .values()
        .find(|e| e.definition == element_type)
        .unwrap()
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_full_lifecycle_round_trip() {
    let config = Config::default();
    let (runtime, bus) = start_runtime(&config).await;
    spawn_scripted(
        &config,
        &bus,
        "compute",
        vec![
            "org.ensemble.element.HttpService",
            "org.ensemble.element.Database",
        ],
    )
    .await;
    spawn_scripted(&config, &bus, "policy", vec!["org.ensemble.element.PolicyGate"]).await;
    await_participants(&runtime, 2).await;

    // Prime and create
    let definition = checkout_definition();
    runtime.prime_definition(&definition).await.unwrap();
    let instance = runtime
        .create_instance(definition.id, "checkout".to_string())
        .await
        .unwrap();
    assert_eq!(instance.elements.len(), 3);
    assert_eq!(instance.deploy_state, DeployState::Commissioned);

    // Distribute and deploy
    runtime.distribute(instance.instance_id).await.unwrap();
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await
        .unwrap();
    let deployed = await_converged(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Locked,
    )
    .await;
    for element in deployed.elements.values() {
        assert_eq!(element.deploy_state, DeployState::Deployed);
        assert_eq!(element.lock_state, LockState::Locked);
        assert_eq!(element.result, StateChangeResult::NoError);
        assert_eq!(element.acked_sequence, 1);
        assert!(element.out_properties.contains_key("managed_by"));
    }
    assert!(!runtime.registry().has_pending(instance.instance_id));

    // Unlock, lock again
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Unlock)
        .await
        .unwrap();
    await_converged(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Unlocked,
    )
    .await;
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Lock)
        .await
        .unwrap();
    await_converged(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Locked,
    )
    .await;

    // Undeploy and delete
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Undeploy)
        .await
        .unwrap();
    let undeployed = await_converged(
        &runtime,
        instance.instance_id,
        DeployState::Undeployed,
        LockState::Unlocked,
    )
    .await;
    assert!(undeployed
        .elements
        .values()
        .all(|e| e.deploy_state == DeployState::Undeployed));

    runtime.delete_instance(instance.instance_id).await.unwrap();
    await_removed(&runtime, instance.instance_id).await;
    assert!(runtime.list_instances().await.unwrap().is_empty());
}

// ============================================================================
// Failure Handling
// ============================================================================

#[tokio::test]
async fn test_failed_deploy_degrades_instance() {
    let config = Config::default();
    let (runtime, bus) = start_runtime(&config).await;
    spawn_scripted(
        &config,
        &bus,
        "compute",
        vec![
            "org.ensemble.element.HttpService",
            "org.ensemble.element.Database",
        ],
    )
    .await;
    let (_, policy_fails) =
        spawn_scripted(&config, &bus, "policy", vec!["org.ensemble.element.PolicyGate"]).await;
    await_participants(&runtime, 2).await;

    let definition = checkout_definition();
    runtime.prime_definition(&definition).await.unwrap();
    let instance = runtime
        .create_instance(definition.id, "checkout".to_string())
        .await
        .unwrap();
    runtime.distribute(instance.instance_id).await.unwrap();

    policy_fails.store(true, Ordering::SeqCst);
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await
        .unwrap();
    let degraded = await_degraded(&runtime, instance.instance_id).await;

    // The failed element reports its prior stable state; the instance stays
    // parked in the transitional state with a degraded result.
    let failed = element_of(&degraded, "org.ensemble.element.PolicyGate");
    assert_eq!(failed.deploy_state, DeployState::Undeployed);
    assert_eq!(failed.result, StateChangeResult::Failed);
    assert!(failed.message.contains("execution failed"));
    assert_eq!(
        element_of(&degraded, "org.ensemble.element.HttpService").deploy_state,
        DeployState::Deployed
    );
    assert_eq!(degraded.deploy_state, DeployState::Deploying);
    assert_eq!(degraded.result, StateChangeResult::Failed);
}

#[tokio::test]
async fn test_redeploy_after_failure_converges() {
    let config = Config::default();
    let (runtime, bus) = start_runtime(&config).await;
    spawn_scripted(
        &config,
        &bus,
        "compute",
        vec![
            "org.ensemble.element.HttpService",
            "org.ensemble.element.Database",
        ],
    )
    .await;
    let (_, policy_fails) =
        spawn_scripted(&config, &bus, "policy", vec!["org.ensemble.element.PolicyGate"]).await;
    await_participants(&runtime, 2).await;

    let definition = checkout_definition();
    runtime.prime_definition(&definition).await.unwrap();
    let instance = runtime
        .create_instance(definition.id, "checkout".to_string())
        .await
        .unwrap();
    runtime.distribute(instance.instance_id).await.unwrap();

    policy_fails.store(true, Ordering::SeqCst);
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await
        .unwrap();
    await_degraded(&runtime, instance.instance_id).await;

    // A failed transition is re-dispatchable once the handler recovers.
    policy_fails.store(false, Ordering::SeqCst);
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await
        .unwrap();
    let deployed = await_converged(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Locked,
    )
    .await;
    for element in deployed.elements.values() {
        assert_eq!(element.deploy_state, DeployState::Deployed);
        assert_eq!(element.result, StateChangeResult::NoError);
        assert_eq!(element.acked_sequence, 2);
    }
}

#[tokio::test]
async fn test_silent_participant_gets_timeout_verdict() {
    let config = Config {
        max_operation_wait_ms: 0,
        operation_retry_limit: 0,
        supervision_interval_ms: 60_000,
        ..Config::default()
    };
    let (runtime, bus) = start_runtime(&config).await;
    let (compute_id, _) = spawn_scripted(
        &config,
        &bus,
        "compute",
        vec![
            "org.ensemble.element.HttpService",
            "org.ensemble.element.Database",
        ],
    )
    .await;
    spawn_silent(&config, &bus, vec!["org.ensemble.element.PolicyGate"]).await;
    await_participants(&runtime, 2).await;

    let definition = checkout_definition();
    runtime.prime_definition(&definition).await.unwrap();
    let instance = runtime
        .create_instance(definition.id, "checkout".to_string())
        .await
        .unwrap();
    runtime.distribute(instance.instance_id).await.unwrap();
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await
        .unwrap();

    // Wait until the healthy participant has acked both of its elements.
    for _ in 0..400 {
        let current = runtime.get_instance(instance.instance_id).await.unwrap();
        if current
            .elements
            .values()
            .filter(|e| e.participant_id == compute_id)
            .all(|e| e.deploy_state == DeployState::Deployed)
        {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    runtime.supervisor().scan().await.unwrap();

    let degraded = runtime.get_instance(instance.instance_id).await.unwrap();
    let timed_out = element_of(&degraded, "org.ensemble.element.PolicyGate");
    assert_eq!(timed_out.result, StateChangeResult::Timeout);
    assert_eq!(timed_out.deploy_state, DeployState::Deploying);
    assert!(timed_out.message.contains("no report"));
    assert_eq!(degraded.result, StateChangeResult::Failed);
    assert!(degraded
        .elements
        .values()
        .filter(|e| e.participant_id == compute_id)
        .all(|e| e.deploy_state == DeployState::Deployed
            && e.result == StateChangeResult::NoError));
    assert!(!runtime.registry().has_pending(instance.instance_id));
}

// ============================================================================
// Delivery Guarantees
// ============================================================================

#[tokio::test]
async fn test_stale_ack_is_rejected() {
    let config = Config::default();
    let (runtime, bus) = start_runtime(&config).await;
    spawn_scripted(
        &config,
        &bus,
        "compute",
        vec![
            "org.ensemble.element.HttpService",
            "org.ensemble.element.Database",
            "org.ensemble.element.PolicyGate",
        ],
    )
    .await;
    await_participants(&runtime, 1).await;

    let definition = checkout_definition();
    runtime.prime_definition(&definition).await.unwrap();
    let instance = runtime
        .create_instance(definition.id, "checkout".to_string())
        .await
        .unwrap();
    runtime.distribute(instance.instance_id).await.unwrap();
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await
        .unwrap();
    let deployed = await_converged(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Locked,
    )
    .await;
    let element = element_of(&deployed, "org.ensemble.element.HttpService");

    // Re-delivery of an already-applied sequence must not regress the state.
    let stale = ElementAck {
        instance_id: instance.instance_id,
        element_id: element.element_id,
        sequence: element.acked_sequence,
        deploy_state: DeployState::Undeployed,
        lock_state: LockState::Unlocked,
        result: StateChangeResult::NoError,
        message: "Undeployed".to_string(),
        out_properties: None,
    };
    let result = runtime.registry().apply_ack(&stale).await;
    assert!(matches!(result, Err(OrchestratorError::StaleMessage { .. })));

    let after = runtime.get_instance(instance.instance_id).await.unwrap();
    let untouched = element_of(&after, "org.ensemble.element.HttpService");
    assert_eq!(untouched.deploy_state, DeployState::Deployed);
    assert_eq!(untouched.lock_state, LockState::Locked);
    assert_eq!(after.deploy_state, DeployState::Deployed);
}

#[tokio::test]
async fn test_property_update_redeploys_element() {
    let config = Config::default();
    let (runtime, bus) = start_runtime(&config).await;
    spawn_scripted(
        &config,
        &bus,
        "compute",
        vec![
            "org.ensemble.element.HttpService",
            "org.ensemble.element.Database",
            "org.ensemble.element.PolicyGate",
        ],
    )
    .await;
    await_participants(&runtime, 1).await;

    let definition = checkout_definition();
    runtime.prime_definition(&definition).await.unwrap();
    let instance = runtime
        .create_instance(definition.id, "checkout".to_string())
        .await
        .unwrap();
    runtime.distribute(instance.instance_id).await.unwrap();
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await
        .unwrap();
    let deployed = await_converged(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Locked,
    )
    .await;
    let element_id = element_of(&deployed, "org.ensemble.element.HttpService").element_id;

    let mut properties = Map::new();
    properties.insert("port".to_string(), Value::from(9090));
    runtime
        .update_element_properties(instance.instance_id, element_id, properties)
        .await
        .unwrap();
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await
        .unwrap();

    let redeployed = await_converged(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Locked,
    )
    .await;
    let element = redeployed.elements.get(&element_id).unwrap();
    assert_eq!(element.acked_sequence, 2);
    assert_eq!(element.in_properties.get("port"), Some(&Value::from(9090)));
}

// ============================================================================
// Definition Loading
// ============================================================================

#[tokio::test]
async fn test_definition_loads_from_yaml() {
    let definition_id = DefinitionId::new_v4();
    let yaml = format!(
        r#"id: {definition_id}
name: checkout-stack
version: 1.2.0
elements:
  - id: org.ensemble.element.HttpService
    version: 1.0.0
    properties:
      port: 8443
  - id: org.ensemble.element.PolicyGate
    version: 1.0.0
"#
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let raw = std::fs::read_to_string(file.path()).unwrap();
    let definition: CompositionDefinition = serde_yaml::from_str(&raw).unwrap();
    assert_eq!(definition.id, definition_id);
    assert_eq!(definition.name, "checkout-stack");
    assert_eq!(definition.elements.len(), 2);
    assert_eq!(
        definition.elements[0].properties.get("port"),
        Some(&Value::from(8443))
    );
    assert!(definition.elements[1].properties.is_empty());

    // A loaded definition primes and instantiates like a built one.
    let config = Config::default();
    let (runtime, bus) = start_runtime(&config).await;
    spawn_scripted(
        &config,
        &bus,
        "compute",
        vec![
            "org.ensemble.element.HttpService",
            "org.ensemble.element.PolicyGate",
        ],
    )
    .await;
    await_participants(&runtime, 1).await;

    runtime.prime_definition(&definition).await.unwrap();
    let instance = runtime
        .create_instance(definition.id, "from-yaml".to_string())
        .await
        .unwrap();
    assert_eq!(instance.elements.len(), 2);
    assert!(instance
        .elements
        .values()
        .all(|e| e.deploy_state == DeployState::Commissioned));
    let http = element_of(&instance, "org.ensemble.element.HttpService");
    assert_eq!(http.in_properties.get("port"), Some(&Value::from(8443)));
}
