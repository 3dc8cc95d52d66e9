use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};

use ensemble::participant::{
    ElementContext, ElementHandler, ElementStore, ParticipantIntermediary, StateReporter,
};
use ensemble::runtime::{LifecycleCommand, Runtime};
use ensemble::storage::InMemoryStore;
use ensemble::transport::InMemoryBus;
use ensemble::types::{
    CompositionDefinition, DefinitionId, DeployState, ElementDefinition, InstanceId, LockState,
    ParticipantId, StateChangeResult,
};
use ensemble::{Config, IntermediaryConfig};

#[derive(Parser)]
#[command(name = "ensemble")]
#[command(about = "Composition lifecycle orchestration runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full lifecycle against two in-process participants.
    Demo,
    /// Parse a composition definition file and report its contents.
    ValidateDefinition {
        #[arg(help = "Path to a YAML definition file")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo => run_demo().await?,
        Commands::ValidateDefinition { path } => validate_definition(&path)?,
    }

    Ok(())
}

async fn run_demo() -> Result<()> {
    let config = Config::from_env();
    let store = Arc::new(InMemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());

    let runtime = Arc::new(Runtime::new(store.clone(), bus.clone(), config.clone()));
    runtime.start().await;
    println!("Runtime listening on topic {}", config.topic);

    let compute = spawn_participant(
        &config,
        &bus,
        vec![
            "org.ensemble.element.HttpService".to_string(),
            "org.ensemble.element.Database".to_string(),
        ],
        "compute",
    )
    .await?;
    let policy = spawn_participant(
        &config,
        &bus,
        vec!["org.ensemble.element.PolicyGate".to_string()],
        "policy",
    )
    .await?;

    for _ in 0..200 {
        if runtime.list_participants().await?.len() == 2 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let participants = runtime.list_participants().await?;
    anyhow::ensure!(participants.len() == 2, "participants did not register");
    println!("{} participants registered", participants.len());

    let definition = demo_definition();
    runtime.prime_definition(&definition).await?;
    let instance = runtime
        .create_instance(definition.id, "checkout-stack".to_string())
        .await?;
    println!(
        "Instance {} created with {} elements",
        instance.instance_id,
        instance.elements.len()
    );

    runtime.distribute(instance.instance_id).await?;
    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Deploy)
        .await?;
    await_instance_state(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Locked,
    )
    .await?;
    println!("Instance deployed and locked");

    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Unlock)
        .await?;
    await_instance_state(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Unlocked,
    )
    .await?;
    println!("Instance unlocked");

    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Lock)
        .await?;
    await_instance_state(
        &runtime,
        instance.instance_id,
        DeployState::Deployed,
        LockState::Locked,
    )
    .await?;
    println!("Instance locked again");

    runtime
        .dispatch(instance.instance_id, LifecycleCommand::Undeploy)
        .await?;
    await_instance_state(
        &runtime,
        instance.instance_id,
        DeployState::Undeployed,
        LockState::Unlocked,
    )
    .await?;
    println!("Instance undeployed");

    runtime.delete_instance(instance.instance_id).await?;
    await_removed(&runtime, instance.instance_id).await?;
    println!("Instance deleted");

    compute.stop().await?;
    policy.stop().await?;
    println!("Demo complete");
    Ok(())
}

fn validate_definition(path: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let definition: CompositionDefinition = serde_yaml::from_str(&raw)?;

    println!(
        "Definition {} ({}) version {}",
        definition.name, definition.id, definition.version
    );
    for element in &definition.elements {
        println!(
            "  element {} v{} ({} properties)",
            element.id,
            element.version,
            element.properties.len()
        );
    }
    Ok(())
}

async fn spawn_participant(
    config: &Config,
    bus: &Arc<InMemoryBus>,
    supported_element_types: Vec<String>,
    name: &'static str,
) -> Result<Arc<ParticipantIntermediary>> {
    let mut intermediary_config =
        IntermediaryConfig::new(ParticipantId::new_v4(), supported_element_types);
    intermediary_config.topic = config.topic.clone();

    let store = ElementStore::new();
    let reporter = Arc::new(StateReporter::new(
        &intermediary_config,
        bus.clone(),
        store.clone(),
    ));
    let handler = Arc::new(DemoHandler {
        name,
        reporter: reporter.clone(),
    });
    let intermediary = Arc::new(ParticipantIntermediary::new(
        intermediary_config,
        bus.clone(),
        store,
        reporter,
        handler,
    ));
    intermediary.start().await?;
    println!("Participant {} started", name);
    Ok(intermediary)
}

async fn await_instance_state(
    runtime: &Arc<Runtime>,
    instance_id: InstanceId,
    deploy: DeployState,
    lock: LockState,
) -> Result<()> {
    for _ in 0..200 {
        let instance = runtime.get_instance(instance_id).await?;
        if instance.deploy_state == deploy
            && instance.lock_state == lock
            && instance.result == StateChangeResult::NoError
        {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!(
        "instance {} did not reach {:?}/{:?}",
        instance_id,
        deploy,
        lock
    )
}

async fn await_removed(runtime: &Arc<Runtime>, instance_id: InstanceId) -> Result<()> {
    for _ in 0..200 {
        if runtime.get_instance(instance_id).await.is_err() {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("instance {} was not removed", instance_id)
}

fn demo_definition() -> CompositionDefinition {
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

struct DemoHandler {
    name: &'static str,
    reporter: Arc<StateReporter>,
}

#[async_trait]
impl ElementHandler for DemoHandler {
    async fn deploy(&self, context: ElementContext) -> Result<()> {
        sleep(Duration::from_millis(25)).await;
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
        println!("  [{}] deployed element {}", self.name, context.element_id);
        Ok(())
    }

    async fn undeploy(&self, context: ElementContext) -> Result<()> {
        sleep(Duration::from_millis(10)).await;
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
        println!("  [{}] undeployed element {}", self.name, context.element_id);
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
        println!("  [{}] deleted element {}", self.name, context.element_id);
        Ok(())
    }
}
