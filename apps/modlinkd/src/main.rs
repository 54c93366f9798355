use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use modlink_events::ChannelEventSink;
use modlink_host::{FileConfigStore, HostBuilder, ModuleHost};
use modlink_protocol::event::{
    Authenticate, CompatibilityRequest, ConfigCommitRequest, InputText, ModuleAnnounce,
    ModuleStatus, OutputChat,
};
use modlink_protocol::{
    EventEnvelope, EventId, ModuleConfigEnvelope, ModuleConfigSchema, ModuleDependency, ModuleId,
    ModuleIdentity, ModulePhase, PluginIdentity, ProtocolEvent, RouteConfig, RouteDestination,
    SparkNotify, SparkUrgency,
};
use modlink_runtime::{HostConfig, ROLE_LABEL, SparkAction, SparkReceiver};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "modlinkd")]
#[command(about = "modlink host demo daemon")]
struct Cli {
    /// Host config (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
    /// Directory for the delivery journal.
    #[arg(long)]
    journal: Option<PathBuf>,
    /// Directory for persisted module configs.
    #[arg(long)]
    state: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).compact().init();
    }

    let config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    let protocol_version = config.protocol_version.clone();
    let api_version = config.api_version.clone();

    let sink = Arc::new(ChannelEventSink::new());
    let mut builder = HostBuilder::new().config(config).sink(sink.clone());
    if let Some(journal) = &cli.journal {
        builder = builder.delivery_log(journal);
    }
    if let Some(state) = &cli.state {
        builder = builder.config_store(Arc::new(FileConfigStore::new(state)));
    }
    let host = builder.build()?;

    let brain = ModuleIdentity::new("brain", PluginIdentity::new("llm").with_version("0.4.0"))
        .with_label(ROLE_LABEL, "llm:orchestrator");
    let bot = ModuleIdentity::new(
        "telegram-bot",
        PluginIdentity::new("telegram").with_version("1.2.0"),
    )
    .with_label("env", "prod");

    let mut tasks = Vec::new();
    for identity in [&brain, &bot] {
        let inbox = sink.register(identity.id.clone());
        tasks.push(tokio::spawn(simulate(host.clone(), identity.clone(), inbox)));
    }

    handshake(&host, &brain, &protocol_version, &api_version, Vec::new(), None).await?;
    handshake(
        &host,
        &bot,
        &protocol_version,
        &api_version,
        vec![ModuleDependency::required("llm:orchestrator")],
        Some(ModuleConfigSchema::new(
            "telegram",
            1,
            Some(json!({
                "type": "object",
                "required": ["token"],
                "properties": {"token": {"type": "string"}}
            })),
        )),
    )
    .await?;

    wait_until_ready(&host, &[brain.id.clone(), bot.id.clone()]).await?;
    info!("all modules ready");

    let question = EventEnvelope::new(ProtocolEvent::InputText(InputText {
        text: "what's on my calendar?".to_owned(),
        overrides: None,
        context_updates: Vec::new(),
    }))
    .with_route(RouteConfig::to(vec![RouteDestination::Id(brain.id.to_string())]));
    let outcome = host.handle(&bot.id, question).await?;
    info!(outcome = ?outcome, "input routed");

    let now = Utc::now().timestamp_millis();
    let nudge = EventEnvelope::new(ProtocolEvent::SparkNotify(SparkNotify {
        id: EventId::default(),
        event_id: EventId::default(),
        kind: "reminder".to_owned(),
        urgency: SparkUrgency::Soon,
        headline: "stand-up in five minutes".to_owned(),
        note: None,
        payload: None,
        destinations: None,
        requires_ack: true,
        ttl_ms: Some(60_000),
        issued_at: Some(now),
    }))
    .with_route(RouteConfig::to(vec![RouteDestination::Id(bot.id.to_string())]));
    let outcome = host.handle(&brain.id, nudge).await?;
    info!(outcome = ?outcome, "spark notify sent");

    tokio::time::sleep(Duration::from_millis(100)).await;
    for module in [&brain.id, &bot.id] {
        host.close_session(module, "demo finished").await?;
        sink.unregister(module);
    }
    for task in tasks {
        if let Err(error) = task.await {
            warn!(%error, "module task stopped");
        }
    }
    Ok(())
}

async fn handshake(
    host: &ModuleHost,
    identity: &ModuleIdentity,
    protocol_version: &str,
    api_version: &str,
    dependencies: Vec<ModuleDependency>,
    config_schema: Option<ModuleConfigSchema>,
) -> Result<()> {
    let module = identity.id.clone();
    host.open_session(module.clone(), Some("demo".to_owned())).await?;
    host.handle(
        &module,
        EventEnvelope::new(ProtocolEvent::CompatibilityRequest(CompatibilityRequest {
            protocol_version: protocol_version.to_owned(),
            api_version: api_version.to_owned(),
            supported_protocol_versions: Vec::new(),
            supported_api_versions: Vec::new(),
        })),
    )
    .await?;
    host.handle(
        &module,
        EventEnvelope::new(ProtocolEvent::Authenticate(Authenticate {
            token: "demo".to_owned(),
        })),
    )
    .await?;
    host.handle(
        &module,
        EventEnvelope::new(ProtocolEvent::Announce(ModuleAnnounce {
            name: module.to_string(),
            index: None,
            identity: identity.clone(),
            possible_events: Vec::new(),
            config_schema,
            dependencies,
        })),
    )
    .await?;
    Ok(())
}

async fn wait_until_ready(host: &ModuleHost, modules: &[ModuleId]) -> Result<()> {
    let all_ready = async {
        loop {
            if modules
                .iter()
                .all(|module| host.phase_of(module) == Some(ModulePhase::Ready))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(2), all_ready)
        .await
        .is_err()
    {
        let phases: Vec<_> = modules
            .iter()
            .map(|module| format!("{module}={:?}", host.phase_of(module)))
            .collect();
        bail!("modules did not become ready: {}", phases.join(", "));
    }
    Ok(())
}

/// A scripted module: logs every delivery and answers the host the way a
/// real module would.
async fn simulate(
    host: ModuleHost,
    identity: ModuleIdentity,
    mut inbox: UnboundedReceiver<EventEnvelope>,
) {
    let mut spark = SparkReceiver::new(host.config().dedupe_capacity);
    while let Some(envelope) = inbox.recv().await {
        let rendered = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_owned());
        info!(
            module_id = %identity.id,
            event_type = envelope.event_type(),
            envelope = %rendered,
            "delivery"
        );
        if let Err(error) = react(&host, &identity, &mut spark, &envelope).await {
            warn!(module_id = %identity.id, %error, "module reaction failed");
        }
    }
}

/// Address `event` back to whoever sent `envelope`.
fn to_source(envelope: &EventEnvelope, event: ProtocolEvent) -> EventEnvelope {
    let answer = EventEnvelope::new(event);
    match envelope.metadata.source.as_ref() {
        Some(source) => answer.with_route(RouteConfig::to(vec![RouteDestination::Id(
            source.id.to_string(),
        )])),
        None => answer,
    }
}

async fn run_spark_actions(
    host: &ModuleHost,
    identity: &ModuleIdentity,
    spark: &mut SparkReceiver,
    envelope: &EventEnvelope,
    actions: Vec<SparkAction>,
) -> Result<()> {
    for action in actions {
        match action {
            SparkAction::Emit(emit) => {
                host.handle(&identity.id, to_source(envelope, ProtocolEvent::SparkEmit(emit)))
                    .await
                    .context("failed reporting spark state")?;
            }
            SparkAction::Handle(notify) => {
                info!(module_id = %identity.id, headline = %notify.headline, "spark notify");
            }
            SparkAction::Execute(command) => {
                info!(module_id = %identity.id, intent = %command.intent, "spark command");
                if let Some(next) = spark.finish_activity() {
                    info!(module_id = %identity.id, action = ?next, "next spark action");
                }
            }
            other => info!(module_id = %identity.id, action = ?other, "spark action"),
        }
    }
    Ok(())
}

async fn react(
    host: &ModuleHost,
    identity: &ModuleIdentity,
    spark: &mut SparkReceiver,
    envelope: &EventEnvelope,
) -> Result<()> {
    let reply = match &envelope.event {
        ProtocolEvent::Status(status)
            if matches!(status.phase, ModulePhase::Prepared | ModulePhase::Configured) =>
        {
            Some(ProtocolEvent::StatusChange(ModuleStatus {
                identity: identity.clone(),
                phase: ModulePhase::Ready,
                reason: None,
                details: None,
            }))
        }
        ProtocolEvent::ConfigurationNeeded(needed) => {
            let base = needed.current.as_ref().map(|current| current.revision);
            let schema_version = needed.schema.as_ref().map_or(1, |schema| schema.version);
            let mut config = ModuleConfigEnvelope::full(
                "telegram",
                base.unwrap_or(0),
                schema_version,
                json!({"token": "demo-token"}),
            );
            config.base_revision = base;
            Some(ProtocolEvent::ConfigCommitRequest(ConfigCommitRequest {
                identity: identity.clone(),
                capability_id: None,
                config,
            }))
        }
        ProtocolEvent::SparkNotify(notify) => {
            let now = Utc::now().timestamp_millis();
            let actions = spark.receive_notify(notify.clone(), now, now);
            run_spark_actions(host, identity, spark, envelope, actions).await?;
            None
        }
        ProtocolEvent::SparkCommand(command) => {
            let actions = spark.receive_command(command.clone());
            run_spark_actions(host, identity, spark, envelope, actions).await?;
            None
        }
        ProtocolEvent::InputText(input) => {
            let answer = to_source(
                envelope,
                ProtocolEvent::OutputMessage(OutputChat {
                    message: Some(json!({
                        "role": "assistant",
                        "content": format!("no events for: {}", input.text),
                    })),
                    tool_calls: Vec::new(),
                    usage: None,
                    source_tags: Vec::new(),
                }),
            );
            host.handle(&identity.id, answer)
                .await
                .context("failed answering input")?;
            None
        }
        _ => None,
    };
    if let Some(event) = reply {
        host.handle(&identity.id, envelope.reply(event)).await?;
    }
    Ok(())
}
