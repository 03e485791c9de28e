mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Mutex;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, SessionCommands};
use loomrun_config::{build_runnable, load_pipeline, ConfigModelResolver};
use loomrun_core::{resume, run, JsonlSessionService, Session, SessionService, TransferRegistry};
use loomrun_tools::{CalculateTool, MakePurchaseTool, RequestApprovalTool, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = loomrun_config::load(cli.config.as_deref())?;
    let services = JsonlSessionService::new(config.session.dir.clone());

    match &cli.command {
        Commands::Run {
            pipeline,
            session,
            input,
        } => run_pipeline(&config, &services, pipeline, session.as_deref(), input.as_deref()).await,
        Commands::Resume {
            session,
            input,
            pipeline,
        } => resume_pipeline(&config, &services, session, pipeline, input.as_deref()).await,
        Commands::Sessions { command } => match command {
            SessionCommands::List => list_sessions(&services).await,
            SessionCommands::Show { session_id } => show_session(&services, session_id).await,
        },
    }
}

fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(CalculateTool);
    registry.register(MakePurchaseTool);
    registry.register(RequestApprovalTool);
    registry
}

async fn run_pipeline(
    config: &loomrun_config::Config,
    services: &JsonlSessionService,
    pipeline_path: &std::path::Path,
    session_id: Option<&str>,
    input: Option<&str>,
) -> anyhow::Result<()> {
    let node = load_pipeline(pipeline_path)
        .with_context(|| format!("loading pipeline {}", pipeline_path.display()))?;
    let registry = builtin_registry();
    let resolver = ConfigModelResolver {
        default: &config.model,
        providers: &config.providers,
    };
    let runnable = build_runnable(&node, &registry, &resolver).context("resolving pipeline")?;

    let mut session = match session_id {
        Some(id) => services.load_session(id).await.context("loading session")?,
        None => services
            .create_session("loomrun")
            .await
            .context("creating session")?,
    };
    if let Some(text) = input {
        session.add_message(text).context("seeding user message")?;
    }
    let session_id = session.id.clone();
    let session = Arc::new(Mutex::new(session));

    let result = run(
        session.clone(),
        Arc::new(registry),
        Arc::new(TransferRegistry::new()),
        runnable,
    )
    .await
    .context("running pipeline")?;

    services
        .save_session(&*session.lock().await)
        .await
        .context("saving session")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    println!("session: {session_id}");
    Ok(())
}

async fn resume_pipeline(
    config: &loomrun_config::Config,
    services: &JsonlSessionService,
    session_id: &str,
    pipeline_path: &std::path::Path,
    input: Option<&str>,
) -> anyhow::Result<()> {
    let node = load_pipeline(pipeline_path)
        .with_context(|| format!("loading pipeline {}", pipeline_path.display()))?;
    let registry = builtin_registry();
    let resolver = ConfigModelResolver {
        default: &config.model,
        providers: &config.providers,
    };
    let runnable = build_runnable(&node, &registry, &resolver).context("resolving pipeline")?;

    let mut session = services
        .load_session(session_id)
        .await
        .context("loading session")?;

    let value: serde_json::Value = match input {
        Some(text) => serde_json::from_str(text).unwrap_or_else(|_| serde_json::json!(text)),
        None => serde_json::json!(true),
    };
    let pending: Vec<String> = session.pending_yielding_calls().iter().cloned().collect();
    for call_id in pending {
        let invocation_id = invocation_id_for_call(session.events(), &call_id)
            .context("locating invocation for pending call")?;
        session
            .add_tool_input(invocation_id, call_id, value.clone())
            .context("submitting tool input")?;
    }

    let session = Arc::new(Mutex::new(session));
    let result = resume(
        session.clone(),
        Arc::new(registry),
        Arc::new(TransferRegistry::new()),
        runnable,
    )
    .await
    .context("resuming pipeline")?;

    services
        .save_session(&*session.lock().await)
        .await
        .context("saving session")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Finds the invocation a still-pending `tool_yield` belongs to, by call id.
fn invocation_id_for_call(
    events: &[loomrun_types::Event],
    call_id: &str,
) -> anyhow::Result<loomrun_types::InvocationId> {
    events
        .iter()
        .rev()
        .find_map(|e| match &e.kind {
            loomrun_types::EventKind::ToolYield(p) if p.call_id == call_id => e.invocation_id.clone(),
            _ => None,
        })
        .context("no tool_yield event found for pending call")
}

async fn list_sessions(services: &JsonlSessionService) -> anyhow::Result<()> {
    let ids = services.list_sessions("loomrun").await?;
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

async fn show_session(services: &JsonlSessionService, session_id: &str) -> anyhow::Result<()> {
    let session = services.load_session(session_id).await?;
    for event in session.events() {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
