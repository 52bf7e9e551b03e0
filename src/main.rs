//! Loom CLI - command-line interface for the Loom agent orchestration core.
//!
//! # Usage
//!
//! ```bash
//! # Run the HTTP surface plus the dispatch loop
//! loomd serve --config loom.toml
//!
//! # One-shot task submission against a running instance
//! loomd submit-task --method videoProcessing --params '{"path":"in.mp4"}'
//!
//! # Submit a workflow definition file
//! loomd submit-workflow my-workflow.yaml
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use loom::config::Settings;
use loom::events::EventBus;
use loom::monitor::Monitor;
use loom::orchestrator::task::TaskSubmission;
use loom::registry::{spawn_health_prober, AgentRegistry};
use loom::resource::{ResourceLimits, ResourceManager};
use loom::router::TaskRouter;
use loom::server::{self, AppState};
use loom::workflow::spec::WorkflowSpec;
use loom::Orchestrator;
use loom::WorkflowEngine;

#[derive(Parser)]
#[command(name = "loomd")]
#[command(about = "Loom - Agent Orchestration Core", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML config file (overlaid with LOOM_* env vars)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP surface and the orchestrator's dispatch loop
    Serve {
        /// Override the configured bind address (host:port)
        #[arg(long)]
        bind: Option<String>,
    },

    /// One-shot task submission against a running instance
    SubmitTask {
        /// Running instance's base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// JSON-RPC method name
        #[arg(short, long)]
        method: String,

        /// JSON-RPC params (JSON string)
        #[arg(short, long, default_value = "{}")]
        params: String,
    },

    /// Load a workflow definition from a YAML/JSON file and submit it
    SubmitWorkflow {
        /// Running instance's base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Workflow definition file (.yaml, .yml or .json)
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.as_ref().and_then(|p| p.to_str());

    match cli.command {
        Commands::Serve { bind } => serve(config_path, bind).await,
        Commands::SubmitTask { server, method, params } => submit_task(server, method, params).await,
        Commands::SubmitWorkflow { server, workflow } => submit_workflow(server, workflow).await,
    }
}

async fn serve(config_path: Option<&str>, bind_override: Option<String>) -> Result<()> {
    let mut config = Settings::load(config_path).context("loading configuration")?;
    if let Some(bind) = bind_override {
        config.bind_address = bind;
    }

    let limits = ResourceLimits::from(&config.resource_limits);
    let resource_manager = ResourceManager::new(limits);
    let registry = AgentRegistry::new();
    let router = TaskRouter::new(registry.clone());
    let events = std::sync::Arc::new(EventBus::new(config.event_bus_capacity));
    let events_for_server = events.clone();
    let monitor = Monitor::new(resource_manager.clone());

    let orchestrator = Orchestrator::new(
        config.clone(),
        resource_manager.clone(),
        registry.clone(),
        router.clone(),
        events.clone(),
    );
    let workflows = WorkflowEngine::new(config.clone(), resource_manager.clone(), events, orchestrator.clone());

    let _dispatch = orchestrator.spawn_dispatch_loop();
    let _metrics_refresh = orchestrator.spawn_metrics_refresh();
    let _resource_hook = orchestrator.spawn_resource_critical_hook();
    let _workflow_hook = workflows.spawn_critical_resource_reaction();
    let _maintenance = workflows.spawn_maintenance();
    let _usage_sampler = resource_manager.spawn_sampler();
    let _health_monitor = monitor.spawn_sampler(std::time::Duration::from_millis(config.health_probe_interval_ms));
    let _agent_prober = spawn_health_prober(
        registry.clone(),
        router,
        reqwest::Client::new(),
        std::time::Duration::from_millis(config.health_probe_interval_ms),
    );

    let bind_address = config.bind_address.clone();
    let app = server::router(AppState {
        orchestrator,
        registry,
        workflows,
        monitor,
        events: events_for_server,
    });

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!(%bind_address, "loomd listening");
    axum::serve(listener, app).await.context("serving http")?;
    Ok(())
}

async fn submit_task(server: String, method: String, params: String) -> Result<()> {
    let params: serde_json::Value = serde_json::from_str(&params).context("parsing --params as JSON")?;
    let submission = TaskSubmission {
        method,
        params,
        source_agent: None,
        target_agent: None,
        resource_requirement: None,
        dependencies: Vec::new(),
    };

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{server}/tasks"))
        .json(&submission)
        .send()
        .await
        .context("submitting task")?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("parsing response")?;
    if !status.is_success() {
        anyhow::bail!("task submission failed ({status}): {body}");
    }
    println!("{body}");
    Ok(())
}

async fn submit_workflow(server: String, workflow: PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(&workflow)
        .with_context(|| format!("reading {}", workflow.display()))?;
    let spec: WorkflowSpec = if workflow.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&raw).context("parsing workflow as JSON")?
    } else {
        serde_yaml::from_str(&raw).context("parsing workflow as YAML")?
    };

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{server}/workflows"))
        .json(&spec)
        .send()
        .await
        .context("submitting workflow")?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("parsing response")?;
    if !status.is_success() {
        anyhow::bail!("workflow submission failed ({status}): {body}");
    }
    println!("{body}");
    Ok(())
}


fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("loom=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loom=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
