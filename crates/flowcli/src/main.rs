// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    ExecutionEvent, ExecutionStatus, NodeEvent, NodeExecutionStatus, NodeSpec, Value, Workflow,
    MAIN_PORT,
};
use flowruntime::{ExecuteOptions, FlowRuntime, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger node to start from (defaults to the first trigger)
        #[arg(short, long)]
        trigger: Option<String>,

        /// Trigger data as JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime config JSON file (defaults to FLOW_* environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    serde_json::from_str(&workflow_json)
        .with_context(|| format!("{} is not a valid workflow", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            trigger,
            input,
            config,
            verbose,
        } => {
            init_tracing(verbose);
            run_workflow(file, trigger, input, config).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

async fn run_workflow(
    file: PathBuf,
    trigger: Option<String>,
    input: Option<String>,
    config: Option<PathBuf>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(&file)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let trigger_data = match input {
        Some(input_str) => {
            let json: serde_json::Value =
                serde_json::from_str(&input_str).context("input must be valid JSON")?;
            Value::from(json)
        }
        None => Value::Object(Default::default()),
    };

    let trigger_id = match trigger {
        Some(id) => id,
        None => workflow
            .nodes
            .iter()
            .find(|n| n.is_trigger())
            .map(|n| n.id.clone())
            .context("workflow has no trigger node; pass --trigger")?,
    };

    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => RuntimeConfig::from_env()?,
    };

    let runtime = Arc::new(FlowRuntime::with_registry(
        Arc::new(flownodes::standard_registry()),
        config,
    ));
    let workflow_id = runtime.register_workflow(workflow).await?;

    // Subscribe before starting so no event is missed
    let mut events = runtime.subscribe_events();

    let handle = runtime
        .start_from_trigger(workflow_id, &trigger_id, trigger_data, ExecuteOptions::default())
        .await?;
    let execution_id = handle.execution_id.clone();

    let event_id = execution_id.clone();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.execution_id() != event_id {
                continue;
            }
            match event {
                ExecutionEvent::ExecutionStarted { affected_nodes, .. } => {
                    println!("▶️  Execution started ({} nodes)", affected_nodes);
                }
                ExecutionEvent::ExecutionStatusChanged { status, .. } => {
                    println!("⏯️  Execution is now {}", status);
                }
                ExecutionEvent::NodeStatusChanged {
                    node_id,
                    status,
                    error,
                    ..
                } => match status {
                    NodeExecutionStatus::Running => println!("  ⚡ Starting node: {}", node_id),
                    NodeExecutionStatus::Completed => println!("  ✅ Node {} completed", node_id),
                    NodeExecutionStatus::Failed => println!(
                        "  ❌ Node {} failed: {}",
                        node_id,
                        error.unwrap_or_default()
                    ),
                    NodeExecutionStatus::Skipped => println!("  ⏭️  Node {} skipped", node_id),
                    _ => {}
                },
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Progress { percent, message } => {
                        if let Some(msg) = message {
                            println!("     📊 [{}] {}% - {}", node_id, percent, msg);
                        } else {
                            println!("     📊 [{}] {}%", node_id, percent);
                        }
                    }
                    NodeEvent::Data { .. } => {}
                },
                ExecutionEvent::ExecutionFinished {
                    status,
                    duration_ms,
                    ..
                } => {
                    println!("🏁 Execution {} after {}ms", status, duration_ms);
                    break;
                }
            }
        }
    });

    let cancel_runtime = runtime.clone();
    let cancel_id = execution_id.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("🛑 Cancelling execution {}", cancel_id);
            if let Err(e) = cancel_runtime.cancel_execution(&cancel_id).await {
                tracing::warn!("Cancel failed: {}", e);
            }
        }
    });

    let result = handle.wait().await;
    ctrl_c.abort();
    // The finished event is the last one for this execution
    let _ = tokio::time::timeout(std::time::Duration::from_millis(500), event_task).await;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Status: {}", result.status);
    println!(
        "   Completed: {}, failed: {}, skipped: {}",
        result.executed_nodes.len(),
        result.failed_nodes.len(),
        result.skipped_nodes.len()
    );

    let mut printed_header = false;
    for node_id in &result.executed_nodes {
        let Some(node_result) = result.node_results.get(node_id) else {
            continue;
        };
        if node_result.outputs.values().all(|items| items.is_empty()) {
            continue;
        }
        if !printed_header {
            println!();
            println!("📤 Outputs:");
            printed_header = true;
        }
        println!("   Node {}:", node_id);
        let mut ports: Vec<_> = node_result.outputs.iter().collect();
        ports.sort_by(|a, b| a.0.cmp(b.0));
        for (port, items) in ports {
            let rendered: Vec<String> = items.iter().map(|v| v.to_json().to_string()).collect();
            println!("     {}: [{}]", port, rendered.join(", "));
        }
    }

    if !result.errors.is_empty() {
        println!();
        println!("⚠️  Errors:");
        for error in &result.errors {
            println!("   {}", error);
            println!("     → {}", error.suggested_resolution);
        }
    }

    match result.status {
        ExecutionStatus::Completed | ExecutionStatus::Partial => Ok(()),
        status => bail!("execution {} ended as {}", result.execution_id, status),
    }
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;
    let result = flowruntime::validate_execution_path(&workflow.nodes, &workflow.connections);

    let registry = flownodes::standard_registry();
    let unknown: Vec<&NodeSpec> = workflow
        .nodes
        .iter()
        .filter(|n| !registry.contains(&n.node_type))
        .collect();

    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());

    for error in &result.errors {
        println!("❌ [{}] {}", error.kind, error.message);
        println!("   → {}", error.suggested_resolution);
    }
    for node in &unknown {
        println!("❌ Unknown node type {} on node {}", node.node_type, node.id);
    }
    for warning in &result.warnings {
        println!("⚠️  {}", warning.message);
    }

    if !result.is_valid || !unknown.is_empty() {
        bail!(
            "workflow is invalid ({} errors)",
            result.errors.len() + unknown.len()
        );
    }

    println!("✅ Workflow is valid");
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = flownodes::standard_registry();

    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
            for port in &metadata.outputs {
                println!("      → {}: {}", port.name, port.description);
            }
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("Example Branching Workflow");
    workflow.description =
        Some("Routes trigger items by their `active` flag and logs both branches".to_string());

    let trigger = workflow.add_node(
        NodeSpec::new("start", "trigger.manual")
            .with_name("Start")
            .with_position(100.0, 200.0),
    );
    let check = workflow.add_node(
        NodeSpec::new("check", "logic.if")
            .with_name("Is Active?")
            .with_config("field", "active")
            .with_position(300.0, 200.0),
    );
    let active = workflow.add_node(
        NodeSpec::new("log_active", "debug.log")
            .with_name("Log Active")
            .with_config("label", "active")
            .with_position(500.0, 100.0),
    );
    let inactive = workflow.add_node(
        NodeSpec::new("log_inactive", "debug.log")
            .with_name("Log Inactive")
            .with_config("label", "inactive")
            .with_position(500.0, 300.0),
    );

    workflow.connect_main(&trigger, &check);
    workflow.connect(&check, "true", &active, MAIN_PORT);
    workflow.connect(&check, "false", &inactive, MAIN_PORT);

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '[{{\"name\": \"a\", \"active\": true}}, {{\"name\": \"b\", \"active\": false}}]'",
        output.display()
    );

    Ok(())
}
