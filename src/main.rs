//! relaymesh binary
//!
//! `relay` runs the peer directory, `node` runs a worker, `submit` and
//! `nodes` act as a short-lived coordinator.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use relaymesh::cli::{Cli, Commands, ConfigSubcommand};
use relaymesh::config::{self, MeshConfig};
use relaymesh::coordinator::{Coordinator, TaskReport};
use relaymesh::logging::{self, LogGuards};
use relaymesh::node::NodeAgent;
use relaymesh::protocol::NodeSummary;
use relaymesh::relay::RelayServer;
use relaymesh::sandbox::{MockSandbox, ProcessSandbox, Sandbox};
use relaymesh::transport::{TcpTransport, Transport};
use relaymesh::version;
use relaymesh::{Error, Result};

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    let Cli { verbose, quiet, command } = cli;

    match command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Relay { config, bind, duplicate_policy } => {
            let mut cfg = MeshConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                cfg.relay.bind_addr = bind;
            }
            if let Some(policy) = duplicate_policy {
                cfg.relay.duplicate_policy = policy;
            }
            cfg.validate()?;
            let _guards = start_logging(&cfg, verbose, quiet, "relay")?;
            runtime()?.block_on(run_relay(cfg))
        }
        Commands::Node { config, relay_url, id, mock } => {
            let mut cfg = MeshConfig::load(config.as_deref())?;
            if let Some(url) = relay_url {
                cfg.relay_client.url = url;
            }
            if id.is_some() {
                cfg.node.id = id;
            }
            cfg.validate()?;
            let _guards = start_logging(&cfg, verbose, quiet, "node")?;
            runtime()?.block_on(run_node(cfg, mock))
        }
        Commands::Submit {
            config,
            relay_url,
            strategy,
            code,
            file,
            repeat,
            task_timeout_ms,
            json,
        } => {
            let mut cfg = MeshConfig::load(config.as_deref())?;
            if let Some(url) = relay_url {
                cfg.relay_client.url = url;
            }
            if let Some(strategy) = strategy {
                cfg.coordinator.strategy = strategy;
            }
            if let Some(ms) = task_timeout_ms {
                cfg.coordinator.task_timeout_ms = ms;
            }
            cfg.validate()?;

            let program = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .map_err(|e| Error::IoRead { path, source: e })?,
                (None, None) => return Err(Error::config_validation("no program given")),
            };

            let _guards = start_logging(&cfg, verbose, quiet, "coordinator")?;
            runtime()?.block_on(run_submit(cfg, program, repeat, json))
        }
        Commands::Nodes { config, relay_url, json } => {
            let mut cfg = MeshConfig::load(config.as_deref())?;
            if let Some(url) = relay_url {
                cfg.relay_client.url = url;
            }
            cfg.validate()?;
            let _guards = start_logging(&cfg, verbose, quiet, "coordinator")?;
            runtime()?.block_on(run_nodes(cfg, json))
        }
    }
}

fn start_logging(cfg: &MeshConfig, verbose: u8, quiet: bool, role: &str) -> Result<LogGuards> {
    let guards = logging::init_logging(&cfg.logging, verbose, quiet)?;
    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        role,
        "Starting relaymesh"
    );
    Ok(guards)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .thread_name("relaymesh")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))
}

fn transport(cfg: &MeshConfig) -> Arc<dyn Transport> {
    Arc::new(TcpTransport::new(cfg.transport.clone()))
}

// ─────────────────────────────────────────────────────────────────
// Roles
// ─────────────────────────────────────────────────────────────────

async fn run_relay(cfg: MeshConfig) -> Result<()> {
    let server = RelayServer::bind(&cfg.relay).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

async fn run_node(cfg: MeshConfig, mock: bool) -> Result<()> {
    let sandbox: Arc<dyn Sandbox> = if mock {
        Arc::new(MockSandbox::echo())
    } else {
        Arc::new(ProcessSandbox::new(&cfg.execution))
    };

    let agent = NodeAgent::from_config(&cfg, transport(&cfg), sandbox);
    info!(peer_id = %agent.peer_id(), relay = %cfg.relay_client.url, "Node starting");

    let stats = agent
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!(completed = stats.completed, failed = stats.failed, "Node exited");
    Ok(())
}

async fn run_submit(cfg: MeshConfig, program: String, repeat: u32, json: bool) -> Result<()> {
    let mut coordinator = Coordinator::from_config(&cfg, transport(&cfg)).await?;
    info!(
        peer_id = %coordinator.peer_id(),
        strategy = %coordinator.strategy(),
        repeat,
        "Submitting program"
    );

    let mut first_error = None;
    for _ in 0..repeat {
        let outcome = tokio::select! {
            outcome = coordinator.submit(&program) => outcome,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };

        match outcome {
            Ok(report) => print_report(&report, json)?,
            Err(e) if repeat == 1 => {
                first_error = Some(e);
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                first_error.get_or_insert(e);
            }
        }
    }

    coordinator.shutdown().await?;
    first_error.map_or(Ok(()), Err)
}

async fn run_nodes(cfg: MeshConfig, json: bool) -> Result<()> {
    let mut coordinator = Coordinator::from_config(&cfg, transport(&cfg)).await?;
    let nodes = coordinator.list_nodes().await?;
    coordinator.shutdown().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
    } else {
        print_nodes(&nodes);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────

fn print_report(report: &TaskReport, json: bool) -> Result<()> {
    if json {
        let line = serde_json::json!({
            "taskId": report.task_id,
            "nodeId": report.node_id,
            "result": report.value,
            "elapsedMs": report.elapsed.as_millis() as u64,
        });
        println!("{}", serde_json::to_string(&line)?);
    } else {
        match &report.value {
            serde_json::Value::String(s) => println!("{}", s),
            other => println!("{}", serde_json::to_string_pretty(other)?),
        }
    }
    Ok(())
}

fn print_nodes(nodes: &[NodeSummary]) {
    if nodes.is_empty() {
        println!("No nodes registered.");
        return;
    }
    println!("{:<24} {:<6} {:>9}", "PEER ID", "STATUS", "COMPLETED");
    for node in nodes {
        println!("{:<24} {:<6} {:>9}", node.peer_id, node.status.to_string(), node.tasks_completed);
    }
}

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = MeshConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            MeshConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
