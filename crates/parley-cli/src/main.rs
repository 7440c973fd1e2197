//! parley: streaming agent gateway with human-approved tool calls

mod config;
mod template;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{ParleyConfig, config_path};
use parley_core::ApprovalGate;
use parley_core::providers::OpenAiCompatAgent;
use parley_gateway::{BroadcastRegistry, GatewayServer, StreamSession, ThreadStore};
use parley_mcp::{HttpConnector, ToolCatalog};

#[derive(Parser)]
#[command(name = "parley", version)]
#[command(about = "Streaming agent gateway with human-approved tool calls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $PARLEY_CONFIG or ~/.parley/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until Ctrl-C
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Inspect and decide pending tool calls on a running gateway
    Approvals {
        #[command(subcommand)]
        action: ApprovalAction,

        /// Gateway base URL (default: derived from the configured bind address)
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// List calls awaiting a decision
    List,
    /// Approve a pending call
    Approve { id: String },
    /// Reject a pending call
    Reject { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = config_path(cli.config.as_deref());

    if let Commands::Init { force } = &cli.command {
        let Some(path) = path else {
            bail!("Cannot determine a config location; pass --config");
        };
        template::write_template(&path, *force)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let config = ParleyConfig::load(path.as_deref())?;
    init_tracing(cli.verbose, config.log_level.as_deref());

    match cli.command {
        Commands::Serve { bind } => serve(config, bind).await,
        Commands::Approvals { action, url } => {
            let base = match url {
                Some(url) => url,
                None => format!("http://{}", config.server.bind),
            };
            approvals(&base, action).await
        }
        Commands::Init { .. } => Ok(()),
    }
}

fn init_tracing(verbose: bool, configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            configured.unwrap_or("info")
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(config: ParleyConfig, bind: Option<String>) -> Result<()> {
    let addr = match bind {
        Some(bind) => bind
            .parse()
            .with_context(|| format!("Invalid bind address '{bind}'"))?,
        None => config.bind_addr()?,
    };

    let agent = Arc::new(OpenAiCompatAgent::new(config.agent_config())?);
    let catalog_config = config.catalog_config();
    let connector = Arc::new(HttpConnector::new(catalog_config.request_timeout)?);
    let session = StreamSession::new(
        agent,
        Arc::new(ToolCatalog::new(catalog_config, connector)),
        Arc::new(ApprovalGate::new()),
        Arc::new(ThreadStore::new(config.thread_config())),
        BroadcastRegistry::new(config.broadcast_config()),
        config.session_config(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    info!("parley v{} starting", env!("CARGO_PKG_VERSION"));
    GatewayServer::new(session, config.gateway_config())
        .serve(addr, shutdown)
        .await
}

async fn approvals(base: &str, action: ApprovalAction) -> Result<()> {
    let base = base.trim_end_matches('/');
    let http = reqwest::Client::new();

    match action {
        ApprovalAction::List => {
            let pending: Vec<Value> = http
                .get(format!("{base}/api/approvals/pending"))
                .send()
                .await
                .with_context(|| format!("Failed to reach gateway at {base}"))?
                .error_for_status()?
                .json()
                .await
                .context("Invalid pending list")?;
            if pending.is_empty() {
                println!("No pending tool calls.");
                return Ok(());
            }
            for call in pending {
                println!(
                    "{}  {}.{}  {}  {}",
                    call["id"].as_str().unwrap_or("?"),
                    call["pluginName"].as_str().unwrap_or("?"),
                    call["functionName"].as_str().unwrap_or("?"),
                    call["args"],
                    call["createdAt"].as_str().unwrap_or("")
                );
            }
        }
        ApprovalAction::Approve { id } => decide(&http, base, "approve", &id).await?,
        ApprovalAction::Reject { id } => decide(&http, base, "reject", &id).await?,
    }
    Ok(())
}

async fn decide(http: &reqwest::Client, base: &str, verb: &str, id: &str) -> Result<()> {
    let response = http
        .post(format!("{base}/api/approvals/{verb}/{id}"))
        .send()
        .await
        .with_context(|| format!("Failed to reach gateway at {base}"))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        bail!("No pending tool call '{id}'");
    }
    response.error_for_status()?;
    let outcome = if verb == "approve" { "Approved" } else { "Rejected" };
    println!("{outcome} {id}");
    Ok(())
}
