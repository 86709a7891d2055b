//! Teleport CLI - expose a local service through a teleport server
//!
//! `teleport server` runs the public endpoint; `teleport connect` runs the agent next
//! to the local service.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use teleport_client::{AgentConfig, TunnelAgent};
use teleport_server::{ServerConfig, TeleportServer};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

/// Teleport - tunnel local services to public subdomains
#[derive(Parser, Debug)]
#[command(name = "teleport")]
#[command(about = "Teleport - tunnel local services to public subdomains")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(
    env!("GIT_TAG"),
    "\nCommit: ",
    env!("GIT_HASH"),
    "\nBuilt: ",
    env!("BUILD_TIME")
))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "TELEPORT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    Server {
        /// JSON configuration file
        #[arg(long, env = "TELEPORT_CONFIG", default_value = "config.json")]
        config: PathBuf,

        /// Public port (overrides the file)
        #[arg(short, long, env = "TELEPORT_PORT")]
        port: Option<u16>,

        /// Public base host that subdomains are allocated under (overrides the file)
        #[arg(short = 'H', long, env = "TELEPORT_HOST")]
        host: Option<String>,

        /// Address to bind the listener to (overrides the file)
        #[arg(short, long, env = "TELEPORT_BIND")]
        bind: Option<String>,
    },

    /// Connect a local service to a tunnel server
    Connect {
        /// Server host, as configured on the server
        #[arg(long, env = "TELEPORT_SERVER_HOST", default_value = "localhost")]
        server_host: String,

        /// Server port
        #[arg(long, env = "TELEPORT_SERVER_PORT", default_value = "9999")]
        server_port: u16,

        /// Account name
        #[arg(short, long, env = "TELEPORT_USERNAME")]
        username: String,

        /// Account password
        #[arg(long, env = "TELEPORT_PASSWORD", hide_env_values = true)]
        password: String,

        /// Host of the local service
        #[arg(long, env = "TELEPORT_LOCAL_HOST", default_value = "127.0.0.1")]
        local_host: String,

        /// Port of the local service
        #[arg(short, long, env = "TELEPORT_LOCAL_PORT")]
        local_port: u16,

        /// Disable end-to-end encryption (server must run with encryption off)
        #[arg(long)]
        insecure_plaintext: bool,

        /// Maximum concurrent connections to the local service
        #[arg(long, env = "TELEPORT_MAX_CONNECTIONS", default_value = "100")]
        max_connections: usize,

        /// Timeout for connecting and completing the handshake, in seconds
        #[arg(long, default_value = "30")]
        connect_timeout: u64,
    },
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Cancel `shutdown` on Ctrl-C.
fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        shutdown.cancel();
    });
}

async fn run_server(
    config_path: PathBuf,
    port: Option<u16>,
    host: Option<String>,
    bind: Option<String>,
) -> Result<()> {
    let mut config = ServerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(bind) = bind {
        config.bind_address = bind;
    }
    if !config.encryption {
        warn!("Encryption is disabled; tunnel traffic is sent in plaintext");
    }

    let server = TeleportServer::new(config)
        .bind()
        .await
        .context("Failed to start server")?;

    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    server.run(shutdown).await.context("Server failed")?;
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    if !config.encryption {
        warn!("Encryption is disabled; tunnel traffic is sent in plaintext");
    }
    info!("Forwarding to local service at {}", config.local_addr);

    let connected = TunnelAgent::new(config)
        .connect()
        .await
        .context("Failed to establish tunnel")?;
    info!("Public URL: http://{}", connected.public_host());

    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    connected.run(shutdown).await.context("Tunnel failed")?;
    info!("Teleport stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Server {
            config,
            port,
            host,
            bind,
        } => run_server(config, port, host, bind).await,
        Commands::Connect {
            server_host,
            server_port,
            username,
            password,
            local_host,
            local_port,
            insecure_plaintext,
            max_connections,
            connect_timeout,
        } => {
            let config = AgentConfig {
                server_host,
                server_port,
                username,
                password,
                local_addr: format!("{}:{}", local_host, local_port),
                encryption: !insecure_plaintext,
                max_connections,
                connect_timeout: Duration::from_secs(connect_timeout),
            };
            run_agent(config).await
        }
    }
}
