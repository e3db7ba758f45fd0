//! Burrow relay
//!
//! Serves the management API and the agent control endpoint, and exposes
//! every activated tunnel on its own public TCP port.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow_api::{ApiServer, ApiServerConfig, Heartbeat};
use burrow_auth::{permissions, JwtClaims, JwtValidator};
use burrow_lib::{Broker, BrokerConfig};

const TOKEN_ISSUER: &str = "burrow-relay";
const TOKEN_AUDIENCE: &str = "burrow-api";

/// Burrow relay - reverse TCP tunnels managed over HTTP
#[derive(Parser, Debug)]
#[command(name = "burrow-relay")]
#[command(about = "Run a burrow tunnel relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a JWT for the management API
    GenerateToken {
        /// JWT secret (must match the relay's --jwt-secret)
        #[arg(long, env = "BURROW_JWT_SECRET")]
        secret: String,

        /// User the token is issued to; tunnels are owned by this name
        #[arg(long)]
        name: String,

        /// Granted permission (repeatable). Defaults to con.new.tcp
        #[arg(long = "perm")]
        perms: Vec<String>,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// API server bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    api_addr: SocketAddr,

    /// Address public and rendezvous listeners bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Port range for public and rendezvous listeners (format: "10000-60000")
    #[arg(long, default_value = "10000-60000")]
    port_range: String,

    /// Per-direction relay buffer size in bytes
    #[arg(long, default_value = "30000")]
    buffer_size: usize,

    /// Seconds to wait for the agent to dial back for a public connection
    #[arg(long, default_value = "30")]
    rendezvous_timeout: u64,

    /// Seconds after which a tunnel never activated by its agent is dropped
    #[arg(long)]
    pending_ttl: Option<u64>,

    /// Seconds between pings on agent control sockets
    #[arg(long, default_value = "15")]
    ping_interval: u64,

    /// Seconds an agent may stay silent after a ping before its tunnel is closed
    #[arg(long, default_value = "15")]
    ping_timeout: u64,

    /// JWT secret for the management API
    #[arg(long, env = "BURROW_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Require this `iss` claim on API tokens
    #[arg(long)]
    jwt_issuer: Option<String>,

    /// Require this `aud` claim on API tokens
    #[arg(long)]
    jwt_audience: Option<String>,

    /// Allow cross-origin API requests
    #[arg(long)]
    enable_cors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn generate_token(secret: &str, name: &str, perms: Vec<String>, hours: i64) -> Result<()> {
    use chrono::Duration;

    let perms = if perms.is_empty() {
        vec![permissions::NEW_TCP.to_string()]
    } else {
        perms
    };

    let claims = JwtClaims::new(
        name.to_string(),
        TOKEN_ISSUER.to_string(),
        TOKEN_AUDIENCE.to_string(),
        Duration::hours(hours),
    )
    .with_permissions(perms);

    let token = JwtValidator::encode(secret.as_bytes(), &claims)
        .map_err(|e| anyhow::anyhow!("Failed to generate token: {}", e))?;

    println!("User:        {}", claims.name);
    println!("Permissions: {}", claims.perm.join(", "));
    println!("Valid for:   {} hours", hours);
    println!("Expires:     {}", claims.exp_formatted());
    println!();
    println!("{}", token);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return match command {
            Commands::GenerateToken {
                secret,
                name,
                perms,
                hours,
            } => generate_token(&secret, &name, perms, hours),
        };
    }

    let args = cli.server_args;
    init_logging(&args.log_level)?;

    let jwt_secret = args
        .jwt_secret
        .ok_or_else(|| anyhow::anyhow!("--jwt-secret (or BURROW_JWT_SECRET) is required"))?;
    let (start, end) = parse_port_range(&args.port_range)?;

    let config = BrokerConfig {
        port_range_start: start,
        port_range_end: end,
        bind_ip: args.bind_ip,
        buffer_size: args.buffer_size,
        rendezvous_timeout: Duration::from_secs(args.rendezvous_timeout),
        pending_ttl: args.pending_ttl.map(Duration::from_secs),
    };
    info!(
        "Port range: {}-{} ({} ports available)",
        start,
        end,
        u32::from(end) - u32::from(start) + 1
    );

    let broker = Arc::new(Broker::new(config));
    let shutdown = CancellationToken::new();
    let sweeper = broker.spawn_pending_sweeper(shutdown.child_token());

    let api = ApiServer::new(
        ApiServerConfig {
            bind_addr: args.api_addr,
            jwt_secret: jwt_secret.into_bytes(),
            jwt_issuer: args.jwt_issuer,
            jwt_audience: args.jwt_audience,
            enable_cors: args.enable_cors,
            heartbeat: Heartbeat {
                interval: Duration::from_secs(args.ping_interval.max(1)),
                timeout: Duration::from_secs(args.ping_timeout),
            },
        },
        broker.clone(),
    );
    let listener = TcpListener::bind(args.api_addr).await?;
    let api_handle = tokio::spawn(api.serve(listener, shutdown.child_token()));

    info!("Management API and agent control on {}", args.api_addr);
    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, closing tunnels...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    // Tunnels first, so agent sockets end and the API can drain
    broker.shutdown().await;
    shutdown.cancel();

    match api_handle.await {
        Ok(Err(e)) => error!("API server error: {}", e),
        Err(e) => error!("API server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    info!("Burrow relay stopped");

    Ok(())
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

fn parse_port_range(range_str: &str) -> Result<(u16, u16)> {
    let Some((start, end)) = range_str.split_once('-') else {
        return Err(anyhow::anyhow!(
            "Invalid port range format. Expected: START-END (e.g., 10000-60000)"
        ));
    };

    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid start port: {}", start))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid end port: {}", end))?;

    if start == 0 || start > end {
        return Err(anyhow::anyhow!(
            "Start port must be non-zero and not greater than end port"
        ));
    }

    Ok((start, end))
}
