//! RelayGate CLI
//!
//! Relay-mediated secure tunnels between systems in separate clouds.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relaygate_core::{
    CloudDescriptor, Gateway, PeerPublicKey, RelayDescriptor, ServiceDefinition, SessionEndpoints,
    SessionHandle, SystemDescriptor,
};
use relaygate_crypto::Identity;
use relaygate_relay::{BrokerConnector, RelayServer, RelayServerConfig, TcpConnector};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::Config;

/// RelayGate - tunnel TCP services through an untrusted relay
#[derive(Parser)]
#[command(name = "relaygate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Endpoint description shared by `expose` and `consume`
#[derive(clap::Args)]
struct EndpointArgs {
    /// Relay as host:port (defaults to node.default_relay)
    #[arg(short, long)]
    relay: Option<String>,

    /// Public key of the gateway on the other side (hex)
    #[arg(long)]
    peer_key: String,

    /// Service name
    #[arg(long, default_value = "tcp")]
    service: String,

    /// Consumer system name
    #[arg(long, default_value = "consumer")]
    consumer_name: String,

    /// Consumer cloud as operator/name
    #[arg(long, default_value = "local/default")]
    consumer_cloud: String,

    /// Provider cloud as operator/name
    #[arg(long, default_value = "local/default")]
    provider_cloud: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay broker
    Relay {
        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0:61617")]
        bind: String,

        /// Messages buffered per queue while nobody is subscribed
        #[arg(long)]
        max_queue_depth: Option<usize>,

        /// Seconds before an idle client is dropped
        #[arg(long)]
        client_timeout: Option<u64>,
    },

    /// Generate a new gateway identity
    Keygen {
        /// Output file for the identity (defaults to node.private_key_file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing identity
        #[arg(long)]
        force: bool,
    },

    /// Print the public key of the gateway identity
    Pubkey,

    /// Serve the provider side of a tunnel to a local service
    Expose {
        /// Address of the real provider as host:port
        #[arg(required = true)]
        target: String,

        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Serve the consumer side of a tunnel on a local port
    Consume {
        /// Peer name printed by `expose`
        #[arg(long)]
        peer_name: String,

        /// Queue id printed by `expose`
        #[arg(long)]
        queue_id: String,

        /// Address of the real provider as host:port
        #[arg(long, default_value = "provider:0")]
        provider: String,

        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Show configuration, identity and relay reachability
    Status {
        /// Relay to probe as host:port
        #[arg(short, long)]
        relay: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    match cli.command {
        Commands::Relay {
            bind,
            max_queue_depth,
            client_timeout,
        } => {
            run_relay(&bind, max_queue_depth, client_timeout).await?;
        }
        Commands::Keygen { output, force } => {
            generate_identity(output, force, &config)?;
        }
        Commands::Pubkey => {
            show_public_key(&config)?;
        }
        Commands::Expose { target, endpoint } => {
            expose(&target, &endpoint, &config).await?;
        }
        Commands::Consume {
            peer_name,
            queue_id,
            provider,
            endpoint,
        } => {
            consume(&peer_name, &queue_id, &provider, &endpoint, &config).await?;
        }
        Commands::Status { relay } => {
            show_status(relay, &config).await?;
        }
    }

    Ok(())
}

/// Run a relay broker until Ctrl+C
async fn run_relay(
    bind: &str,
    max_queue_depth: Option<usize>,
    client_timeout: Option<u64>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address: {bind}"))?;

    let mut server_config = RelayServerConfig::default();
    if let Some(depth) = max_queue_depth {
        server_config.max_queue_depth = depth;
    }
    if let Some(secs) = client_timeout {
        server_config.client_timeout = Duration::from_secs(secs);
    }

    let server = RelayServer::bind_with_config(addr, server_config).await?;

    println!("RelayGate Relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", server.local_addr());
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\nShutting down...");
            server.shutdown();
        }
    }

    Ok(())
}

/// Generate a new identity and save it
fn generate_identity(output: Option<PathBuf>, force: bool, config: &Config) -> anyhow::Result<()> {
    let path = output.unwrap_or_else(|| config.node.private_key_file.clone());
    if path.exists() && !force {
        anyhow::bail!(
            "Identity already exists at {} (use --force to replace it)",
            path.display()
        );
    }

    println!("Generating new gateway identity...");

    let identity = Identity::generate(&mut rand_core::OsRng);
    identity.save(&path)?;

    let public_key = identity.public_key();
    println!("Public key: {}", public_key.to_hex());
    println!("Fingerprint: {}", public_key.fingerprint());
    println!("Identity saved to: {}", path.display());
    println!("\nKeep this file secure! It contains your private keys.");

    Ok(())
}

/// Print the public key of the configured identity
fn show_public_key(config: &Config) -> anyhow::Result<()> {
    let identity = load_identity(config)?;
    println!("{}", identity.public_key().to_hex());
    Ok(())
}

fn load_identity(config: &Config) -> anyhow::Result<Arc<Identity>> {
    let path = &config.node.private_key_file;
    let identity = Identity::load(path).with_context(|| {
        format!(
            "No usable identity at {} (run `relaygate keygen`)",
            path.display()
        )
    })?;
    Ok(Arc::new(identity))
}

fn relay_descriptor(arg: Option<&str>, config: &Config) -> anyhow::Result<RelayDescriptor> {
    let relay = arg
        .or(config.node.default_relay.as_deref())
        .ok_or_else(|| anyhow::anyhow!("No relay given and node.default_relay is unset"))?;
    Ok(relay.parse()?)
}

fn parse_cloud(arg: &str) -> anyhow::Result<CloudDescriptor> {
    let (operator, name) = arg
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("Cloud '{}' must be operator/name", arg))?;
    Ok(CloudDescriptor::new(operator, name))
}

fn parse_system(name: &str, arg: &str) -> anyhow::Result<SystemDescriptor> {
    let (host, port) = arg
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("'{}' missing port (expected format: host:port)", arg))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}' has invalid port: {}", arg, port))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(SystemDescriptor::new(name, host, port))
}

fn endpoints(
    endpoint: &EndpointArgs,
    provider: SystemDescriptor,
) -> anyhow::Result<SessionEndpoints> {
    Ok(SessionEndpoints {
        consumer: SystemDescriptor::new(endpoint.consumer_name.clone(), "", 0),
        provider,
        consumer_cloud: parse_cloud(&endpoint.consumer_cloud)?,
        provider_cloud: parse_cloud(&endpoint.provider_cloud)?,
        service: ServiceDefinition::new(endpoint.service.clone()),
    })
}

fn start_gateway(config: &Config) -> anyhow::Result<Gateway> {
    let gateway = Gateway::with_tcp(
        config.gateway_config()?,
        config.node.name.clone(),
        load_identity(config)?,
    )?;
    gateway.start_supervision();
    Ok(gateway)
}

/// Wait until the session ends or Ctrl+C, then shut the gateway down
async fn serve(gateway: Gateway, handle: &SessionHandle) -> anyhow::Result<()> {
    println!("Press Ctrl+C to stop");

    match gateway.worker(handle.side, &handle.session) {
        Some(worker) => {
            tokio::select! {
                () = worker.finished() => {
                    match worker.last_error() {
                        Some(e) => println!("\nSession ended: {e}"),
                        None => println!("\nSession ended"),
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    println!("\nShutting down...");
                }
            }
        }
        None => println!("Session already ended"),
    }

    let stats = gateway.stats();
    gateway.shutdown().await;
    tracing::info!(stats = %serde_json::to_string(&stats)?, "Gateway stopped");
    Ok(())
}

/// Provider side: connect to `target` and publish the session on the relay
async fn expose(target: &str, endpoint: &EndpointArgs, config: &Config) -> anyhow::Result<()> {
    let relay = relay_descriptor(endpoint.relay.as_deref(), config)?;
    let peer_key: PeerPublicKey = endpoint.peer_key.parse()?;
    let provider = parse_system("provider", target)?;
    let endpoints = endpoints(endpoint, provider)?;

    let gateway = start_gateway(config)?;
    let handle = gateway
        .connect_provider(relay.clone(), endpoints, peer_key)
        .await?;

    println!("Relay: {relay}");
    println!("Target: {target}");
    println!("Peer name: {}", handle.peer_name());
    println!("Queue id: {}", handle.queue_id());

    serve(gateway, &handle).await
}

/// Consumer side: open the session and listen for one local client
async fn consume(
    peer_name: &str,
    queue_id: &str,
    provider: &str,
    endpoint: &EndpointArgs,
    config: &Config,
) -> anyhow::Result<()> {
    let relay = relay_descriptor(endpoint.relay.as_deref(), config)?;
    let peer_key: PeerPublicKey = endpoint.peer_key.parse()?;
    let endpoints = endpoints(endpoint, parse_system("provider", provider)?)?;

    let gateway = start_gateway(config)?;
    let handle = gateway
        .connect_consumer(relay.clone(), endpoints, peer_key, peer_name, queue_id)
        .await?;

    println!("Relay: {relay}");
    match handle.local_port {
        Some(port) => println!("Listening on: {}:{}", config.tunnel.bind_host, port),
        None => anyhow::bail!("Consumer session has no local port"),
    }

    serve(gateway, &handle).await
}

/// Show configuration and identity, optionally probing a relay
async fn show_status(relay: Option<String>, config: &Config) -> anyhow::Result<()> {
    println!("RelayGate Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Node:");
    println!("  Name: {}", config.node.name);
    match Identity::load(&config.node.private_key_file) {
        Ok(identity) => println!("  Public key: {}", identity.public_key().to_hex()),
        Err(_) => println!(
            "  Public key: none ({} missing)",
            config.node.private_key_file.display()
        ),
    }
    if let Some(relay) = &config.node.default_relay {
        println!("  Default relay: {relay}");
    }
    println!();

    println!("Tunnel:");
    println!("  Buffer size: {} bytes", config.tunnel.buffer_size);
    println!("  Bind host: {}", config.tunnel.bind_host);
    if let (Some(min), Some(max)) = (config.tunnel.min_port, config.tunnel.max_port) {
        println!("  Port range: {min}-{max}");
    }
    println!();

    println!("Supervision:");
    println!("  Interval: {}s", config.supervision.interval_secs);
    println!(
        "  Consumer idle timeout: {}s",
        config.supervision.consumer_idle_timeout_secs
    );
    println!(
        "  Switch failure policy: {:?}",
        config.supervision.switch_failure_policy
    );

    if relay.is_some() || config.node.default_relay.is_some() {
        let relay = relay_descriptor(relay.as_deref(), config)?;
        let gateway_config = config.gateway_config()?;
        let connector = TcpConnector::new(gateway_config.relay.broker_config());
        println!();
        match connector.connect(&relay, &config.node.name).await {
            Ok(broker) => {
                println!("Relay {relay}: reachable");
                broker.close().await;
            }
            Err(e) => println!("Relay {relay}: unreachable ({e})"),
        }
    }

    Ok(())
}
