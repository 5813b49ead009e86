use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use plexus::{
    config::Config,
    device::{MemoryDevice, TunnelDevice, WgCommandDevice},
    engine::Engine,
    identity::Identity,
    management::{ManagementClient, SystemInfo, TcpManagementClient},
    signaling::TcpSignalClient,
    stun, EngineConfig, TurnServer,
};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(
    name = "plexus",
    version,
    about = "Plexus mesh VPN peer engine",
    long_about = "Plexus peer engine\n\n\
        Reconciles the local WireGuard interface and per-peer NAT traversal\n\
        sessions against the network map served by a management service.\n\n\
        Examples:\n  \
          # Generate an identity and exit\n  \
          plexus --init\n\n  \
          # Join a mesh\n  \
          plexus --management mgmt.example.com:33073 --signal sig.example.com:10000 --setup-key <KEY>"
)]
struct Args {
    /// Management service address (host:port)
    #[arg(short, long)]
    management: Option<String>,

    /// Signal service address (host:port)
    #[arg(short, long)]
    signal: Option<String>,

    /// One-time setup key for registration
    #[arg(long)]
    setup_key: Option<String>,

    /// Overlay interface name
    #[arg(long)]
    interface: Option<String>,

    /// UDP port for tunnel traffic
    #[arg(short, long)]
    port: Option<u16>,

    /// Initialize new identity and exit
    #[arg(long)]
    init: bool,

    /// Path to identity directory
    #[arg(long)]
    identity: Option<std::path::PathBuf>,

    /// Path to config file
    #[arg(long, short = 'C')]
    config: Option<std::path::PathBuf>,

    /// STUN servers for NAT discovery (repeatable)
    #[arg(long, action = clap::ArgAction::Append)]
    stun: Vec<String>,

    /// Run without a kernel interface, negotiating connections only
    #[arg(long)]
    signaling_only: bool,
}

fn load_config(args: &Args) -> Config {
    if let Some(path) = &args.config {
        Config::load(path).unwrap_or_else(|e| {
            warn!(
                "failed to load config from {:?}: {}. Using defaults.",
                path, e
            );
            Config::default()
        })
    } else {
        Config::load_or_default()
    }
}

fn collect_stun_servers(args: &Args, config: &Config) -> Vec<String> {
    if !args.stun.is_empty() {
        args.stun.clone()
    } else if !config.network.stun_servers.is_empty() {
        config.network.stun_servers.clone()
    } else if config.network.use_builtin_stun {
        stun::STUN_SERVERS.iter().map(|s| s.to_string()).collect()
    } else {
        Vec::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    if args.init {
        let id = Identity::generate();
        id.save(args.identity.as_ref())?;
        println!("Your public key: {}", id.public_key());
        return Ok(());
    }

    let config = load_config(&args);
    let identity_dir = args.identity.clone().or_else(|| {
        config
            .daemon
            .identity_path
            .as_ref()
            .map(std::path::PathBuf::from)
    });
    let identity = Identity::load_or_generate(identity_dir.as_ref())?;
    info!("using identity {}", identity.public_key().short());

    let management_addr = args
        .management
        .clone()
        .or_else(|| config.network.management.clone())
        .context("no management service configured (--management)")?;
    let signal_addr = args
        .signal
        .clone()
        .or_else(|| config.network.signal.clone())
        .context("no signal service configured (--signal)")?;
    let setup_key = args
        .setup_key
        .clone()
        .or_else(|| config.network.setup_key.clone())
        .unwrap_or_default();

    let stun_servers = collect_stun_servers(&args, &config);
    let turn_servers: Vec<TurnServer> = config.network.turn_servers.clone();

    let management = Arc::new(TcpManagementClient::new(
        &management_addr,
        identity.private_key().clone(),
    ));

    // registration: fetch the server key, then send the sealed payload
    let server_key = management
        .get_server_public_key()
        .await
        .context("fetching management server key")?;
    let peer_config = management
        .register(&server_key, &setup_key, &SystemInfo::collect())
        .await
        .context("registering with management")?;
    info!("registered with overlay address {}", peer_config.address);

    let address = peer_config
        .address
        .parse()
        .context("management returned an unparseable overlay address")?;

    let iface_name = args
        .interface
        .clone()
        .unwrap_or_else(|| config.daemon.interface.clone());
    let listen_port = args.port.unwrap_or(config.daemon.port);

    let engine_config = EngineConfig {
        iface_name: iface_name.clone(),
        address,
        private_key: identity.private_key().clone(),
        listen_port,
        stun_servers,
        turn_servers,
    };

    let device: Arc<dyn TunnelDevice> = if args.signaling_only {
        info!("running in signaling-only mode, no kernel interface");
        Arc::new(MemoryDevice::new())
    } else {
        Arc::new(WgCommandDevice::new(&iface_name))
    };

    let signal_client = Arc::new(TcpSignalClient::new(&signal_addr, identity.public_key()));

    let engine = Engine::new(
        engine_config,
        device,
        signal_client,
        management as Arc<dyn ManagementClient>,
    );
    engine.start().await.context("starting engine")?;

    signal::ctrl_c().await?;
    info!("shutting down");
    engine.stop().await.context("stopping engine")?;

    Ok(())
}
