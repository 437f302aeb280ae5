//! tunlink: inspect and drive shared VPN session state
//!
//! Opens the same file-backed namespaces the host app and tunnel
//! extension use, so session state can be watched or injected from a
//! terminal.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tunlink_session::{
    IdentityRegistry, NamespaceKind, Namespaces, ObservationBus, SessionConfig, SessionContext,
    SessionEvent, StatusKey,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "tunlink", version, about = "Shared VPN session state")]
struct Cli {
    /// Session configuration (.toml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of the namespace files (overrides the configuration)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print decoded session events until interrupted
    Watch,
    /// Show the persisted session identity
    Identity,
    /// Write a raw status value, as the engine would
    Publish {
        #[arg(value_enum)]
        key: KeyArg,
        value: String,
        /// Namespace to write into
        #[arg(long, value_enum, default_value = "main")]
        namespace: NamespaceArg,
    },
    /// Validate the configuration
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum KeyArg {
    ConnectionUpdate,
    VpnStatus,
    ProfileStatus,
}

impl From<KeyArg> for StatusKey {
    fn from(key: KeyArg) -> Self {
        match key {
            KeyArg::ConnectionUpdate => StatusKey::ConnectionUpdate,
            KeyArg::VpnStatus => StatusKey::VpnStatus,
            KeyArg::ProfileStatus => StatusKey::ProfileStatus,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum NamespaceArg {
    Main,
    Group,
}

impl From<NamespaceArg> for NamespaceKind {
    fn from(ns: NamespaceArg) -> Self {
        match ns {
            NamespaceArg::Main => NamespaceKind::Main,
            NamespaceArg::Group => NamespaceKind::Group,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Command::Check => check(&config),
        Command::Identity => identity(&config),
        Command::Publish {
            key,
            value,
            namespace,
        } => publish(&config, key.into(), namespace.into(), &value),
        Command::Watch => watch(&config).await,
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(dir) = &cli.store_dir {
        config.store_dir = Some(dir.clone());
    }
    Ok(config)
}

fn check(config: &SessionConfig) -> Result<()> {
    config.validate()?;

    println!("platform:     {}", config.platform);
    println!("namespace:    {}", config.main_namespace);
    match config.isolation() {
        Some(isolation) => {
            println!("group:        {}", isolation.group_identifier);
            println!("description:  {}", isolation.localized_description);
            println!("provider:     {}", isolation.provider_bundle_identifier);
        }
        None => println!("group:        (none)"),
    }
    println!("merge policy: {:?}", config.merge_policy);
    Ok(())
}

fn identity(config: &SessionConfig) -> Result<()> {
    let namespaces = Namespaces::open(config)?;
    let registry = IdentityRegistry::new(namespaces.main_store());

    match registry.current() {
        Some(identity) if identity.name.is_empty() => println!("id: {}", identity.id),
        Some(identity) => println!("name: {}\nid:   {}", identity.name, identity.id),
        None => println!("no session identity stored"),
    }
    Ok(())
}

fn publish(config: &SessionConfig, key: StatusKey, kind: NamespaceKind, value: &str) -> Result<()> {
    let namespaces = Namespaces::open(config)?;
    let store = match kind {
        NamespaceKind::Main => namespaces.main_store(),
        NamespaceKind::Group => match namespaces.group_store() {
            Some(store) => store,
            None => bail!("{} has no group namespace", config.platform),
        },
    };

    let Some(store_key) = key.store_key(kind) else {
        bail!("{} is not exposed in the {} namespace", key, kind);
    };

    store.set_string(store_key, value)?;
    info!("Wrote {}={:?} to {}", store_key, value, store.namespace());
    Ok(())
}

async fn watch(config: &SessionConfig) -> Result<()> {
    let namespaces = Namespaces::open(config)?;
    let pollers = namespaces.spawn_pollers(config.poll_interval());

    let bus = ObservationBus::new(
        Arc::new(SessionContext::new()),
        config.merge_policy,
        namespaces.main_store(),
        namespaces.group_store(),
    );
    bus.wire_all();
    if bus.wired_count() == 0 {
        warn!("No store observers were registered");
    }
    let stream = bus.event_channel();
    info!("Watching {} (ctrl-c to stop)", namespaces.main.path().display());

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                for event in stream.drain() {
                    print_event(&event);
                }
            }
        }
    }

    bus.close_stream(stream);
    for poller in pollers {
        poller.abort();
    }
    info!("tunlink shutting down");
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ConnectionUpdate(e) => println!(
            "connection  duration={} last_packet={} in={} out={}",
            e.duration, e.last_packet_receive_at, e.bytes_in, e.bytes_out
        ),
        SessionEvent::VpnStatus(state) => println!("vpn         {}", state),
        SessionEvent::ProfileStatus(loaded) => println!("profile     loaded={}", loaded),
    }
}
