//! berth command-line client
//!
//! Talks to a container daemon over its control socket. Provides:
//! - One-shot queries (`info`, `ps`) and actions (`start`, `stop`, `rm`)
//! - A `watch` mode that prints every client event until interrupted

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use berth_client::config::config_file;
use berth_client::{
    ApiCall, ApiMessage, Client, ClientConfig, ClientEvent, ClientHandle, Health,
};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

mod logging;
mod render;

/// How long one-shot commands wait for the daemon
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Status the daemon returns when a resource is already in the requested state
const NOT_MODIFIED: u16 = 304;

/// berth - container daemon client
#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Inspect and control a container daemon over its Unix socket")]
#[command(version)]
#[command(after_help = "\
Examples:
  berth info                  Show daemon summary
  berth ps --running          List running containers
  berth start web             Start the container named web
  berth watch --json          Stream events as JSON lines
  berth --log-file /tmp/berth.log watch
  berth --socket /run/user/1000/docker.sock ps

Environment:
  DOCKER_HOST=unix:///path    Socket path, unless --socket is given
  RUST_LOG=berth=debug        Log filter
")]
struct Cli {
    /// Daemon socket path (overrides the config file and `DOCKER_HOST`)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Config file (defaults to `~/.config/berth/config.json`)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Also append log lines to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the daemon summary
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List containers
    Ps {
        /// Only show running containers
        #[arg(short, long)]
        running: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a container
    Start {
        /// Container id or name
        id: String,
    },

    /// Stop a container
    Stop {
        /// Container id or name
        id: String,
    },

    /// Remove a container
    Rm {
        /// Container id or name
        id: String,
    },

    /// Print client events until interrupted
    Watch {
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    if let Some(path) = &cli.config
        && !path.exists()
    {
        bail!("Config file not found: {}", path.display());
    }

    let config = match config_file(cli.config.clone()) {
        Some(path) => ClientConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let mut config = config.with_docker_host(std::env::var("DOCKER_HOST").ok().as_deref());
    if let Some(socket) = &cli.socket {
        config.socket_path.clone_from(socket);
    }
    config.validate()?;
    Ok(config)
}

/// Wait for the first event `pick` accepts.
///
/// Fails as soon as the daemon turns out to be unreachable.
async fn wait_for<T>(
    client: &mut ClientHandle,
    mut pick: impl FnMut(ClientEvent) -> Option<Result<T>>,
) -> Result<T> {
    let wait = async {
        while let Some(event) = client.recv().await {
            debug!(?event, "Client event");
            if let ClientEvent::Health(Health::Disconnected { reason }) = &event {
                bail!("Daemon unavailable: {reason}");
            }
            if let Some(result) = pick(event) {
                return result;
            }
        }
        Err(anyhow!("Client stopped unexpectedly"))
    };

    tokio::time::timeout(COMMAND_TIMEOUT, wait)
        .await
        .context("Timed out waiting for the daemon")?
}

async fn run_info(mut client: ClientHandle, json: bool) -> Result<()> {
    let result = wait_for(&mut client, |event| match event {
        ClientEvent::Message(ApiMessage::Info(info)) => Some(Ok(info)),
        ClientEvent::Failed(signal) => Some(Err(anyhow!("Daemon error: {signal}"))),
        _ => None,
    })
    .await;
    client.disconnect().await;
    let info = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("{}", render::info_text(&info));
    }
    Ok(())
}

async fn run_ps(mut client: ClientHandle, running: bool, json: bool) -> Result<()> {
    let result = wait_for(&mut client, |event| match event {
        ClientEvent::Message(ApiMessage::ResourceList { resources }) => Some(Ok(resources)),
        ClientEvent::Failed(signal) => Some(Err(anyhow!("Daemon error: {signal}"))),
        _ => None,
    })
    .await;
    client.disconnect().await;

    let mut resources = result?;
    if running {
        resources.retain(berth_types::Resource::is_active);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&resources)?);
    } else {
        println!("{}", render::resource_table(&resources));
    }
    Ok(())
}

async fn run_action(mut client: ClientHandle, call: ApiCall) -> Result<()> {
    client.send(call.clone())?;

    let result = wait_for(&mut client, |event| match event {
        ClientEvent::Message(ApiMessage::NoContent) => Some(Ok(false)),
        ClientEvent::Failed(signal) if signal.status == NOT_MODIFIED => Some(Ok(true)),
        ClientEvent::Failed(signal) => Some(Err(anyhow!("{call} failed: {signal}"))),
        ClientEvent::ActionRejected { action, reason } => {
            Some(Err(anyhow!("{action} rejected: {reason}")))
        }
        _ => None,
    })
    .await;
    client.disconnect().await;

    if result? {
        println!("{call}: already done");
    } else {
        println!("{call}: ok");
    }
    Ok(())
}

async fn run_watch(mut client: ClientHandle, json: bool) -> Result<()> {
    loop {
        tokio::select! {
            event = client.recv() => {
                let Some(event) = event else {
                    break;
                };
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    println!("{}", render::event_line(&event));
                }
            }

            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {e}");
                }
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::setup_logging(cli.debug, cli.log_file.as_deref())?;

    let config = load_config(&cli)?;
    debug!(socket = %config.socket_path.display(), "Using daemon socket");

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Info { json } => run_info(Client::spawn(config), json).await,
        Commands::Ps { running, json } => run_ps(Client::spawn(config), running, json).await,
        Commands::Start { id } => run_action(Client::spawn(config), ApiCall::Start(id)).await,
        Commands::Stop { id } => run_action(Client::spawn(config), ApiCall::Stop(id)).await,
        Commands::Rm { id } => run_action(Client::spawn(config), ApiCall::Delete(id)).await,
        Commands::Watch { json } => run_watch(Client::spawn(config), json).await,
    }
}
