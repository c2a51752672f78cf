#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # clawdbot-companion
//!
//! Headless front end for the companion core. Every command loads the stored
//! configuration, starts a [`Supervisor`], performs one operation through its
//! handle, prints JSON on stdout, and shuts the supervisor down. `run` keeps
//! the supervisor alive and streams its notifications as JSON lines until
//! Ctrl-C.
//!
//! Logs go to stderr. `RUST_LOG` takes precedence over `--log-level`.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use clawdbot_companion::config::{generate_api_secret, DEFAULT_GATEWAY_PORT};
use clawdbot_companion::transport::detect_gateway;
use clawdbot_companion::{
    CommandOutcome, Config, ConfigPatch, FileStore, HttpTransport, Supervisor, SupervisorHandle,
    WsChannel,
};

type CliResult<T> = Result<T, Box<dyn StdError>>;

/// Desktop companion for a Clawdbot gateway.
#[derive(Parser)]
#[command(name = "clawdbot-companion", version)]
struct Cli {
    /// Directory holding the configuration file (default: ~/.clawdbot).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep a supervised connection and print notifications as JSON lines.
    Run {
        /// Connect immediately instead of waiting for autoConnect.
        #[arg(long)]
        connect: bool,
    },
    /// Connect once and report the gateway status.
    Test,
    /// Fetch gateway status.
    Status,
    /// Fetch the session list.
    Sessions,
    /// Fetch recent messages.
    Messages {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Send a chat message.
    Send {
        text: String,
        #[arg(long)]
        target: Option<String>,
    },
    /// Send a configured quick action by name.
    Quick { name: String },
    /// Show or change the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Record that onboarding has been completed.
    Onboarded,
    /// Clear the stored configuration.
    Reset,
    /// Look for a gateway on this machine.
    Detect {
        #[arg(long, default_value_t = DEFAULT_GATEWAY_PORT)]
        port: u16,
    },
    /// Print a freshly generated API secret.
    Secret,
    /// Platform and companion state.
    Info,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current configuration (secret masked).
    Show,
    /// Apply a JSON patch, e.g. '{"gatewayUrl":"http://localhost:3000"}'.
    Set { patch: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    match execute(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("clawdbot-companion: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run one command. `Ok(false)` means the command ran but failed.
async fn execute(cli: Cli) -> CliResult<bool> {
    match cli.command {
        Commands::Secret => {
            print_json(&json!({ "apiSecret": generate_api_secret() }))?;
            return Ok(true);
        }
        Commands::Detect { port } => {
            let probe = detect_gateway(port).await;
            print_json(&probe)?;
            return Ok(probe.running);
        }
        _ => {}
    }

    let streaming = matches!(cli.command, Commands::Run { .. });
    let handle = start_supervisor(cli.config_dir.as_deref(), streaming)?;
    let result = dispatch(&handle, cli.command).await;
    if let Err(e) = handle.shutdown().await {
        warn!("shutdown: {e}");
    }
    result
}

fn start_supervisor(
    config_dir: Option<&std::path::Path>,
    streaming: bool,
) -> CliResult<SupervisorHandle> {
    let store = match config_dir {
        Some(dir) => FileStore::open(dir)?,
        None => FileStore::open_default()?,
    };
    info!("configuration file: {}", store.path().display());

    let mut config = Config::load(&store)?;
    config.apply_env_overrides();
    if !streaming {
        // One-shot commands never auto-connect.
        config.auto_connect = false;
    }

    Ok(Supervisor::spawn(
        config,
        Box::new(store),
        Arc::new(HttpTransport::new()?),
        Box::new(WsChannel::new()),
    ))
}

async fn dispatch(handle: &SupervisorHandle, command: Commands) -> CliResult<bool> {
    match command {
        Commands::Run { connect } => {
            stream(handle, connect).await?;
            Ok(true)
        }
        Commands::Test => outcome(handle.test_connection().await),
        Commands::Status => fetched(&handle.status().await?),
        Commands::Sessions => fetched(&handle.sessions().await?),
        Commands::Messages { limit } => fetched(&handle.messages(limit).await?),
        Commands::Send { text, target } => outcome(handle.send_message(text, target).await),
        Commands::Quick { name } => outcome(handle.send_quick_action(name).await),
        Commands::Config { action } => {
            let config = match action {
                ConfigAction::Show => handle.config().await?,
                ConfigAction::Set { patch } => {
                    let patch: ConfigPatch = serde_json::from_str(&patch)
                        .map_err(|e| format!("invalid config patch: {e}"))?;
                    handle.update_config(patch).await?
                }
            };
            print_json(&masked(&config)?)?;
            Ok(true)
        }
        Commands::Onboarded => {
            handle.mark_onboarding_seen().await?;
            print_json(&json!({ "onboardingSeen": true }))?;
            Ok(true)
        }
        Commands::Reset => {
            handle.reset().await?;
            print_json(&json!({ "reset": true }))?;
            Ok(true)
        }
        Commands::Info => {
            let system = handle.system_info().await?;
            let app = handle.app_state().await?;
            print_json(&json!({ "system": system, "app": app }))?;
            Ok(true)
        }
        Commands::Secret | Commands::Detect { .. } => Ok(true),
    }
}

/// Print notifications until Ctrl-C or until the supervisor stops.
async fn stream(handle: &SupervisorHandle, connect: bool) -> CliResult<()> {
    let mut events = handle.subscribe().await?;
    if connect {
        if let Err(e) = handle.connect().await {
            warn!("connect: {e}");
        }
    }
    info!("streaming notifications, Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(n) => println!("{}", serde_json::to_string(&n)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}

fn outcome(result: Result<Value, clawdbot_companion::Error>) -> CliResult<bool> {
    let outcome = CommandOutcome::from(result);
    print_json(&outcome)?;
    Ok(outcome.success)
}

/// Print a snapshot; a resource that was never fetched counts as a failure.
fn fetched<T: Serialize>(snapshot: &clawdbot_companion::supervisor::Snapshot<T>) -> CliResult<bool> {
    print_json(snapshot)?;
    Ok(snapshot.fetched_at_ms.is_some())
}

fn masked(config: &Config) -> CliResult<Value> {
    let mut value = serde_json::to_value(config)?;
    if !config.api_secret.is_empty() {
        value["apiSecret"] = json!("********");
    }
    Ok(value)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
