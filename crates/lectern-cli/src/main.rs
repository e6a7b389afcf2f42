//! Lectern CLI
//!
//! Runs the signaling relay, lists video calls from the platform API, and
//! probes a call end to end with synthetic media.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use lectern_call::{
    watch_listing, CallCommand, CallConfig, CallDeps, CallDirectory, CallEvent, CallId,
    CallListing, CallRole, CallSession, CallState, ParticipantInfo, PlatformRole,
    SyntheticMedia, SyntheticPeerBackend, VideoCallRecord, WsSignalingConnector,
};
use lectern_signal::RelayConfig;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

/// Lectern - peer video calls for the learning platform
#[derive(Parser, Debug)]
#[command(name = "lectern")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay
    Serve {
        /// Path to relay configuration (default: relay.json in current directory)
        #[arg(short, long, value_name = "FILE")]
        config: Option<String>,

        /// Port to listen on, overriding the configured bind address
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// List video calls from the platform API
    Calls {
        /// Which list to read
        #[arg(value_enum, default_value_t = ListingArg::Incoming)]
        listing: ListingArg,

        /// Keep refreshing until interrupted
        #[arg(short, long)]
        watch: bool,

        /// Print records as JSON
        #[arg(long)]
        json: bool,

        /// Base URL of the platform API
        #[arg(long, value_name = "URL", env = "LECTERN_API_URL")]
        api: Option<String>,

        /// Bearer token for the platform API
        #[arg(long, env = "LECTERN_API_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Path to call configuration (default: lectern.json in current directory)
        #[arg(short, long, value_name = "FILE")]
        config: Option<String>,
    },

    /// Join a call with synthetic media over a real relay
    Probe {
        /// Call to join
        #[arg(long, value_name = "ID")]
        call_id: String,

        /// Peer id to join as
        #[arg(long, value_name = "NAME")]
        peer: String,

        /// Peer id expected on the other side of the call
        #[arg(long, value_name = "NAME")]
        remote: String,

        /// Send the offer instead of answering
        #[arg(long)]
        caller: bool,

        /// Base URL of the signaling relay
        #[arg(long, value_name = "URL")]
        signal: Option<String>,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value_t = 10)]
        duration: u64,

        /// Path to call configuration (default: lectern.json in current directory)
        #[arg(short, long, value_name = "FILE")]
        config: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ListingArg {
    Incoming,
    Scheduled,
    History,
}

impl From<ListingArg> for CallListing {
    fn from(arg: ListingArg) -> Self {
        match arg {
            ListingArg::Incoming => Self::Incoming,
            ListingArg::Scheduled => Self::Scheduled,
            ListingArg::History => Self::History,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match args.command {
        Command::Serve { config, port } => run_serve(config.as_deref(), port).await,
        Command::Calls {
            listing,
            watch,
            json,
            api,
            token,
            config,
        } => {
            let output = Output { json };
            run_calls(config.as_deref(), listing.into(), watch, output, api, token).await
        }
        Command::Probe {
            call_id,
            peer,
            remote,
            caller,
            signal,
            duration,
            config,
        } => {
            let role = if caller {
                CallRole::Caller
            } else {
                CallRole::Callee
            };
            run_probe(
                config.as_deref(),
                CallId::from(call_id),
                &peer,
                &remote,
                role,
                signal,
                Duration::from_secs(duration),
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

// ============================================================================
// serve
// ============================================================================

async fn run_serve(config_path: Option<&str>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_relay_config(config_path)?;

    if let Some(port) = port {
        let mut addr = config.socket_addr()?;
        addr.set_port(port);
        config.bind_addr = addr.to_string();
    }
    config.validate()?;

    println!("Relay configuration:");
    println!("  Bind address: {}", config.bind_addr);
    println!("  Peers per room: {}", config.max_peers_per_room);
    println!("  Max frame: {} bytes", config.max_message_bytes);
    println!("  Heartbeat: {}s", config.heartbeat_secs);

    let listener = TcpListener::bind(config.socket_addr()?).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind {}: {e}\n\nSuggestion: Choose a free port with --port",
            config.bind_addr
        )
    })?;

    lectern_signal::serve(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C, shutting down");
    })
    .await?;
    Ok(())
}

fn load_relay_config(config_path: Option<&str>) -> anyhow::Result<RelayConfig> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Ok(RelayConfig::load_from_file(path)?)
        }
        None => {
            let dir = std::env::current_dir()?;
            Ok(RelayConfig::load_from_dir(&dir)?)
        }
    }
}

// ============================================================================
// calls
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn print(self, listing: CallListing, calls: &[VideoCallRecord]) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(calls)?);
            return Ok(());
        }

        println!("{} calls: {}", listing.as_str(), calls.len());
        for call in calls {
            let when = call
                .scheduled_at
                .or(call.started_at)
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
            println!(
                "  {:<12} {:<9} {:<25} {} (host: {})",
                call.id, call.status, when, call.title, call.host_name
            );
        }
        Ok(())
    }
}

async fn run_calls(
    config_path: Option<&str>,
    listing: CallListing,
    watch: bool,
    output: Output,
    api: Option<String>,
    token: Option<String>,
) -> anyhow::Result<()> {
    let mut config = load_call_config(config_path)?;
    if let Some(api) = api {
        config.api_base_url = api;
    }

    let mut directory = CallDirectory::from_config(&config)?;
    if let Some(token) = token {
        directory = directory.with_token(token);
    }

    if !watch {
        let calls = directory.list(listing).await?;
        return output.print(listing, &calls);
    }

    let period = Duration::from_secs(config.poll_interval_secs);
    tracing::info!(listing = listing.as_str(), period = ?period, "watching call list");
    let (mut handle, mut rx) = watch_listing(directory, listing, period)?;

    loop {
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let calls = rx.borrow_and_update().clone();
                output.print(listing, &calls)?;
            }
        }
    }

    handle.cancel();
    Ok(())
}

fn load_call_config(config_path: Option<&str>) -> anyhow::Result<CallConfig> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Ok(CallConfig::load_from_file(path)?)
        }
        None => Ok(CallConfig::load()?),
    }
}

// ============================================================================
// probe
// ============================================================================

async fn run_probe(
    config_path: Option<&str>,
    call_id: CallId,
    peer: &str,
    remote: &str,
    role: CallRole,
    signal: Option<String>,
    duration: Duration,
) -> anyhow::Result<()> {
    let mut config = load_call_config(config_path)?;
    if let Some(signal) = signal {
        config.signaling_url = signal;
    }
    config.validate()?;

    println!("Probing call {call_id} as {peer} ({role})");
    println!("  Relay: {}", config.signaling_url);

    let connector = WsSignalingConnector::new(config.signaling_url.clone());
    let deps = CallDeps::new(
        Arc::new(SyntheticMedia::new()),
        Arc::new(SyntheticPeerBackend::new()),
        Arc::new(connector),
        config,
    );
    let mut session = CallSession::new(
        call_id,
        role,
        ParticipantInfo::local(peer, peer, PlatformRole::Student),
        ParticipantInfo::remote(remote, remote, PlatformRole::Mentor),
        deps,
    );

    let printer = tokio::spawn(print_events(session.subscribe()));
    let (commands, rx) = mpsc::channel(8);
    let hangup = tokio::spawn(hang_up_after(session.subscribe(), commands, duration));

    let final_state = session.run(rx).await;
    hangup.abort();
    printer.abort();

    let history: Vec<String> = session.history().iter().map(ToString::to_string).collect();
    println!();
    println!("=== Probe Summary ===");
    println!("Final state: {final_state}");
    println!("History: {}", history.join(" -> "));
    println!("Chat messages: {}", session.chat().len());

    if final_state == CallState::Error {
        let reason = session
            .error()
            .map_or_else(|| "unknown failure".to_string(), |f| f.message.clone());
        anyhow::bail!("Call failed: {reason}");
    }
    Ok(())
}

/// Prints state changes and chat as they happen.
async fn print_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(CallEvent::StateChanged { from, to }) => println!("  {from} -> {to}"),
            Ok(CallEvent::Chat { message }) => println!("  [chat] {}: {}", message.sender, message.text),
            Ok(CallEvent::RemoteTrack { track }) => println!("  remote {} track {}", track.kind, track.id),
            Ok(CallEvent::Error { kind, message }) => println!("  error ({kind:?}): {message}"),
            Ok(CallEvent::Flags { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Sends `End` once the call has been connected for `duration`, or on Ctrl+C.
async fn hang_up_after(
    mut events: broadcast::Receiver<CallEvent>,
    commands: mpsc::Sender<CallCommand>,
    duration: Duration,
) {
    let connected = async {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged {
                    to: CallState::Connected,
                    ..
                }) => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };

    let reason = tokio::select! {
        Ok(()) = tokio::signal::ctrl_c() => "interrupted",
        up = connected => {
            if !up {
                return;
            }
            tokio::select! {
                Ok(()) = tokio::signal::ctrl_c() => "interrupted",
                () = tokio::time::sleep(duration) => "probe finished",
            }
        }
    };
    tracing::info!(reason, "hanging up");
    let _ = commands.send(CallCommand::End(reason.to_string())).await;
}
