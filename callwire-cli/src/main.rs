//! Callwire CLI Application

use anyhow::{Context, Result};
use callwire_core::prelude::*;
use callwire_core::{IceServer, MediaAcquisitionManager, RelayServer, StaticSampleDevices};
use clap::{Parser, Subcommand};
use console::{format_device_status, format_device_trial, ConsoleObserver};
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

mod console;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Participant id used as the personal relay room (random if omitted)
    #[arg(short, long, global = true, env = "CALLWIRE_IDENTITY")]
    identity: Option<String>,

    /// Display name shown to the remote side
    #[arg(short, long, global = true, env = "CALLWIRE_NAME")]
    name: Option<String>,

    /// JSON configuration file
    #[arg(long, global = true, env = "CALLWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// STUN server URL (repeatable, replaces the configured list)
    #[arg(long = "stun", global = true)]
    stun: Vec<String>,

    /// Seconds an incoming call rings before it is declined
    #[arg(long, global = true)]
    ring_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(long, env = "CALLWIRE_BIND", default_value = "127.0.0.1:9000")]
        bind: SocketAddr,
    },

    /// Call a participant
    Call {
        /// Participant id to call
        peer: String,

        /// Relay URL
        #[arg(long, env = "CALLWIRE_SERVER", default_value = "ws://127.0.0.1:9000")]
        server: String,

        /// Place an audio-only call
        #[arg(long)]
        audio_only: bool,
    },

    /// Wait for incoming calls
    Listen {
        /// Relay URL
        #[arg(long, env = "CALLWIRE_SERVER", default_value = "ws://127.0.0.1:9000")]
        server: String,

        /// Accept incoming calls without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Check camera and microphone before a call
    Devices {
        /// Test the microphone only
        #[arg(long)]
        audio_only: bool,
    },

    /// Show the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("callwire=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Relay { bind } => handle_relay(bind).await,
        Commands::Call {
            ref peer,
            ref server,
            audio_only,
        } => {
            let media_type = if audio_only {
                MediaType::Audio
            } else {
                config.constraints.media_type()
            };
            handle_call(identity(&cli), config, server, peer, media_type).await
        }
        Commands::Listen {
            ref server,
            auto_accept,
        } => handle_listen(identity(&cli), config, server, auto_accept).await,
        Commands::Devices { audio_only } => handle_devices(&config, audio_only).await,
        Commands::Status => handle_status(&identity(&cli), &config),
    }
}

fn identity(cli: &Cli) -> ParticipantIdentity {
    let id = cli.identity.clone().unwrap_or_else(generate_random_identity);
    match &cli.name {
        Some(name) => ParticipantIdentity::new(id, name.clone()),
        None => ParticipantIdentity::anonymous(id),
    }
}

fn load_config(cli: &Cli) -> Result<CallConfig> {
    let mut config = match &cli.config {
        Some(path) => CallConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CallConfig::default(),
    };
    if !cli.stun.is_empty() {
        config.ice_servers = cli.stun.iter().map(IceServer::stun).collect();
    }
    if let Some(secs) = cli.ring_timeout {
        config.ring_timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

async fn connect(
    identity: ParticipantIdentity,
    config: CallConfig,
    server: &str,
) -> Result<CallEngine<WebSocketTransport>> {
    let transport_config = TransportConfig {
        url: server.to_string(),
        ..TransportConfig::default()
    };
    let transport = Arc::new(
        WebSocketTransport::connect(&transport_config)
            .await
            .with_context(|| format!("connecting to relay {server}"))?,
    );
    let engine = CallEngine::builder(identity, transport)
        .with_config(config)
        .build()
        .await?;
    engine.add_observer(Arc::new(ConsoleObserver::new(engine.identity().id.clone())));
    println!("🔗 Connected to {server} as {}", engine.identity());
    Ok(engine)
}

async fn handle_relay(bind: SocketAddr) -> Result<()> {
    let server = RelayServer::bind(bind).await?;
    println!("📡 Relay listening on ws://{}", server.local_addr()?);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => println!("📡 Relay stopped"),
    }
    Ok(())
}

async fn handle_call(
    identity: ParticipantIdentity,
    config: CallConfig,
    server: &str,
    peer: &str,
    media_type: MediaType,
) -> Result<()> {
    let engine = connect(identity, config, server).await?;
    let mut events = engine.subscribe_events();

    println!("📞 Calling {peer} ({media_type})...");
    let call_id = engine.call_with(peer, media_type).await?;
    tracing::info!(call_id = %call_id, "Call placed");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::StateChanged { state: CallState::Idle, .. }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(text) => send_line(&engine, text).await,
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("👋 Hanging up");
                if let Err(e) = engine.end_call().await {
                    tracing::debug!(error = %e, "No call to end");
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn handle_listen(
    identity: ParticipantIdentity,
    config: CallConfig,
    server: &str,
    auto_accept: bool,
) -> Result<()> {
    let ring_secs = config.ring_timeout.as_secs();
    let engine = connect(identity, config, server).await?;
    let mut events = engine.subscribe_events();

    println!("👂 Listening for incoming calls...");
    if auto_accept {
        println!("   Auto-accept: enabled");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::IncomingCall(_)) if auto_accept => {
                    println!("✅ Accepting call...");
                    if let Err(e) = engine.accept().await {
                        println!("❌ Could not accept: {e}");
                    }
                }
                Ok(CallEvent::IncomingCall(_)) => {
                    println!("   Type 'y' to accept or 'n' to reject ({ring_secs}s)");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => {
                let Some(text) = line? else {
                    stdin_open = false;
                    continue;
                };
                match (engine.state(), text.trim()) {
                    (CallState::Ringing, "y") => {
                        if let Err(e) = engine.accept().await {
                            println!("❌ Could not accept: {e}");
                        }
                    }
                    (CallState::Ringing, "n") => {
                        if let Err(e) = engine.reject("rejected").await {
                            tracing::debug!(error = %e, "Call already gone");
                        }
                    }
                    _ => send_line(&engine, text).await,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn send_line(engine: &CallEngine<WebSocketTransport>, text: String) {
    if text.trim().is_empty() {
        return;
    }
    if let Err(e) = engine.send_text(text).await {
        println!("⚠️  Message not sent: {e}");
    }
}

async fn handle_devices(config: &CallConfig, audio_only: bool) -> Result<()> {
    let media = MediaAcquisitionManager::new(
        Arc::new(StaticSampleDevices::new()),
        config.acquisition.clone(),
    );
    let constraints = if audio_only {
        MediaConstraints::audio_only()
    } else {
        config.constraints.clone()
    };

    println!("🎛  Testing camera and microphone...");
    for line in format_device_status(&media.device_status().await) {
        println!("{line}");
    }
    match media.test_devices(&constraints).await {
        Ok(trial) => {
            println!("{}", format_device_trial(&trial));
            Ok(())
        }
        Err(e) => {
            tracing::debug!(error = %e, "Device test failed");
            anyhow::bail!("❌ {}", e.kind().user_message())
        }
    }
}

fn handle_status(identity: &ParticipantIdentity, config: &CallConfig) -> Result<()> {
    println!("📊 Callwire Status");
    println!("==================");
    println!("Identity:          {identity}");
    println!("Ring timeout:      {}s", config.ring_timeout.as_secs());
    println!("Request timeout:   {}s", config.request_timeout.as_secs());
    println!("Disconnect grace:  {}ms", config.disconnect_grace.as_millis());
    println!("Negotiation limit: {}s", config.negotiation_timeout.as_secs());
    println!("Default call type: {}", config.constraints.media_type());
    println!("Data channel:      {}", config.data_channel_label);
    for server in &config.ice_servers {
        println!("ICE server:        {}", server.urls.join(", "));
    }
    println!();
    println!("Effective configuration:");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "delta", "ember", "fjord", "grove", "heron", "iris", "jade",
        "kestrel", "lark", "maple", "north", "onyx", "pine", "quartz", "raven", "sage", "tide",
        "umber", "vale", "willow", "yarrow", "zephyr",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{}",
        WORDS[rng.gen_range(0..WORDS.len())],
        WORDS[rng.gen_range(0..WORDS.len())],
        rng.gen_range(100..1000)
    )
}
