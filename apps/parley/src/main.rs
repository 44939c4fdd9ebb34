use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use parley_client_core::media::{NoMediaDevices, default_classifier};
use parley_client_core::relay::RelayClient;
use parley_client_core::telemetry::{self, LogConfig, LogLevel};
use parley_client_core::transport::webrtc::WebRtcTransportFactory;
use parley_client_core::{MeshConfig, MeshDeps, MeshEvent, MeshSession};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    telemetry::init(&log_config).context("failed to configure logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Join(args) => handle_join(args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "parley",
    about = "Join a parley room from the terminal",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "PARLEY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "PARLEY_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig::from_env(self.level, self.file.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room and chat over the mesh
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long, env = "PARLEY_RELAY", help = "Signaling relay websocket URL")]
    relay: String,

    #[arg(long, env = "PARLEY_ROOM", help = "Room to join")]
    room: String,

    #[arg(long = "user-id", env = "PARLEY_USER_ID", help = "Identity issued for this session")]
    user_id: String,

    #[arg(
        long,
        env = "PARLEY_PASSPHRASE",
        help = "Chat passphrase (defaults to the room id)"
    )]
    passphrase: Option<String>,

    #[arg(long = "max-peers", env = "PARLEY_MAX_PEERS", help = "Peer connection limit")]
    max_peers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Chat(String),
    Send(PathBuf),
    Typing,
    Quit,
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    match line.split_once(char::is_whitespace) {
        Some(("/send", path)) if !path.trim().is_empty() => Input::Send(PathBuf::from(path.trim())),
        _ => match line {
            "/quit" | "/exit" => Input::Quit,
            "/typing" => Input::Typing,
            _ => Input::Chat(line.to_string()),
        },
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

async fn handle_join(args: JoinArgs) -> Result<()> {
    let mut config = MeshConfig::from_env();
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers.max(1);
    }

    let (relay, inbound) = RelayClient::connect(&args.relay, &args.user_id)
        .await
        .with_context(|| format!("failed to connect to relay {}", args.relay))?;
    let transports = WebRtcTransportFactory::new(config.ice_servers.clone())
        .context("failed to configure webrtc")?;
    let deps = MeshDeps {
        transports: Arc::new(transports),
        devices: Arc::new(NoMediaDevices),
        signals: relay.clone(),
        classifier: default_classifier(),
    };
    let mesh = MeshSession::new(
        &args.user_id,
        &args.room,
        args.passphrase.as_deref(),
        config,
        deps,
    );

    let printer = tokio::spawn(print_events(mesh.subscribe()));
    let runner = {
        let mesh = Arc::clone(&mesh);
        tokio::spawn(async move { mesh.run(inbound).await })
    };
    mesh.join().await.context("failed to join room")?;
    println!(
        "joined room {} as {}; type to chat, /send <path>, /typing, /quit",
        args.room, args.user_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut typing = false;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Typing => {
                typing = !typing;
                if let Err(err) = mesh.set_typing(typing).await {
                    eprintln!("⚠️  {err}");
                }
            }
            Input::Chat(text) => {
                if typing {
                    typing = false;
                    let _ = mesh.set_typing(false).await;
                }
                if let Err(err) = mesh.send_chat(&text).await {
                    eprintln!("⚠️  message not sent: {err}");
                }
            }
            Input::Send(path) => match send_file(&mesh, &path).await {
                Ok(id) => println!("sent {} (transfer {id})", path.display()),
                Err(err) => eprintln!("⚠️  {err:#}"),
            },
        }
    }

    let left = mesh.leave().await;
    runner.abort();
    printer.abort();
    left.context("failed to leave room")?;
    Ok(())
}

async fn send_file(mesh: &MeshSession, path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let id = mesh
        .send_bulk(&name, mime_for_path(path), Bytes::from(data))
        .await?;
    Ok(id)
}

async fn print_events(mut events: broadcast::Receiver<MeshEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("⚠️  skipped {skipped} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            MeshEvent::PeerAdded { peer_id } => println!("+ {peer_id}"),
            MeshEvent::PeerRemoved { peer_id } => println!("- {peer_id}"),
            MeshEvent::ConnectionStateChanged { peer_id, state } => {
                println!("  {peer_id}: {state}")
            }
            MeshEvent::AuxChannelChanged { peer_id, open } => {
                println!("  {peer_id}: transfers {}", if open { "ready" } else { "closed" })
            }
            MeshEvent::RemoteTrackAdded {
                peer_id,
                track,
                class,
            } => println!("  {peer_id}: {class:?} track {}", track.label),
            MeshEvent::ChatReceived { from, content } => println!("<{from}> {}", content.text()),
            MeshEvent::TypingChanged { from, typing } => {
                if typing {
                    println!("  {from} is typing…");
                }
            }
            MeshEvent::RoomIdGenerated { room_id } => match room_id {
                Some(room_id) => println!("room id: {room_id}"),
                None => println!("relay did not return a room id"),
            },
            MeshEvent::RelayError { error } => eprintln!("⚠️  relay: {error}"),
            MeshEvent::TransferCompleted(transfer) => println!(
                "received {} ({}, {} bytes) from {}",
                transfer.name,
                transfer.mime,
                transfer.bytes.len(),
                transfer.peer_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_commands_parse() {
        assert_eq!(parse_input("  "), Input::Empty);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/typing"), Input::Typing);
        assert_eq!(
            parse_input("/send ./cat photo.png"),
            Input::Send(PathBuf::from("./cat photo.png"))
        );
        assert_eq!(parse_input("/send"), Input::Chat("/send".into()));
        assert_eq!(parse_input(" hello there "), Input::Chat("hello there".into()));
    }

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_for_path(Path::new("a/b/CAT.PNG")), "image/png");
        assert_eq!(mime_for_path(Path::new("notes.txt")), "text/plain");
        assert_eq!(mime_for_path(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn join_requires_relay_room_and_user() {
        let cli = Cli::try_parse_from([
            "parley", "join", "--relay", "ws://localhost:8080/ws", "--room", "r1", "--user-id",
            "a1",
        ])
        .expect("parse");
        let Command::Join(args) = cli.command;
        assert_eq!(args.room, "r1");
        assert!(args.passphrase.is_none());
        assert_eq!(cli.logging.level, LogLevel::Warn);
    }
}
