mod cli;

use clap::Parser;
use cli::Command;
use lanchat::{RoomConfig, RoomHandle};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Serverless chat rooms for the local network.
#[derive(Parser, Debug)]
#[command(name = "lanchat-cli", version, about)]
struct Args {
    /// Room to join
    #[arg(short, long)]
    room: Option<String>,

    /// Name shown to other peers
    #[arg(short, long)]
    nickname: Option<String>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP discovery port
    #[arg(long)]
    discovery_port: Option<u16>,

    /// First TCP port to try for the peer listener
    #[arg(long)]
    port_start: Option<u16>,

    /// Extra unicast announce target, for networks that block broadcast
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,
}

fn prompt(label: &str) -> io::Result<String> {
    loop {
        print!("{label}: ");
        io::stdout().flush()?;
        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
        }
        let value = input.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
        println!("❌ {label} cannot be empty");
    }
}

fn build_config(args: &Args) -> Result<RoomConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RoomConfig::load(path)?,
        None => RoomConfig::default(),
    };
    if let Some(port) = args.discovery_port {
        config.discovery_port = port;
    }
    if let Some(start) = args.port_start {
        let width = config.tcp_port_end.saturating_sub(config.tcp_port_start);
        config.tcp_port_start = start;
        config.tcp_port_end = start.saturating_add(width);
    }
    config.announce_targets.extend(args.peers.iter().copied());
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanchat=info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    println!("💬 lanchat - serverless LAN chat");
    println!("================================");

    let room_name = match &args.room {
        Some(room) => room.clone(),
        None => prompt("Room")?,
    };
    let nickname = match &args.nickname {
        Some(nickname) => nickname.clone(),
        None => prompt("Nickname")?,
    };

    let mut room = RoomHandle::join_with_config(&room_name, &nickname, config).await?;
    println!("✅ Joined '{}' as {} (ID: {}...)", room.room_name(), room.nickname(), room.local_peer_id().short());
    match room.local_ip() {
        Some(ip) => println!("📡 Local IP: {ip}"),
        None => println!("📡 Local IP: unknown"),
    }
    println!("🔍 Discovery port: {}, TCP port: {}", room.discovery_port(), room.tcp_port());
    println!("💡 Type /help for commands");

    if let Some(mut events) = room.take_event_receiver() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                cli::print_event(&event);
            }
        });
    }

    room.send_local_message(&format!("👋 {} joined the chat!", room.nickname()))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Peers => cli::list_peers(&room),
            Command::Messages => cli::list_messages(&room),
            Command::Status => cli::show_status(&room),
            Command::Help => cli::show_help(),
            Command::Send(text) => {
                if let Err(e) = room.send_local_message(&text) {
                    println!("❌ Failed to send message: {e}");
                }
            }
        }
    }

    room.shutdown().await;
    println!("👋 Goodbye!");
    Ok(())
}
