use lanchat::{format_timestamp, Message, RoomEvent, RoomHandle};

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Peers,
    Messages,
    Status,
    Help,
    Quit,
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" => Command::Empty,
            "/quit" | "quit" | "exit" | "q" => Command::Quit,
            "/peers" => Command::Peers,
            "/messages" => Command::Messages,
            "/status" => Command::Status,
            "/help" | "/h" => Command::Help,
            text => Command::Send(text.to_string()),
        }
    }
}

pub fn show_help() {
    println!("\n🆘 Help:");
    println!("• Type a line and press enter to send it to the room");
    println!("• /peers     list known peers");
    println!("• /messages  show the message log");
    println!("• /status    show room status");
    println!("• /quit      leave (also quit, exit, q, Ctrl+C)");
}

pub fn show_status(room: &RoomHandle) {
    let health = room.health_status();
    println!("\n📊 Status:");
    println!("• Room: {}", health.room_name);
    println!("• Nickname: {}", health.nickname);
    println!("• ID: {}", health.local_peer_id);
    match room.local_ip() {
        Some(ip) => println!("• Local IP: {ip}"),
        None => println!("• Local IP: unknown"),
    }
    println!("• TCP port: {}, discovery port: {}", room.tcp_port(), room.discovery_port());
    println!("• Known peers: {}", health.known_peers);
    println!("• Connected peers: {}", health.connected_peers);
    println!("• Messages: {}", health.message_count);
}

pub fn list_peers(room: &RoomHandle) {
    let peers = room.list_peers();
    let connected = room.connected_peers();
    println!("\n👥 Peers ({}):", peers.len());
    if peers.is_empty() {
        println!("   No peers yet...");
        println!("   💡 Make sure other instances are running on the same network, or pass --peer");
        return;
    }
    for (i, peer) in peers.iter().enumerate() {
        let marker = if connected.contains(&peer.id) { "🔗" } else { "🔍" };
        println!(
            "   {}. {} {} ({}) - ID: {}...",
            i + 1,
            marker,
            peer.nickname,
            peer.socket_addr(),
            peer.id.short()
        );
    }
}

pub fn list_messages(room: &RoomHandle) {
    let messages = room.list_messages();
    println!("\n📜 Messages ({}):", messages.len());
    for message in &messages {
        println!("   {}", format_message(message));
    }
}

pub fn format_message(message: &Message) -> String {
    format!(
        "[{}] {}: {}",
        format_timestamp(message.timestamp),
        message.nickname,
        message.body
    )
}

pub fn print_event(event: &RoomEvent) {
    match event {
        RoomEvent::PeerDiscovered(peer) => {
            println!("🔍 {} discovered at {}", peer.nickname, peer.address);
        }
        RoomEvent::PeerLost(peer) => {
            println!("👻 {} stopped announcing", peer.nickname);
        }
        RoomEvent::PeerConnected(peer) => {
            println!("🔗 {} connected ({})", peer.nickname, peer.socket_addr());
        }
        RoomEvent::PeerDisconnected(peer) => {
            println!("💔 {} disconnected", peer.nickname);
        }
        RoomEvent::MessageReceived(message) => {
            println!("💬 {}", format_message(message));
        }
        RoomEvent::MessageSent(_) => {}
    }
}
