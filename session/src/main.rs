use clap::Parser;
use log::{info, warn};
use session::{
    JoinAttempt, JoinProgress, LocalNetwork, NetworkSession, SessionConfig, SessionError, SessionEvent,
    SessionSettings, SignedInGamer,
};
use shared::{NetworkSessionType, SendDataOptions, SessionQuery, DEFAULT_SESSION_PORT};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Runs a system link session over the in-process transport: one host, a few
/// clients found through LAN discovery, and some frames of traffic.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of client machines joining the host
    #[arg(short = 'c', long, default_value = "3")]
    clients: u8,

    /// Frames of traffic to simulate once the game started
    #[arg(short = 'f', long, default_value = "60")]
    frames: u32,

    /// Maximum gamers the session accepts
    #[arg(short = 'm', long, default_value = "8")]
    max_gamers: u8,

    /// Application identifier shared by host and clients
    #[arg(short = 'a', long, default_value = "netsession-demo")]
    app_id: String,

    /// How long clients search the LAN for sessions, in milliseconds
    #[arg(short = 'd', long, default_value = "100")]
    discovery_ms: u64,
}

fn host_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], DEFAULT_SESSION_PORT))
}

fn client_addr(index: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 1, index], 4000))
}

/// Keeps `session` running for `duration` so it can answer discovery.
async fn pump(session: &mut NetworkSession, duration: Duration, every: Duration) -> Result<(), SessionError> {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        session.update()?;
        sleep(every).await;
    }
    Ok(())
}

fn log_events(name: &str, session: &mut NetworkSession) {
    while let Some(event) = session.poll_event() {
        match event {
            SessionEvent::GamerJoined { id, gamertag, is_local } => {
                info!("[{}] {} joined as gamer {} (local: {})", name, gamertag, id, is_local)
            }
            SessionEvent::GamerLeft { id, gamertag } => info!("[{}] {} (gamer {}) left", name, gamertag, id),
            SessionEvent::SessionEnded { reason } => info!("[{}] session ended: {}", name, reason.as_str()),
            other => info!("[{}] {:?}", name, other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = SessionConfig::new(args.app_id.clone())
        .with_discovery_timeout(Duration::from_millis(args.discovery_ms));
    let network = LocalNetwork::new();

    let settings = SessionSettings::new(NetworkSessionType::SystemLink, args.max_gamers).with_join_in_progress(true);
    let mut host = NetworkSession::create(
        Box::new(network.peer(host_addr())),
        settings,
        config.clone(),
        vec![SignedInGamer::new("Host")],
    )?;
    info!("Hosting session {} at {}", host.guid(), host_addr());

    let mut clients = Vec::new();
    for index in 1..=args.clients {
        let mut peer = network.peer(client_addr(index));
        let query = SessionQuery::new(NetworkSessionType::SystemLink, 1);
        let (found, pumped) = tokio::join!(
            NetworkSession::find_local(&mut peer, &config, &query),
            pump(&mut host, config.discovery_timeout, config.poll_interval)
        );
        pumped?;
        let Some(available) = found?.into_iter().next() else {
            warn!("Client {} found no session to join", index);
            continue;
        };
        info!(
            "Client {} found {}'s session ({} open public slots)",
            index, available.info.host_gamertag, available.info.open_public_gamer_slots
        );

        let profile = SignedInGamer::new(format!("Player{}", index));
        let mut attempt = JoinAttempt::start(Box::new(peer), available.host_endpoint, config.clone(), vec![profile])?;
        loop {
            host.update()?;
            match attempt.poll() {
                Ok(JoinProgress::Joined(session)) => {
                    clients.push(session);
                    break;
                }
                Ok(JoinProgress::Pending) => sleep(config.poll_interval).await,
                Err(e) => {
                    warn!("Client {} could not join: {}", index, e);
                    break;
                }
            }
        }
    }
    host.update()?;
    for client in clients.iter_mut() {
        client.update()?;
    }

    // Everybody readies up, then the host starts
    for client in clients.iter_mut() {
        for id in client.local_gamer_ids() {
            client.set_ready(id, true)?;
        }
        client.update()?;
    }
    for id in host.local_gamer_ids() {
        host.set_ready(id, true)?;
    }
    for _ in 0..5 {
        host.update()?;
        for client in clients.iter_mut() {
            client.update()?;
        }
    }
    info!("Everyone ready: {}", host.is_everyone_ready());
    host.start_game()?;

    let mut received = 0usize;
    let mut buffer = [0u8; 64];
    for frame in 0..args.frames {
        for client in clients.iter_mut() {
            for id in client.local_gamer_ids() {
                let payload = format!("frame {} from gamer {}", frame, id);
                client.send_data(id, payload.as_bytes(), SendDataOptions::NONE, None)?;
            }
        }
        if let Some(&id) = host.local_gamer_ids().first() {
            host.send_data(id, &frame.to_le_bytes(), SendDataOptions::RELIABLE_IN_ORDER, None)?;
        }

        host.update()?;
        for client in clients.iter_mut() {
            client.update()?;
        }

        for session in std::iter::once(&mut host).chain(clients.iter_mut()) {
            for id in session.local_gamer_ids() {
                while let (length, Some(_)) = session.receive_data(id, &mut buffer)? {
                    if length > 0 {
                        received += 1;
                    }
                }
            }
        }
        sleep(Duration::from_millis(1)).await;
    }
    info!("Delivered {} packets over {} frames", received, args.frames);

    host.end_game()?;
    for _ in 0..3 {
        host.update()?;
        for client in clients.iter_mut() {
            client.update()?;
        }
    }

    log_events("host", &mut host);
    for (index, client) in clients.iter_mut().enumerate() {
        log_events(&format!("client {}", index + 1), client);
    }

    host.end();
    for client in clients.iter_mut() {
        let _ = client.update();
        log_events("client", client);
    }
    info!(
        "Packet pool allocated {} buffers, {} free",
        host.packet_pool().allocated(),
        host.packet_pool().free_count()
    );
    Ok(())
}
