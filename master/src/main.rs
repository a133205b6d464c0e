use clap::Parser;
use log::info;
use master::network::MasterServer;
use shared::DEFAULT_MASTER_SERVER_PORT;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_MASTER_SERVER_PORT)]
    port: u16,

    /// Seconds a host stays listed without re-registering
    #[arg(short, long, default_value = "90")]
    expiry: u64,

    /// Maximum number of registered hosts
    #[arg(short, long, default_value = "1024")]
    max_hosts: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting master server...");
    info!("Host expiry: {}s, capacity: {} hosts", args.expiry, args.max_hosts);

    let mut server = MasterServer::new(&address, args.max_hosts, Duration::from_secs(args.expiry)).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
