use clap::Parser;
use clap_derive::Parser;
use srmcast::{ReliableSocket, SrmConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{info, Level};

/// Sends every line from stdin to a multicast group, and prints every line received from other
///  members
#[derive(Parser)]
struct Args {
    #[clap(default_value = "239.255.42.99:9901")]
    group: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let group: SocketAddr = args.group.parse()?;

    let socket = Arc::new(ReliableSocket::new(SrmConfig::default())?);
    socket.join(group).await?;
    info!("joined {} as {:?}", group, socket.self_id().await);

    let result = select! {
        result = print_received(socket.clone()) => result,
        result = send_lines(socket.clone()) => result,
    };

    socket.leave().await?;
    result
}

async fn print_received(socket: Arc<ReliableSocket>) -> anyhow::Result<()> {
    loop {
        let payload = socket.receive().await?;
        println!("> {}", String::from_utf8_lossy(&payload));
    }
}

async fn send_lines(socket: Arc<ReliableSocket>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/view" => println!("{:?}", socket.view().await),
            _ => socket.send(Bytes::from(line)).await?,
        }
    }
    Ok(())
}
