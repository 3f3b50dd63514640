use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use arena_server::connection::{TcpConnection, UdpConnection, WsConnection};
use arena_server::db::Database;
use arena_server::dispatcher::Dispatcher;
use arena_server::http;
use arena_server::inbox::Inbox;
use arena_server::options::MatchOptions;
use arena_server::queue::Queue;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TCP listen address for wall arduino devices
    #[clap(long, default_value = "0.0.0.0:5000")]
    tcp_addr: String,

    /// UDP listen address for wearable devices
    #[clap(long, default_value = "0.0.0.0:5001")]
    udp_addr: String,

    /// WebSocket listen address for tablets and simulators
    #[clap(long, default_value = "0.0.0.0:5002")]
    ws_addr: String,

    /// HTTP admin listen address
    #[clap(long, default_value = "0.0.0.0:5003")]
    http_addr: String,

    /// SQLite database path for match history
    #[clap(long, default_value = "arena.db")]
    db_path: String,

    /// Match options file
    #[clap(long, default_value = "cfg.toml")]
    options: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info");
    }

    let args = Args::parse();

    // Any startup failure here is fatal: options, database, listeners.
    let options = Arc::new(MatchOptions::load(&args.options)?);
    let db = Database::open(&args.db_path)?;

    let tcp_listener = TcpListener::bind(&args.tcp_addr).await?;
    let udp_socket = UdpSocket::bind(&args.udp_addr).await?;
    let ws_listener = TcpListener::bind(&args.ws_addr).await?;
    let http_listener = TcpListener::bind(&args.http_addr).await?;
    info!(
        "listening on tcp {}, udp {}, ws {}, http {}",
        args.tcp_addr, args.udp_addr, args.ws_addr, args.http_addr
    );

    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let inbox = Arc::new(Inbox::new(msg_tx));
    let queue = Arc::new(Mutex::new(Queue::new()));

    tokio::spawn(accept_tcp(tcp_listener, inbox.clone(), options.clone()));
    tokio::spawn(accept_ws(ws_listener, inbox.clone()));
    {
        // one shared socket serves every wearable
        let inbox = inbox.clone();
        tokio::spawn(async move {
            inbox.listen(Arc::new(UdpConnection::new(udp_socket))).await;
        });
    }
    {
        let router = http::router(queue.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, router).await {
                error!("http server error: {}", e);
            }
        });
    }

    Dispatcher::new(inbox, queue, db, options, msg_rx, event_tx, event_rx)
        .run()
        .await;
    Ok(())
}

async fn accept_tcp(listener: TcpListener, inbox: Arc<Inbox>, options: Arc<MatchOptions>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("new tcp connection from {}", peer);
                let conn = Arc::new(TcpConnection::new(stream, options.clone()));
                let inbox = inbox.clone();
                tokio::spawn(async move { inbox.listen(conn).await });
            }
            Err(e) => error!("tcp accept error: {}", e),
        }
    }
}

async fn accept_ws(listener: TcpListener, inbox: Arc<Inbox>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    match WsConnection::handshake(stream).await {
                        Ok(conn) => {
                            info!("new ws connection from {}", peer);
                            inbox.listen(Arc::new(conn)).await;
                        }
                        Err(e) => error!("ws handshake with {} failed: {}", peer, e),
                    }
                });
            }
            Err(e) => error!("ws accept error: {}", e),
        }
    }
}
