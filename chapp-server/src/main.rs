//! chapp-server: WebSocket chat fan-out server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;

use chapp_server::{ChatServer, ServerConfig, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "chapp-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "CHAPP_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// RocksDB directory; messages are kept in memory when omitted
    #[arg(short, long, env = "CHAPP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Maximum number of messages returned by a list
    #[arg(long, env = "CHAPP_LIST_LIMIT", default_value_t = 50)]
    list_limit: usize,

    /// Maximum message content length in bytes
    #[arg(long, env = "CHAPP_MAX_CONTENT", default_value_t = 4096)]
    max_content_len: usize,

    /// Frames buffered per connection before it is dropped as too slow
    #[arg(long, env = "CHAPP_OUTBOUND_BUFFER", default_value_t = 256)]
    outbound_buffer: usize,

    /// Seconds to wait for open sessions on shutdown
    #[arg(long, env = "CHAPP_SHUTDOWN_TIMEOUT", default_value_t = 5)]
    shutdown_timeout_secs: u64,

    /// Default log filter when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = ServerConfig {
        bind_addr: args.bind,
        outbound_buffer: args.outbound_buffer,
        store: StoreConfig {
            list_limit: args.list_limit,
            max_content_len: args.max_content_len,
        },
        storage_path: args.data_dir,
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
    };

    info!("Starting chapp-server on {}...", config.bind_addr);

    let server = ChatServer::open(config)?;

    let dangling = server.service().reconcile()?;
    if dangling > 0 {
        info!("Removed {dangling} dangling index entries");
    }

    let listener = tokio::net::TcpListener::bind(server.bind_addr()).await?;
    server
        .serve_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = server.stats();
    info!(
        "Stopped after {} connections, {} messages created",
        stats.total_connections, stats.messages_created
    );
    Ok(())
}
