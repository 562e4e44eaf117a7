use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;

use modkv::KvProvider;
use modkv_core::{parse_mem_size, KvStore, SegmentConfig, SegmentMode, DEFAULT_MEM_SIZE};

mod shell;

const DEFAULT_PROTOCOL: &str = "ofi+tcp";
const DEFAULT_PORT: u16 = 8080;
const PROVIDER_ID: u16 = 1;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && args[1] == "shell" {
        let code = shell::run(args.get(2).map(String::as_str), args.get(3).map(String::as_str)).await?;
        std::process::exit(code);
    }
    run_server(&args).await
}

/// Positional arguments: `protocol port memory-size[K|M|G] [memory|persistent]`.
async fn run_server(args: &[String]) -> Result<(), Box<dyn Error>> {
    let protocol = args.get(1).map(String::as_str).unwrap_or(DEFAULT_PROTOCOL);
    let port: u16 = match args.get(2) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(%raw, port = DEFAULT_PORT, "invalid port, using default");
            DEFAULT_PORT
        }),
        None => DEFAULT_PORT,
    };
    let mem_size = args
        .get(3)
        .map(|raw| parse_mem_size(raw))
        .unwrap_or(DEFAULT_MEM_SIZE);
    let mode = match args.get(4).map(|m| m.to_ascii_lowercase()).as_deref() {
        Some("persistent") => SegmentMode::Persistent,
        Some("memory") | None => SegmentMode::Memory,
        Some(other) => {
            tracing::warn!(mode = other, "unknown storage mode, defaulting to memory");
            SegmentMode::Memory
        }
    };

    let cfg = SegmentConfig::new(mode, mem_size as usize);
    let store = Arc::new(KvStore::open_owner(&cfg)?);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let stats = store.memory_stats();
    tracing::info!(
        protocol,
        port,
        capacity_mb = stats.total / (1024 * 1024),
        mode = ?mode,
        entries = store.entry_count(),
        provider_id = PROVIDER_ID,
        "server ready"
    );

    KvProvider::new(store, PROVIDER_ID).serve(listener).await?;
    Ok(())
}
