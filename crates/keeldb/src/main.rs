use anyhow::{anyhow, Result};
use clap::Parser;
use kvstore::MemStore;
use sqlengine::{Engine, Options};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod server;

use server::{Server, ServerConfig};

#[derive(Parser)]
#[clap(name = "keeldb", version)]
struct Arguments {
    /// Address the postgres-protocol listener binds to.
    #[clap(short, long, default_value = "0.0.0.0:5432")]
    bind: String,

    /// Hex byte prefix every persisted key lives under.
    #[clap(long, default_value = "02")]
    data_prefix: String,

    /// Upper bound on the key set a SELECT DISTINCT may accumulate.
    #[clap(long, default_value_t = 1 << 16)]
    distinct_limit: usize,
}

fn main() -> Result<()> {
    let args = Arguments::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let prefix = decode_hex(&args.data_prefix)?;
    let opts = Options::default()
        .with_prefix(prefix)
        .with_distinct_limit(args.distinct_limit);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let engine = Arc::new(Engine::new(MemStore::new(), opts));
        let server = Server::connect(engine)?;
        let pg_listener = TcpListener::bind(&args.bind).await?;
        server.serve(ServerConfig { pg_listener }).await
    })
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(anyhow!("invalid hex prefix: {}", s));
    }
    Ok((0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).expect("checked hex digits"))
        .collect())
}
