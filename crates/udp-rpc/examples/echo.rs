//! Echo peer.
//!
//! Serve:   cargo run -p proven-udp-rpc --example echo -- --port 9000
//! Call:    cargo run -p proven-udp-rpc --example echo -- --connect 127.0.0.1:9000 hello

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use proven_udp_rpc::{Endpoint, Message, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// UDP port to listen on
    #[arg(long, default_value_t = 0, env = "PROVEN_UDP_RPC_PORT")]
    port: u16,

    /// Idle session lifetime in microseconds
    #[arg(
        long,
        default_value_t = 60_000_000,
        env = "PROVEN_UDP_RPC_MAX_IDLE_LIFETIME_MICROS"
    )]
    max_idle_lifetime_micros: u64,

    /// Call timeout in milliseconds
    #[arg(long, default_value_t = 5000, env = "PROVEN_UDP_RPC_TIMEOUT_MS")]
    timeout_ms: u64,

    /// Length of generated session ids
    #[arg(long, default_value_t = 16, env = "PROVEN_UDP_RPC_SESSION_ID_LEN")]
    session_id_len: usize,

    /// Peer to call instead of serving
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Body to send when calling
    #[arg(default_value = "hello")]
    body: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let endpoint = Endpoint::builder()
        .port(args.port)
        .max_idle_lifetime_micros(args.max_idle_lifetime_micros)
        .default_timeout(Duration::from_millis(args.timeout_ms))
        .session_id_len(args.session_id_len)
        .bind()
        .await?;

    endpoint
        .router()
        .register("echo", |m: &Message| m.body.clone());
    endpoint
        .router()
        .register("ping", |_: &Message| "pong".to_string());
    endpoint.start()?;

    if let Some(remote) = args.connect {
        let (session, reply) = endpoint.connect(remote, "echo", &args.body).await?;
        info!("Session {} established, reply: {}", session, reply);

        let reply = endpoint.promise(&session, "ping", "").await?;
        info!("ping -> {}", reply);
    } else {
        info!("Echo peer listening on {}", endpoint.local_addr()?);
        let _ = tokio::signal::ctrl_c().await;
    }

    endpoint.shutdown().await;

    Ok(())
}
