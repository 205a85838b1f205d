use clap::Parser;
use clap_derive::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::select;
use tokio::time;
use tracing::{info, warn, Level};
use udp_session::callback::SessionCallback;
use udp_session::client::Client;
use udp_session::config::{resolve_socket_addr, ClientConfig, ServerConfig};
use udp_session::server::Server;
use udp_session::session::Session;

/// Runs an echo server on one or more ports, and optionally a client pinging other echo nodes
#[derive(Parser)]
struct Args {
    host: String,

    #[clap(short, long, required = true)]
    port: Vec<u16>,

    /// 'host:port' of an echo node to ping once per second
    #[clap(long)]
    ping: Vec<String>,

    #[clap(long, default_value_t = 10_000)]
    idle_timeout_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct EchoCallback;

#[async_trait]
impl SessionCallback for EchoCallback {
    async fn incoming(&self, session: &Arc<Session>, payload: &[u8]) -> anyhow::Result<()> {
        info!("echoing {} bytes to {}", payload.len(), session);
        session.send(payload).await?;
        Ok(())
    }
}

struct PingCallback;

#[async_trait]
impl SessionCallback for PingCallback {
    async fn incoming(&self, session: &Arc<Session>, payload: &[u8]) -> anyhow::Result<()> {
        let pings = session.get_attribute::<u64>("pings")?.unwrap_or(0) + 1;
        session.set_attribute("pings", pings);
        info!("reply #{} from {:?}: {}", pings, session.remote_addr(), String::from_utf8_lossy(payload));
        Ok(())
    }

    async fn timeout(&self, session: &Arc<Session>) {
        warn!("echo node {:?} stopped answering", session.remote_addr());
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let mut bind_addrs = Vec::new();
    for &port in &args.port {
        bind_addrs.push(resolve_socket_addr(&args.host, port).await?);
    }

    let mut server_config = ServerConfig::new(bind_addrs);
    server_config.idle_timeout = Duration::from_millis(args.idle_timeout_millis);
    let server = Server::new(server_config, Arc::new(EchoCallback)).await?;
    server.start().await?;

    let client = if args.ping.is_empty() {
        None
    }
    else {
        let mut peer_addrs = Vec::new();
        for s in &args.ping {
            let (host, port) = s.rsplit_once(':')
                .ok_or_else(|| anyhow!("expected 'host:port', was {}", s))?;
            peer_addrs.push(resolve_socket_addr(host, port.parse()?).await?);
        }

        let self_addr: SocketAddr = if peer_addrs[0].is_ipv4() { "0.0.0.0:0".parse()? } else { "[::]:0".parse()? };
        let client = Client::with_coordinator(ClientConfig::new(self_addr, peer_addrs), Arc::new(PingCallback), server.coordinator().clone()).await?;
        client.start().await?;
        Some(client)
    };

    let (drained_sender, mut drained_receiver) = tokio::sync::mpsc::channel(1);
    server.set_drain_hook(move || {
        let _ = drained_sender.try_send(());
    });

    let mut ping_interval = time::interval(Duration::from_secs(1));
    let mut ping_number = 0u64;
    let ctrl_c = tokio::spawn(server.coordinator().clone().signal_on_ctrl_c());

    loop {
        select! {
            _ = ping_interval.tick() => {
                let Some(client) = &client else { continue; };
                ping_number += 1;
                for session in client.sessions() {
                    if let Err(e) = session.send(format!("ping {}", ping_number).as_bytes()).await {
                        warn!("could not ping {:?}: {}", session.remote_addr(), e);
                    }
                }
            }
            _ = drained_receiver.recv() => break,
        }
    }

    if let Some(client) = &client {
        client.shutdown().await;
    }
    server.shutdown().await;
    ctrl_c.await??;
    info!("bye");
    Ok(())
}
