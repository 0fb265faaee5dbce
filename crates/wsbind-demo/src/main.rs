use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use wsbind::{BinderRegistry, Methods, RpcConfig, RpcServer, ServerConfig, call_many_unit, client};

#[derive(Parser)]
#[command(name = "wsbind-demo", about = "Bidirectional WebSocket RPC demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an echo server
    Serve {
        #[arg(long, env = "WSBIND_LISTEN_HOST", default_value = "127.0.0.1")]
        host: String,
        #[arg(long, env = "WSBIND_LISTEN_PORT", default_value_t = 8800)]
        port: u16,
    },

    /// Call a method on a running server and print the reply
    Call {
        #[arg(long, default_value = "ws://127.0.0.1:8800/rpc")]
        url: String,
        /// Method name (echo, reverse, hits)
        method: String,
        /// Positional arguments, parsed as JSON, falling back to strings
        args: Vec<String>,
    },
}

/// The object the server exposes to every peer.
struct EchoService {
    hits: AtomicU64,
}

impl EchoService {
    fn methods(self: Arc<Self>) -> Methods {
        let counter = self.clone();
        let reverse_counter = self.clone();
        let hit_counter = self;
        Methods::new()
            .unary("echo", move |s: String| {
                counter.hits.fetch_add(1, Ordering::Relaxed);
                async move { Ok(s) }
            })
            .unary("reverse", move |s: String| {
                reverse_counter.hits.fetch_add(1, Ordering::Relaxed);
                async move { Ok(s.chars().rev().collect::<String>()) }
            })
            .nullary("hits", move || {
                let hits = hit_counter.hits.load(Ordering::Relaxed);
                async move { Ok(hits) }
            })
    }
}

/// The object a caller exposes back to the server.
struct CallerPeer;

async fn serve(host: String, port: u16) -> anyhow::Result<()> {
    let config = ServerConfig {
        listen_host: host,
        listen_port: port,
        ..ServerConfig::default()
    };
    let registry = BinderRegistry::new();
    let service = Arc::new(EchoService { hits: AtomicU64::new(0) });

    let reg = registry.clone();
    let delay = config.rpc.termination_delay;
    let server = RpcServer::new(config.clone(), registry.clone(), move |conn, ctx| {
        let registry = reg.clone();
        let service = service.clone();
        async move {
            info!(conn_id = %conn.id(), cookies = ctx.cookies.len(), "peer connected");
            let methods = service.clone().methods();
            if let Err(e) = registry.bind_local(&conn, service, methods) {
                warn!(conn_id = %conn.id(), error = %e, "bind failed");
                return;
            }
            // the other direction of the link: the server calls back
            // into each connected peer
            match registry.bind_remote(&conn, "Peer", delay) {
                Ok(peer) => {
                    let conn_id = conn.id().to_string();
                    tokio::spawn(async move {
                        if let Err(e) = peer.call("notify", vec![json!("welcome")]).await {
                            info!(conn_id = %conn_id, error = %e, "peer did not take the greeting");
                        }
                    });
                }
                Err(e) => warn!(conn_id = %conn.id(), error = %e, "bind failed"),
            }
        }
    });

    // periodic liveness broadcast to every peer still connected
    let broadcast_registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            let peers = broadcast_registry.remotes_of("Peer");
            if peers.is_empty() {
                continue;
            }
            call_many_unit(&peers, "notify", vec![json!("server is alive")]).await;
        }
    });

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let serving = tokio::spawn(server.clone().serve(listener));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.shutdown().await;
    serving.await??;
    Ok(())
}

async fn call(url: String, method: String, args: Vec<String>) -> anyhow::Result<()> {
    let arguments = args
        .into_iter()
        .map(|raw| serde_json::from_str(&raw).unwrap_or(json!(raw)))
        .collect();

    let registry = BinderRegistry::new();
    let reg = registry.clone();
    let conn = client::connect(&url, &RpcConfig::default(), move |conn| {
        let registry = reg.clone();
        async move {
            let methods = Methods::new().unary("notify", |message: String| async move {
                info!(message, "notification from server");
                Ok(())
            });
            if let Err(e) = registry.bind_local(&conn, Arc::new(CallerPeer), methods) {
                warn!(error = %e, "bind failed");
            }
        }
    })
    .await?;
    let remote = registry.bind_remote(&conn, "EchoService", Duration::from_secs(10))?;

    let reply = remote.call(&method, arguments).await?;
    println!("{reply}");

    conn.close(wsbind::CloseStatus::Normal, "done").await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port } => serve(host, port).await,
        Commands::Call { url, method, args } => call(url, method, args).await,
    }
}
