use clap::Parser;
use relay::bus::{MessageBus, RedisBus};
use relay::config::{load_config, normalize_listen_addr};
use relay::{WsServer, handlers, metrics};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const REMOTE_QUEUE_DEPTH: usize = 4096;

#[derive(Parser)]
#[command(name = "relay", about = "WalletConnect v1 bridging relay")]
struct Args {
    /// Config file (YAML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override relay_config.listen.
    #[arg(long = "relay-addr")]
    relay_addr: Option<String>,
    /// Override redis_config.server_addr.
    #[arg(long = "redis-server-addr")]
    redis_server_addr: Option<String>,
}

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let mut cfg = load_config(args.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("FATAL: {e}");
        process::exit(1);
    });
    if let Some(listen) = args.relay_addr {
        cfg.relay_config.listen = listen;
    }
    if let Some(server_addr) = args.redis_server_addr {
        cfg.redis_config.server_addr = server_addr;
    }

    metrics::register_all();

    let (remote_tx, remote_rx) = mpsc::channel(REMOTE_QUEUE_DEPTH);
    let bus = RedisBus::connect(
        &cfg.redis_config.server_addr,
        &cfg.redis_config.password,
        remote_tx,
    )
    .await
    .unwrap_or_else(|e| {
        eprintln!("FATAL: store connection failed: {e}");
        process::exit(1);
    });
    info!(addr = %cfg.redis_config.server_addr, "connected to store");
    let bus: Arc<dyn MessageBus> = Arc::new(bus);

    let (server, state) = WsServer::new(cfg.wsserver_config.clone(), bus, remote_rx);
    tokio::spawn(server.run());
    tokio::spawn(handlers::run_expiry_sweeper(state.clone()));

    if cfg.metric_config.enable {
        let addr = normalize_listen_addr(&cfg.metric_config.listen);
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
            eprintln!("FATAL: metrics bind {addr} failed: {e}");
            process::exit(1);
        });
        info!(addr = %addr, "metrics server listening");
        tokio::spawn(async move {
            let _ = axum::serve(listener, relay::build_metrics_router()).await;
        });
    }

    let addr = normalize_listen_addr(&cfg.relay_config.listen);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("FATAL: relay bind {addr} failed: {e}");
        process::exit(1);
    });
    info!(addr = %addr, "relay server listening");
    if let Err(e) = axum::serve(listener, relay::build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("FATAL: server error: {e}");
        process::exit(1);
    }

    let wait = cfg.relay_config.graceful_shutdown_wait_seconds;
    info!(wait_seconds = wait, "shutting down");
    tokio::time::sleep(Duration::from_secs(wait)).await;
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
