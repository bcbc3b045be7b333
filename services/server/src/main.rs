use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use rand::RngCore;
use server::Server;
use server::config::{DEFAULT_CONFIG_PATH, ServerConfig};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "helios-server", about = "Structured real-time messaging over WebSocket")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print a fresh signing secret suitable for `session_recovery.secret`.
    GenSecret,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Some(Command::GenSecret) = cli.command {
        let mut bytes = [0u8; 48];
        rand::thread_rng().fill_bytes(&mut bytes);
        println!("{}", STANDARD.encode(bytes));
        return;
    }

    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = match ServerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };
    let bind = config.bind.clone();

    let server = Server::new(config).await.expect("server construction");
    let router = server::build_router(server);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .expect("failed to bind");
    info!(addr = %bind, "server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("server shut down gracefully");
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
