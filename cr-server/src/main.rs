use std::{env, net::SocketAddr, path::PathBuf};

use cr_server::{DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_PARTS, ServerConfig, ServerState, build_server_app};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if wants_version_flag() {
        println!("{}", binary_version_text());
        return Ok(());
    }

    init_logging();
    info!("{}", binary_version_text());

    let default_addr = format!("0.0.0.0:{}", proto::DEFAULT_PORT);
    let addr = parse_addr("SERVER_ADDR", &default_addr)?;
    let config = ServerConfig {
        record_dir: parse_record_dir("RECORD_DIR", "recordings"),
        max_chunk_bytes: parse_env("MAX_CHUNK_BYTES", DEFAULT_MAX_CHUNK_BYTES)?,
        max_parts: parse_env("MAX_PARTS", DEFAULT_MAX_PARTS)?,
    };
    std::fs::create_dir_all(&config.record_dir)?;
    info!(
        "recordings are written to {}",
        config.record_dir.display()
    );

    let state = ServerState::new(config);
    let app = build_server_app(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown requested, finalizing open sessions");
    for (session_id, result) in state.finalize_open_sessions().await {
        match result {
            Ok(artifact) => info!(
                "finalized session={session_id} file={} bytes={}",
                artifact.file_name, artifact.bytes
            ),
            Err(err) => warn!("failed to finalize session={session_id}: {err}"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn parse_addr(key: &str, default: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    Ok(value.parse()?)
}

fn parse_env<T>(key: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + 'static,
{
    match env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

fn parse_record_dir(key: &str, default: &str) -> PathBuf {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        PathBuf::from(default)
    } else {
        PathBuf::from(trimmed)
    }
}

fn wants_version_flag() -> bool {
    env::args()
        .skip(1)
        .any(|arg| matches!(arg.as_str(), "-V" | "--version"))
}

fn binary_version_text() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
