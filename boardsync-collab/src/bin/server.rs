//! Standalone sync server.
//!
//! Usage: `boardsync-server [config.toml]`. `RUST_LOG` controls verbosity.

use boardsync_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    log::info!(
        "Starting boardsync server (storage: {})",
        config
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string())
    );

    let server = SyncServer::new(config)?;
    server.run().await?;
    Ok(())
}
