//! Standalone synchronization endpoint.
//!
//! Usage: `collab-server [config.toml]`. Without a config file the server
//! binds `127.0.0.1:9090` and keeps rooms in memory only.

use collab_drive::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{e}");
                std::process::exit(2);
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(root) = &config.root_dir {
        log::info!("Serving documents from {}", root.display());
    }

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
