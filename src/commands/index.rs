// `tessera index` — run the index coordinator.

use std::path::PathBuf;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ConfigFile;
use crate::index_server::IndexServer;

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => ConfigFile::load(&path)?,
        None => ConfigFile::load_default()?,
    };
    crate::metrics::init_metrics();

    let server = IndexServer::new(config.index.server_config()?);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            signal_cancel.cancel();
        }
    });

    server.run(cancel).await
}
