// `tessera node` — run a cache node process.
//
// The binary hosts the cache subsystem with an empty operator registry;
// cache hits, deliveries and reorg all work, while scheduled computes for
// unknown semantic ids report NotFound. Deployments embedding an operator
// graph construct [`NodeServer`] directly with a populated registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ConfigFile;
use crate::node_cache::NodeCacheManager;
use crate::node_server::NodeServer;
use crate::operators::OperatorRegistry;

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => ConfigFile::load(&path)?,
        None => ConfigFile::load_default()?,
    };
    crate::metrics::init_metrics();

    let node = &config.node;
    let mgr = Arc::new(NodeCacheManager::new(
        node.strategy()?,
        node.replacement()?,
        node.cache_sizes(),
    ));
    let registry = Arc::new(OperatorRegistry::new());
    let server = NodeServer::new(mgr, registry, node.server_config());

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
