// Configuration.
//
// One TOML file configures both process kinds; each binary reads its own
// section. The path resolves from the `TESSERA_CONFIG` env var, then the
// environment-dependent default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;
use crate::index_server::{IndexServerConfig, SchedulerPolicy};
use crate::node_cache::CacheSizes;
use crate::node_server::NodeServerConfig;
use crate::reorg::ReorgStrategy;
use crate::replacement::RelevanceFunction;
use crate::strategy::CachingStrategy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub index: IndexSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_host")]
    pub advertised_host: String,
    #[serde(default)]
    pub delivery_port: u16,
    #[serde(default = "default_host")]
    pub index_host: String,
    #[serde(default = "default_index_port")]
    pub index_port: u16,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub standalone: bool,
    #[serde(default)]
    pub cache: CacheSection,
}

impl Default for NodeSection {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_replacement")]
    pub replacement: String,
    #[serde(default)]
    pub size: SizeSection,
}

impl Default for CacheSection {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

/// Per-type byte budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeSection {
    #[serde(default = "default_raster_size")]
    pub raster: u64,
    #[serde(default = "default_feature_size")]
    pub point: u64,
    #[serde(default = "default_feature_size")]
    pub line: u64,
    #[serde(default = "default_feature_size")]
    pub polygon: u64,
    #[serde(default = "default_plot_size")]
    pub plot: u64,
}

impl Default for SizeSection {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSection {
    #[serde(default = "default_index_port")]
    pub port: u16,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default)]
    pub batching: BatchingSection,
    #[serde(default)]
    pub reorg: ReorgSection,
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
}

impl Default for IndexSection {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingSection {
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl Default for BatchingSection {
    fn default() -> Self {
        BatchingSection { enable: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorgSection {
    #[serde(default = "default_reorg_strategy")]
    pub strategy: String,
    #[serde(default = "default_replacement")]
    pub relevance: String,
    #[serde(default = "default_reorg_interval")]
    pub interval_secs: u64,
}

impl Default for ReorgSection {
    fn default() -> Self {
        toml::from_str("").expect("defaults")
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_index_port() -> u16 {
    10042
}

fn default_threads() -> usize {
    4
}

fn default_strategy() -> String {
    "all".to_string()
}

fn default_replacement() -> String {
    "lru".to_string()
}

fn default_scheduler() -> String {
    "locality".to_string()
}

fn default_reorg_strategy() -> String {
    "capacity".to_string()
}

fn default_reorg_interval() -> u64 {
    60
}

fn default_request_deadline() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_raster_size() -> u64 {
    1 << 30 // 1 GiB
}

fn default_feature_size() -> u64 {
    256 << 20 // 256 MiB
}

fn default_plot_size() -> u64 {
    64 << 20 // 64 MiB
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
        let config: ConfigFile =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {path:?}"))?;
        Ok(config)
    }

    /// Loads the resolved config path, falling back to defaults when the
    /// file does not exist.
    pub fn load_default() -> Result<Self> {
        let path = config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(ConfigFile::default())
        }
    }
}

impl NodeSection {
    pub fn server_config(&self) -> NodeServerConfig {
        NodeServerConfig {
            advertised_host: self.advertised_host.clone(),
            delivery_port: self.delivery_port,
            index_host: self.index_host.clone(),
            index_port: self.index_port,
            workers: self.threads,
            standalone: self.standalone,
        }
    }

    pub fn strategy(&self) -> CacheResult<CachingStrategy> {
        CachingStrategy::by_name(&self.cache.strategy)
    }

    pub fn replacement(&self) -> CacheResult<RelevanceFunction> {
        RelevanceFunction::by_name(&self.cache.replacement)
    }

    pub fn cache_sizes(&self) -> CacheSizes {
        CacheSizes {
            raster: self.cache.size.raster,
            point: self.cache.size.point,
            line: self.cache.size.line,
            polygon: self.cache.size.polygon,
            plot: self.cache.size.plot,
        }
    }
}

impl IndexSection {
    pub fn server_config(&self) -> CacheResult<IndexServerConfig> {
        Ok(IndexServerConfig {
            port: self.port,
            scheduler: SchedulerPolicy::by_name(&self.scheduler)?,
            batching_enabled: self.batching.enable,
            reorg_strategy: ReorgStrategy::by_name(&self.reorg.strategy)?,
            relevance: RelevanceFunction::by_name(&self.reorg.relevance)?,
            reorg_interval: Duration::from_secs(self.reorg.interval_secs.max(1)),
            request_deadline: Duration::from_secs(self.request_deadline_secs.max(1)),
        })
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `TESSERA_CONFIG` env var
/// 2. `/etc/tessera/tessera.toml` (production/staging)
/// 3. `./tessera.toml` (development)
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TESSERA_CONFIG") {
        return PathBuf::from(path);
    }
    match std::env::var("TESSERA_ENV").as_deref() {
        Ok("production") | Ok("staging") => PathBuf::from("/etc/tessera/tessera.toml"),
        _ => PathBuf::from("./tessera.toml"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigFile::default();
        assert_eq!(config.node.threads, 4);
        assert_eq!(config.node.cache.strategy, "all");
        assert_eq!(config.node.cache.size.raster, 1 << 30);
        assert!(config.index.batching.enable);
        assert_eq!(config.index.reorg.interval_secs, 60);
        assert!(config.node.strategy().is_ok());
        assert!(config.index.server_config().is_ok());
    }

    #[test]
    fn test_parse_full_file() {
        let toml_str = r#"
            [node]
            advertised_host = "10.1.2.3"
            delivery_port = 10043
            threads = 8

            [node.cache]
            strategy = "cost:5"
            replacement = "costlru"

            [node.cache.size]
            raster = 1000000

            [index]
            port = 9000
            scheduler = "roundrobin"

            [index.batching]
            enable = false

            [index.reorg]
            strategy = "colocate"
            relevance = "costlru"
            interval_secs = 10
        "#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.advertised_host, "10.1.2.3");
        assert_eq!(config.node.threads, 8);
        assert_eq!(
            config.node.strategy().unwrap(),
            CachingStrategy::CostThreshold(5.0)
        );
        assert_eq!(
            config.node.replacement().unwrap(),
            RelevanceFunction::CostLru
        );
        assert_eq!(config.node.cache_sizes().raster, 1_000_000);
        // Unset sizes keep their defaults.
        assert_eq!(config.node.cache_sizes().point, 256 << 20);

        let index = config.index.server_config().unwrap();
        assert_eq!(index.port, 9000);
        assert_eq!(index.scheduler, SchedulerPolicy::RoundRobin);
        assert!(!index.batching_enabled);
        assert_eq!(index.reorg_strategy, ReorgStrategy::Colocate);
        assert_eq!(index.reorg_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_bad_strategy_name_fails_late() {
        let config: ConfigFile =
            toml::from_str("[node.cache]\nstrategy = \"sometimes\"").unwrap();
        assert!(config.node.strategy().is_err());
    }

    #[test]
    fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");
        let config = ConfigFile::default();
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded.node.threads, config.node.threads);
        assert_eq!(loaded.index.port, config.index.port);
    }
}
