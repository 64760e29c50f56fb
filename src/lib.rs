//! TESSERA - distributed spatio-temporal result cache
//!
//! Caches the results of an operator-graph query engine (rasters, feature
//! collections, plots) across a cluster of node processes coordinated by
//! an index. Results are keyed by an opaque operator fingerprint and
//! indexed by their spatio-temporal extent, so a query can be served by a
//! full hit, assembled from overlapping cached fragments plus recomputed
//! remainders, or fetched from a peer node.

pub mod artifact;
pub mod client;
pub mod commands;
pub mod config;
pub mod delivery;
pub mod entry_store;
pub mod error;
pub mod extent;
pub mod index_directory;
pub mod index_server;
pub mod matcher;
pub mod metrics;
pub mod node_cache;
pub mod node_server;
pub mod operators;
pub mod profiler;
pub mod puzzle;
pub mod reorg;
pub mod replacement;
pub mod retriever;
pub mod strategy;
pub mod wire;
