// Reorganization planning.
//
// After each stats round the index recomputes per-entry relevance and
// plans (a) removals on nodes whose per-type usage exceeds their budget
// and (b), under the colocating strategy, moves that gather the entries of
// one semantic id onto the node already holding most of them. Entries with
// an active ref lease are deferred to the next round. Plans are pure data;
// the index server drives the wire exchange (moves before removals, so a
// moved entry exists at its destination before the source copy dies).

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::artifact::ResultType;
use crate::entry_store::{StoreStats, now_millis};
use crate::error::{CacheError, CacheResult};
use crate::index_directory::{IndexDirectory, IndexEntry};
use crate::replacement::RelevanceFunction;
use crate::wire::{ReorgMove, ReorgRemove};

/// Moves per node per round are bounded to keep rounds short.
pub const MAX_MOVES_PER_ROUND: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgStrategy {
    /// Only enforce per-node byte budgets by removing low-relevance
    /// entries.
    Capacity,
    /// Capacity enforcement plus moves that co-locate entries of one
    /// semantic id, so puzzles resolve on a single node.
    Colocate,
}

impl ReorgStrategy {
    pub fn by_name(name: &str) -> CacheResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "capacity" => Ok(ReorgStrategy::Capacity),
            "colocate" | "colocation" => Ok(ReorgStrategy::Colocate),
            other => Err(CacheError::Argument(format!(
                "unknown reorg strategy: {other}"
            ))),
        }
    }
}

/// Where each node stands for one result type: budget and usage as
/// reported by the last stats round.
#[derive(Debug, Clone, Copy)]
pub struct NodeUsage {
    pub node_id: u32,
    pub max_size: u64,
    pub used_size: u64,
}

/// The per-node actions of one reorg round.
#[derive(Debug, Default)]
pub struct ReorgPlan {
    /// Moves, keyed by the *destination* node that pulls the entry.
    pub moves: HashMap<u32, Vec<ReorgMove>>,
    /// Removals, keyed by the owning node. Includes the source copies of
    /// planned moves.
    pub removals: HashMap<u32, Vec<ReorgRemove>>,
}

impl ReorgPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.removals.is_empty()
    }
}

/// Plans one reorg round from the directory and the latest per-node store
/// stats. `resolve` yields the delivery address moves are pulled from.
pub fn plan_reorg(
    strategy: ReorgStrategy,
    relevance: RelevanceFunction,
    directory: &IndexDirectory,
    usage: &[(ResultType, Vec<NodeUsage>)],
    resolve: impl Fn(u32) -> Option<(String, u16)>,
) -> ReorgPlan {
    let mut plan = ReorgPlan::default();
    let now = Instant::now();
    let now_ms = now_millis();

    for (rt, nodes) in usage {
        let snapshot = directory.snapshot(*rt);

        if strategy == ReorgStrategy::Colocate {
            plan_moves(*rt, &snapshot, &mut plan, now, &resolve);
        }

        for node in nodes {
            if node.used_size <= node.max_size {
                continue;
            }
            let excess = node.used_size - node.max_size;
            plan_removals(*rt, &snapshot, node.node_id, excess, relevance, now, now_ms, &mut plan);
        }
    }

    if !plan.is_empty() {
        debug!(
            moves = plan.moves.values().map(Vec::len).sum::<usize>(),
            removals = plan.removals.values().map(Vec::len).sum::<usize>(),
            "planned reorg round"
        );
    }
    plan
}

fn plan_removals(
    rt: ResultType,
    snapshot: &[(String, Vec<IndexEntry>)],
    node_id: u32,
    excess: u64,
    relevance: RelevanceFunction,
    now: Instant,
    now_ms: u64,
    plan: &mut ReorgPlan,
) {
    let mut victims: Vec<(&str, &IndexEntry, f64)> = snapshot
        .iter()
        .flat_map(|(semantic_id, entries)| {
            entries
                .iter()
                .filter(|e| e.node_id == node_id && !e.leased(now))
                .map(move |e| {
                    (
                        semantic_id.as_str(),
                        e,
                        relevance.relevance(e.last_access, &e.profile, now_ms),
                    )
                })
        })
        .collect();
    victims.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut freed = 0u64;
    for (semantic_id, entry, _) in victims {
        if freed >= excess {
            break;
        }
        freed += entry.size;
        plan.removals.entry(node_id).or_default().push(ReorgRemove {
            result_type: rt,
            semantic_id: semantic_id.to_string(),
            entry_id: entry.entry_id,
        });
    }
}

/// Gathers scattered semantic ids: every id with entries on several nodes
/// is pulled toward the node already holding most of its bytes.
fn plan_moves(
    rt: ResultType,
    snapshot: &[(String, Vec<IndexEntry>)],
    plan: &mut ReorgPlan,
    now: Instant,
    resolve: &impl Fn(u32) -> Option<(String, u16)>,
) {
    for (semantic_id, entries) in snapshot {
        let mut bytes_by_node: HashMap<u32, u64> = HashMap::new();
        for e in entries {
            *bytes_by_node.entry(e.node_id).or_insert(0) += e.size;
        }
        if bytes_by_node.len() < 2 {
            continue;
        }
        let Some((&target, _)) = bytes_by_node
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        else {
            continue;
        };

        for e in entries {
            if e.node_id == target || e.leased(now) {
                continue;
            }
            let target_moves = plan.moves.entry(target).or_default();
            if target_moves.len() >= MAX_MOVES_PER_ROUND {
                break;
            }
            let Some((host, port)) = resolve(e.node_id) else {
                continue;
            };
            target_moves.push(ReorgMove {
                result_type: rt,
                semantic_id: semantic_id.clone(),
                entry_id: e.entry_id,
                from_host: host,
                from_port: port,
            });
            // The source copy dies once the destination confirmed; the
            // server issues these removals after the move phase.
            plan.removals.entry(e.node_id).or_default().push(ReorgRemove {
                result_type: rt,
                semantic_id: semantic_id.clone(),
                entry_id: e.entry_id,
            });
        }
    }
}

/// Extracts per-node usage for planning from the collected store stats.
pub fn usage_from_stats(stats: &[(u32, Vec<StoreStats>)]) -> Vec<(ResultType, Vec<NodeUsage>)> {
    ResultType::ALL
        .iter()
        .map(|rt| {
            let nodes = stats
                .iter()
                .filter_map(|(node_id, stores)| {
                    stores
                        .iter()
                        .find(|s| s.result_type == Some(*rt))
                        .map(|s| NodeUsage {
                            node_id: *node_id,
                            max_size: s.max_size,
                            used_size: s.used_size,
                        })
                })
                .collect();
            (*rt, nodes)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_store::HandshakeEntry;
    use crate::entry_store::MetaEntry;
    use crate::extent::{CacheCube, CrsId, SpatioTemporalExtent};
    use crate::profiler::ProfilingData;

    fn add(dir: &IndexDirectory, node_id: u32, entry_id: u64, last_access: u64, size: u64) {
        let extent = SpatioTemporalExtent::new(CrsId::LatLon, 0.0, 0.0, 10.0, 10.0, 0.0, 1.0);
        dir.add_entry(&MetaEntry {
            node_id,
            result_type: ResultType::Point,
            semantic_id: "op".into(),
            entry: HandshakeEntry {
                entry_id,
                cube: CacheCube::from_extent(&extent).unwrap(),
                size,
                profile: ProfilingData::default(),
                last_access,
                access_count: 0,
            },
        });
    }

    fn resolve(_: u32) -> Option<(String, u16)> {
        Some(("127.0.0.1".into(), 4000))
    }

    #[test]
    fn test_by_name() {
        assert_eq!(ReorgStrategy::by_name("capacity").unwrap(), ReorgStrategy::Capacity);
        assert_eq!(ReorgStrategy::by_name("Colocate").unwrap(), ReorgStrategy::Colocate);
        assert!(ReorgStrategy::by_name("shuffle").is_err());
    }

    #[test]
    fn test_capacity_removes_least_relevant() {
        let dir = IndexDirectory::new();
        add(&dir, 1, 1, 100, 1000);
        add(&dir, 1, 2, 50, 1000);
        add(&dir, 1, 3, 200, 1000);
        let usage = vec![(
            ResultType::Point,
            vec![NodeUsage {
                node_id: 1,
                max_size: 2000,
                used_size: 3000,
            }],
        )];
        let plan = plan_reorg(
            ReorgStrategy::Capacity,
            RelevanceFunction::Lru,
            &dir,
            &usage,
            resolve,
        );
        let removals = &plan.removals[&1];
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].entry_id, 2);
        assert!(plan.moves.is_empty());
    }

    #[test]
    fn test_within_budget_plans_nothing() {
        let dir = IndexDirectory::new();
        add(&dir, 1, 1, 100, 1000);
        let usage = vec![(
            ResultType::Point,
            vec![NodeUsage {
                node_id: 1,
                max_size: 2000,
                used_size: 1000,
            }],
        )];
        let plan = plan_reorg(
            ReorgStrategy::Capacity,
            RelevanceFunction::Lru,
            &dir,
            &usage,
            resolve,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_colocate_moves_toward_majority_holder() {
        let dir = IndexDirectory::new();
        add(&dir, 1, 1, 100, 4000);
        add(&dir, 1, 2, 100, 4000);
        add(&dir, 2, 3, 100, 1000);
        let usage = vec![(
            ResultType::Point,
            vec![
                NodeUsage {
                    node_id: 1,
                    max_size: 100_000,
                    used_size: 8000,
                },
                NodeUsage {
                    node_id: 2,
                    max_size: 100_000,
                    used_size: 1000,
                },
            ],
        )];
        let plan = plan_reorg(
            ReorgStrategy::Colocate,
            RelevanceFunction::Lru,
            &dir,
            &usage,
            resolve,
        );
        // Node 2's single entry moves to node 1 and dies at its source.
        let moves = &plan.moves[&1];
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].entry_id, 3);
        assert_eq!(plan.removals[&2][0].entry_id, 3);
    }
}
