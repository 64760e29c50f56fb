// Replacement policy.
//
// A relevance function is a total order over entries; eviction walks the
// least relevant entries first until enough bytes are freed. The same
// relevance math drives node-local eviction and the index's reorg rounds.

use serde::{Deserialize, Serialize};

use crate::entry_store::{EntryKey, EntryStore, now_millis};
use crate::error::{CacheError, CacheResult};
use crate::profiler::ProfilingData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelevanceFunction {
    /// Oldest access evicted first.
    Lru,
    /// Computation cost discounted by age: `cost * (1 - age_minutes * 0.01)`,
    /// clamped at zero. Cheap, stale entries go first.
    CostLru,
}

impl RelevanceFunction {
    pub fn by_name(name: &str) -> CacheResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "lru" => Ok(RelevanceFunction::Lru),
            "costlru" => Ok(RelevanceFunction::CostLru),
            other => Err(CacheError::Argument(format!("unknown replacement: {other}"))),
        }
    }

    /// The sort key; entries with smaller keys are evicted first.
    pub fn relevance(&self, last_access: u64, profile: &ProfilingData, now: u64) -> f64 {
        match self {
            RelevanceFunction::Lru => last_access as f64,
            RelevanceFunction::CostLru => {
                let age_minutes = now.saturating_sub(last_access) as f64 / 60_000.0;
                let discount = (1.0 - age_minutes * 0.01).max(0.0);
                profile.uncached_cost() * discount
            }
        }
    }
}

/// Selects the entries to remove so that `bytes_needed` fit into the
/// store's budget. Empty when the free budget already suffices. The caller
/// performs the actual removals.
pub fn get_removals(
    relevance: RelevanceFunction,
    store: &EntryStore,
    bytes_needed: u64,
) -> Vec<EntryKey> {
    let used = store.used_size();
    let available = store.max_size().saturating_sub(used);
    if available >= bytes_needed {
        return Vec::new();
    }

    let now = now_millis();
    let mut entries: Vec<(EntryKey, u64, f64)> = store
        .get_all()
        .items
        .iter()
        .flat_map(|(semantic_id, metas)| {
            metas.iter().map(|m| {
                (
                    EntryKey::new(semantic_id.clone(), m.entry_id),
                    m.size,
                    relevance.relevance(m.last_access, &m.profile, now),
                )
            })
        })
        .collect();
    entries.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut result = Vec::new();
    let mut freed = 0u64;
    let to_free = bytes_needed - available;
    for (key, size, _) in entries {
        if freed >= to_free {
            break;
        }
        freed += size;
        result.push(key);
    }
    result
}
