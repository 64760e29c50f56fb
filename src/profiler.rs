// Cost accounting for queries.
//
// Every query carries a profiler through the cache. While the profiler is
// running, work is attributed to the `self_*` and `uncached_*` buckets.
// When a sub-operation (a puzzle, a remote fetch chain) takes over, the
// parent is stopped and a child profiler measures the sub-operation; the
// child's totals are merged back into the parent afterwards. A successful
// cache write re-attributes the paid cost to the `cached_*` bucket via
// `cached()`.

use serde::{Deserialize, Serialize};

/// Accumulated CPU/GPU/IO costs of a computation.
///
/// `all_*` counts everything attributed to a query including the recorded
/// cost of entries served from cache; `self_*` is own work only;
/// `uncached_*` is the cost actually paid this run; `cached_*` is cost that
/// was paid once and then saved into the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilingData {
    pub all_cpu: f64,
    pub all_gpu: f64,
    pub all_io: f64,
    pub self_cpu: f64,
    pub self_gpu: f64,
    pub self_io: f64,
    pub uncached_cpu: f64,
    pub uncached_gpu: f64,
    pub uncached_io: f64,
    pub cached_cpu: f64,
    pub cached_gpu: f64,
    pub cached_io: f64,
}

impl ProfilingData {
    /// The cost of the uncached computation, used by admission and
    /// relevance functions.
    pub fn uncached_cost(&self) -> f64 {
        self.uncached_cpu + self.uncached_gpu + self.uncached_io
    }

    pub fn total_cost(&self) -> f64 {
        self.all_cpu + self.all_gpu + self.all_io
    }
}

impl std::ops::AddAssign<&ProfilingData> for ProfilingData {
    fn add_assign(&mut self, rhs: &ProfilingData) {
        self.all_cpu += rhs.all_cpu;
        self.all_gpu += rhs.all_gpu;
        self.all_io += rhs.all_io;
        self.self_cpu += rhs.self_cpu;
        self.self_gpu += rhs.self_gpu;
        self.self_io += rhs.self_io;
        self.uncached_cpu += rhs.uncached_cpu;
        self.uncached_gpu += rhs.uncached_gpu;
        self.uncached_io += rhs.uncached_io;
        self.cached_cpu += rhs.cached_cpu;
        self.cached_gpu += rhs.cached_gpu;
        self.cached_io += rhs.cached_io;
    }
}

/// Per-query profiler. Stops nest: the profiler only records own work when
/// no sub-operation has stopped it.
#[derive(Debug, Default)]
pub struct QueryProfiler {
    stops: u32,
    pub data: ProfilingData,
}

impl QueryProfiler {
    pub fn new() -> Self {
        QueryProfiler::default()
    }

    pub fn is_running(&self) -> bool {
        self.stops == 0
    }

    pub fn stop(&mut self) {
        self.stops += 1;
    }

    pub fn resume(&mut self) {
        debug_assert!(self.stops > 0, "resume without matching stop");
        self.stops = self.stops.saturating_sub(1);
    }

    pub fn add_cpu(&mut self, cost: f64) {
        if self.is_running() {
            self.data.self_cpu += cost;
            self.data.all_cpu += cost;
            self.data.uncached_cpu += cost;
        }
    }

    pub fn add_gpu(&mut self, cost: f64) {
        if self.is_running() {
            self.data.self_gpu += cost;
            self.data.all_gpu += cost;
            self.data.uncached_gpu += cost;
        }
    }

    pub fn add_io(&mut self, cost: f64) {
        if self.is_running() {
            self.data.self_io += cost;
            self.data.all_io += cost;
            self.data.uncached_io += cost;
        }
    }

    /// Merges a child profile's totals into this profiler's accumulated
    /// totals. Used when an entry is served from cache (its recorded cost
    /// counts toward the query) and when a sub-operation finishes.
    pub fn add_total(&mut self, child: &ProfilingData) {
        self.data.all_cpu += child.all_cpu;
        self.data.all_gpu += child.all_gpu;
        self.data.all_io += child.all_io;
    }

    /// Merges a finished sub-operation: totals plus the cost it actually
    /// paid, which stays payable by this query unless later `cached()`.
    pub fn add_child(&mut self, child: &ProfilingData) {
        self.add_total(child);
        self.data.uncached_cpu += child.uncached_cpu;
        self.data.uncached_gpu += child.uncached_gpu;
        self.data.uncached_io += child.uncached_io;
    }

    /// Re-attributes a successfully cached sub-computation: the cost was
    /// paid, but the write means future queries are spared it.
    pub fn cached(&mut self, child: &ProfilingData) {
        self.data.cached_cpu += child.uncached_cpu;
        self.data.cached_gpu += child.uncached_gpu;
        self.data.cached_io += child.uncached_io;
        self.data.uncached_cpu = (self.data.uncached_cpu - child.uncached_cpu).max(0.0);
        self.data.uncached_gpu = (self.data.uncached_gpu - child.uncached_gpu).max(0.0);
        self.data.uncached_io = (self.data.uncached_io - child.uncached_io).max(0.0);
    }

    /// Runs `f` with this profiler stopped, restoring the running state on
    /// every exit path.
    pub fn while_stopped<T>(&mut self, f: impl FnOnce() -> T) -> T {
        self.stop();
        let out = f();
        self.resume();
        out
    }
}
