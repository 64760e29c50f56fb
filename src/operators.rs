// The operator seam.
//
// The cache sees the operator graph only through an opaque semantic id and
// the ability to run a sub-query. Operators register here at startup; the
// core never parses the id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::artifact::{Artifact, ResultType};
use crate::error::{CacheError, CacheResult};
use crate::extent::QueryRectangle;
use crate::profiler::QueryProfiler;

/// A runnable operator graph, identified by its semantic id.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Result type of this operator's artifacts.
    fn result_type(&self) -> ResultType;

    /// Depth of the operator graph. Depth-0 graphs (leaves) bypass the
    /// cache entirely.
    fn depth(&self) -> u32;

    /// Computes the result for a query rectangle, attributing costs to the
    /// profiler.
    async fn compute(
        &self,
        query: &QueryRectangle,
        profiler: &mut QueryProfiler,
    ) -> CacheResult<Artifact>;
}

/// Registry of operators by semantic id, populated at startup.
#[derive(Default)]
pub struct OperatorRegistry {
    ops: RwLock<HashMap<String, Arc<dyn Operator>>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        OperatorRegistry::default()
    }

    pub fn register(&self, semantic_id: impl Into<String>, op: Arc<dyn Operator>) {
        self.ops
            .write()
            .expect("registry lock poisoned")
            .insert(semantic_id.into(), op);
    }

    pub fn get(&self, semantic_id: &str) -> CacheResult<Arc<dyn Operator>> {
        self.ops
            .read()
            .expect("registry lock poisoned")
            .get(semantic_id)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(format!("operator {semantic_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Plot;
    use crate::extent::{CrsId, SpatioTemporalExtent};

    struct ConstPlot;

    #[async_trait]
    impl Operator for ConstPlot {
        fn result_type(&self) -> ResultType {
            ResultType::Plot
        }

        fn depth(&self) -> u32 {
            1
        }

        async fn compute(
            &self,
            _query: &QueryRectangle,
            profiler: &mut QueryProfiler,
        ) -> CacheResult<Artifact> {
            profiler.add_cpu(1.0);
            Ok(Artifact::Plot(Plot::new(
                SpatioTemporalExtent::unreferenced(CrsId::LatLon),
                "{}".into(),
            )))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = OperatorRegistry::new();
        registry.register("op1", Arc::new(ConstPlot));
        assert!(registry.get("op1").is_ok());
        assert!(matches!(registry.get("nope"), Err(CacheError::NotFound(_))));
    }
}
