// Admission strategy.
//
// A stateless per-put decision: is this artifact worth storing? Selected
// by name at node startup and never changed mid-run.

use crate::error::{CacheError, CacheResult};
use crate::profiler::ProfilingData;

#[derive(Debug, Clone, PartialEq)]
pub enum CachingStrategy {
    /// Cache everything the budget allows.
    CacheAll,
    /// Cache nothing.
    Never,
    /// Cache results whose uncached computation cost reaches the threshold.
    CostThreshold(f64),
    /// Cache results up to a size limit in bytes.
    SizeBounded(u64),
    /// All sub-strategies must agree.
    All(Vec<CachingStrategy>),
    /// Any sub-strategy suffices.
    Any(Vec<CachingStrategy>),
}

impl CachingStrategy {
    /// Parses a strategy spec. Accepted forms: `all`, `never`,
    /// `cost:<threshold>`, `size:<bytes>`, `and(a,b,...)`, `or(a,b,...)`.
    pub fn by_name(spec: &str) -> CacheResult<Self> {
        let spec = spec.trim();
        let lower = spec.to_ascii_lowercase();
        match lower.as_str() {
            "all" | "cacheall" => return Ok(CachingStrategy::CacheAll),
            "never" | "none" => return Ok(CachingStrategy::Never),
            _ => {}
        }
        if let Some(value) = lower.strip_prefix("cost:") {
            let threshold: f64 = value
                .parse()
                .map_err(|_| CacheError::Argument(format!("bad cost threshold: {value}")))?;
            return Ok(CachingStrategy::CostThreshold(threshold));
        }
        if let Some(value) = lower.strip_prefix("size:") {
            let max: u64 = value
                .parse()
                .map_err(|_| CacheError::Argument(format!("bad size bound: {value}")))?;
            return Ok(CachingStrategy::SizeBounded(max));
        }
        if let Some(inner) = lower.strip_prefix("and(").and_then(|s| s.strip_suffix(")")) {
            return Ok(CachingStrategy::All(Self::parse_list(inner)?));
        }
        if let Some(inner) = lower.strip_prefix("or(").and_then(|s| s.strip_suffix(")")) {
            return Ok(CachingStrategy::Any(Self::parse_list(inner)?));
        }
        Err(CacheError::Argument(format!(
            "unknown caching strategy: {spec}"
        )))
    }

    fn parse_list(inner: &str) -> CacheResult<Vec<CachingStrategy>> {
        // Splits on top-level commas only, so nested and()/or() survive.
        let mut parts = Vec::new();
        let mut depth = 0usize;
        let mut start = 0usize;
        for (i, ch) in inner.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push(Self::by_name(&inner[start..i])?);
                    start = i + 1;
                }
                _ => {}
            }
        }
        if start < inner.len() {
            parts.push(Self::by_name(&inner[start..])?);
        }
        if parts.is_empty() {
            return Err(CacheError::Argument("empty strategy composition".into()));
        }
        Ok(parts)
    }

    pub fn do_cache(&self, profile: &ProfilingData, size: u64) -> bool {
        match self {
            CachingStrategy::CacheAll => true,
            CachingStrategy::Never => false,
            CachingStrategy::CostThreshold(threshold) => profile.uncached_cost() >= *threshold,
            CachingStrategy::SizeBounded(max) => size <= *max,
            CachingStrategy::All(subs) => subs.iter().all(|s| s.do_cache(profile, size)),
            CachingStrategy::Any(subs) => subs.iter().any(|s| s.do_cache(profile, size)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(cost: f64) -> ProfilingData {
        ProfilingData {
            uncached_cpu: cost,
            ..Default::default()
        }
    }

    #[test]
    fn test_by_name_simple() {
        assert_eq!(CachingStrategy::by_name("all").unwrap(), CachingStrategy::CacheAll);
        assert_eq!(CachingStrategy::by_name("Never").unwrap(), CachingStrategy::Never);
        assert_eq!(
            CachingStrategy::by_name("cost:2.5").unwrap(),
            CachingStrategy::CostThreshold(2.5)
        );
        assert_eq!(
            CachingStrategy::by_name("size:4096").unwrap(),
            CachingStrategy::SizeBounded(4096)
        );
        assert!(CachingStrategy::by_name("sometimes").is_err());
    }

    #[test]
    fn test_by_name_composed() {
        let s = CachingStrategy::by_name("and(cost:10,size:1000)").unwrap();
        assert!(s.do_cache(&profile(20.0), 500));
        assert!(!s.do_cache(&profile(20.0), 5000));
        assert!(!s.do_cache(&profile(5.0), 500));

        let s = CachingStrategy::by_name("or(cost:10,size:1000)").unwrap();
        assert!(s.do_cache(&profile(5.0), 500));
        assert!(!s.do_cache(&profile(5.0), 5000));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let s = CachingStrategy::CostThreshold(10.0);
        assert!(s.do_cache(&profile(10.0), 1));
        assert!(!s.do_cache(&profile(9.9), 1));
    }

    #[test]
    fn test_zero_threshold_admits_everything() {
        let s = CachingStrategy::by_name("cost:0").unwrap();
        assert!(s.do_cache(&profile(0.0), 1));
    }
}
