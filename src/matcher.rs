// Query matching against a set of cached cubes.
//
// Given a query rectangle and the candidate entries stored under one
// semantic id, selects a hit set and decomposes the uncovered area into
// axis-aligned remainder rectangles. The same matcher runs on the node
// (over the local store) and on the index (over the cluster directory).

use crate::extent::{COVERAGE_EPSILON, CacheCube, QueryRectangle, Rect};

/// A matchable entry: the cube plus the tie-break fields.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub cube: CacheCube,
    pub entry_id: u64,
    pub access_count: u64,
}

/// The outcome of matching one query. `items` holds indices into the
/// candidate slice handed to [`match_query`].
#[derive(Debug, Clone)]
pub struct CacheQueryResult {
    pub items: Vec<usize>,
    pub remainder: Vec<QueryRectangle>,
    pub hit_ratio: f64,
}

impl CacheQueryResult {
    pub fn miss() -> Self {
        CacheQueryResult {
            items: Vec::new(),
            remainder: Vec::new(),
            hit_ratio: 0.0,
        }
    }

    pub fn has_hit(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn has_remainder(&self) -> bool {
        !self.remainder.is_empty()
    }
}

struct Scored {
    index: usize,
    score: f64,
}

/// Matches `query` against `candidates`.
///
/// A candidate fully covering the query short-circuits to a single-item
/// hit. Otherwise candidates are scored by `coverage / cube_area` (tight
/// fits first) and selected greedily, subtracting each selected cube from
/// the uncovered region. Ties within 1e-9 prefer the higher access count,
/// then the lower entry id.
pub fn match_query(query: &QueryRectangle, candidates: &[Candidate]) -> CacheQueryResult {
    if let Some(full) = best_full_match(query, candidates) {
        return CacheQueryResult {
            items: vec![full],
            remainder: Vec::new(),
            hit_ratio: 1.0,
        };
    }

    let mut scored: Vec<Scored> = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, c)| {
            let coverage = c.cube.coverage(query);
            (coverage > COVERAGE_EPSILON).then(|| Scored {
                index,
                score: coverage / c.cube.area(),
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        if (a.score - b.score).abs() <= COVERAGE_EPSILON {
            let ca = &candidates[a.index];
            let cb = &candidates[b.index];
            cb.access_count
                .cmp(&ca.access_count)
                .then(ca.entry_id.cmp(&cb.entry_id))
        } else {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        }
    });

    let query_area = query.area();
    let mut uncovered = vec![query.bbox()];
    let mut items = Vec::new();

    for s in &scored {
        if uncovered.is_empty() {
            break;
        }
        let bbox = candidates[s.index].cube.bbox();
        let gain: f64 = uncovered
            .iter()
            .filter_map(|r| r.intersection(&bbox))
            .map(|r| r.area())
            .sum();
        if gain <= COVERAGE_EPSILON * query_area {
            continue;
        }
        items.push(s.index);
        uncovered = uncovered
            .into_iter()
            .flat_map(|r| r.subtract(&bbox))
            .collect();
    }

    let uncovered_area: f64 = uncovered.iter().map(Rect::area).sum();
    let hit_ratio = if items.is_empty() {
        0.0
    } else {
        (1.0 - uncovered_area / query_area).clamp(0.0, 1.0)
    };

    CacheQueryResult {
        items,
        remainder: uncovered.iter().map(|r| query.sub_query(r)).collect(),
        hit_ratio,
    }
}

/// The best fully-covering candidate: tightest cube, then higher access
/// count, then lower entry id.
fn best_full_match(query: &QueryRectangle, candidates: &[Candidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.cube.matches(query))
        .min_by(|(_, a), (_, b)| {
            a.cube
                .area()
                .partial_cmp(&b.cube.area())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.access_count.cmp(&a.access_count))
                .then(a.entry_id.cmp(&b.entry_id))
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{CrsId, QueryResolution, SpatioTemporalExtent};

    fn query(x1: f64, y1: f64, x2: f64, y2: f64) -> QueryRectangle {
        QueryRectangle::new(CrsId::LatLon, x1, y1, x2, y2, 0.0, 1.0, QueryResolution::None)
            .unwrap()
    }

    fn candidate(entry_id: u64, x1: f64, y1: f64, x2: f64, y2: f64) -> Candidate {
        let extent = SpatioTemporalExtent::new(CrsId::LatLon, x1, y1, x2, y2, 0.0, 1.0);
        Candidate {
            cube: CacheCube::from_extent(&extent).unwrap(),
            entry_id,
            access_count: 0,
        }
    }

    #[test]
    fn test_full_hit_short_circuits() {
        let candidates = vec![
            candidate(1, 0.0, 0.0, 100.0, 100.0),
            candidate(2, 0.0, 0.0, 50.0, 50.0),
        ];
        let res = match_query(&query(10.0, 10.0, 20.0, 20.0), &candidates);
        assert_eq!(res.items.len(), 1);
        assert!(!res.has_remainder());
        assert_eq!(res.hit_ratio, 1.0);
    }

    #[test]
    fn test_full_hit_prefers_tightest() {
        let candidates = vec![
            candidate(1, 0.0, 0.0, 100.0, 100.0),
            candidate(2, 0.0, 0.0, 40.0, 40.0),
        ];
        let res = match_query(&query(10.0, 10.0, 20.0, 20.0), &candidates);
        assert_eq!(res.items, vec![1]);
    }

    #[test]
    fn test_two_halves_cover_without_remainder() {
        let candidates = vec![
            candidate(1, 0.0, 0.0, 50.0, 100.0),
            candidate(2, 50.0, 0.0, 100.0, 100.0),
        ];
        let res = match_query(&query(0.0, 0.0, 100.0, 100.0), &candidates);
        assert_eq!(res.items.len(), 2);
        assert!(!res.has_remainder());
        assert!((res.hit_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_hit_emits_remainder() {
        let candidates = vec![candidate(1, 0.0, 0.0, 50.0, 100.0)];
        let res = match_query(&query(0.0, 0.0, 100.0, 100.0), &candidates);
        assert_eq!(res.items.len(), 1);
        assert_eq!(res.remainder.len(), 1);
        let r = &res.remainder[0];
        assert!((r.x1 - 50.0).abs() < 1e-9);
        assert!((res.hit_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_miss() {
        let candidates = vec![candidate(1, 200.0, 200.0, 300.0, 300.0)];
        let res = match_query(&query(0.0, 0.0, 100.0, 100.0), &candidates);
        assert!(!res.has_hit());
        assert_eq!(res.hit_ratio, 0.0);
    }

    #[test]
    fn test_zero_coverage_candidates_discarded() {
        // Temporal mismatch gives zero coverage even with spatial overlap.
        let extent = SpatioTemporalExtent::new(CrsId::LatLon, 0.0, 0.0, 100.0, 100.0, 5.0, 6.0);
        let candidates = vec![Candidate {
            cube: CacheCube::from_extent(&extent).unwrap(),
            entry_id: 1,
            access_count: 0,
        }];
        let res = match_query(&query(0.0, 0.0, 100.0, 100.0), &candidates);
        assert!(!res.has_hit());
    }

    #[test]
    fn test_remainder_disjoint_and_covering() {
        // An L-shaped gap: one candidate in the middle of the query.
        let candidates = vec![candidate(1, 25.0, 25.0, 75.0, 75.0)];
        let res = match_query(&query(0.0, 0.0, 100.0, 100.0), &candidates);
        assert!(res.has_remainder());
        assert!(res.remainder.len() <= 8);
        let total: f64 = res.remainder.iter().map(QueryRectangle::area).sum();
        assert!((total - (10_000.0 - 2_500.0)).abs() < 1e-6);
        for (i, a) in res.remainder.iter().enumerate() {
            for b in res.remainder.iter().skip(i + 1) {
                assert!(!a.bbox().intersects(&b.bbox()));
            }
        }
    }

    #[test]
    fn test_tiebreak_prefers_access_count() {
        let mut a = candidate(1, 0.0, 0.0, 60.0, 100.0);
        let mut b = candidate(2, 40.0, 0.0, 100.0, 100.0);
        a.access_count = 1;
        b.access_count = 5;
        // Same coverage and area; scores tie, so entry 2 goes first.
        let res = match_query(&query(0.0, 0.0, 100.0, 100.0), &[a, b]);
        assert_eq!(res.items[0], 1);
    }
}
