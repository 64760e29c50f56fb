// Puzzle assembly.
//
// Merges a set of overlapping inputs (cached parts plus recomputed
// remainders) into one artifact restricted to the query rectangle. The
// fetch/recompute orchestration lives in the node cache wrapper; this
// module is the pure per-type merge.

use tracing::debug;

use crate::artifact::{Artifact, FeatureCollection, Raster, ResultType};
use crate::error::{CacheError, CacheResult};
use crate::extent::{QueryRectangle, QueryResolution, SpatioTemporalExtent};

/// Merges `inputs` into a single artifact of `result_type` covering
/// exactly `query`.
///
/// Rasters are composed pixel-wise: inputs are blitted in ascending
/// coverage order so that where inputs overlap, the higher-coverage one
/// wins the edge. Feature collections are concatenated with
/// provenance-based duplicate dropping and schema union. Plots are only
/// defined for exactly one input.
pub fn merge_artifacts(
    result_type: ResultType,
    query: &QueryRectangle,
    inputs: Vec<Artifact>,
) -> CacheResult<Artifact> {
    if inputs.is_empty() {
        return Err(CacheError::MustNotHappen(
            "puzzle with no inputs".into(),
        ));
    }
    for input in &inputs {
        input.expect_type(result_type)?;
    }
    debug!(
        "type" = %result_type,
        inputs = inputs.len(),
        "assembling puzzle result"
    );

    match result_type {
        ResultType::Raster => merge_rasters(query, inputs),
        ResultType::Point | ResultType::Line | ResultType::Polygon => {
            let parts: Vec<FeatureCollection> = inputs
                .into_iter()
                .filter_map(|a| match a {
                    Artifact::Points(c) | Artifact::Lines(c) | Artifact::Polygons(c) => Some(c),
                    _ => None,
                })
                .collect();
            let merged = FeatureCollection::merge(&parts, query)?;
            Artifact::from_features(result_type, merged)
        }
        ResultType::Plot => {
            let mut inputs = inputs;
            if inputs.len() != 1 {
                return Err(CacheError::Unsupported(format!(
                    "plots cannot be puzzled from {} inputs",
                    inputs.len()
                )));
            }
            Ok(inputs.remove(0))
        }
    }
}

fn merge_rasters(query: &QueryRectangle, inputs: Vec<Artifact>) -> CacheResult<Artifact> {
    let QueryResolution::Pixels { xres, yres } = query.resolution else {
        return Err(CacheError::Argument(
            "raster puzzle without pixel resolution".into(),
        ));
    };
    let mut rasters: Vec<Raster> = inputs
        .into_iter()
        .filter_map(|a| match a {
            Artifact::Raster(r) => Some(r),
            _ => None,
        })
        .collect();

    // Ascending coverage: the best-covering input is blitted last and wins
    // overlapping edges.
    rasters.sort_by(|a, b| {
        let ca = coverage_of(a, query);
        let cb = coverage_of(b, query);
        ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
    });

    let bpp = rasters[0].bytes_per_pixel;
    let nodata = rasters[0].nodata;
    let mut out = Raster::filled(SpatioTemporalExtent::from(query), xres, yres, bpp, nodata)?;
    for r in &rasters {
        out.blit(r)?;
    }
    Ok(Artifact::Raster(out))
}

fn coverage_of(raster: &Raster, query: &QueryRectangle) -> f64 {
    match raster
        .extent
        .bbox()
        .intersection(&query.bbox())
    {
        Some(overlap) => overlap.area() / query.area(),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{AttributeTable, Plot, point_geom};
    use crate::extent::CrsId;

    fn ext(x1: f64, y1: f64, x2: f64, y2: f64) -> SpatioTemporalExtent {
        SpatioTemporalExtent::new(CrsId::LatLon, x1, y1, x2, y2, 0.0, 1.0)
    }

    fn gradient(e: SpatioTemporalExtent, width: u32, height: u32) -> Raster {
        let data: Vec<u8> = (0..width * height).map(|i| (i % 251) as u8).collect();
        Raster::new(e, width, height, 1, None, data).unwrap()
    }

    #[test]
    fn test_raster_two_halves() {
        let q = QueryRectangle::new(
            CrsId::LatLon,
            0.0,
            0.0,
            100.0,
            100.0,
            0.0,
            1.0,
            QueryResolution::pixels(100, 100),
        )
        .unwrap();
        let left = gradient(ext(0.0, 0.0, 50.0, 100.0), 50, 100);
        let right = gradient(ext(50.0, 0.0, 100.0, 100.0), 50, 100);
        let merged = merge_artifacts(
            ResultType::Raster,
            &q,
            vec![
                Artifact::Raster(left.clone()),
                Artifact::Raster(right.clone()),
            ],
        )
        .unwrap();
        let Artifact::Raster(out) = merged else {
            panic!("expected raster");
        };
        // Compare against the directly assembled reference.
        let mut want = Raster::filled(ext(0.0, 0.0, 100.0, 100.0), 100, 100, 1, None).unwrap();
        want.blit(&left).unwrap();
        want.blit(&right).unwrap();
        assert_eq!(out.data, want.data);
    }

    #[test]
    fn test_single_covering_raster_is_window() {
        // Puzzle idempotence: one input fully covering the query yields
        // the input restricted to the query, bit-exact.
        let src = gradient(ext(0.0, 0.0, 100.0, 100.0), 100, 100);
        let q = QueryRectangle::new(
            CrsId::LatLon,
            10.0,
            10.0,
            20.0,
            20.0,
            0.0,
            1.0,
            QueryResolution::pixels(10, 10),
        )
        .unwrap();
        let merged =
            merge_artifacts(ResultType::Raster, &q, vec![Artifact::Raster(src.clone())]).unwrap();
        let Artifact::Raster(out) = merged else {
            panic!("expected raster");
        };
        assert_eq!(out.data, src.cut(&q).unwrap().data);
    }

    #[test]
    fn test_feature_merge() {
        let q = QueryRectangle::new(
            CrsId::LatLon,
            0.0,
            0.0,
            100.0,
            100.0,
            0.0,
            1.0,
            QueryResolution::None,
        )
        .unwrap();
        let a = FeatureCollection::new(
            ext(0.0, 0.0, 50.0, 100.0),
            vec![point_geom(10.0, 10.0)],
            AttributeTable::default(),
        )
        .unwrap();
        let b = FeatureCollection::new(
            ext(50.0, 0.0, 100.0, 100.0),
            vec![point_geom(60.0, 10.0)],
            AttributeTable::default(),
        )
        .unwrap();
        let merged = merge_artifacts(
            ResultType::Point,
            &q,
            vec![Artifact::Points(a), Artifact::Points(b)],
        )
        .unwrap();
        assert_eq!(merged.feature_collection().unwrap().len(), 2);
    }

    #[test]
    fn test_plot_requires_single_input() {
        let q = QueryRectangle::new(
            CrsId::LatLon,
            0.0,
            0.0,
            1.0,
            1.0,
            0.0,
            1.0,
            QueryResolution::None,
        )
        .unwrap();
        let plot = Artifact::Plot(Plot::new(ext(0.0, 0.0, 1.0, 1.0), "p".into()));
        assert!(merge_artifacts(ResultType::Plot, &q, vec![plot.clone()]).is_ok());
        let err = merge_artifacts(ResultType::Plot, &q, vec![plot.clone(), plot]).unwrap_err();
        assert!(matches!(err, CacheError::Unsupported(_)));
    }

    #[test]
    fn test_type_mixing_rejected() {
        let q = QueryRectangle::new(
            CrsId::LatLon,
            0.0,
            0.0,
            1.0,
            1.0,
            0.0,
            1.0,
            QueryResolution::None,
        )
        .unwrap();
        let plot = Artifact::Plot(Plot::new(ext(0.0, 0.0, 1.0, 1.0), "p".into()));
        assert!(matches!(
            merge_artifacts(ResultType::Point, &q, vec![plot]),
            Err(CacheError::Argument(_))
        ));
    }
}
