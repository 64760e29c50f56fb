// Result artifacts.
//
// The closed set of result types the cache handles. Artifacts are carried
// as one enum and dispatched by tag; every operation is per-type and types
// never mix.

mod features;
mod plot;
mod raster;

pub use features::{AttributeColumn, AttributeTable, FeatureCollection, Provenance, point_geom};
pub use plot::Plot;
pub use raster::{Raster, ScaleSaturation};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::extent::{CacheCube, QueryRectangle, SpatioTemporalExtent};

/// The closed variant set of cacheable result types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultType {
    Raster,
    Point,
    Line,
    Polygon,
    Plot,
}

impl ResultType {
    pub const ALL: [ResultType; 5] = [
        ResultType::Raster,
        ResultType::Point,
        ResultType::Line,
        ResultType::Polygon,
        ResultType::Plot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Raster => "raster",
            ResultType::Point => "point",
            ResultType::Line => "line",
            ResultType::Polygon => "polygon",
            ResultType::Plot => "plot",
        }
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResultType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raster" => Ok(ResultType::Raster),
            "point" => Ok(ResultType::Point),
            "line" => Ok(ResultType::Line),
            "polygon" => Ok(ResultType::Polygon),
            "plot" => Ok(ResultType::Plot),
            other => Err(CacheError::Argument(format!("unknown result type: {other}"))),
        }
    }
}

/// A computed result that may be cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Artifact {
    Raster(Raster),
    Points(FeatureCollection),
    Lines(FeatureCollection),
    Polygons(FeatureCollection),
    Plot(Plot),
}

impl Artifact {
    pub fn result_type(&self) -> ResultType {
        match self {
            Artifact::Raster(_) => ResultType::Raster,
            Artifact::Points(_) => ResultType::Point,
            Artifact::Lines(_) => ResultType::Line,
            Artifact::Polygons(_) => ResultType::Polygon,
            Artifact::Plot(_) => ResultType::Plot,
        }
    }

    pub fn extent(&self) -> &SpatioTemporalExtent {
        match self {
            Artifact::Raster(r) => &r.extent,
            Artifact::Points(c) | Artifact::Lines(c) | Artifact::Polygons(c) => &c.extent,
            Artifact::Plot(p) => &p.extent,
        }
    }

    /// In-memory payload size, used for byte accounting and admission.
    pub fn byte_size(&self) -> u64 {
        match self {
            Artifact::Raster(r) => r.byte_size(),
            Artifact::Points(c) | Artifact::Lines(c) | Artifact::Polygons(c) => c.byte_size(),
            Artifact::Plot(p) => p.byte_size(),
        }
    }

    /// The cache cube describing what this artifact is good for. Raster
    /// cubes carry the scale interval, widened by the result's saturation
    /// flags.
    pub fn cube(&self) -> CacheResult<CacheCube> {
        match self {
            Artifact::Raster(r) => r.cube(),
            Artifact::Points(c) | Artifact::Lines(c) | Artifact::Polygons(c) => {
                CacheCube::from_extent(&c.extent)
            }
            Artifact::Plot(p) => CacheCube::from_extent(&p.extent),
        }
    }

    /// Restricts the artifact to a query rectangle.
    pub fn cut(&self, query: &QueryRectangle) -> CacheResult<Artifact> {
        match self {
            Artifact::Raster(r) => Ok(Artifact::Raster(r.cut(query)?)),
            Artifact::Points(c) => Ok(Artifact::Points(c.clip(query))),
            Artifact::Lines(c) => Ok(Artifact::Lines(c.clip(query))),
            Artifact::Polygons(c) => Ok(Artifact::Polygons(c.clip(query))),
            Artifact::Plot(p) => Ok(Artifact::Plot(p.clone())),
        }
    }

    pub fn expect_type(&self, expected: ResultType) -> CacheResult<()> {
        if self.result_type() == expected {
            Ok(())
        } else {
            Err(CacheError::Argument(format!(
                "expected {expected} artifact, got {}",
                self.result_type()
            )))
        }
    }

    pub fn feature_collection(&self) -> Option<&FeatureCollection> {
        match self {
            Artifact::Points(c) | Artifact::Lines(c) | Artifact::Polygons(c) => Some(c),
            _ => None,
        }
    }

    pub fn from_features(result_type: ResultType, c: FeatureCollection) -> CacheResult<Artifact> {
        match result_type {
            ResultType::Point => Ok(Artifact::Points(c)),
            ResultType::Line => Ok(Artifact::Lines(c)),
            ResultType::Polygon => Ok(Artifact::Polygons(c)),
            other => Err(CacheError::Argument(format!(
                "{other} is not a feature type"
            ))),
        }
    }
}
