// Spatio-temporal extents and query rectangles.
//
// A query addresses a rectangle in space, an interval in time and (for
// rasters) a pixel resolution. A cache cube is the extent an entry is good
// for: the spatial/temporal bounds of the artifact plus, for rasters, the
// interval of pixel scales the artifact may serve.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Coverage comparisons treat values closer than this as equal.
pub const COVERAGE_EPSILON: f64 = 1e-9;

/// Coordinate reference systems for space, mapping x/y to a place on earth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrsId {
    Unknown,
    WebMercator,
    LatLon,
    GeosMsg,
}

impl CrsId {
    /// The full extent of the CRS, or `None` when unknown.
    pub fn extent(&self) -> Option<Rect> {
        match self {
            CrsId::WebMercator => Some(Rect::new(
                -20_037_508.34,
                -20_037_508.34,
                20_037_508.34,
                20_037_508.34,
            )),
            CrsId::LatLon => Some(Rect::new(-180.0, -90.0, 180.0, 90.0)),
            CrsId::GeosMsg => Some(Rect::new(
                -5_568_748.276,
                -5_568_748.276,
                5_568_748.276,
                5_568_748.276,
            )),
            CrsId::Unknown => None,
        }
    }
}

/// Coordinate systems for time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeType {
    Unknown,
    Unix,
}

/// Requested output resolution. Feature and plot queries carry `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryResolution {
    None,
    Pixels { xres: u32, yres: u32 },
}

impl QueryResolution {
    pub fn pixels(xres: u32, yres: u32) -> Self {
        QueryResolution::Pixels { xres, yres }
    }

    pub fn is_pixels(&self) -> bool {
        matches!(self, QueryResolution::Pixels { .. })
    }
}

/// An axis-aligned spatial rectangle. `x1 <= x2` and `y1 <= y2` always.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Rect {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Rect { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f64 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.x2 - self.x1 <= COVERAGE_EPSILON || self.y2 - self.y1 <= COVERAGE_EPSILON
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !(self.x1 >= other.x2
            || self.x2 <= other.x1
            || self.y1 >= other.y2
            || self.y2 <= other.y1)
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::new(
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.x2.min(other.x2),
            self.y2.min(other.y2),
        );
        if r.x1 < r.x2 && r.y1 < r.y2 { Some(r) } else { None }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x1 <= other.x1 && self.x2 >= other.x2 && self.y1 <= other.y1 && self.y2 >= other.y2
    }

    /// Removes `clip` from this rectangle, producing up to four disjoint
    /// remainder rectangles (left and right full-height strips, top and
    /// bottom strips between them).
    pub fn subtract(&self, clip: &Rect) -> Vec<Rect> {
        let Some(overlap) = self.intersection(clip) else {
            return vec![*self];
        };
        let mut parts = Vec::with_capacity(4);
        if overlap.x1 > self.x1 {
            parts.push(Rect::new(self.x1, self.y1, overlap.x1, self.y2));
        }
        if overlap.x2 < self.x2 {
            parts.push(Rect::new(overlap.x2, self.y1, self.x2, self.y2));
        }
        if overlap.y1 > self.y1 {
            parts.push(Rect::new(overlap.x1, self.y1, overlap.x2, overlap.y1));
        }
        if overlap.y2 < self.y2 {
            parts.push(Rect::new(overlap.x1, overlap.y2, overlap.x2, self.y2));
        }
        parts.retain(|r| !r.is_empty());
        parts
    }
}

/// Half-open scalar interval `[a, b)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub a: f64,
    pub b: f64,
}

impl Interval {
    pub fn new(a: f64, b: f64) -> Self {
        Interval { a, b }
    }

    pub fn contains(&self, v: f64) -> bool {
        self.a <= v && v < self.b
    }
}

/// Pixel-scale bounds of a raster entry, per axis. Scale is measured in
/// CRS units per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleInterval {
    pub x: Interval,
    pub y: Interval,
}

impl ScaleInterval {
    pub fn contains(&self, x_scale: f64, y_scale: f64) -> bool {
        self.x.contains(x_scale) && self.y.contains(y_scale)
    }
}

/// The rectangle a query addresses: a CRS-tagged bounding box in space,
/// an interval in time, and the requested output resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRectangle {
    pub crs: CrsId,
    pub time_type: TimeType,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub t1: f64,
    pub t2: f64,
    pub resolution: QueryResolution,
}

impl QueryRectangle {
    pub fn new(
        crs: CrsId,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        t1: f64,
        t2: f64,
        resolution: QueryResolution,
    ) -> CacheResult<Self> {
        let q = QueryRectangle {
            crs,
            time_type: TimeType::Unix,
            x1,
            y1,
            x2,
            y2,
            t1,
            t2,
            resolution,
        };
        q.validate()?;
        Ok(q)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.x1 > self.x2 || self.y1 > self.y2 {
            return Err(CacheError::Argument(format!(
                "invalid spatial bounds: x:[{},{}] y:[{},{}]",
                self.x1, self.x2, self.y1, self.y2
            )));
        }
        if self.t1 > self.t2 {
            return Err(CacheError::Argument(format!(
                "invalid temporal bounds: [{},{}]",
                self.t1, self.t2
            )));
        }
        if self.x1.is_nan() || self.y1.is_nan() || self.x2.is_nan() || self.y2.is_nan() {
            return Err(CacheError::Argument("bounds contain NaN".into()));
        }
        if let QueryResolution::Pixels { xres, yres } = self.resolution
            && (xres == 0 || yres == 0)
        {
            return Err(CacheError::Argument("zero pixel resolution".into()));
        }
        Ok(())
    }

    pub fn bbox(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.x2, self.y2)
    }

    pub fn area(&self) -> f64 {
        self.bbox().area()
    }

    /// The pixel scale the query asks for (units per pixel), or `None` for
    /// feature/plot queries.
    pub fn pixel_scale(&self) -> Option<(f64, f64)> {
        match self.resolution {
            QueryResolution::Pixels { xres, yres } => Some((
                (self.x2 - self.x1) / xres as f64,
                (self.y2 - self.y1) / yres as f64,
            )),
            QueryResolution::None => None,
        }
    }

    /// Derives the sub-query for a remainder rectangle: same CRS, time and
    /// pixel scale, with the resolution shrunk proportionally.
    pub fn sub_query(&self, bbox: &Rect) -> QueryRectangle {
        let resolution = match self.resolution {
            QueryResolution::Pixels { xres, yres } => {
                let fx = (bbox.x2 - bbox.x1) / (self.x2 - self.x1);
                let fy = (bbox.y2 - bbox.y1) / (self.y2 - self.y1);
                QueryResolution::Pixels {
                    xres: ((xres as f64 * fx).round() as u32).max(1),
                    yres: ((yres as f64 * fy).round() as u32).max(1),
                }
            }
            QueryResolution::None => QueryResolution::None,
        };
        QueryRectangle {
            crs: self.crs,
            time_type: self.time_type,
            x1: bbox.x1,
            y1: bbox.y1,
            x2: bbox.x2,
            y2: bbox.y2,
            t1: self.t1,
            t2: self.t2,
            resolution,
        }
    }
}

/// The spatial/temporal footprint a result applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatioTemporalExtent {
    pub crs: CrsId,
    pub time_type: TimeType,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub t1: f64,
    pub t2: f64,
}

impl SpatioTemporalExtent {
    pub fn new(crs: CrsId, x1: f64, y1: f64, x2: f64, y2: f64, t1: f64, t2: f64) -> Self {
        SpatioTemporalExtent {
            crs,
            time_type: TimeType::Unix,
            x1,
            y1,
            x2,
            y2,
            t1,
            t2,
        }
    }

    /// An extent spanning the known universe of the CRS, both in space and
    /// time. Falls back to +-infinity when the CRS extent is unknown.
    pub fn unreferenced(crs: CrsId) -> Self {
        let bbox = crs
            .extent()
            .unwrap_or(Rect::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::INFINITY));
        SpatioTemporalExtent::new(
            crs,
            bbox.x1,
            bbox.y1,
            bbox.x2,
            bbox.y2,
            f64::NEG_INFINITY,
            f64::INFINITY,
        )
    }

    pub fn bbox(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.x2, self.y2)
    }
}

impl From<&QueryRectangle> for SpatioTemporalExtent {
    fn from(q: &QueryRectangle) -> Self {
        SpatioTemporalExtent {
            crs: q.crs,
            time_type: q.time_type,
            x1: q.x1,
            y1: q.y1,
            x2: q.x2,
            y2: q.y2,
            t1: q.t1,
            t2: q.t2,
        }
    }
}

/// The extent a cache entry is good for. For raster entries the spatial
/// bounds are outset by half a pixel and a scale interval is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheCube {
    pub crs: CrsId,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub t1: f64,
    pub t2: f64,
    pub scale: Option<ScaleInterval>,
}

impl CacheCube {
    pub fn from_extent(extent: &SpatioTemporalExtent) -> CacheResult<Self> {
        if extent.time_type != TimeType::Unix {
            return Err(CacheError::Argument(
                "cache cubes only accept unix timestamps".into(),
            ));
        }
        Ok(CacheCube {
            crs: extent.crs,
            x1: extent.x1,
            y1: extent.y1,
            x2: extent.x2,
            y2: extent.y2,
            t1: extent.t1,
            t2: extent.t2,
            scale: None,
        })
    }

    /// Builds the cube for a raster result: spatial bounds outset by half a
    /// pixel in each direction, scale bounds `[0.75*r, 1.5*r)` around the
    /// actual pixel scale `r` per axis.
    pub fn for_raster(extent: &SpatioTemporalExtent, width: u32, height: u32) -> CacheResult<Self> {
        let mut cube = CacheCube::from_extent(extent)?;
        let x_scale = (extent.x2 - extent.x1) / width as f64;
        let y_scale = (extent.y2 - extent.y1) / height as f64;

        cube.x1 -= x_scale / 2.0;
        cube.x2 += x_scale / 2.0;
        cube.y1 -= y_scale / 2.0;
        cube.y2 += y_scale / 2.0;
        cube.scale = Some(ScaleInterval {
            x: Interval::new(x_scale * 0.75, x_scale * 1.5),
            y: Interval::new(y_scale * 0.75, y_scale * 1.5),
        });
        Ok(cube)
    }

    pub fn bbox(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.x2, self.y2)
    }

    pub fn area(&self) -> f64 {
        self.bbox().area()
    }

    fn covers_time(&self, query: &QueryRectangle) -> bool {
        query.t1 >= self.t1 && query.t2 <= self.t2
    }

    fn covers_scale(&self, query: &QueryRectangle) -> bool {
        match (self.scale, query.pixel_scale()) {
            (Some(scale), Some((qx, qy))) => scale.contains(qx, qy),
            (None, None) => true,
            // Raster entries never answer feature queries and vice versa.
            _ => false,
        }
    }

    /// Whether this cube fully covers the query (CRS, space, time and, for
    /// rasters, the requested scale).
    pub fn matches(&self, query: &QueryRectangle) -> bool {
        self.crs == query.crs
            && self.bbox().contains(&query.bbox())
            && self.covers_time(query)
            && self.covers_scale(query)
    }

    /// Spatial coverage of the query in [0,1]. Requires CRS, temporal and
    /// scale containment; zero otherwise.
    pub fn coverage(&self, query: &QueryRectangle) -> f64 {
        if self.crs != query.crs || !self.covers_time(query) || !self.covers_scale(query) {
            return 0.0;
        }
        match self.bbox().intersection(&query.bbox()) {
            Some(overlap) => overlap.area() / query.area(),
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster_query(x1: f64, y1: f64, x2: f64, y2: f64, res: u32) -> QueryRectangle {
        QueryRectangle::new(
            CrsId::LatLon,
            x1,
            y1,
            x2,
            y2,
            0.0,
            1.0,
            QueryResolution::pixels(res, res),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let r = QueryRectangle::new(
            CrsId::LatLon,
            10.0,
            0.0,
            5.0,
            1.0,
            0.0,
            1.0,
            QueryResolution::None,
        );
        assert!(matches!(r, Err(CacheError::Argument(_))));
    }

    #[test]
    fn test_raster_cube_outset_and_scale() {
        let extent = SpatioTemporalExtent::new(CrsId::LatLon, 0.0, 0.0, 100.0, 100.0, 0.0, 1.0);
        let cube = CacheCube::for_raster(&extent, 100, 100).unwrap();
        // One pixel spans one unit, so the outset is half a unit.
        assert!((cube.x1 - -0.5).abs() < 1e-12);
        assert!((cube.x2 - 100.5).abs() < 1e-12);
        let scale = cube.scale.unwrap();
        assert!((scale.x.a - 0.75).abs() < 1e-12);
        assert!((scale.x.b - 1.5).abs() < 1e-12);
        // The actual scale always sits inside its own interval.
        assert!(scale.contains(1.0, 1.0));
    }

    #[test]
    fn test_cube_matches_contained_query() {
        let extent = SpatioTemporalExtent::new(CrsId::LatLon, 0.0, 0.0, 100.0, 100.0, 0.0, 1.0);
        let cube = CacheCube::for_raster(&extent, 100, 100).unwrap();
        // Same scale (10 units / 10 px), contained bounds.
        assert!(cube.matches(&raster_query(10.0, 10.0, 20.0, 20.0, 10)));
        // Too fine a scale is out of the interval.
        assert!(!cube.matches(&raster_query(10.0, 10.0, 20.0, 20.0, 100)));
        // Not spatially contained.
        assert!(!cube.matches(&raster_query(50.0, 50.0, 150.0, 150.0, 100)));
    }

    #[test]
    fn test_cube_rejects_wrong_time() {
        let extent = SpatioTemporalExtent::new(CrsId::LatLon, 0.0, 0.0, 100.0, 100.0, 5.0, 6.0);
        let cube = CacheCube::from_extent(&extent).unwrap();
        let q = QueryRectangle::new(
            CrsId::LatLon,
            10.0,
            10.0,
            20.0,
            20.0,
            0.0,
            1.0,
            QueryResolution::None,
        )
        .unwrap();
        assert!(!cube.matches(&q));
        assert_eq!(cube.coverage(&q), 0.0);
    }

    #[test]
    fn test_coverage_fraction() {
        let extent = SpatioTemporalExtent::new(CrsId::LatLon, 0.0, 0.0, 50.0, 100.0, 0.0, 1.0);
        let cube = CacheCube::from_extent(&extent).unwrap();
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
        assert!((cube.coverage(&q) - 0.5).abs() < COVERAGE_EPSILON);
    }

    #[test]
    fn test_rect_subtract_center() {
        let outer = Rect::new(0.0, 0.0, 10.0, 10.0);
        let inner = Rect::new(2.0, 2.0, 8.0, 8.0);
        let parts = outer.subtract(&inner);
        assert_eq!(parts.len(), 4);
        let total: f64 = parts.iter().map(Rect::area).sum();
        assert!((total - (100.0 - 36.0)).abs() < 1e-9);
        for (i, a) in parts.iter().enumerate() {
            for b in parts.iter().skip(i + 1) {
                assert!(!a.intersects(b));
            }
        }
    }

    #[test]
    fn test_rect_subtract_disjoint() {
        let outer = Rect::new(0.0, 0.0, 10.0, 10.0);
        let parts = outer.subtract(&Rect::new(20.0, 20.0, 30.0, 30.0));
        assert_eq!(parts, vec![outer]);
    }

    #[test]
    fn test_sub_query_scales_resolution() {
        let q = raster_query(0.0, 0.0, 100.0, 100.0, 100);
        let sub = q.sub_query(&Rect::new(0.0, 0.0, 50.0, 100.0));
        assert_eq!(sub.resolution, QueryResolution::pixels(50, 100));
        let (sx, sy) = sub.pixel_scale().unwrap();
        assert!((sx - 1.0).abs() < 1e-12);
        assert!((sy - 1.0).abs() < 1e-12);
    }
}
