// Feature-collection artifacts (points, lines, polygons).
//
// Geometries are geo primitives; attributes are column-oriented with one
// value per feature. Each feature optionally remembers the cache entry it
// was first stored under, which lets the puzzler drop duplicates when
// overlapping fragments are merged.

use std::collections::BTreeMap;

use geo::Intersects;
use geo_types::{Geometry, Polygon, Rect as GeoRect, coord};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::extent::{QueryRectangle, SpatioTemporalExtent};

/// Where a feature was first cached: the owning entry and the feature's
/// index within it. Features fresh from a computation carry no provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub entry_id: u64,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeColumn {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl AttributeColumn {
    pub fn len(&self) -> usize {
        match self {
            AttributeColumn::Numeric(v) => v.len(),
            AttributeColumn::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the missing-value filler: NaN for numeric columns, the
    /// empty string for text columns.
    fn push_missing(&mut self) {
        match self {
            AttributeColumn::Numeric(v) => v.push(f64::NAN),
            AttributeColumn::Text(v) => v.push(String::new()),
        }
    }

    fn push_from(&mut self, other: &AttributeColumn, index: usize) -> CacheResult<()> {
        match (self, other) {
            (AttributeColumn::Numeric(dst), AttributeColumn::Numeric(src)) => {
                dst.push(src[index]);
                Ok(())
            }
            (AttributeColumn::Text(dst), AttributeColumn::Text(src)) => {
                dst.push(src[index].clone());
                Ok(())
            }
            _ => Err(CacheError::Argument(
                "attribute column type mismatch".into(),
            )),
        }
    }

    fn byte_size(&self) -> u64 {
        match self {
            AttributeColumn::Numeric(v) => (v.len() * 8) as u64,
            AttributeColumn::Text(v) => v.iter().map(|s| s.len() as u64 + 24).sum(),
        }
    }
}

/// Column-oriented per-feature attributes. All columns have one value per
/// feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeTable {
    pub columns: BTreeMap<String, AttributeColumn>,
}

impl AttributeTable {
    pub fn byte_size(&self) -> u64 {
        self.columns
            .iter()
            .map(|(k, c)| k.len() as u64 + c.byte_size())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    pub extent: SpatioTemporalExtent,
    pub geoms: Vec<Geometry<f64>>,
    pub attributes: AttributeTable,
    pub provenance: Vec<Option<Provenance>>,
}

impl FeatureCollection {
    pub fn new(
        extent: SpatioTemporalExtent,
        geoms: Vec<Geometry<f64>>,
        attributes: AttributeTable,
    ) -> CacheResult<Self> {
        for (name, col) in &attributes.columns {
            if col.len() != geoms.len() {
                return Err(CacheError::Argument(format!(
                    "attribute column '{name}' has {} values for {} features",
                    col.len(),
                    geoms.len()
                )));
            }
        }
        let provenance = vec![None; geoms.len()];
        Ok(FeatureCollection {
            extent,
            geoms,
            attributes,
            provenance,
        })
    }

    pub fn empty(extent: SpatioTemporalExtent) -> Self {
        FeatureCollection {
            extent,
            geoms: Vec::new(),
            attributes: AttributeTable::default(),
            provenance: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.geoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geoms.is_empty()
    }

    pub fn byte_size(&self) -> u64 {
        use geo::CoordsIter;
        let coords: usize = self.geoms.iter().map(|g| g.coords_count()).sum();
        (coords * 16) as u64
            + self.attributes.byte_size()
            + (self.provenance.len() * 16) as u64
            + std::mem::size_of::<FeatureCollection>() as u64
    }

    /// Stamps provenance onto features that have none yet. Called by the
    /// store when the collection is inserted under a fresh entry id.
    pub fn stamp_provenance(&mut self, entry_id: u64) {
        for (index, slot) in self.provenance.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Provenance {
                    entry_id,
                    index: index as u32,
                });
            }
        }
    }

    fn query_polygon(query: &QueryRectangle) -> Polygon<f64> {
        GeoRect::new(
            coord! { x: query.x1, y: query.y1 },
            coord! { x: query.x2, y: query.y2 },
        )
        .to_polygon()
    }

    /// Keeps the features whose geometry intersects the query rectangle.
    pub fn clip(&self, query: &QueryRectangle) -> FeatureCollection {
        let clip = Self::query_polygon(query);
        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| self.geoms[i].intersects(&clip))
            .collect();
        self.take_rows(SpatioTemporalExtent::from(query), &keep)
    }

    fn take_rows(&self, extent: SpatioTemporalExtent, rows: &[usize]) -> FeatureCollection {
        let geoms = rows.iter().map(|&i| self.geoms[i].clone()).collect();
        let provenance = rows.iter().map(|&i| self.provenance[i]).collect();
        let mut columns = BTreeMap::new();
        for (name, col) in &self.attributes.columns {
            let taken = match col {
                AttributeColumn::Numeric(v) => {
                    AttributeColumn::Numeric(rows.iter().map(|&i| v[i]).collect())
                }
                AttributeColumn::Text(v) => {
                    AttributeColumn::Text(rows.iter().map(|&i| v[i].clone()).collect())
                }
            };
            columns.insert(name.clone(), taken);
        }
        FeatureCollection {
            extent,
            geoms,
            attributes: AttributeTable { columns },
            provenance,
        }
    }

    /// Merges overlapping fragments into one collection restricted to the
    /// query: features outside the query are dropped, duplicates (same
    /// provenance seen twice) are dropped, and attribute schemas are
    /// unioned with NaN / empty-string fill.
    pub fn merge(parts: &[FeatureCollection], query: &QueryRectangle) -> CacheResult<FeatureCollection> {
        let clip = Self::query_polygon(query);
        let mut out = FeatureCollection::empty(SpatioTemporalExtent::from(query));

        // Union schema first so every appended row fills every column.
        for part in parts {
            for (name, col) in &part.attributes.columns {
                let template = match col {
                    AttributeColumn::Numeric(_) => AttributeColumn::Numeric(Vec::new()),
                    AttributeColumn::Text(_) => AttributeColumn::Text(Vec::new()),
                };
                out.attributes.columns.entry(name.clone()).or_insert(template);
            }
        }

        let mut seen = std::collections::HashSet::new();
        for part in parts {
            for i in 0..part.len() {
                if let Some(p) = part.provenance[i]
                    && !seen.insert(p)
                {
                    continue;
                }
                if !part.geoms[i].intersects(&clip) {
                    continue;
                }
                out.geoms.push(part.geoms[i].clone());
                out.provenance.push(part.provenance[i]);
                for (name, col) in out.attributes.columns.iter_mut() {
                    match part.attributes.columns.get(name) {
                        Some(src) => col.push_from(src, i)?,
                        None => col.push_missing(),
                    }
                }
            }
        }
        Ok(out)
    }

    /// Feature-set equality ignoring order, for verification: compares the
    /// geometry/provenance multiset.
    pub fn set_eq(&self, other: &FeatureCollection) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut matched = vec![false; other.len()];
        'outer: for i in 0..self.len() {
            for j in 0..other.len() {
                if !matched[j]
                    && self.provenance[i] == other.provenance[j]
                    && self.geoms[i] == other.geoms[j]
                {
                    matched[j] = true;
                    continue 'outer;
                }
            }
            return false;
        }
        true
    }
}

/// A point geometry helper used across tests.
pub fn point_geom(x: f64, y: f64) -> Geometry<f64> {
    Geometry::Point(geo_types::Point::new(x, y))
}
