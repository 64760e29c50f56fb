// Plot artifacts.
//
// Plots (histograms, text, xy graphs) are carried as an opaque rendered
// payload. They are not spatially separable, so the cache can only serve
// them whole: cutting returns the plot unchanged and puzzling is defined
// only for a single input.

use serde::{Deserialize, Serialize};

use crate::extent::SpatioTemporalExtent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plot {
    pub extent: SpatioTemporalExtent,
    pub content: String,
}

impl Plot {
    pub fn new(extent: SpatioTemporalExtent, content: String) -> Self {
        Plot { extent, content }
    }

    pub fn byte_size(&self) -> u64 {
        self.content.len() as u64 + std::mem::size_of::<Plot>() as u64
    }
}
