// Raster artifacts.
//
// A raster is a row-major pixel grid over a spatio-temporal extent, with a
// fixed number of bytes per pixel. Row 0 is the northern edge (maximum y).
// The cache never resamples beyond nearest-neighbor: the scale interval on
// the cube guarantees source and target scales differ by less than a
// factor of two.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::extent::{CacheCube, QueryRectangle, QueryResolution, SpatioTemporalExtent};

/// Whether the computation reported that its output pixel scale saturated
/// the operator's finest/coarsest capability on an axis. A saturated bound
/// widens the cube's scale interval, because requests beyond the bound
/// would produce the same result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSaturation {
    pub x_min: bool,
    pub x_max: bool,
    pub y_min: bool,
    pub y_max: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster {
    pub extent: SpatioTemporalExtent,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub nodata: Option<f64>,
    pub saturation: ScaleSaturation,
    pub data: Vec<u8>,
}

impl Raster {
    pub fn new(
        extent: SpatioTemporalExtent,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        nodata: Option<f64>,
        data: Vec<u8>,
    ) -> CacheResult<Self> {
        if width == 0 || height == 0 || bytes_per_pixel == 0 {
            return Err(CacheError::Argument("empty raster dimensions".into()));
        }
        let expected = width as usize * height as usize * bytes_per_pixel as usize;
        if data.len() != expected {
            return Err(CacheError::Argument(format!(
                "raster data length {} does not match {}x{}x{}",
                data.len(),
                width,
                height,
                bytes_per_pixel
            )));
        }
        Ok(Raster {
            extent,
            width,
            height,
            bytes_per_pixel,
            nodata,
            saturation: ScaleSaturation::default(),
            data,
        })
    }

    /// An all-zero raster covering `extent` at the given dimensions.
    pub fn filled(
        extent: SpatioTemporalExtent,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        nodata: Option<f64>,
    ) -> CacheResult<Self> {
        let data = vec![0u8; width as usize * height as usize * bytes_per_pixel as usize];
        Raster::new(extent, width, height, bytes_per_pixel, nodata, data)
    }

    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64 + std::mem::size_of::<Raster>() as u64
    }

    /// Pixel scale in CRS units per pixel.
    pub fn x_scale(&self) -> f64 {
        (self.extent.x2 - self.extent.x1) / self.width as f64
    }

    pub fn y_scale(&self) -> f64 {
        (self.extent.y2 - self.extent.y1) / self.height as f64
    }

    /// The cache cube for this raster, including the saturation-widened
    /// scale interval.
    pub fn cube(&self) -> CacheResult<CacheCube> {
        let mut cube = CacheCube::for_raster(&self.extent, self.width, self.height)?;
        if let Some(scale) = cube.scale.as_mut() {
            if self.saturation.x_min {
                scale.x.a = 0.0;
            }
            if self.saturation.x_max {
                scale.x.b = f64::INFINITY;
            }
            if self.saturation.y_min {
                scale.y.a = 0.0;
            }
            if self.saturation.y_max {
                scale.y.b = f64::INFINITY;
            }
        }
        Ok(cube)
    }

    fn pixel(&self, col: u32, row: u32) -> &[u8] {
        let bpp = self.bytes_per_pixel as usize;
        let off = (row as usize * self.width as usize + col as usize) * bpp;
        &self.data[off..off + bpp]
    }

    fn pixel_mut(&mut self, col: u32, row: u32) -> &mut [u8] {
        let bpp = self.bytes_per_pixel as usize;
        let off = (row as usize * self.width as usize + col as usize) * bpp;
        &mut self.data[off..off + bpp]
    }

    /// Maps a coordinate to the source pixel whose cell contains it.
    fn col_of(&self, x: f64) -> Option<u32> {
        let col = ((x - self.extent.x1) / self.x_scale()).floor();
        (col >= 0.0 && col < self.width as f64).then_some(col as u32)
    }

    fn row_of(&self, y: f64) -> Option<u32> {
        let row = ((self.extent.y2 - y) / self.y_scale()).floor();
        (row >= 0.0 && row < self.height as f64).then_some(row as u32)
    }

    /// Cuts the window addressed by `query` out of this raster, sized to
    /// the query's resolution. Pixels are taken nearest-neighbor; output
    /// cells whose center falls outside this raster stay zero.
    pub fn cut(&self, query: &QueryRectangle) -> CacheResult<Raster> {
        let QueryResolution::Pixels { xres, yres } = query.resolution else {
            return Err(CacheError::Argument(
                "raster query without pixel resolution".into(),
            ));
        };
        let mut out = Raster::filled(
            SpatioTemporalExtent::from(query),
            xres,
            yres,
            self.bytes_per_pixel,
            self.nodata,
        )?;
        out.blit(self)?;
        Ok(out)
    }

    /// Copies the overlapping region of `src` into this raster. For every
    /// target cell whose center lies inside `src`, the nearest source
    /// pixel wins; previously written pixels are overwritten, so callers
    /// blit inputs in ascending priority order.
    pub fn blit(&mut self, src: &Raster) -> CacheResult<()> {
        if src.bytes_per_pixel != self.bytes_per_pixel {
            return Err(CacheError::Argument(format!(
                "pixel format mismatch: {} vs {} bytes per pixel",
                src.bytes_per_pixel, self.bytes_per_pixel
            )));
        }
        let x_scale = self.x_scale();
        let y_scale = self.y_scale();
        for row in 0..self.height {
            let y = self.extent.y2 - (row as f64 + 0.5) * y_scale;
            let Some(src_row) = src.row_of(y) else {
                continue;
            };
            for col in 0..self.width {
                let x = self.extent.x1 + (col as f64 + 0.5) * x_scale;
                let Some(src_col) = src.col_of(x) else {
                    continue;
                };
                let value = src.pixel(src_col, src_row);
                self.pixel_mut(col, row).copy_from_slice(value);
            }
        }
        Ok(())
    }
}
