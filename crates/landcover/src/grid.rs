use std::fmt;

use geo::{coord, Coord, Rect};

use crate::codes::LandCoverCode;
use crate::error::ValidationError;

/// Coordinate reference identifier.
///
/// The EPSG spellings `EPSG:28992`, `urn:ogc:def:crs:EPSG::28992` and
/// `http://www.opengis.net/def/crs/EPSG/0/28992` all parse to `Epsg(28992)`
/// and compare equal. Anything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Crs {
    Epsg(u32),
    Other(String),
}

impl Crs {
    pub fn parse(identifier: &str) -> Self {
        let trimmed = identifier.trim();
        let upper = trimmed.to_ascii_uppercase();

        let code = if let Some(rest) = upper.strip_prefix("EPSG:") {
            Some(rest)
        } else if let Some(rest) = upper.strip_prefix("URN:OGC:DEF:CRS:EPSG:") {
            // Optional version between the two colons: `EPSG::n` or `EPSG:9.9:n`.
            rest.rsplit(':').next()
        } else if upper.starts_with("HTTP") && upper.contains("/EPSG/") {
            upper.rsplit('/').next()
        } else {
            None
        };

        match code.and_then(|c| c.parse::<u32>().ok()) {
            Some(epsg) => Crs::Epsg(epsg),
            None => Crs::Other(trimmed.to_owned()),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Epsg(code) => write!(f, "EPSG:{code}"),
            Crs::Other(name) => f.write_str(name),
        }
    }
}

/// Six-coefficient affine pixel-to-world transform.
///
/// `x = a·col + b·row + c`, `y = d·col + e·row + f`, with `(col, row)` the
/// pixel corner coordinates (the top-left corner of cell `(0, 0)` is `(0, 0)`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels of `resolution` and the top-left
    /// corner at `(origin_x, origin_y)`.
    pub fn north_up(origin_x: f64, origin_y: f64, resolution: f64) -> Self {
        Self {
            a: resolution,
            b: 0.0,
            c: origin_x,
            d: 0.0,
            e: -resolution,
            f: origin_y,
        }
    }

    pub fn from_coefficients([a, b, c, d, e, f]: [f64; 6]) -> Self {
        Self { a, b, c, d, e, f }
    }

    pub fn coefficients(&self) -> [f64; 6] {
        [self.a, self.b, self.c, self.d, self.e, self.f]
    }

    #[inline]
    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let finite = self.coefficients().iter().all(|v| v.is_finite());
        let det = self.determinant();
        if !finite || !det.is_finite() || det.abs() < f64::EPSILON * 1e-3 {
            return Err(ValidationError::DegenerateTransform);
        }
        Ok(())
    }

    /// Pixel resolution along x and y (always positive).
    pub fn resolution(&self) -> (f64, f64) {
        (self.a.hypot(self.d), self.b.hypot(self.e))
    }

    /// Map a pixel-space coordinate to world space.
    #[inline]
    pub fn apply(&self, col: f64, row: f64) -> Coord<f64> {
        coord! {
            x: self.a * col + self.b * row + self.c,
            y: self.d * col + self.e * row + self.f,
        }
    }

    /// World coordinate of the center of cell `(col, row)`.
    #[inline]
    pub fn cell_center(&self, col: usize, row: usize) -> Coord<f64> {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Map a world coordinate back to pixel space. `None` for a degenerate
    /// transform.
    pub fn invert(&self, world: Coord<f64>) -> Option<(f64, f64)> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = world.x - self.c;
        let dy = world.y - self.f;
        let col = (self.e * dx - self.b * dy) / det;
        let row = (-self.d * dx + self.a * dy) / det;
        Some((col, row))
    }

    /// Pixel-space bounds `(col_min, row_min, col_max, row_max)` of a world
    /// rectangle. All four corners are mapped so rotated transforms work.
    pub fn pixel_bounds(&self, rect: Rect<f64>) -> Option<(f64, f64, f64, f64)> {
        let (min, max) = (rect.min(), rect.max());
        let corners = [
            coord! { x: min.x, y: min.y },
            coord! { x: max.x, y: min.y },
            coord! { x: max.x, y: max.y },
            coord! { x: min.x, y: max.y },
        ];

        let mut bounds = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for corner in corners {
            let (col, row) = self.invert(corner)?;
            bounds.0 = bounds.0.min(col);
            bounds.1 = bounds.1.min(row);
            bounds.2 = bounds.2.max(col);
            bounds.3 = bounds.3.max(row);
        }
        Some(bounds)
    }
}

/// Shape and georeferencing shared by every raster of one composition.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: Crs,
}

impl GridSpec {
    pub fn new(width: usize, height: usize, transform: GeoTransform, crs: Crs) -> Self {
        Self {
            width,
            height,
            transform,
            crs,
        }
    }

    /// Cell count. Saturates for shapes that `validate` rejects.
    #[inline]
    pub fn len(&self) -> usize {
        self.width.saturating_mul(self.height)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.width == 0 || self.height == 0 {
            return Err(ValidationError::EmptyGrid);
        }
        let max_cells = isize::MAX as usize / std::mem::size_of::<i16>();
        if !matches!(self.width.checked_mul(self.height), Some(n) if n <= max_cells) {
            return Err(ValidationError::OversizedGrid {
                width: self.width,
                height: self.height,
            });
        }
        self.transform.validate()
    }

    /// Fails with `GeoreferenceMismatch` unless a raster placed by
    /// `transform` (and `crs`, when it names one) lands exactly on this grid.
    pub fn check_georeference(
        &self,
        what: &'static str,
        transform: &GeoTransform,
        crs: Option<&Crs>,
    ) -> Result<(), ValidationError> {
        if transform != &self.transform {
            return Err(ValidationError::GeoreferenceMismatch {
                what,
                reason: format!(
                    "transform {:?}, grid has {:?}",
                    transform.coefficients(),
                    self.transform.coefficients()
                ),
            });
        }
        match crs {
            Some(crs) if crs != &self.crs => Err(ValidationError::GeoreferenceMismatch {
                what,
                reason: format!("CRS {crs}, grid is in {}", self.crs),
            }),
            _ => Ok(()),
        }
    }

    /// Fails with `DimensionMismatch` unless `mask` matches this grid's shape.
    pub fn check_mask(&self, what: &'static str, mask: &BoolMask) -> Result<(), ValidationError> {
        if (mask.width, mask.height) != (self.width, self.height) {
            return Err(ValidationError::DimensionMismatch {
                what,
                expected: (self.width, self.height),
                found: (mask.width, mask.height),
            });
        }
        Ok(())
    }
}

/// A finished or intermediate land-cover raster. Cells are row-major.
///
/// Every mutating operation returns a new grid, so snapshots taken along the
/// way stay valid.
#[derive(Debug, Clone, PartialEq)]
pub struct LandCoverGrid {
    spec: GridSpec,
    cells: Vec<i16>,
}

impl LandCoverGrid {
    /// A grid with every cell set to NODATA.
    pub fn nodata(spec: GridSpec) -> Self {
        let cells = vec![LandCoverCode::NODATA; spec.len()];
        Self { spec, cells }
    }

    /// Wrap externally produced cells. Values outside the code enumeration
    /// are rejected by [`LandCoverGrid::validate_codes`], not here.
    pub fn from_cells(spec: GridSpec, cells: Vec<i16>) -> Result<Self, ValidationError> {
        if cells.len() != spec.len() {
            return Err(ValidationError::DimensionMismatch {
                what: "cell buffer",
                expected: (spec.width, spec.height),
                found: (cells.len(), 1),
            });
        }
        Ok(Self { spec, cells })
    }

    #[inline]
    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    #[inline]
    pub fn cells(&self) -> &[i16] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<i16> {
        self.cells
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> Option<i16> {
        if col >= self.spec.width || row >= self.spec.height {
            return None;
        }
        Some(self.cells[row * self.spec.width + col])
    }

    /// Decoded code at `(col, row)`; `None` out of bounds or for an invalid value.
    pub fn code(&self, col: usize, row: usize) -> Option<LandCoverCode> {
        self.get(col, row).and_then(LandCoverCode::from_value)
    }

    /// Index of the first cell whose value is not a land-cover code.
    pub fn validate_codes(&self) -> Option<usize> {
        self.cells
            .iter()
            .position(|&value| LandCoverCode::from_value(value).is_none())
    }

    /// Copy of this grid with `code` written into every cell where `mask` is set.
    pub fn paint(&self, code: LandCoverCode, mask: &BoolMask) -> Result<Self, ValidationError> {
        self.spec.check_mask("paint mask", mask)?;

        let mut out = self.clone();
        let value = code.value();
        for (cell, &covered) in out.cells.iter_mut().zip(mask.cells()) {
            if covered {
                *cell = value;
            }
        }
        Ok(out)
    }

    /// Copy of this grid with NODATA cells rewritten to `nodata`, for export
    /// to rasters that use a different sentinel.
    pub fn with_nodata(&self, nodata: i16) -> Vec<i16> {
        self.cells
            .iter()
            .map(|&v| if v == LandCoverCode::NODATA { nodata } else { v })
            .collect()
    }

    /// Cell counts per code, in code order. Codes with no cells are omitted.
    pub fn class_histogram(&self) -> Vec<(LandCoverCode, usize)> {
        let mut counts = [0usize; LandCoverCode::ALL.len()];
        for &value in &self.cells {
            if let Some(code) = LandCoverCode::from_value(value) {
                counts[code.ordinal()] += 1;
            }
        }
        LandCoverCode::ALL
            .iter()
            .zip(counts)
            .filter(|(_, count)| *count > 0)
            .map(|(code, count)| (*code, count))
            .collect()
    }

    /// Cells where this grid holds `code`.
    pub fn mask_of(&self, code: LandCoverCode) -> BoolMask {
        let value = code.value();
        BoolMask::from_cells(
            self.spec.width,
            self.spec.height,
            self.cells.iter().map(|&v| v == value).collect(),
        )
    }

    pub(crate) fn cells_mut(&mut self) -> &mut [i16] {
        &mut self.cells
    }
}

/// Row-major boolean raster, e.g. a thresholded height signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoolMask {
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl BoolMask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![false; width * height],
        }
    }

    /// # Panics
    ///
    /// When `cells.len() != width * height`.
    pub fn from_cells(width: usize, height: usize, cells: Vec<bool>) -> Self {
        assert_eq!(cells.len(), width * height, "mask buffer size");
        Self {
            width,
            height,
            cells,
        }
    }

    /// Threshold a raw raster: a cell is set iff its value is positive and not
    /// the raster's nodata sentinel.
    pub fn from_raster(width: usize, height: usize, values: &[i16], nodata: Option<i16>) -> Self {
        let cells = values
            .iter()
            .map(|&v| v > 0 && Some(v) != nodata)
            .collect();
        Self::from_cells(width, height, cells)
    }

    /// Parse rows of `#` (set) and `.` (clear). Handy for building small
    /// masks by hand.
    pub fn from_ascii(rows: &[&str]) -> Self {
        let height = rows.len();
        let width = rows.first().map_or(0, |r| r.chars().count());
        let mut mask = Self::new(width, height);
        for (row, line) in rows.iter().enumerate() {
            for (col, ch) in line.chars().enumerate().take(width) {
                if ch == '#' {
                    mask.set(col, row, true);
                }
            }
        }
        mask
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn cells(&self) -> &[bool] {
        &self.cells
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> bool {
        col < self.width && row < self.height && self.cells[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, col: usize, row: usize, value: bool) {
        if col < self.width && row < self.height {
            self.cells[row * self.width + col] = value;
        }
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }
}
