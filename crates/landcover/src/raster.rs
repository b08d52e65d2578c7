//! Polygon to grid coverage.
//!
//! A cell is covered iff its center lies inside a polygon or on its boundary.

use geo::{BoundingRect, CoordsIter, Intersects, MultiPolygon, Polygon};
use log::{debug, warn};

use crate::codes::LandCoverCode;
use crate::error::GeometryError;
use crate::feature::Layer;
use crate::grid::{BoolMask, GridSpec};

/// Per-layer rasterization result: the code each covered cell receives.
#[derive(Debug, Clone, PartialEq)]
pub struct Coverage {
    width: usize,
    height: usize,
    cells: Vec<Option<LandCoverCode>>,
}

impl Coverage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![None; width * height],
        }
    }

    #[inline]
    pub fn cells(&self) -> &[Option<LandCoverCode>] {
        &self.cells
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> Option<LandCoverCode> {
        if col >= self.width || row >= self.height {
            return None;
        }
        self.cells[row * self.width + col]
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }

    pub fn to_mask(&self) -> BoolMask {
        BoolMask::from_cells(
            self.width,
            self.height,
            self.cells.iter().map(Option::is_some).collect(),
        )
    }

    /// Write every covered cell of `self` into `target`, overwriting.
    pub(crate) fn apply_to(&self, target: &mut [i16]) {
        for (cell, code) in target.iter_mut().zip(&self.cells) {
            if let Some(code) = code {
                *cell = code.value();
            }
        }
    }
}

/// Outcome of rasterizing one layer. Features that could not be rasterized
/// are listed in `skipped`; they never abort the layer.
#[derive(Debug)]
pub struct LayerRaster {
    pub coverage: Coverage,
    pub skipped: Vec<GeometryError>,
}

/// Rasterize a layer's features in list order. Where features overlap, the
/// later one wins. Unclassified features are ignored.
pub fn rasterize_layer(spec: &GridSpec, layer: &Layer) -> LayerRaster {
    let mut coverage = Coverage::new(spec.width, spec.height);
    let mut skipped = Vec::new();

    for (index, feature) in layer.features.iter().enumerate() {
        let Some(code) = feature.classification.code() else {
            debug!("{} feature #{index} has no classification; skipped", layer.kind);
            continue;
        };

        let result = for_each_covered_cell(spec, &feature.geometry, index, |i| {
            coverage.cells[i] = Some(code);
        });

        if let Err(err) = result {
            warn!("{} layer: {err}; skipped", layer.kind);
            skipped.push(err);
        }
    }

    LayerRaster { coverage, skipped }
}

/// Boolean coverage of a set of geometries, the union of their footprints.
/// Malformed geometries are skipped with a warning.
pub fn geometry_mask(spec: &GridSpec, geometries: &[MultiPolygon<f64>]) -> BoolMask {
    let mut mask = BoolMask::new(spec.width, spec.height);
    for (index, geometry) in geometries.iter().enumerate() {
        let result = for_each_covered_cell(spec, geometry, index, |i| {
            mask.set(i % spec.width, i / spec.width, true);
        });
        if let Err(err) = result {
            warn!("geometry mask: {err}; skipped");
        }
    }
    mask
}

/// Call `visit` with the row-major index of every cell covered by `geometry`.
pub(crate) fn for_each_covered_cell(
    spec: &GridSpec,
    geometry: &MultiPolygon<f64>,
    index: usize,
    mut visit: impl FnMut(usize),
) -> Result<(), GeometryError> {
    check_geometry(geometry, index)?;

    for polygon in &geometry.0 {
        scan_polygon(spec, polygon, &mut visit);
    }
    Ok(())
}

fn check_geometry(geometry: &MultiPolygon<f64>, index: usize) -> Result<(), GeometryError> {
    if geometry.0.is_empty() || geometry.0.iter().any(|p| p.exterior().0.is_empty()) {
        return Err(GeometryError::EmptyExterior(index));
    }
    if geometry.coords_iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(GeometryError::NonFinite(index));
    }
    Ok(())
}

fn scan_polygon(spec: &GridSpec, polygon: &Polygon<f64>, visit: &mut impl FnMut(usize)) {
    let Some(rect) = polygon.bounding_rect() else {
        return;
    };
    let Some((col_min, row_min, col_max, row_max)) = spec.transform.pixel_bounds(rect) else {
        return;
    };

    // ------- Candidate window: cells whose center may fall inside the bbox ---
    let w = spec.width as i64;
    let h = spec.height as i64;
    let c0 = ((col_min - 0.5).floor() as i64).max(0);
    let c1 = ((col_max - 0.5).ceil() as i64).min(w - 1);
    let r0 = ((row_min - 0.5).floor() as i64).max(0);
    let r1 = ((row_max - 0.5).ceil() as i64).min(h - 1);
    if c0 > c1 || r0 > r1 {
        return;
    }

    // ------- Inclusive point-in-polygon test at each cell center -------------
    for row in r0 as usize..=r1 as usize {
        for col in c0 as usize..=c1 as usize {
            let center = spec.transform.cell_center(col, row);
            if polygon.intersects(&center) {
                visit(row * spec.width + col);
            }
        }
    }
}
