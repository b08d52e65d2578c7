//! Precedence-ordered compositing of feature layers onto one grid.

use std::collections::BTreeMap;

use log::{debug, info};
use rayon::prelude::*;

use crate::error::{GeometryError, ValidationError};
use crate::feature::{building_layer, Building, Layer, LayerKind};
use crate::grid::{BoolMask, GridSpec, LandCoverGrid};
use crate::raster::{rasterize_layer, LayerRaster};

/// Snapshots produced by one [`compose`] call.
#[derive(Debug, Clone)]
pub struct Composition {
    before_buildings: LandCoverGrid,
    grid: LandCoverGrid,
    masks: BTreeMap<LayerKind, BoolMask>,
    skipped: Vec<(LayerKind, GeometryError)>,
}

impl Composition {
    /// The final grid.
    #[inline]
    pub fn grid(&self) -> &LandCoverGrid {
        &self.grid
    }

    pub fn into_grid(self) -> LandCoverGrid {
        self.grid
    }

    /// The grid as it stood after water and before any building layer.
    #[inline]
    pub fn before_buildings(&self) -> &LandCoverGrid {
        &self.before_buildings
    }

    /// Union of the cells covered by every layer of `kind` that was
    /// rasterized. `None` when no such layer had features.
    pub fn mask(&self, kind: LayerKind) -> Option<&BoolMask> {
        self.masks.get(&kind)
    }

    /// Features dropped because their geometry could not be rasterized.
    pub fn skipped(&self) -> &[(LayerKind, GeometryError)] {
        &self.skipped
    }

    /// Rasterize `buildings` over the final grid at building precedence and
    /// return the result as a new grid.
    pub fn overlay_buildings(&self, buildings: &[Building]) -> Result<LandCoverGrid, ValidationError> {
        let spec = self.grid.spec();
        let layer = building_layer(spec.crs.clone(), buildings);
        apply_layer(&self.grid, &layer)
    }
}

/// Composite `layers` onto a fresh NODATA grid shaped like `spec`.
///
/// Layers are applied in [`LayerKind::ORDER`]; layers of the same kind keep
/// their relative order. Coverage for each layer is computed in parallel,
/// then written to the grid one layer at a time.
pub fn compose(spec: &GridSpec, layers: &[Layer]) -> Result<Composition, ValidationError> {
    spec.validate()?;
    for layer in layers {
        check_crs(spec, layer)?;
    }

    let mut ordered: Vec<&Layer> = layers.iter().collect();
    ordered.sort_by_key(|layer| layer.kind);

    let rasters: Vec<Option<LayerRaster>> = ordered
        .par_iter()
        .map(|layer| (!layer.features.is_empty()).then(|| rasterize_layer(spec, layer)))
        .collect();

    let mut grid = LandCoverGrid::nodata(spec.clone());
    let mut before_buildings = None;
    let mut masks: BTreeMap<LayerKind, BoolMask> = BTreeMap::new();
    let mut skipped = Vec::new();

    for (layer, raster) in ordered.iter().zip(rasters) {
        if layer.kind == LayerKind::Building && before_buildings.is_none() {
            before_buildings = Some(grid.clone());
        }

        let Some(raster) = raster else {
            info!("No {} features found. Skipping {} rasterization.", layer.kind, layer.kind);
            continue;
        };

        debug!(
            "Applying {} layer: {} features, {} skipped",
            layer.kind,
            layer.features.len(),
            raster.skipped.len()
        );
        raster.coverage.apply_to(grid.cells_mut());

        let mask = raster.coverage.to_mask();
        masks
            .entry(layer.kind)
            .and_modify(|existing| union_into(existing, &mask))
            .or_insert(mask);
        skipped.extend(raster.skipped.into_iter().map(|err| (layer.kind, err)));
    }

    Ok(Composition {
        before_buildings: before_buildings.unwrap_or_else(|| grid.clone()),
        grid,
        masks,
        skipped,
    })
}

/// Rasterize one layer over an existing grid, returning a new grid.
pub fn apply_layer(grid: &LandCoverGrid, layer: &Layer) -> Result<LandCoverGrid, ValidationError> {
    let spec = grid.spec();
    spec.validate()?;
    check_crs(spec, layer)?;

    if layer.features.is_empty() {
        info!("No {} features found. Skipping {} rasterization.", layer.kind, layer.kind);
        return Ok(grid.clone());
    }

    let raster = rasterize_layer(spec, layer);
    let mut out = grid.clone();
    raster.coverage.apply_to(out.cells_mut());
    Ok(out)
}

fn check_crs(spec: &GridSpec, layer: &Layer) -> Result<(), ValidationError> {
    if layer.crs != spec.crs {
        return Err(ValidationError::CrsMismatch {
            layer: layer.kind.name().to_owned(),
            feature: None,
            expected: spec.crs.clone(),
            found: layer.crs.clone(),
        });
    }

    for (index, feature) in layer.features.iter().enumerate() {
        if let Some(crs) = &feature.crs {
            if *crs != spec.crs {
                return Err(ValidationError::CrsMismatch {
                    layer: layer.kind.name().to_owned(),
                    feature: Some(index),
                    expected: spec.crs.clone(),
                    found: crs.clone(),
                });
            }
        }
    }
    Ok(())
}

fn union_into(target: &mut BoolMask, other: &BoolMask) {
    for row in 0..target.height() {
        for col in 0..target.width() {
            if other.get(col, row) {
                target.set(col, row, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{Classification, LandCoverCode};
    use crate::feature::VectorFeature;
    use crate::grid::{Crs, GeoTransform};
    use geo::{coord, Polygon, Rect};

    const CRS: Crs = Crs::Epsg(28992);

    fn spec() -> GridSpec {
        GridSpec::new(4, 4, GeoTransform::north_up(0.0, 4.0, 1.0), CRS)
    }

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
        Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 }).to_polygon()
    }

    fn layer(kind: LayerKind, features: Vec<(Polygon<f64>, LandCoverCode)>) -> Layer {
        Layer::new(
            kind,
            CRS,
            features
                .into_iter()
                .map(|(p, code)| VectorFeature::new(p, code))
                .collect(),
        )
    }

    fn codes(grid: &LandCoverGrid) -> Vec<i16> {
        grid.cells().to_vec()
    }

    #[test]
    fn single_layer_reproduces_its_coverage() {
        let terrain = layer(LayerKind::Terrain, vec![(rect(0.0, 2.0, 2.0, 4.0), LandCoverCode::Grass)]);
        let out = compose(&spec(), &[terrain]).unwrap();

        #[rustfmt::skip]
        let expected = vec![
            5, 5, -9999, -9999,
            5, 5, -9999, -9999,
            -9999, -9999, -9999, -9999,
            -9999, -9999, -9999, -9999,
        ];
        assert_eq!(codes(out.grid()), expected);
    }

    #[test]
    fn disjoint_polygons_keep_their_codes_in_any_order() {
        let a = (rect(0.0, 0.0, 2.0, 4.0), LandCoverCode::Grass);
        let b = (rect(2.0, 0.0, 4.0, 4.0), LandCoverCode::Farmland);

        let forward = compose(&spec(), &[layer(LayerKind::Terrain, vec![a.clone(), b.clone()])]).unwrap();
        let reverse = compose(&spec(), &[layer(LayerKind::Terrain, vec![b, a])]).unwrap();

        assert_eq!(forward.grid(), reverse.grid());
        assert_eq!(forward.grid().code(0, 0), Some(LandCoverCode::Grass));
        assert_eq!(forward.grid().code(3, 3), Some(LandCoverCode::Farmland));
    }

    #[test]
    fn later_feature_wins_inside_a_layer() {
        let first = (rect(0.0, 0.0, 3.0, 4.0), LandCoverCode::Grass);
        let second = (rect(1.0, 0.0, 4.0, 4.0), LandCoverCode::Farmland);
        let out = compose(&spec(), &[layer(LayerKind::Terrain, vec![first, second])]).unwrap();

        assert_eq!(out.grid().code(0, 0), Some(LandCoverCode::Grass));
        assert_eq!(out.grid().code(1, 0), Some(LandCoverCode::Farmland));
        assert_eq!(out.grid().code(2, 0), Some(LandCoverCode::Farmland));
    }

    #[test]
    fn later_layers_overwrite_regardless_of_input_order() {
        let full = rect(0.0, 0.0, 4.0, 4.0);
        let layers = vec![
            layer(LayerKind::Building, vec![(rect(0.0, 0.0, 1.0, 1.0), LandCoverCode::Building)]),
            layer(LayerKind::Water, vec![(rect(0.0, 0.0, 2.0, 2.0), LandCoverCode::Water)]),
            layer(LayerKind::Road, vec![(rect(0.0, 0.0, 3.0, 3.0), LandCoverCode::Asphalt)]),
            layer(LayerKind::Terrain, vec![(full, LandCoverCode::Grass)]),
        ];
        let out = compose(&spec(), &layers).unwrap();
        let grid = out.grid();

        // Bottom-left corner is (col 0, row 3).
        assert_eq!(grid.code(0, 3), Some(LandCoverCode::Building));
        assert_eq!(grid.code(1, 2), Some(LandCoverCode::Water));
        assert_eq!(grid.code(2, 1), Some(LandCoverCode::Asphalt));
        assert_eq!(grid.code(3, 0), Some(LandCoverCode::Grass));
        assert_eq!(grid.validate_codes(), None);

        let before = out.before_buildings();
        assert_eq!(before.code(0, 3), Some(LandCoverCode::Water));
        assert_eq!(out.mask(LayerKind::Building).unwrap().count(), 1);
        assert_eq!(out.mask(LayerKind::Water).unwrap().count(), 4);
    }

    #[test]
    fn empty_layer_is_a_no_op() {
        let terrain = layer(LayerKind::Terrain, vec![(rect(0.0, 0.0, 4.0, 4.0), LandCoverCode::Grass)]);
        let water = Layer::empty(LayerKind::Water, CRS);
        let out = compose(&spec(), &[terrain.clone(), water]).unwrap();
        let baseline = compose(&spec(), &[terrain]).unwrap();

        assert_eq!(out.grid(), baseline.grid());
        assert!(out.mask(LayerKind::Water).is_none());
        assert_eq!(out.before_buildings(), out.grid());
    }

    #[test]
    fn unclassified_feature_does_not_touch_cells() {
        let terrain = Layer::new(
            LayerKind::Terrain,
            CRS,
            vec![VectorFeature::new(rect(0.0, 0.0, 4.0, 4.0), Classification::Unclassified)],
        );
        let out = compose(&spec(), &[terrain]).unwrap();
        assert!(out.grid().cells().iter().all(|&v| v == LandCoverCode::NODATA));
    }

    #[test]
    fn crs_mismatch_is_fatal_and_names_the_layer() {
        let mut road = layer(LayerKind::Road, vec![(rect(0.0, 0.0, 1.0, 1.0), LandCoverCode::Paving)]);
        road.crs = Crs::Epsg(4326);
        let err = compose(&spec(), &[road]).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::CrsMismatch { ref layer, feature: None, .. } if layer == "road"
        ));

        let mut water = layer(
            LayerKind::Water,
            vec![
                (rect(0.0, 0.0, 1.0, 1.0), LandCoverCode::Water),
                (rect(1.0, 1.0, 2.0, 2.0), LandCoverCode::Water),
            ],
        );
        water.features[1].crs = Some(Crs::parse("EPSG:3857"));
        let err = compose(&spec(), &[water]).unwrap_err();
        assert!(matches!(err, ValidationError::CrsMismatch { feature: Some(1), .. }));
        assert!(err.to_string().contains("feature #1"));
    }

    #[test]
    fn degenerate_grid_is_fatal() {
        let mut bad = spec();
        bad.width = 0;
        assert!(matches!(compose(&bad, &[]), Err(ValidationError::EmptyGrid)));
    }

    #[test]
    fn overlay_buildings_returns_new_grid() {
        let terrain = layer(LayerKind::Terrain, vec![(rect(0.0, 0.0, 4.0, 4.0), LandCoverCode::Grass)]);
        let out = compose(&spec(), &[terrain]).unwrap();

        let overlaid = out
            .overlay_buildings(&[Building::from_polygon(rect(3.0, 3.0, 4.0, 4.0), "b1")])
            .unwrap();
        assert_eq!(overlaid.code(3, 0), Some(LandCoverCode::Building));
        assert_eq!(out.grid().code(3, 0), Some(LandCoverCode::Grass));

        let unchanged = out.overlay_buildings(&[]).unwrap();
        assert_eq!(&unchanged, out.grid());
    }

    #[test]
    fn composition_is_deterministic() {
        let layers = vec![
            layer(
                LayerKind::Terrain,
                vec![
                    (rect(0.0, 0.0, 3.0, 3.0), LandCoverCode::Grass),
                    (rect(1.0, 1.0, 4.0, 4.0), LandCoverCode::BareSoil),
                ],
            ),
            layer(LayerKind::Road, vec![(rect(0.5, 0.5, 2.5, 2.5), LandCoverCode::SemiPavedRoad)]),
        ];
        let first = compose(&spec(), &layers).unwrap();
        for _ in 0..5 {
            assert_eq!(compose(&spec(), &layers).unwrap().grid(), first.grid());
        }
    }

    #[test]
    fn skipped_features_survive_a_cloned_snapshot() {
        let empty = Polygon::new(geo::LineString::new(Vec::new()), Vec::new());
        let terrain = layer(
            LayerKind::Terrain,
            vec![(empty, LandCoverCode::Farmland), (rect(0.0, 0.0, 4.0, 4.0), LandCoverCode::Grass)],
        );
        let out = compose(&spec(), &[terrain]).unwrap();
        let snapshot = out.clone();
        assert_eq!(
            snapshot.skipped(),
            &[(LayerKind::Terrain, GeometryError::EmptyExterior(0))]
        );
        assert_eq!(codes(snapshot.grid()), vec![5; 16]);
    }
}
