//! Scene description: where the grid, layers, buildings and masks come from.
//!
//! ```json
//! {
//!   "grid": { "template": "dtm.lcr" },
//!   "layers": {
//!     "terrain": "terrein_vlak.json",
//!     "road": { "path": "wegdeel_vlak.json", "crs": "EPSG:28992" },
//!     "water": "waterdeel_vlak.json"
//!   },
//!   "reference_buildings": { "path": "bag.json", "id_property": "identificatie" },
//!   "highest_mask": "highest.lcr",
//!   "footprint_mask": "footprint.lcr",
//!   "paint": [{ "code": 5, "mask": "park.lcr" }],
//!   "output": "landcover.lcr"
//! }
//! ```
//!
//! Relative paths are resolved against the scene file's directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use landcover::{
    collect_features, BoolMask, Building, Crs, FeaturePage, FeatureSource, FetchError, GeoTransform, GridSpec,
    LayerKind, RawFeature,
};
use log::{debug, warn};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scene {
    pub grid: GridSource,
    #[serde(default)]
    pub layers: Layers,
    #[serde(default)]
    pub reference_buildings: Option<BuildingSource>,
    #[serde(default)]
    pub highest_mask: Option<PathBuf>,
    #[serde(default)]
    pub footprint_mask: Option<PathBuf>,
    #[serde(default)]
    pub paint: Vec<PaintStep>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GridSource {
    /// Shape, transform, CRS and nodata taken from an LCR1 raster.
    Template {
        template: PathBuf,
        /// Required when the template carries no CRS.
        #[serde(default)]
        crs: Option<String>,
    },
    Inline {
        width: usize,
        height: usize,
        transform: [f64; 6],
        crs: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Layers {
    pub terrain: Option<LayerSource>,
    pub road: Option<LayerSource>,
    pub water: Option<LayerSource>,
    pub building: Option<LayerSource>,
}

impl Layers {
    /// Configured sources in precedence order.
    pub fn iter(&self) -> impl Iterator<Item = (LayerKind, &LayerSource)> {
        [
            (LayerKind::Terrain, &self.terrain),
            (LayerKind::Road, &self.road),
            (LayerKind::Water, &self.water),
            (LayerKind::Building, &self.building),
        ]
        .into_iter()
        .filter_map(|(kind, source)| source.as_ref().map(|s| (kind, s)))
    }

    fn each_mut(&mut self) -> impl Iterator<Item = &mut LayerSource> {
        [&mut self.terrain, &mut self.road, &mut self.water, &mut self.building]
            .into_iter()
            .flatten()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LayerSource {
    Path(PathBuf),
    Detailed {
        path: PathBuf,
        #[serde(default)]
        crs: Option<String>,
    },
}

impl LayerSource {
    pub fn path(&self) -> &Path {
        match self {
            LayerSource::Path(path) | LayerSource::Detailed { path, .. } => path,
        }
    }

    /// The layer's own CRS, or `None` to use the grid's.
    pub fn crs(&self) -> Option<Crs> {
        match self {
            LayerSource::Detailed { crs: Some(crs), .. } => Some(Crs::parse(crs)),
            _ => None,
        }
    }

    fn path_mut(&mut self) -> &mut PathBuf {
        match self {
            LayerSource::Path(path) | LayerSource::Detailed { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildingSource {
    pub path: PathBuf,
    #[serde(default = "default_id_property")]
    pub id_property: String,
}

fn default_id_property() -> String {
    "identificatie".to_owned()
}

/// Overwrite every cell where `mask` is set with `code`, after composition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaintStep {
    pub code: i16,
    pub mask: PathBuf,
}

/// A grid together with the nodata value of the raster it came from, if any.
#[derive(Debug, Clone)]
pub struct ResolvedGrid {
    pub spec: GridSpec,
    pub source_nodata: Option<i16>,
}

impl Scene {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading scene {}", path.display()))?;
        let mut scene: Scene =
            serde_json::from_str(&text).with_context(|| format!("parsing scene {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        scene.resolve_paths(base);
        Ok(scene)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        if let GridSource::Template { template, .. } = &mut self.grid {
            join(template);
        }
        for layer in self.layers.each_mut() {
            join(layer.path_mut());
        }
        if let Some(buildings) = &mut self.reference_buildings {
            join(&mut buildings.path);
        }
        self.highest_mask.iter_mut().for_each(join);
        self.footprint_mask.iter_mut().for_each(join);
        for step in &mut self.paint {
            join(&mut step.mask);
        }
        join(&mut self.output);
    }

    pub fn grid(&self) -> Result<ResolvedGrid> {
        let grid = match &self.grid {
            GridSource::Inline {
                width,
                height,
                transform,
                crs,
            } => ResolvedGrid {
                spec: GridSpec::new(*width, *height, GeoTransform::from_coefficients(*transform), Crs::parse(crs)),
                source_nodata: None,
            },
            GridSource::Template { template, crs } => {
                let raster = lcr::read_file(template)
                    .with_context(|| format!("reading grid template {}", template.display()))?;
                let Some(crs) = crs.as_deref().or(raster.crs.as_deref()) else {
                    bail!("grid template {} has no CRS; set `grid.crs`", template.display());
                };
                ResolvedGrid {
                    spec: GridSpec::new(
                        raster.width as usize,
                        raster.height as usize,
                        GeoTransform::from_coefficients(raster.transform),
                        Crs::parse(crs),
                    ),
                    source_nodata: raster.nodata,
                }
            }
        };
        grid.spec.validate().context("invalid grid")?;
        Ok(grid)
    }
}

/// Read an LCR1 raster as a boolean mask: cells above zero that are not nodata.
/// The raster must share the grid's shape and transform, and its CRS when it
/// carries one.
pub fn load_mask(path: &Path, spec: &GridSpec, what: &'static str) -> Result<BoolMask> {
    let raster = lcr::read_file(path).with_context(|| format!("reading {what} {}", path.display()))?;
    let mask = BoolMask::from_raster(raster.width as usize, raster.height as usize, &raster.cells, raster.nodata);
    spec.check_mask(what, &mask)?;
    let crs = raster.crs.as_deref().map(Crs::parse);
    spec.check_georeference(what, &GeoTransform::from_coefficients(raster.transform), crs.as_ref())
        .with_context(|| format!("{what} {}", path.display()))?;
    debug!("{what}: {} of {} cells set", mask.count(), spec.len());
    Ok(mask)
}

/// GeoJSON page files. The first page is `first`; a `next` link is a path
/// relative to the directory of `first`.
#[derive(Debug, Clone)]
pub struct GeoJsonFiles {
    first: PathBuf,
}

impl GeoJsonFiles {
    pub fn new(first: impl Into<PathBuf>) -> Self {
        Self { first: first.into() }
    }

    fn page_path(&self, token: Option<&str>) -> PathBuf {
        match token {
            None => self.first.clone(),
            Some(t) => self.first.parent().unwrap_or_else(|| Path::new(".")).join(t),
        }
    }
}

impl FeatureSource for GeoJsonFiles {
    fn fetch(&mut self, token: Option<&str>) -> Result<FeaturePage, FetchError> {
        let path = self.page_path(token);
        debug!("reading feature page {}", path.display());

        let io_err = |source: io::Error| FetchError::Io {
            token: token.map(str::to_owned),
            source,
        };
        let bytes = fs::read(&path).map_err(io_err)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed {
            token: token.map(str::to_owned),
            reason: format!("{}: {e}", path.display()),
        })?;
        FeaturePage::from_geojson(value, token)
    }
}

/// All features behind a layer source, every page included.
pub fn load_features(path: &Path) -> Result<Vec<RawFeature>> {
    collect_features(&mut GeoJsonFiles::new(path)).with_context(|| format!("loading features from {}", path.display()))
}

/// Reference buildings: polygonal features keyed by `id_property`. Features
/// without an id are skipped.
pub fn load_buildings(source: &BuildingSource) -> Result<Vec<Building>> {
    let features = load_features(&source.path)?;
    let total = features.len();

    let buildings: Vec<Building> = features
        .into_iter()
        .filter_map(|feature| {
            let id = match feature.properties.get(&source.id_property)? {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            match feature.geometry? {
                geo::Geometry::Polygon(p) => Some(Building::from_polygon(p, id)),
                geo::Geometry::MultiPolygon(mp) => Some(Building::new(mp, id)),
                _ => None,
            }
        })
        .collect();

    if buildings.len() < total {
        warn!(
            "{}: skipped {} building features without polygon geometry or `{}`",
            source.path.display(),
            total - buildings.len(),
            source.id_property
        );
    }
    Ok(buildings)
}
