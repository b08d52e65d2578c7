use std::fmt;

use geo::{MultiPolygon, Polygon};

use crate::codes::{Classification, LandCoverCode};
use crate::grid::Crs;

/// Layer categories in ascending precedence: a later kind overwrites an
/// earlier one wherever both cover a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerKind {
    Terrain,
    Road,
    Water,
    Building,
}

impl LayerKind {
    pub const ORDER: [LayerKind; 4] = [
        LayerKind::Terrain,
        LayerKind::Road,
        LayerKind::Water,
        LayerKind::Building,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LayerKind::Terrain => "terrain",
            LayerKind::Road => "road",
            LayerKind::Water => "water",
            LayerKind::Building => "building",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorFeature {
    pub geometry: MultiPolygon<f64>,
    pub classification: Classification,
    /// Overrides the layer CRS for this feature only.
    pub crs: Option<Crs>,
}

impl VectorFeature {
    pub fn new(geometry: impl Into<MultiPolygon<f64>>, classification: impl Into<Classification>) -> Self {
        Self {
            geometry: geometry.into(),
            classification: classification.into(),
            crs: None,
        }
    }

    pub fn with_crs(mut self, crs: Crs) -> Self {
        self.crs = Some(crs);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub kind: LayerKind,
    pub crs: Crs,
    pub features: Vec<VectorFeature>,
}

impl Layer {
    pub fn new(kind: LayerKind, crs: Crs, features: Vec<VectorFeature>) -> Self {
        Self { kind, crs, features }
    }

    pub fn empty(kind: LayerKind, crs: Crs) -> Self {
        Self::new(kind, crs, Vec::new())
    }
}

/// A building polygon and the parcel identifier that follows it through
/// export, removal and re-querying.
#[derive(Debug, Clone, PartialEq)]
pub struct Building {
    pub geometry: MultiPolygon<f64>,
    pub parcel_id: String,
}

impl Building {
    pub fn new(geometry: impl Into<MultiPolygon<f64>>, parcel_id: impl Into<String>) -> Self {
        Self {
            geometry: geometry.into(),
            parcel_id: parcel_id.into(),
        }
    }

    pub fn from_polygon(polygon: Polygon<f64>, parcel_id: impl Into<String>) -> Self {
        Self::new(MultiPolygon::new(vec![polygon]), parcel_id)
    }

    pub fn to_feature(&self) -> VectorFeature {
        VectorFeature::new(self.geometry.clone(), LandCoverCode::Building)
    }
}

/// Building layer for a set of buildings, every feature coded as building.
pub fn building_layer(crs: Crs, buildings: &[Building]) -> Layer {
    Layer::new(
        LayerKind::Building,
        crs,
        buildings.iter().map(Building::to_feature).collect(),
    )
}
