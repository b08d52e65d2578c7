//! Raw features, their classification into layers, and paged sources.
//!
//! Pages are GeoJSON `FeatureCollection`s. A page continues when it carries a
//! `links` entry with `rel: "next"`; the entry's `href` is the token handed
//! back to the source.

use std::collections::HashSet;

use geo::{Buffer, Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::codes::{Classification, CodeTable, LandCoverCode};
use crate::error::FetchError;
use crate::feature::{Layer, LayerKind, VectorFeature};
use crate::grid::Crs;

const LAND_USE: &str = "typelandgebruik";
const SURFACE: &str = "verhardingstype";
const HEIGHT_LEVEL: &str = "hoogteniveau";
const HARDENED: &str = "verhard";

/// Buffer distance, in CRS units, that turns water center lines into areas.
pub const WATER_LINE_BUFFER: f64 = 0.75;

#[derive(Debug, Clone, PartialEq)]
pub struct RawFeature {
    /// `None` for GeoJSON `null` geometries.
    pub geometry: Option<Geometry<f64>>,
    pub properties: Map<String, Value>,
    pub crs: Option<Crs>,
}

impl RawFeature {
    pub fn new(geometry: impl Into<Geometry<f64>>, properties: Map<String, Value>) -> Self {
        Self {
            geometry: Some(geometry.into()),
            properties,
            crs: None,
        }
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    fn below_ground(&self) -> bool {
        match self.properties.get(HEIGHT_LEVEL) {
            Some(Value::Number(n)) => n.as_f64() == Some(-1.0),
            Some(Value::String(s)) => s.trim() == "-1",
            _ => false,
        }
    }
}

/// Turns raw attribute records into classified layer features.
#[derive(Debug, Clone)]
pub struct Classifier {
    table: CodeTable,
    hardened_road: LandCoverCode,
    water_line_buffer: f64,
}

impl Classifier {
    pub fn new(table: CodeTable, hardened_road: LandCoverCode) -> Self {
        Self {
            table,
            hardened_road,
            water_line_buffer: WATER_LINE_BUFFER,
        }
    }

    /// Distance by which water lines are buffered. Zero or less drops them.
    pub fn with_water_line_buffer(mut self, distance: f64) -> Self {
        self.water_line_buffer = distance;
        self
    }

    pub fn table(&self) -> &CodeTable {
        &self.table
    }

    pub fn classification(&self, kind: LayerKind, feature: &RawFeature) -> Classification {
        match kind {
            LayerKind::Terrain => self.table.terrain(feature.property_str(LAND_USE).unwrap_or_default()),
            LayerKind::Road => {
                let surface = feature.property_str(SURFACE).unwrap_or_default();
                if surface.eq_ignore_ascii_case(HARDENED) {
                    self.hardened_road.into()
                } else {
                    self.table.road(surface)
                }
            }
            LayerKind::Water => LandCoverCode::Water.into(),
            LayerKind::Building => LandCoverCode::Building.into(),
        }
    }

    /// `None` when the feature does not belong in a `kind` layer: it has no
    /// areal geometry, or it is water below ground level. Water lines are
    /// buffered into areas.
    pub fn classify(&self, kind: LayerKind, feature: &RawFeature) -> Option<VectorFeature> {
        if kind == LayerKind::Water && feature.below_ground() {
            return None;
        }
        let geometry = self.areal(kind, feature.geometry.as_ref()?)?;
        let mut out = VectorFeature::new(geometry, self.classification(kind, feature));
        out.crs = feature.crs.clone();
        Some(out)
    }

    pub fn layer(&self, kind: LayerKind, crs: Crs, features: &[RawFeature]) -> Layer {
        let classified: Vec<VectorFeature> = features
            .iter()
            .filter_map(|f| self.classify(kind, f))
            .collect();
        let dropped = features.len() - classified.len();
        if dropped > 0 {
            debug!("{kind}: dropped {dropped} of {} features", features.len());
        }
        Layer::new(kind, crs, classified)
    }

    fn areal(&self, kind: LayerKind, geometry: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
        let area = match geometry {
            Geometry::Polygon(p) => MultiPolygon::new(vec![p.clone()]),
            Geometry::MultiPolygon(mp) => mp.clone(),
            Geometry::LineString(line) if kind == LayerKind::Water && self.water_line_buffer > 0.0 => {
                line.buffer(self.water_line_buffer)
            }
            Geometry::MultiLineString(lines) if kind == LayerKind::Water && self.water_line_buffer > 0.0 => {
                lines.buffer(self.water_line_buffer)
            }
            _ => {
                debug!("{kind}: dropping geometry without area");
                return None;
            }
        };
        (!area.0.is_empty()).then_some(area)
    }
}

// ------- Pages ----------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeaturePage {
    pub features: Vec<RawFeature>,
    /// Continuation token; `None` ends the sequence.
    pub next: Option<String>,
}

impl FeaturePage {
    /// Parse a GeoJSON `FeatureCollection`. `token` names the page in errors.
    pub fn from_geojson(value: Value, token: Option<&str>) -> Result<Self, FetchError> {
        let malformed = |reason: String| FetchError::Malformed {
            token: token.map(str::to_owned),
            reason,
        };

        let page: CollectionDoc = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
        let page_crs = page.crs.and_then(NamedCrs::into_crs);

        let features = page
            .features
            .into_iter()
            .enumerate()
            .map(|(i, f)| {
                let doc: FeatureDoc = serde_json::from_value(f).map_err(|e| malformed(format!("feature #{i}: {e}")))?;
                Ok(doc.into_raw(page_crs.as_ref()))
            })
            .collect::<Result<Vec<_>, FetchError>>()?;

        let next = page
            .links
            .into_iter()
            .find(|link| link.rel.as_deref() == Some("next"))
            .and_then(|link| link.href);

        Ok(Self { features, next })
    }
}

/// A paged supplier of raw features.
pub trait FeatureSource {
    /// Fetch the page named by `token`; `None` is the first page.
    fn fetch(&mut self, token: Option<&str>) -> Result<FeaturePage, FetchError>;

    /// Page sequence starting from the first page. Each call starts over.
    fn pages(&mut self) -> Pages<'_, Self>
    where
        Self: Sized,
    {
        Pages::new(self)
    }
}

/// Lazy page sequence. Ends after a page without a continuation token, or
/// after the first error.
pub struct Pages<'a, S: ?Sized> {
    source: &'a mut S,
    state: PageState,
    seen: HashSet<String>,
}

enum PageState {
    Pending(Option<String>),
    Done,
}

impl<'a, S: FeatureSource + ?Sized> Pages<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        Self {
            source,
            state: PageState::Pending(None),
            seen: HashSet::new(),
        }
    }
}

impl<S: FeatureSource + ?Sized> Iterator for Pages<'_, S> {
    type Item = Result<FeaturePage, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        let PageState::Pending(token) = std::mem::replace(&mut self.state, PageState::Done) else {
            return None;
        };

        let page = match self.source.fetch(token.as_deref()) {
            Ok(page) => page,
            Err(err) => return Some(Err(err)),
        };

        if let Some(next) = &page.next {
            if !self.seen.insert(next.clone()) {
                return Some(Err(FetchError::Malformed {
                    token,
                    reason: format!("continuation `{next}` was already fetched"),
                }));
            }
            self.state = PageState::Pending(Some(next.clone()));
        }
        Some(Ok(page))
    }
}

/// Every feature of every page, or the first error.
pub fn collect_features<S: FeatureSource + ?Sized>(source: &mut S) -> Result<Vec<RawFeature>, FetchError> {
    let mut features = Vec::new();
    let mut pages = 0usize;
    for page in Pages::new(source) {
        features.extend(page?.features);
        pages += 1;
    }
    info!("collected {} features from {pages} pages", features.len());
    Ok(features)
}

// ------- GeoJSON documents -----------------------------------------------------

#[derive(Debug, Deserialize)]
enum CollectionTag {
    FeatureCollection,
}

#[derive(Debug, Deserialize)]
enum FeatureTag {
    Feature,
}

/// Features stay raw so a decoding error can name the offending feature.
#[derive(Debug, Deserialize)]
struct CollectionDoc {
    #[serde(rename = "type")]
    _kind: CollectionTag,
    features: Vec<Value>,
    #[serde(default)]
    crs: Option<NamedCrs>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: Option<String>,
    href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCrs {
    properties: CrsProperties,
}

#[derive(Debug, Deserialize)]
struct CrsProperties {
    name: Option<String>,
}

impl NamedCrs {
    fn into_crs(self) -> Option<Crs> {
        self.properties.name.as_deref().map(Crs::parse)
    }
}

#[derive(Debug, Deserialize)]
struct FeatureDoc {
    #[serde(rename = "type")]
    _kind: FeatureTag,
    #[serde(default)]
    geometry: Option<GeometryDoc>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    crs: Option<NamedCrs>,
}

impl FeatureDoc {
    fn into_raw(self, page_crs: Option<&Crs>) -> RawFeature {
        RawFeature {
            geometry: self.geometry.map(Geometry::from),
            properties: self.properties.unwrap_or_default(),
            crs: self.crs.and_then(NamedCrs::into_crs).or_else(|| page_crs.cloned()),
        }
    }
}

/// A position with at least two ordinates. Further ordinates are ignored.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(try_from = "Vec<f64>")]
struct Position(Coord<f64>);

impl TryFrom<Vec<f64>> for Position {
    type Error = String;

    fn try_from(ordinates: Vec<f64>) -> Result<Self, Self::Error> {
        match *ordinates.as_slice() {
            [x, y, ..] => Ok(Self(Coord { x, y })),
            _ => Err(format!("position needs two ordinates, found {}", ordinates.len())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeometryDoc {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<GeometryDoc> },
}

fn line(positions: Vec<Position>) -> LineString<f64> {
    positions.into_iter().map(|p| p.0).collect()
}

fn polygon(rings: Vec<Vec<Position>>) -> Polygon<f64> {
    let mut rings = rings.into_iter().map(line);
    let exterior = rings.next().unwrap_or_else(|| LineString::new(Vec::new()));
    Polygon::new(exterior, rings.collect())
}

impl From<GeometryDoc> for Geometry<f64> {
    fn from(doc: GeometryDoc) -> Self {
        match doc {
            GeometryDoc::Point { coordinates } => Point::from(coordinates.0).into(),
            GeometryDoc::MultiPoint { coordinates } => {
                MultiPoint::new(coordinates.into_iter().map(|p| Point::from(p.0)).collect()).into()
            }
            GeometryDoc::LineString { coordinates } => line(coordinates).into(),
            GeometryDoc::MultiLineString { coordinates } => {
                MultiLineString::new(coordinates.into_iter().map(line).collect()).into()
            }
            GeometryDoc::Polygon { coordinates } => polygon(coordinates).into(),
            GeometryDoc::MultiPolygon { coordinates } => {
                MultiPolygon::new(coordinates.into_iter().map(polygon).collect()).into()
            }
            GeometryDoc::GeometryCollection { geometries } => {
                Geometry::GeometryCollection(geometries.into_iter().map(Geometry::from).collect())
            }
        }
    }
}

/// Decode a GeoJSON geometry object.
pub fn parse_geometry(value: &Value) -> Result<Geometry<f64>, String> {
    GeometryDoc::deserialize(value)
        .map(Geometry::from)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GeoTransform, GridSpec};
    use crate::raster::rasterize_layer;
    use geo::polygon;
    use serde_json::json;

    fn table() -> CodeTable {
        CodeTable::from_json_str(
            r#"{ "terrain": { "grasland": 5, "akker": 6 },
                 "road": { "onverhard": 3, "halfverhard": 4 } }"#,
        )
        .unwrap()
    }

    fn square() -> Polygon<f64> {
        polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)]
    }

    fn raw(properties: Value) -> RawFeature {
        let Value::Object(map) = properties else {
            panic!("properties must be an object");
        };
        RawFeature::new(square(), map)
    }

    #[test]
    fn terrain_reads_land_use_case_insensitively() {
        let c = Classifier::new(table(), LandCoverCode::Asphalt);
        let f = raw(json!({ "typelandgebruik": "Grasland" }));
        assert_eq!(
            c.classification(LayerKind::Terrain, &f),
            Classification::Classified(LandCoverCode::Grass)
        );
        let unknown = raw(json!({ "typelandgebruik": "bos" }));
        assert_eq!(c.classification(LayerKind::Terrain, &unknown), Classification::Unclassified);
        let missing = raw(json!({}));
        assert_eq!(c.classification(LayerKind::Terrain, &missing), Classification::Unclassified);
    }

    #[test]
    fn hardened_road_uses_configured_code() {
        let c = Classifier::new(table(), LandCoverCode::Paving);
        let hard = raw(json!({ "verhardingstype": "verhard" }));
        let loose = raw(json!({ "verhardingstype": "onverhard" }));
        assert_eq!(c.classification(LayerKind::Road, &hard).code(), Some(LandCoverCode::Paving));
        assert_eq!(c.classification(LayerKind::Road, &loose).code(), Some(LandCoverCode::UnpavedRoad));
    }

    #[test]
    fn water_below_ground_is_dropped() {
        let c = Classifier::new(table(), LandCoverCode::Asphalt);
        let features = vec![
            raw(json!({ "hoogteniveau": 0 })),
            raw(json!({ "hoogteniveau": -1 })),
            raw(json!({ "hoogteniveau": "-1" })),
            raw(json!({})),
        ];
        let layer = c.layer(LayerKind::Water, Crs::Epsg(28992), &features);
        assert_eq!(layer.features.len(), 2);
        assert!(layer
            .features
            .iter()
            .all(|f| f.classification.code() == Some(LandCoverCode::Water)));
    }

    #[test]
    fn geometry_without_area_is_dropped() {
        let c = Classifier::new(table(), LandCoverCode::Asphalt);
        let line = RawFeature::new(
            LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]),
            Map::new(),
        );
        let point = RawFeature::new(Point::new(0.5, 0.5), Map::new());
        let mut empty = raw(json!({}));
        empty.geometry = None;
        assert!(c.classify(LayerKind::Road, &line).is_none());
        assert!(c.classify(LayerKind::Water, &point).is_none());
        assert!(c.clone().with_water_line_buffer(0.0).classify(LayerKind::Water, &line).is_none());
        assert!(c.classify(LayerKind::Building, &empty).is_none());
        assert_eq!(
            c.classify(LayerKind::Building, &raw(json!({}))).unwrap().classification.code(),
            Some(LandCoverCode::Building)
        );
    }

    #[test]
    fn water_lines_cover_the_cells_along_them() {
        let c = Classifier::new(table(), LandCoverCode::Asphalt);
        let mut ditch = RawFeature::new(
            LineString::from(vec![(0.0, 2.5), (5.0, 2.5)]),
            Map::new(),
        );
        let below = {
            let mut f = ditch.clone();
            f.properties.insert(HEIGHT_LEVEL.into(), json!(-1));
            f
        };
        ditch.properties.insert(HEIGHT_LEVEL.into(), json!(0));

        let layer = c.layer(LayerKind::Water, Crs::Epsg(28992), &[ditch, below]);
        assert_eq!(layer.features.len(), 1);

        let spec = GridSpec::new(5, 5, GeoTransform::north_up(0.0, 5.0, 1.0), Crs::Epsg(28992));
        let raster = rasterize_layer(&spec, &layer);
        for row in 0..5 {
            for col in 0..5 {
                let expected = (row == 2).then_some(LandCoverCode::Water);
                assert_eq!(raster.coverage.get(col, row), expected, "cell ({col}, {row})");
            }
        }
    }

    #[test]
    fn parses_feature_collection_with_next_link() {
        let page = json!({
            "type": "FeatureCollection",
            "crs": { "type": "name", "properties": { "name": "urn:ogc:def:crs:EPSG::28992" } },
            "features": [{
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [
                        [[0, 0], [4, 0], [4, 4], [0, 4], [0, 0]],
                        [[1, 1], [2, 1], [2, 2], [1, 2], [1, 1]]
                    ]
                },
                "properties": { "typelandgebruik": "akker" }
            }, {
                "type": "Feature",
                "geometry": null,
                "properties": null
            }],
            "links": [
                { "rel": "self", "href": "p1.json" },
                { "rel": "next", "href": "p2.json" }
            ]
        });

        let page = FeaturePage::from_geojson(page, None).unwrap();
        assert_eq!(page.next.as_deref(), Some("p2.json"));
        assert_eq!(page.features.len(), 2);
        assert_eq!(page.features[0].crs, Some(Crs::Epsg(28992)));
        let Some(Geometry::Polygon(p)) = &page.features[0].geometry else {
            panic!("expected a polygon");
        };
        assert_eq!(p.interiors().len(), 1);
        assert!(page.features[1].geometry.is_none());
        assert_eq!(page.features[0].property_str("typelandgebruik"), Some("akker"));
    }

    #[test]
    fn malformed_page_names_the_feature() {
        let page = json!({
            "type": "FeatureCollection",
            "features": [{ "type": "Feature", "geometry": { "type": "Polygon", "coordinates": [[[0, "a"]]] } }]
        });
        let err = FeaturePage::from_geojson(page, Some("p7")).unwrap_err();
        match err {
            FetchError::Malformed { token, reason } => {
                assert_eq!(token.as_deref(), Some("p7"));
                assert!(reason.starts_with("feature #0"), "{reason}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    /// Serves `pages[i]` for token `i`, failing at `fail_at`.
    struct Scripted {
        pages: usize,
        fail_at: Option<usize>,
        fetches: usize,
    }

    impl FeatureSource for Scripted {
        fn fetch(&mut self, token: Option<&str>) -> Result<FeaturePage, FetchError> {
            self.fetches += 1;
            let index: usize = token.map_or(0, |t| t.parse().unwrap());
            if self.fail_at == Some(index) {
                return Err(FetchError::Io {
                    token: token.map(str::to_owned),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
                });
            }
            let features = vec![RawFeature::new(square(), Map::new()); 2];
            let next = (index + 1 < self.pages).then(|| (index + 1).to_string());
            Ok(FeaturePage { features, next })
        }
    }

    #[test]
    fn pages_follow_continuation_until_absent() {
        let mut source = Scripted {
            pages: 3,
            fail_at: None,
            fetches: 0,
        };
        assert_eq!(source.pages().count(), 3);
        // Restartable: a second pass fetches from the first page again.
        assert_eq!(collect_features(&mut source).unwrap().len(), 6);
        assert_eq!(source.fetches, 6);
    }

    #[test]
    fn collect_is_all_or_error() {
        let mut source = Scripted {
            pages: 3,
            fail_at: Some(2),
            fetches: 0,
        };
        assert!(matches!(collect_features(&mut source), Err(FetchError::Io { .. })));

        let results: Vec<_> = source.pages().collect();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_err());
    }

    struct Looping;

    impl FeatureSource for Looping {
        fn fetch(&mut self, _token: Option<&str>) -> Result<FeaturePage, FetchError> {
            Ok(FeaturePage {
                features: Vec::new(),
                next: Some("again".into()),
            })
        }
    }

    #[test]
    fn repeated_continuation_is_an_error() {
        assert!(matches!(collect_features(&mut Looping), Err(FetchError::Malformed { .. })));
    }
}
