//! Land-cover grids from classified vector layers, and building blobs from
//! height masks.
//!
//! Layers are rasterized by cell center onto a shared [`GridSpec`] and
//! overwrite each other in the fixed order terrain < road < water < building.
//! Building masks are labelled into 4-connected regions, traced into
//! polygons, and footprint blobs take the identifier of the highest blob they
//! intersect.
//!
//! ```no_run
//! use landcover::{compose, GeoTransform, GridSpec, Crs, Layer, LayerKind};
//!
//! let spec = GridSpec::new(10, 10, GeoTransform::north_up(0.0, 10.0, 1.0), Crs::Epsg(28992));
//! let composition = compose(&spec, &[Layer::empty(LayerKind::Terrain, spec.crs.clone())]).unwrap();
//! assert_eq!(composition.grid().cells().len(), 100);
//! ```

pub mod buildings;
pub mod codes;
pub mod compose;
pub mod config;
pub mod error;
pub mod extract;
pub mod feature;
pub mod grid;
pub mod ingest;
pub mod matcher;
pub mod raster;

pub use buildings::BuildingRegistry;
pub use codes::{Classification, CodeTable, LandCoverCode};
pub use compose::{apply_layer, compose, Composition};
pub use config::LandCoverConfig;
pub use error::{CodeTableError, FetchError, GeometryError, ValidationError};
pub use extract::{extract, identify, trace_blobs, BlobIdGenerator, BlobSource, BuildingBlob, IdScheme};
pub use feature::{building_layer, Building, Layer, LayerKind, VectorFeature};
pub use grid::{BoolMask, Crs, GeoTransform, GridSpec, LandCoverGrid};
pub use ingest::{collect_features, Classifier, FeaturePage, FeatureSource, Pages, RawFeature, WATER_LINE_BUFFER};
pub use matcher::{match_buildings, MatchedBuilding};
pub use raster::{geometry_mask, rasterize_layer, Coverage};
