use std::io;

use thiserror::Error;

use crate::grid::Crs;

/// Grid-level precondition failures. These abort the whole call.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("layer `{layer}`{} is in {found}, grid is in {expected}", feature_suffix(.feature))]
    CrsMismatch {
        layer: String,
        /// Set when the mismatch comes from a per-feature CRS override.
        feature: Option<usize>,
        expected: Crs,
        found: Crs,
    },

    #[error("{what} is {}, expected {}", dims(.found), dims(.expected))]
    DimensionMismatch {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("affine transform is not invertible or has non-finite coefficients")]
    DegenerateTransform,

    #[error("grid has zero width or height")]
    EmptyGrid,

    #[error("grid of {width}x{height} cells does not fit in memory")]
    OversizedGrid { width: usize, height: usize },

    #[error("{what} is georeferenced differently from the grid: {reason}")]
    GeoreferenceMismatch { what: &'static str, reason: String },
}

fn feature_suffix(feature: &Option<usize>) -> String {
    feature
        .map(|index| format!(" (feature #{index})"))
        .unwrap_or_default()
}

fn dims(&(width, height): &(usize, usize)) -> String {
    format!("{width}x{height}")
}

/// A single polygon that cannot be rasterized or vectorized. Callers log it
/// and move on to the next feature.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("feature #{0} has an empty exterior ring")]
    EmptyExterior(usize),

    #[error("feature #{0} has non-finite coordinates")]
    NonFinite(usize),
}

#[derive(Debug, Error)]
pub enum CodeTableError {
    #[error("failed to read code table: {0}")]
    Io(#[from] io::Error),

    #[error("code table is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("code table must have exactly the keys `terrain` and `road`, found {0:?}")]
    Keys(Vec<String>),

    #[error("code table entry `{category}.{name}` has invalid code {value}")]
    InvalidCode {
        category: &'static str,
        name: String,
        value: serde_json::Value,
    },
}

/// Raised by feature sources. The core never sees a partially consumed source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch page {token:?}: {source}")]
    Io {
        token: Option<String>,
        #[source]
        source: io::Error,
    },

    #[error("page {token:?} is malformed: {reason}")]
    Malformed {
        token: Option<String>,
        reason: String,
    },
}
