//! Building blobs from boolean height masks.
//!
//! A blob is a maximal 4-connected region of set cells. Each region is traced
//! along its cell corners into one polygon (holes included) and mapped to
//! world coordinates through the grid transform.

use std::collections::{HashMap, HashSet};
use std::fmt;

use geo::orient::{Direction, Orient};
use geo::{Area, LineString, Polygon};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ValidationError;
use crate::grid::{BoolMask, GeoTransform};

/// Which raster signal a blob was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobSource {
    Footprint,
    Highest,
}

impl fmt::Display for BlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlobSource::Footprint => "footprint",
            BlobSource::Highest => "highest",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildingBlob {
    pub polygon: Polygon<f64>,
    pub id: String,
    pub source: BlobSource,
}

/// How blob identifiers are generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdScheme {
    /// Run-scoped counter rendered as 8 hex digits. Never collides.
    #[default]
    Sequential,
    /// First 8 hex digits of a v4 UUID (16^8 space). Duplicates within one
    /// generator are redrawn.
    Random,
}

/// Issues blob identifiers for one extraction+match run. Share one generator
/// between the footprint and highest extractions so their ids never collide.
#[derive(Debug, Clone)]
pub struct BlobIdGenerator {
    scheme: IdScheme,
    next: u64,
    issued: HashSet<String>,
}

impl BlobIdGenerator {
    pub fn new(scheme: IdScheme) -> Self {
        Self {
            scheme,
            next: 1,
            issued: HashSet::new(),
        }
    }

    pub fn sequential() -> Self {
        Self::new(IdScheme::Sequential)
    }

    pub fn random() -> Self {
        Self::new(IdScheme::Random)
    }

    pub fn next_id(&mut self) -> String {
        match self.scheme {
            IdScheme::Sequential => {
                let id = format!("{:08x}", self.next);
                self.next += 1;
                id
            }
            IdScheme::Random => loop {
                let mut token = uuid::Uuid::new_v4().simple().to_string();
                token.truncate(8);
                if self.issued.insert(token.clone()) {
                    break token;
                }
            },
        }
    }
}

impl Default for BlobIdGenerator {
    fn default() -> Self {
        Self::new(IdScheme::default())
    }
}

/// Label 4-connected regions of set cells.
///
/// Returns one label per cell (`0` for clear cells) and the number of
/// regions. Labels `1..=n` follow the row-major order of each region's
/// first cell.
pub fn label_components(mask: &BoolMask) -> (Vec<u32>, u32) {
    let (w, h) = (mask.width(), mask.height());
    let cells = mask.cells();
    let mut labels = vec![0u32; cells.len()];
    let mut count = 0u32;
    let mut stack = Vec::new();

    for start in 0..cells.len() {
        if !cells[start] || labels[start] != 0 {
            continue;
        }

        count += 1;
        labels[start] = count;
        stack.push(start);

        while let Some(i) = stack.pop() {
            let (col, row) = (i % w, i / w);
            let mut visit = |j: usize| {
                if cells[j] && labels[j] == 0 {
                    labels[j] = count;
                    stack.push(j);
                }
            };
            if col > 0 {
                visit(i - 1);
            }
            if col + 1 < w {
                visit(i + 1);
            }
            if row > 0 {
                visit(i - w);
            }
            if row + 1 < h {
                visit(i + w);
            }
        }
    }

    (labels, count)
}

/// Vectorize every region of `mask` into a world-space polygon, in label order.
///
/// Pure geometry: no identifiers are assigned, so two masks can be traced
/// concurrently.
pub fn trace_blobs(mask: &BoolMask, transform: &GeoTransform) -> Result<Vec<Polygon<f64>>, ValidationError> {
    transform.validate()?;

    let (labels, count) = label_components(mask);
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut regions: Vec<Vec<usize>> = vec![Vec::new(); count as usize];
    for (i, &label) in labels.iter().enumerate() {
        if label != 0 {
            regions[label as usize - 1].push(i);
        }
    }

    let width = mask.width();
    let polygons: Vec<Option<Polygon<f64>>> = regions
        .par_iter()
        .enumerate()
        .map(|(index, cells)| {
            let rings = trace_region(width, &labels, index as u32 + 1, cells);
            let polygon = rings_to_polygon(rings, transform);
            let area = polygon.as_ref().map_or(f64::NAN, |p| p.unsigned_area());
            if !area.is_finite() || area <= 0.0 {
                warn!("blob #{index} produced a degenerate polygon; skipped");
                return None;
            }
            polygon
        })
        .collect();

    Ok(polygons.into_iter().flatten().collect())
}

/// Extract identified building blobs from `mask`.
pub fn extract(
    mask: &BoolMask,
    transform: &GeoTransform,
    source: BlobSource,
    ids: &mut BlobIdGenerator,
) -> Result<Vec<BuildingBlob>, ValidationError> {
    let polygons = trace_blobs(mask, transform)?;
    debug!("{source} mask: {} blobs from {} set cells", polygons.len(), mask.count());
    Ok(identify(polygons, source, ids))
}

/// Attach fresh identifiers to traced polygons, in order.
pub fn identify(polygons: Vec<Polygon<f64>>, source: BlobSource, ids: &mut BlobIdGenerator) -> Vec<BuildingBlob> {
    polygons
        .into_iter()
        .map(|polygon| BuildingBlob {
            polygon,
            id: ids.next_id(),
            source,
        })
        .collect()
}

type Vertex = (i64, i64);

/// A closed boundary ring in pixel-corner coordinates plus its signed area
/// (positive for the outer boundary, negative for holes).
struct PixelRing {
    vertices: Vec<Vertex>,
    signed_area: i64,
}

/// Trace all boundary rings of one region.
///
/// Every cell side facing a cell outside the region becomes a directed edge,
/// oriented clockwise around its cell in row-down pixel space. At each vertex
/// the successor of an edge is the outgoing edge turning right, else straight,
/// else left. Turning right first hugs the current cell, so cells that only
/// touch diagonally stay apart.
fn trace_region(width: usize, labels: &[u32], label: u32, cells: &[usize]) -> Vec<PixelRing> {
    let inside = |col: i64, row: i64| -> bool {
        if col < 0 || row < 0 || col >= width as i64 {
            return false;
        }
        labels.get(row as usize * width + col as usize) == Some(&label)
    };

    let mut edges: Vec<(Vertex, Vertex)> = Vec::with_capacity(cells.len() * 2);
    for &i in cells {
        let (c, r) = ((i % width) as i64, (i / width) as i64);
        if !inside(c, r - 1) {
            edges.push(((c, r), (c + 1, r)));
        }
        if !inside(c + 1, r) {
            edges.push(((c + 1, r), (c + 1, r + 1)));
        }
        if !inside(c, r + 1) {
            edges.push(((c + 1, r + 1), (c, r + 1)));
        }
        if !inside(c - 1, r) {
            edges.push(((c, r + 1), (c, r)));
        }
    }

    let mut outgoing: HashMap<Vertex, SmallVec<[usize; 2]>> = HashMap::with_capacity(edges.len());
    for (index, (from, _)) in edges.iter().enumerate() {
        outgoing.entry(*from).or_default().push(index);
    }

    let successor = |edge: usize| -> usize {
        let (from, to) = edges[edge];
        let dir = (to.0 - from.0, to.1 - from.1);
        let right = (-dir.1, dir.0);
        let left = (dir.1, -dir.0);
        let candidates = &outgoing[&to];
        [right, dir, left]
            .iter()
            .find_map(|want| {
                candidates.iter().copied().find(|&e| {
                    let (a, b) = edges[e];
                    (b.0 - a.0, b.1 - a.1) == *want
                })
            })
            .unwrap_or(candidates[0])
    };

    let mut used = vec![false; edges.len()];
    let mut rings = Vec::new();
    for start in 0..edges.len() {
        if used[start] {
            continue;
        }

        let mut vertices = Vec::new();
        let mut edge = start;
        loop {
            used[edge] = true;
            vertices.push(edges[edge].0);
            edge = successor(edge);
            if edge == start || used[edge] {
                break;
            }
        }

        let vertices = drop_collinear(vertices);
        let signed_area = shoelace2(&vertices) / 2;
        rings.push(PixelRing { vertices, signed_area });
    }
    rings
}

fn drop_collinear(vertices: Vec<Vertex>) -> Vec<Vertex> {
    let n = vertices.len();
    if n < 4 {
        return vertices;
    }
    (0..n)
        .filter(|&i| {
            let prev = vertices[(i + n - 1) % n];
            let here = vertices[i];
            let next = vertices[(i + 1) % n];
            let d_in = ((here.0 - prev.0).signum(), (here.1 - prev.1).signum());
            let d_out = ((next.0 - here.0).signum(), (next.1 - here.1).signum());
            d_in != d_out
        })
        .map(|i| vertices[i])
        .collect()
}

/// Twice the signed area of a closed ring (implicitly closed).
fn shoelace2(vertices: &[Vertex]) -> i64 {
    let n = vertices.len();
    (0..n)
        .map(|i| {
            let (x0, y0) = vertices[i];
            let (x1, y1) = vertices[(i + 1) % n];
            x0 * y1 - x1 * y0
        })
        .sum()
}

fn rings_to_polygon(rings: Vec<PixelRing>, transform: &GeoTransform) -> Option<Polygon<f64>> {
    let (outer, holes): (Vec<PixelRing>, Vec<PixelRing>) =
        rings.into_iter().partition(|ring| ring.signed_area > 0);

    let mut outer = outer.into_iter();
    let exterior = outer.next()?;
    if outer.next().is_some() {
        // A 4-connected region has exactly one outer boundary.
        warn!("region traced into more than one outer ring; extra rings dropped");
    }

    let to_world = |ring: &PixelRing| -> LineString<f64> {
        let mut coords: Vec<_> = ring
            .vertices
            .iter()
            .map(|&(col, row)| transform.apply(col as f64, row as f64))
            .collect();
        if let Some(&first) = coords.first() {
            coords.push(first);
        }
        LineString::new(coords)
    };

    let polygon = Polygon::new(to_world(&exterior), holes.iter().map(to_world).collect());
    Some(polygon.orient(Direction::Default))
}
