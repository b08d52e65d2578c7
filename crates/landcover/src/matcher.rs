//! Identity reconciliation between footprint and highest blobs.

use geo::{BoundingRect, Contains, Intersects, Polygon};
use log::debug;
use rstar::{RTree, RTreeObject, AABB};

use crate::extract::BuildingBlob;

/// A footprint blob after matching. When `matched` is set, `blob.id` has
/// been replaced by the id of `highest[matched]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedBuilding {
    pub blob: BuildingBlob,
    /// Identifier the blob was extracted with.
    pub own_id: String,
    /// Index into the highest set this blob adopted its id from.
    pub matched: Option<usize>,
}

impl MatchedBuilding {
    #[inline]
    pub fn id(&self) -> &str {
        &self.blob.id
    }

    #[inline]
    pub fn polygon(&self) -> &Polygon<f64> {
        &self.blob.polygon
    }
}

#[derive(Clone)]
struct BlobBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for BlobBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope(polygon: &Polygon<f64>) -> Option<AABB<[f64; 2]>> {
    let rect = polygon.bounding_rect()?;
    Some(AABB::from_corners(
        [rect.min().x, rect.min().y],
        [rect.max().x, rect.max().y],
    ))
}

/// Give each footprint blob the id of the first highest blob it relates to.
///
/// Candidates come from an R-tree over the highest blobs' bounding boxes and
/// are tried in ascending index order; the first whose polygon intersects the
/// footprint, or contains it, wins. This is not a best-overlap match.
/// Footprints without a related highest blob keep their own id. Geometry is
/// never changed.
pub fn match_buildings(footprints: Vec<BuildingBlob>, highest: &[BuildingBlob]) -> Vec<MatchedBuilding> {
    let boxes: Vec<BlobBox> = highest
        .iter()
        .enumerate()
        .filter_map(|(idx, blob)| envelope(&blob.polygon).map(|env| BlobBox { idx, env }))
        .collect();
    let tree = RTree::bulk_load(boxes);

    let mut adopted = 0usize;
    let matched: Vec<MatchedBuilding> = footprints
        .into_iter()
        .map(|mut blob| {
            let own_id = blob.id.clone();
            let hit = envelope(&blob.polygon).and_then(|env| {
                let mut candidates: Vec<usize> = tree
                    .locate_in_envelope_intersecting(&env)
                    .map(|candidate| candidate.idx)
                    .collect();
                candidates.sort_unstable();
                candidates.into_iter().find(|&idx| {
                    let other = &highest[idx].polygon;
                    blob.polygon.intersects(other) || other.contains(&blob.polygon)
                })
            });

            if let Some(idx) = hit {
                blob.id = highest[idx].id.clone();
                adopted += 1;
            }

            MatchedBuilding {
                blob,
                own_id,
                matched: hit,
            }
        })
        .collect();

    debug!(
        "matched {adopted} of {} footprint blobs against {} highest blobs",
        matched.len(),
        highest.len()
    );
    matched
}
