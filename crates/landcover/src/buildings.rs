//! Reference and user-supplied buildings with per-id removal.

use std::collections::HashSet;

use log::{debug, info};

use crate::error::ValidationError;
use crate::extract::{identify, trace_blobs, BlobIdGenerator, BlobSource, BuildingBlob};
use crate::feature::{self, Building, Layer};
use crate::grid::{BoolMask, Crs, GeoTransform};
use crate::matcher::match_buildings;

#[derive(Debug, Clone, Default)]
pub struct BuildingRegistry {
    reference: Vec<Building>,
    removed: HashSet<String>,
    user: Vec<Building>,
    user_higher: Vec<Building>,
    removed_user: HashSet<String>,
    is_3d: bool,
}

impl BuildingRegistry {
    pub fn new(reference: Vec<Building>) -> Self {
        Self {
            reference,
            ..Self::default()
        }
    }

    pub fn reference(&self) -> &[Building] {
        &self.reference
    }

    /// User buildings: footprint blobs when a footprint mask was supplied,
    /// highest blobs otherwise.
    pub fn user_buildings(&self) -> &[Building] {
        &self.user
    }

    /// Highest blobs kept alongside footprint-derived user buildings.
    /// Empty unless the registry is 3D.
    pub fn user_buildings_higher(&self) -> &[Building] {
        &self.user_higher
    }

    #[inline]
    pub fn is_3d(&self) -> bool {
        self.is_3d
    }

    pub fn remove_building(&mut self, id: impl Into<String>) {
        self.removed.insert(id.into());
    }

    /// Returns `false` if `id` was not removed.
    pub fn retrieve_building(&mut self, id: &str) -> bool {
        self.removed.remove(id)
    }

    pub fn remove_user_building(&mut self, id: impl Into<String>) {
        self.removed_user.insert(id.into());
    }

    /// Returns `false` if `id` was not removed.
    pub fn retrieve_user_building(&mut self, id: &str) -> bool {
        self.removed_user.remove(id)
    }

    /// Replace the user buildings with blobs extracted from `highest`, and,
    /// when given, from `footprint` matched against them.
    ///
    /// Previously removed user ids are forgotten. On error the registry is
    /// left unchanged.
    pub fn insert_user_buildings(
        &mut self,
        highest: &BoolMask,
        transform: &GeoTransform,
        footprint: Option<&BoolMask>,
        ids: &mut BlobIdGenerator,
    ) -> Result<(), ValidationError> {
        if let Some(fp) = footprint {
            if (fp.width(), fp.height()) != (highest.width(), highest.height()) {
                return Err(ValidationError::DimensionMismatch {
                    what: "footprint mask",
                    expected: (highest.width(), highest.height()),
                    found: (fp.width(), fp.height()),
                });
            }
        }

        let (highest_polys, footprint_polys) = rayon::join(
            || trace_blobs(highest, transform),
            || footprint.map(|fp| trace_blobs(fp, transform)).transpose(),
        );
        let highest_blobs = identify(highest_polys?, BlobSource::Highest, ids);
        let footprint_polys = footprint_polys?;

        self.removed_user.clear();
        match footprint_polys {
            Some(polys) => {
                let footprint_blobs = identify(polys, BlobSource::Footprint, ids);
                let matched = match_buildings(footprint_blobs, &highest_blobs);
                self.user = matched.into_iter().map(|m| blob_to_building(m.blob)).collect();
                self.user_higher = highest_blobs.into_iter().map(blob_to_building).collect();
                self.is_3d = true;
            }
            None => {
                self.user = highest_blobs.into_iter().map(blob_to_building).collect();
                self.user_higher.clear();
                self.is_3d = false;
            }
        }

        info!(
            "inserted {} user buildings ({})",
            self.user.len(),
            if self.is_3d { "footprint matched to highest" } else { "highest only" }
        );
        Ok(())
    }

    /// Reference buildings not removed, followed by user buildings not removed.
    pub fn active_buildings(&self) -> Vec<Building> {
        let reference = self
            .reference
            .iter()
            .filter(|b| !self.removed.contains(&b.parcel_id));
        let user = self
            .user
            .iter()
            .filter(|b| !self.removed_user.contains(&b.parcel_id));
        let active: Vec<Building> = reference.chain(user).cloned().collect();
        debug!(
            "{} active buildings ({} reference removed, {} user removed)",
            active.len(),
            self.removed.len(),
            self.removed_user.len()
        );
        active
    }

    pub fn building_layer(&self, crs: Crs) -> Layer {
        feature::building_layer(crs, &self.active_buildings())
    }
}

fn blob_to_building(blob: BuildingBlob) -> Building {
    Building::from_polygon(blob.polygon, blob.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::LayerKind;
    use geo::{coord, Area, Rect};

    fn reference() -> Vec<Building> {
        ["0363100012345678", "0363100012345679"]
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let x = i as f64 * 10.0;
                let rect = Rect::new(coord! { x: x, y: 0.0 }, coord! { x: x + 5.0, y: 5.0 });
                Building::from_polygon(rect.to_polygon(), *id)
            })
            .collect()
    }

    fn ids_of(buildings: &[Building]) -> Vec<&str> {
        buildings.iter().map(|b| b.parcel_id.as_str()).collect()
    }

    #[test]
    fn remove_and_retrieve_reference_buildings() {
        let mut registry = BuildingRegistry::new(reference());
        registry.remove_building("0363100012345678");
        assert_eq!(ids_of(&registry.active_buildings()), ["0363100012345679"]);

        assert!(registry.retrieve_building("0363100012345678"));
        assert!(!registry.retrieve_building("0363100012345678"));
        assert!(!registry.retrieve_building("unknown"));
        assert_eq!(registry.active_buildings().len(), 2);
    }

    #[test]
    fn highest_only_insert() {
        let mut registry = BuildingRegistry::new(reference());
        let highest = BoolMask::from_ascii(&["##..", "##..", "...#"]);
        let transform = GeoTransform::north_up(100.0, 3.0, 1.0);
        let mut ids = BlobIdGenerator::sequential();

        registry
            .insert_user_buildings(&highest, &transform, None, &mut ids)
            .unwrap();
        assert!(!registry.is_3d());
        assert!(registry.user_buildings_higher().is_empty());
        assert_eq!(ids_of(registry.user_buildings()), ["00000001", "00000002"]);
        assert_eq!(registry.user_buildings()[0].geometry.unsigned_area(), 4.0);

        let active = registry.active_buildings();
        assert_eq!(
            ids_of(&active),
            ["0363100012345678", "0363100012345679", "00000001", "00000002"]
        );
    }

    #[test]
    fn footprint_insert_adopts_highest_ids() {
        let mut registry = BuildingRegistry::default();
        let highest = BoolMask::from_ascii(&["###...", "###...", "###..#"]);
        let footprint = BoolMask::from_ascii(&["......", ".#....", "....#."]);
        let transform = GeoTransform::north_up(0.0, 3.0, 1.0);
        let mut ids = BlobIdGenerator::sequential();

        registry
            .insert_user_buildings(&highest, &transform, Some(&footprint), &mut ids)
            .unwrap();
        assert!(registry.is_3d());
        assert_eq!(registry.user_buildings_higher().len(), 2);

        let higher_ids = ids_of(registry.user_buildings_higher());
        let user_ids = ids_of(registry.user_buildings());
        // The footprint cell inside the 3x3 block takes the block's id; the
        // lone footprint cell at (4, 2) shares an edge with (5, 2).
        assert!(higher_ids.contains(&user_ids[0]));
        assert!(higher_ids.contains(&user_ids[1]));
        assert_eq!(registry.user_buildings()[0].geometry.unsigned_area(), 1.0);
    }

    #[test]
    fn unmatched_footprint_keeps_own_id() {
        let mut registry = BuildingRegistry::default();
        let highest = BoolMask::from_ascii(&["#.....", "......"]);
        let footprint = BoolMask::from_ascii(&["......", "....#."]);
        let transform = GeoTransform::north_up(0.0, 2.0, 1.0);
        let mut ids = BlobIdGenerator::sequential();

        registry
            .insert_user_buildings(&highest, &transform, Some(&footprint), &mut ids)
            .unwrap();
        assert_eq!(ids_of(registry.user_buildings_higher()), ["00000001"]);
        assert_eq!(ids_of(registry.user_buildings()), ["00000002"]);
    }

    #[test]
    fn reinsert_forgets_removed_user_ids() {
        let mut registry = BuildingRegistry::default();
        let highest = BoolMask::from_ascii(&["#.#"]);
        let transform = GeoTransform::north_up(0.0, 1.0, 1.0);
        let mut ids = BlobIdGenerator::sequential();

        registry
            .insert_user_buildings(&highest, &transform, None, &mut ids)
            .unwrap();
        registry.remove_user_building("00000001");
        assert_eq!(ids_of(&registry.active_buildings()), ["00000002"]);
        assert!(registry.retrieve_user_building("00000001"));
        registry.remove_user_building("00000001");

        let mut ids = BlobIdGenerator::sequential();
        registry
            .insert_user_buildings(&highest, &transform, None, &mut ids)
            .unwrap();
        assert_eq!(registry.active_buildings().len(), 2);
    }

    #[test]
    fn mismatched_masks_leave_registry_untouched() {
        let mut registry = BuildingRegistry::new(reference());
        let mut ids = BlobIdGenerator::sequential();
        let err = registry
            .insert_user_buildings(
                &BoolMask::new(4, 4),
                &GeoTransform::north_up(0.0, 4.0, 1.0),
                Some(&BoolMask::new(3, 4)),
                &mut ids,
            )
            .unwrap_err();
        assert!(matches!(err, ValidationError::DimensionMismatch { .. }));
        assert!(registry.user_buildings().is_empty());
    }

    #[test]
    fn building_layer_codes_every_active_building() {
        let mut registry = BuildingRegistry::new(reference());
        registry.remove_building("0363100012345679");
        let layer = registry.building_layer(Crs::Epsg(28992));
        assert_eq!(layer.kind, LayerKind::Building);
        assert_eq!(layer.features.len(), 1);
        assert_eq!(
            layer.features[0].classification.code(),
            Some(crate::codes::LandCoverCode::Building)
        );
    }
}
