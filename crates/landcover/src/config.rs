use serde::{Deserialize, Serialize};

use crate::codes::LandCoverCode;
use crate::extract::{BlobIdGenerator, IdScheme};
use crate::ingest::WATER_LINE_BUFFER;

/// Library-level settings shared by ingestion, extraction and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandCoverConfig {
    /// Code assigned to roads whose surface is `verhard`, in 0..=8.
    pub hardened_road_code: i16,
    pub id_scheme: IdScheme,
    /// Buffer distance applied to water center lines, in CRS units.
    pub water_line_buffer: f64,
    /// Nodata value written to exported rasters.
    pub output_nodata: i16,
}

impl Default for LandCoverConfig {
    fn default() -> Self {
        Self {
            hardened_road_code: LandCoverCode::Asphalt.value(),
            id_scheme: IdScheme::Sequential,
            water_line_buffer: WATER_LINE_BUFFER,
            output_nodata: LandCoverCode::NODATA,
        }
    }
}

impl LandCoverConfig {
    /// The hardened road code, or `None` if it is not a class code.
    pub fn hardened_road(&self) -> Option<LandCoverCode> {
        LandCoverCode::from_value(self.hardened_road_code).filter(|c| *c != LandCoverCode::Nodata)
    }

    pub fn id_generator(&self) -> BlobIdGenerator {
        BlobIdGenerator::new(self.id_scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: LandCoverConfig = serde_json::from_str(r#"{ "id_scheme": "random" }"#).unwrap();
        assert_eq!(cfg.id_scheme, IdScheme::Random);
        assert_eq!(cfg.hardened_road(), Some(LandCoverCode::Asphalt));
        assert_eq!(cfg.output_nodata, -9999);
        assert_eq!(cfg.water_line_buffer, 0.75);
    }

    #[test]
    fn hardened_road_code_must_be_a_class() {
        let mut cfg = LandCoverConfig::default();
        cfg.hardened_road_code = 1;
        assert_eq!(cfg.hardened_road(), Some(LandCoverCode::Paving));
        cfg.hardened_road_code = 9;
        assert_eq!(cfg.hardened_road(), None);
        cfg.hardened_road_code = -9999;
        assert_eq!(cfg.hardened_road(), None);
    }
}
