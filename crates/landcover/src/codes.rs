//! Land-cover code enumeration and the external code table.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::CodeTableError;

/// The closed set of values a finished land-cover grid may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i16)]
pub enum LandCoverCode {
    Nodata = -9999,
    /// Hardened road surface; the default code for `verhard` roads.
    Asphalt = 0,
    Paving = 1,
    Building = 2,
    UnpavedRoad = 3,
    SemiPavedRoad = 4,
    Grass = 5,
    Farmland = 6,
    Water = 7,
    BareSoil = 8,
}

impl LandCoverCode {
    pub const NODATA: i16 = -9999;

    pub const ALL: [LandCoverCode; 10] = [
        LandCoverCode::Nodata,
        LandCoverCode::Asphalt,
        LandCoverCode::Paving,
        LandCoverCode::Building,
        LandCoverCode::UnpavedRoad,
        LandCoverCode::SemiPavedRoad,
        LandCoverCode::Grass,
        LandCoverCode::Farmland,
        LandCoverCode::Water,
        LandCoverCode::BareSoil,
    ];

    #[inline]
    pub fn value(self) -> i16 {
        self as i16
    }

    pub fn from_value(value: i16) -> Option<Self> {
        match value {
            Self::NODATA => Some(Self::Nodata),
            0..=8 => Some(Self::ALL[value as usize + 1]),
            _ => None,
        }
    }

    /// Position in [`LandCoverCode::ALL`].
    #[inline]
    pub(crate) fn ordinal(self) -> usize {
        match self {
            Self::Nodata => 0,
            other => other.value() as usize + 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nodata => "nodata",
            Self::Asphalt => "asphalt",
            Self::Paving => "paving",
            Self::Building => "building",
            Self::UnpavedRoad => "unpaved road",
            Self::SemiPavedRoad => "semi-paved road",
            Self::Grass => "grass",
            Self::Farmland => "farmland",
            Self::Water => "water",
            Self::BareSoil => "bare soil",
        }
    }
}

impl fmt::Display for LandCoverCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.value())
    }
}

/// Result of looking a type name up in the code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Classified(LandCoverCode),
    /// No entry for the type; the feature must leave the grid untouched.
    Unclassified,
}

impl Classification {
    #[inline]
    pub fn code(self) -> Option<LandCoverCode> {
        match self {
            Classification::Classified(code) => Some(code),
            Classification::Unclassified => None,
        }
    }
}

impl From<LandCoverCode> for Classification {
    fn from(code: LandCoverCode) -> Self {
        Classification::Classified(code)
    }
}

/// Validated `terrain` and `road` lookup tables, loaded once.
///
/// ```json
/// { "terrain": { "grasland": 5, "akker": 6 },
///   "road":    { "onverhard": 3, "halfverhard": 4 } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeTable {
    terrain: HashMap<String, LandCoverCode>,
    road: HashMap<String, LandCoverCode>,
}

impl CodeTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CodeTableError> {
        // The source files are not always clean UTF-8.
        let bytes = fs::read(path)?;
        Self::from_json_str(&String::from_utf8_lossy(&bytes))
    }

    pub fn from_json_str(json: &str) -> Result<Self, CodeTableError> {
        let root: serde_json::Map<String, Value> = serde_json::from_str(json)?;

        let mut keys: Vec<String> = root.keys().cloned().collect();
        keys.sort();
        if keys != ["road", "terrain"] {
            return Err(CodeTableError::Keys(keys));
        }

        Ok(Self {
            terrain: parse_category("terrain", &root["terrain"])?,
            road: parse_category("road", &root["road"])?,
        })
    }

    #[inline]
    pub fn terrain(&self, land_use: &str) -> Classification {
        lookup(&self.terrain, land_use)
    }

    #[inline]
    pub fn road(&self, surface: &str) -> Classification {
        lookup(&self.road, surface)
    }
}

fn lookup(table: &HashMap<String, LandCoverCode>, name: &str) -> Classification {
    table
        .get(&name.to_lowercase())
        .copied()
        .map_or(Classification::Unclassified, Classification::Classified)
}

fn parse_category(
    category: &'static str,
    value: &Value,
) -> Result<HashMap<String, LandCoverCode>, CodeTableError> {
    let entries = value.as_object().ok_or_else(|| CodeTableError::InvalidCode {
        category,
        name: String::new(),
        value: value.clone(),
    })?;

    entries
        .iter()
        .map(|(name, raw)| {
            let code = raw
                .as_i64()
                .and_then(|v| i16::try_from(v).ok())
                .filter(|v| *v >= 0)
                .and_then(LandCoverCode::from_value)
                .ok_or_else(|| CodeTableError::InvalidCode {
                    category,
                    name: name.clone(),
                    value: raw.clone(),
                })?;
            Ok((name.to_lowercase(), code))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
        "terrain": { "grasland": 5, "akker": 6, "zand": 8 },
        "road": { "onverhard": 3, "halfverhard": 4, "Klinkers": 1 }
    }"#;

    #[test]
    fn lookup_is_case_insensitive_and_misses_are_unclassified() {
        let table = CodeTable::from_json_str(TABLE).unwrap();
        assert_eq!(table.terrain("Grasland"), Classification::Classified(LandCoverCode::Grass));
        assert_eq!(table.road("klinkers"), LandCoverCode::Paving.into());
        assert_eq!(table.terrain("onbekend"), Classification::Unclassified);
        assert_eq!(table.road("grasland"), Classification::Unclassified);
    }

    #[test]
    fn table_must_have_exactly_two_categories() {
        let err = CodeTable::from_json_str(r#"{ "terrain": {} }"#).unwrap_err();
        assert!(matches!(err, CodeTableError::Keys(ref k) if k == &["terrain".to_string()]));

        let extra = r#"{ "terrain": {}, "road": {}, "water": {} }"#;
        assert!(matches!(CodeTable::from_json_str(extra), Err(CodeTableError::Keys(_))));
    }

    #[test]
    fn codes_outside_the_enumeration_are_rejected() {
        for bad in ["-1", "9", "\"5\"", "2.5", "-9999"] {
            let json = format!(r#"{{ "terrain": {{ "x": {bad} }}, "road": {{}} }}"#);
            assert!(
                matches!(CodeTable::from_json_str(&json), Err(CodeTableError::InvalidCode { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn code_values_round_trip() {
        for code in LandCoverCode::ALL {
            assert_eq!(LandCoverCode::from_value(code.value()), Some(code));
            assert_eq!(LandCoverCode::ALL[code.ordinal()], code);
        }
        assert_eq!(LandCoverCode::from_value(9), None);
        assert_eq!(LandCoverCode::from_value(-1), None);
    }

    #[test]
    fn load_reads_lossy_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("landcover.json");
        let mut bytes = br#"{ "terrain": { "grasland": 5 }, "road": { "x"#.to_vec();
        bytes.push(0xff);
        bytes.extend_from_slice(br#"": 3 } }"#);
        fs::write(&path, bytes).unwrap();

        let table = CodeTable::load(&path).unwrap();
        assert_eq!(table.terrain("grasland"), LandCoverCode::Grass.into());
    }
}
