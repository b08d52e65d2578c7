use clap::Parser;
use std::path::PathBuf;

use landcover::{IdScheme, LandCoverConfig};

/// `scene2lcr` - compose a land-cover raster from classified vector layers
/// and building masks.
///
/// Reads a scene description, rasterizes terrain, road, water and building
/// layers in that order of precedence, and writes an LCR1 raster.
#[derive(Parser, Debug, Clone)]
#[command(name = "scene2lcr", version, about, long_about = None)]
pub struct Args {
    /// Scene description (JSON). Relative paths inside it are resolved
    /// against its directory.
    #[arg(long, env = "SCENE2LCR_SCENE")]
    pub scene: PathBuf,

    /// Land-cover code table with exactly the keys `terrain` and `road`.
    #[arg(long, env = "SCENE2LCR_CODE_TABLE")]
    pub code_table: PathBuf,

    /// Code for roads whose surface is `verhard`.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub hardened_road_code: i16,

    /// Buffer distance for water center lines; zero drops them.
    #[arg(long, default_value_t = landcover::ingest::WATER_LINE_BUFFER)]
    pub water_line_buffer: f64,

    /// Write -9999 as nodata even when the grid template has its own value.
    #[arg(long, default_value_t = false)]
    pub force_nodata: bool,

    /// Random 8-hex building ids instead of a run-scoped counter.
    #[arg(long, default_value_t = false)]
    pub random_ids: bool,

    /// Reference building to leave out (repeatable).
    #[arg(long = "remove-building", value_name = "ID")]
    pub remove_building: Vec<String>,

    /// Extracted user building to leave out (repeatable).
    #[arg(long = "remove-user-building", value_name = "ID")]
    pub remove_user_building: Vec<String>,

    /// Write the payload run-length encoded.
    #[arg(long, default_value_t = false)]
    pub rle: bool,

    #[arg(long, default_value_t = false)]
    pub overwrite: bool,

    /// Output path; overrides the scene's `output`.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl Args {
    pub fn landcover_config(&self) -> LandCoverConfig {
        LandCoverConfig {
            hardened_road_code: self.hardened_road_code,
            id_scheme: if self.random_ids {
                IdScheme::Random
            } else {
                IdScheme::Sequential
            },
            water_line_buffer: self.water_line_buffer,
            ..LandCoverConfig::default()
        }
    }

    pub fn encoding(&self) -> lcr::Encoding {
        if self.rle {
            lcr::Encoding::Rle
        } else {
            lcr::Encoding::Raw
        }
    }
}
