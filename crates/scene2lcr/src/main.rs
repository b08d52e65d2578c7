mod config;
mod scene;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use landcover::{compose, BuildingRegistry, Classifier, CodeTable, LandCoverCode, LandCoverGrid, Layer};

use crate::config::Args;
use crate::scene::{load_buildings, load_features, load_mask, Scene};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    run(&args)?;
    Ok(())
}

/// Compose the scene and write the raster. Returns the output path.
fn run(args: &Args) -> Result<PathBuf> {
    let started = Instant::now();

    let mut cfg = args.landcover_config();
    let Some(hardened) = cfg.hardened_road() else {
        bail!(
            "--hardened-road-code {} is not a land-cover class (0..=8)",
            cfg.hardened_road_code
        );
    };

    let table = CodeTable::load(&args.code_table)
        .with_context(|| format!("loading code table {}", args.code_table.display()))?;
    let classifier = Classifier::new(table, hardened).with_water_line_buffer(cfg.water_line_buffer);

    let scene = Scene::load(&args.scene)?;
    let output = args.output.clone().unwrap_or_else(|| scene.output.clone());
    if output.exists() && !args.overwrite {
        bail!("{} exists; pass --overwrite to replace it", output.display());
    }

    let grid = scene.grid()?;
    let spec = &grid.spec;
    cfg.output_nodata = output_nodata(args.force_nodata, grid.source_nodata);
    info!("Grid {}x{} in {}", spec.width, spec.height, spec.crs);

    // ---------------------------------------------------------------------
    // Vector layers: each source is read and classified independently.
    // ---------------------------------------------------------------------
    let sources: Vec<_> = scene.layers.iter().collect();
    let mut layers: Vec<Layer> = sources
        .par_iter()
        .map(|(kind, source)| -> Result<Layer> {
            let features = load_features(source.path())?;
            let crs = source.crs().unwrap_or_else(|| spec.crs.clone());
            let layer = classifier.layer(*kind, crs, &features);
            info!(
                "{kind}: {} of {} features from {}",
                layer.features.len(),
                features.len(),
                source.path().display()
            );
            Ok(layer)
        })
        .collect::<Result<_>>()?;

    // ---------------------------------------------------------------------
    // Buildings: reference set minus removals, plus blobs from the masks.
    // ---------------------------------------------------------------------
    let mut registry = match &scene.reference_buildings {
        Some(source) => BuildingRegistry::new(load_buildings(source)?),
        None => BuildingRegistry::default(),
    };
    for id in &args.remove_building {
        if !registry.reference().iter().any(|b| &b.parcel_id == id) {
            warn!("--remove-building {id}: no reference building has this id");
        }
        registry.remove_building(id.clone());
    }

    match (&scene.highest_mask, &scene.footprint_mask) {
        (Some(highest), footprint) => {
            let highest = load_mask(highest, spec, "highest mask")?;
            let footprint = footprint
                .as_deref()
                .map(|path| load_mask(path, spec, "footprint mask"))
                .transpose()?;
            let mut ids = cfg.id_generator();
            registry.insert_user_buildings(&highest, &spec.transform, footprint.as_ref(), &mut ids)?;
        }
        (None, Some(path)) => warn!("{}: footprint mask without a highest mask is ignored", path.display()),
        (None, None) => {}
    }
    for id in &args.remove_user_building {
        registry.remove_user_building(id.clone());
    }
    layers.push(registry.building_layer(spec.crs.clone()));

    // ---------------------------------------------------------------------
    // Composite, apply paint steps, export.
    // ---------------------------------------------------------------------
    let composition = compose(spec, &layers)?;
    if !composition.skipped().is_empty() {
        warn!("{} features could not be rasterized", composition.skipped().len());
    }

    let mut grid = composition.into_grid();
    for step in &scene.paint {
        let code = LandCoverCode::from_value(step.code)
            .filter(|c| *c != LandCoverCode::Nodata)
            .with_context(|| format!("paint code {} is not a land-cover class", step.code))?;
        let mask = load_mask(&step.mask, spec, "paint mask")?;
        debug!("Painting {code} over {} cells", mask.count());
        grid = grid.paint(code, &mask)?;
    }

    for (code, count) in grid.class_histogram() {
        debug!("{code}: {count} cells");
    }

    write_grid(&output, &grid, cfg.output_nodata, args.encoding())?;
    info!(
        "OK {} ({}x{}, nodata {}) in {:.2?}",
        output.display(),
        spec.width,
        spec.height,
        cfg.output_nodata,
        started.elapsed()
    );
    Ok(output)
}

/// -9999 when forced or when the grid source has no nodata of its own.
fn output_nodata(force: bool, source: Option<i16>) -> i16 {
    match (force, source) {
        (false, Some(nodata)) => nodata,
        (false, None) => {
            info!("Grid source has no nodata value; writing {}", LandCoverCode::NODATA);
            LandCoverCode::NODATA
        }
        (true, _) => LandCoverCode::NODATA,
    }
}

fn write_grid(path: &Path, grid: &LandCoverGrid, nodata: i16, encoding: lcr::Encoding) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let spec = grid.spec();
    let raster = lcr::RasterFile {
        width: u32::try_from(spec.width).context("grid too wide for LCR1")?,
        height: u32::try_from(spec.height).context("grid too tall for LCR1")?,
        transform: spec.transform.coefficients(),
        crs: Some(spec.crs.to_string()),
        nodata: Some(nodata),
        cells: grid.with_nodata(nodata),
    };

    debug!("Writing LCR1 raster to {}", path.display());
    lcr::write_file(path, &raster, encoding).with_context(|| format!("writing {}", path.display()))
}
