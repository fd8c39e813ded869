//! # Calipers
//!
//! Measures a GDAL dataset in a given reference frame: prints the ground
//! sample distance and, per producing reference-frame node, the usable lod
//! range with the tile range at each lod.
//!
//! ## Usage
//! ```sh
//! calipers dataset.tif webmerc --demToOphotoScale 3
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use tilecast::calipers::{CalipersOptions, DatasetType, measure};
use tilecast_core::Registry;
use tilecast_gdal::DatasetDescriptor;

#[derive(Parser, Debug)]
#[command(author, version, about = "Measures GDAL dataset in given reference frame.", long_about = None)]
struct Cli {
	/// Path to GDAL dataset to examine.
	dataset: PathBuf,

	/// Reference frame.
	reference_frame: String,

	/// Dataset type (dem or ophoto). Mandatory only if autodetect fails.
	#[arg(long = "datasetType")]
	dataset_type: Option<DatasetType>,

	/// Inverse scale between DEM's resolution and resolution of most
	/// detailed orthophoto that can be draped on it. Used for bottom LOD
	/// calculation. To get 2x better ophoto (i.e. resolution scale 1/2)
	/// use 2.
	#[arg(long = "demToOphotoScale", default_value_t = 3.0)]
	dem_to_ophoto_scale: f64,

	/// Fraction of tile when rasterization algorithm stops. Inverse
	/// value, 4 means 1/4 of tile.
	#[arg(long = "tileFractionLimit", default_value_t = 32.0)]
	tile_fraction_limit: f64,

	/// Reference-frame registry file; a built-in web-mercator registry is
	/// used when absent.
	#[arg(long)]
	registry: Option<PathBuf>,

	#[arg(long, short = 'v', action = clap::ArgAction::Count, help = "Increase logging verbosity")]
	verbose: u8,
}

fn main() {
	if let Err(err) = run() {
		eprintln!("calipers: {err:#}");
		std::process::exit(1);
	}
}

fn run() -> Result<()> {
	let cli = Cli::parse();

	let log_level = match cli.verbose {
		0 => LevelFilter::Warn,
		1 => LevelFilter::Info,
		2 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	};
	env_logger::Builder::new().filter_level(log_level).format_timestamp(None).init();

	tilecast_gdal::register_all();

	let dataset = std::fs::canonicalize(&cli.dataset).unwrap_or(cli.dataset.clone());
	let descriptor = DatasetDescriptor::probe(&dataset).context("cannot open dataset")?;

	let registry = match &cli.registry {
		Some(path) => Registry::from_path(path)?,
		None => Registry::builtin(),
	};
	let rf = registry.reference_frame(&cli.reference_frame)?;

	let options = CalipersOptions {
		dataset_type: cli.dataset_type,
		dem_to_ophoto_scale: cli.dem_to_ophoto_scale,
		tile_fraction_limit: cli.tile_fraction_limit,
	};

	let measurement = measure(&descriptor, &registry, rf, &options)?;
	measurement.write(&mut std::io::stdout().lock())?;
	Ok(())
}
