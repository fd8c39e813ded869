use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tilecast::generator::{GeneratorConfig, Generators};
use tilecast::http::{ServerState, router};
use tilecast::resources::FileResourceBackend;
use tilecast_core::{GeneratorType, Registry};
use tilecast_gdal::{Arsenal, WarperOptions};

#[derive(Args, Debug)]
#[command(about = "Serve tile pyramids via HTTP")]
pub struct Subcommand {
	/// Address to listen on.
	#[arg(long, default_value = "0.0.0.0:3070")]
	listen: String,

	/// Reference-frame registry file; a built-in web-mercator registry is
	/// used when absent.
	#[arg(long)]
	registry: Option<PathBuf>,

	/// JSON file with the resource list.
	#[arg(long)]
	resources: PathBuf,

	/// Root of the per-generator store.
	#[arg(long, default_value = "store")]
	root: PathBuf,

	/// Datasets in resource definitions are resolved against this root.
	#[arg(long, default_value = ".")]
	resource_root: PathBuf,

	/// Resource update period in seconds; zero or negative disables
	/// periodic updates.
	#[arg(long, default_value_t = 300)]
	update_period: i64,

	/// Generator types whose incompatible changes are rejected.
	#[arg(long, value_delimiter = ',', default_values_t = vec![String::from("surface")])]
	freeze: Vec<String>,

	/// Number of GDAL worker processes.
	#[arg(long, default_value_t = 4)]
	gdal_processes: usize,

	/// Size of the GDAL shared-memory region in MiB.
	#[arg(long, default_value_t = 64)]
	gdal_region_mib: usize,
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let registry = Arc::new(match &arguments.registry {
		Some(path) => Registry::from_path(path)?,
		None => Registry::builtin(),
	});

	let mut freeze = std::collections::BTreeSet::new();
	for name in &arguments.freeze {
		freeze.insert(match name.as_str() {
			"tms" => GeneratorType::Tms,
			"surface" => GeneratorType::Surface,
			"geodata" => GeneratorType::Geodata,
			other => anyhow::bail!("unknown generator type '{other}' in --freeze"),
		});
	}

	let config = GeneratorConfig {
		root: arguments.root.clone(),
		resource_root: arguments.resource_root.clone(),
		freeze,
		resource_update_period: arguments.update_period,
	};

	let backend = Arc::new(FileResourceBackend::new(arguments.resources.clone()));
	let generators = Generators::new(config, registry, backend)?;

	// the worker pool forks before any runtime threads exist
	tilecast_gdal::register_all();
	let arsenal = Arsenal::new(WarperOptions {
		process_count: arguments.gdal_processes,
		region_size: arguments.gdal_region_mib * 1024 * 1024,
		..WarperOptions::default()
	})?;

	generators.start(arsenal.clone())?;

	let state = Arc::new(ServerState {
		generators: generators.clone(),
		arsenal: arsenal.clone(),
	});

	let runtime = tokio::runtime::Runtime::new()?;
	let result = runtime.block_on(async {
		let listener = tokio::net::TcpListener::bind(&arguments.listen)
			.await
			.with_context(|| format!("cannot listen on {}", arguments.listen))?;
		eprintln!("server starts listening on {}", arguments.listen);

		axum::serve(listener, router(state).into_make_service())
			.with_graceful_shutdown(async {
				let _ = tokio::signal::ctrl_c().await;
			})
			.await
			.context("server failed")
	});

	generators.stop();
	arsenal.stop();
	result
}
