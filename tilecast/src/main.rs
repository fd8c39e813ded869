//! # Tilecast
//!
//! Tilecast serves map-tile pyramids (metatiles, meshes, navtiles, masks)
//! generated on demand from GDAL datasets.
//!
//! ## Usage
//! ```sh
//! tilecast serve --resources resources.json --root ./store
//! ```

mod tools;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_help_subcommand = true)]
struct Cli {
	#[command(subcommand)]
	command: Commands,

	#[arg(
		long,
		short = 'q',
		action = clap::ArgAction::Count,
		global = true,
		help = "Decrease logging verbosity",
		conflicts_with = "verbose",
		display_order = 100,
	)]
	quiet: u8,

	#[arg(
		long,
		short = 'v',
		action = clap::ArgAction::Count,
		global = true,
		help = "Increase logging verbosity",
		display_order = 100,
	)]
	verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
	#[clap(alias = "server")]
	/// Serve tile pyramids via HTTP
	Serve(tools::serve::Subcommand),
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	// initialize logger and set log level based on verbosity flags
	let verbosity = cli.verbose as i16 - cli.quiet as i16;
	let log_level = match verbosity {
		i16::MIN..=-1 => LevelFilter::Off,
		0 => LevelFilter::Warn,
		1 => LevelFilter::Info,
		2 => LevelFilter::Debug,
		3..=i16::MAX => LevelFilter::Trace,
	};

	env_logger::Builder::new().filter_level(log_level).format_timestamp(None).init();

	run(cli)
}

fn run(cli: Cli) -> Result<()> {
	match &cli.command {
		Commands::Serve(arguments) => tools::serve::run(arguments),
	}
}

#[cfg(test)]
mod tests {
	use crate::Cli;
	use clap::Parser;

	#[test]
	fn serve_requires_resources() {
		assert!(Cli::try_parse_from(vec!["tilecast", "serve"]).is_err());
	}

	#[test]
	fn serve_parses() {
		let cli = Cli::try_parse_from(vec![
			"tilecast",
			"serve",
			"--resources",
			"resources.json",
			"-vv",
		])
		.unwrap();
		assert_eq!(cli.verbose, 2);
	}
}
