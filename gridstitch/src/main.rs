mod tools;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

// Define the command-line interface using the clap crate
#[derive(Parser, Debug)]
#[command(
	author,
	version,
	about,
	long_about = None,
	propagate_version = true,
	disable_help_subcommand = true,
)]
struct Cli {
	#[command(subcommand)]
	command: Commands,

	/// increase log verbosity (-v: debug, -vv: trace)
	#[arg(short, long, global = true, action = ArgAction::Count)]
	verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Arrange a flat capture into a cNNN_rNNN grid
	Rename(tools::rename::Subcommand),

	/// Inspect and transform a panorama project
	Pto(tools::pto::Subcommand),

	/// Statistical position optimizer
	Iopt(tools::iopt::Subcommand),

	/// Linear-regression dead-reckoning position optimizer
	Dopt(tools::dopt::Subcommand),

	/// Optimize positions and fix the output canvas
	Reopt(tools::reopt::Subcommand),

	/// Render a project into a directory of output tiles
	Ts(tools::ts::Subcommand),

	/// Full pipeline: optimize, check RMS, tile
	Stitch(tools::stitch::Subcommand),
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	let level = match cli.verbose {
		0 => log::LevelFilter::Info,
		1 => log::LevelFilter::Debug,
		_ => log::LevelFilter::Trace,
	};
	env_logger::Builder::new()
		.filter_level(level)
		.format_timestamp_secs()
		.init();

	run(cli)
}

fn run(cli: Cli) -> Result<()> {
	match &cli.command {
		Commands::Rename(arguments) => tools::rename::run(arguments),
		Commands::Pto(arguments) => tools::pto::run(arguments),
		Commands::Iopt(arguments) => tools::iopt::run(arguments),
		Commands::Dopt(arguments) => tools::dopt::run(arguments),
		Commands::Reopt(arguments) => tools::reopt::run(arguments),
		Commands::Ts(arguments) => tools::ts::run(arguments),
		Commands::Stitch(arguments) => tools::stitch::run(arguments),
	}
}

#[cfg(test)]
mod tests {
	use super::Cli;
	use clap::Parser;

	fn parse_err(args: Vec<&str>) -> String {
		Cli::try_parse_from(args).unwrap_err().to_string()
	}

	#[test]
	fn help() {
		let err = parse_err(vec!["gridstitch"]);
		assert!(err.contains("Usage: gridstitch"));
	}

	#[test]
	fn version() {
		let err = parse_err(vec!["gridstitch", "-V"]);
		assert!(err.starts_with("gridstitch "));
	}

	#[test]
	fn ts_subcommand_help() {
		let err = parse_err(vec!["gridstitch", "ts", "--help"]);
		assert!(err.contains("Render a project into a directory of output tiles"));
	}

	#[test]
	fn iopt_parses_anchor() {
		let cli = Cli::try_parse_from(vec!["gridstitch", "iopt", "--anchor-cr", "3,4"]).unwrap();
		match cli.command {
			super::Commands::Iopt(args) => assert_eq!(args.anchor_cr.as_deref(), Some("3,4")),
			_ => panic!("wrong subcommand"),
		}
	}
}
