//! Statistical position optimizer front end.

use super::parse_anchor;
use anyhow::Result;
use gridstitch_core::{Config, Project, Stopwatch, load_step_fractions};
use gridstitch_opt::{XyOptions, xy_optimize};
use std::path::{Path, PathBuf};

#[derive(clap::Args, Debug)]
#[command(disable_version_flag = true)]
pub struct Subcommand {
	/// input project
	#[arg(long, default_value = "out.pto")]
	pub pto_in: PathBuf,

	/// output project; defaults to the input
	#[arg(long)]
	pub pto_out: Option<PathBuf>,

	/// keep pair deltas within n standard deviations
	#[arg(long, default_value_t = 3.0)]
	pub stdev: f64,

	/// anchor at col,row instead of searching from the center
	#[arg(long, value_name = "col,row")]
	pub anchor_cr: Option<String>,

	/// skip the placement sanity check
	#[arg(long)]
	pub no_check_poor_opt: bool,
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let watch = Stopwatch::start();
	let out = arguments.pto_out.as_deref().unwrap_or(&arguments.pto_in);
	log::info!("in: {}, out: {}", arguments.pto_in.display(), out.display());

	let config = Config::load()?;
	let mut project = Project::from_file(&arguments.pto_in)?;
	let fractions = load_step_fractions(Path::new("."), &config)?;

	let options = XyOptions {
		stdev: Some(arguments.stdev),
		anchor_cr: arguments.anchor_cr.as_deref().map(parse_anchor).transpose()?,
		check_poor_opt: !arguments.no_check_poor_opt,
	};
	xy_optimize(&mut project, &config, fractions, &options)?;

	log::info!("centering");
	project.center()?;

	log::info!("saving to {}", out.display());
	project.save_as(out)?;
	log::info!("completed in {watch}");
	Ok(())
}
