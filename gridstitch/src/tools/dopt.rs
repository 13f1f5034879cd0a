//! Linear-regression dead-reckoning position optimizer front end.
//!
//! Assumes the images form a near-perfect grid, fits the linear system and
//! places every image onto it.

use anyhow::Result;
use gridstitch_core::{Project, Stopwatch};
use gridstitch_opt::{LinearOptions, linear_reoptimize};
use std::path::PathBuf;

#[derive(clap::Args, Debug)]
#[command(disable_version_flag = true)]
pub struct Subcommand {
	/// input project
	#[arg(long, default_value = "out.pto")]
	pub pto_in: PathBuf,

	/// output project; defaults to the input
	#[arg(long)]
	pub pto_out: Option<PathBuf>,

	/// row regressions: 1 for backlash-compensated stages, 2 for serpentine
	#[arg(long, default_value_t = 2)]
	pub row_orders: usize,

	/// tolerate missing grid slots
	#[arg(long)]
	pub allow_missing: bool,
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let watch = Stopwatch::start();
	let out = arguments.pto_out.as_deref().unwrap_or(&arguments.pto_in);
	log::info!("in: {}, out: {}", arguments.pto_in.display(), out.display());

	let mut project = Project::from_file(&arguments.pto_in)?;
	let options = LinearOptions {
		r_orders: arguments.row_orders,
		allow_missing: arguments.allow_missing,
	};
	linear_reoptimize(&mut project, &options)?;

	log::info!("centering");
	project.center()?;

	log::info!("saving to {}", out.display());
	project.save_as(out)?;
	log::info!("completed in {watch}");
	Ok(())
}
