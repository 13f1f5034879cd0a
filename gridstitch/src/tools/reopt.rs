//! Optimize positions, then let the external canvas fixer recompute the
//! output size and field of view.

use super::fix_canvas;
use anyhow::Result;
use gridstitch_core::{Config, Project, Stopwatch, SystemRunner, load_step_fractions};
use gridstitch_opt::{XyOptions, xy_optimize};
use std::path::{Path, PathBuf};

#[derive(clap::Args, Debug)]
#[command(disable_version_flag = true)]
pub struct Subcommand {
	/// project to work on
	#[arg(default_value = "out.pto")]
	pub pto_in: PathBuf,

	/// output file; defaults to overwriting the input
	#[arg()]
	pub pto_out: Option<PathBuf>,
}

/// RMS errors before and after optimization; before is unavailable when the
/// input has no positions yet.
pub struct ReoptReport {
	pub rms_initial: Option<f64>,
	pub rms_final: f64,
}

pub fn reoptimize(pto_in: &Path, pto_out: &Path, config: &Config) -> Result<ReoptReport> {
	let mut project = Project::from_file(pto_in)?;
	let rms_initial = project.rms_error().ok();
	if let Some(rms) = rms_initial {
		log::info!("initial RMS error: {rms:.3}");
	}

	let fractions = load_step_fractions(Path::new("."), config)?;
	xy_optimize(&mut project, config, fractions, &XyOptions::default())?;
	let rms_final = project.rms_error()?;
	log::info!("final RMS error: {rms_final:.3}");

	project.save_as(pto_out)?;
	fix_canvas(config, &SystemRunner, pto_out)?;

	Ok(ReoptReport {
		rms_initial,
		rms_final,
	})
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let watch = Stopwatch::start();
	let out = arguments.pto_out.as_deref().unwrap_or(&arguments.pto_in);
	log::info!("in: {}, out: {}", arguments.pto_in.display(), out.display());

	let config = Config::load()?;
	reoptimize(&arguments.pto_in, out, &config)?;
	log::info!("completed in {watch}");
	Ok(())
}
