//! The orchestrator: optimize, gate on RMS, tile.
//!
//! Feature detection stays external; the input project must already carry
//! control points. A stitch only proceeds to tiling when the optimized
//! RMS is acceptable: below 1.0 is a perfect stitch, around 2.0 still
//! fine, 5.0 means something is wrong with the capture.

use super::{reopt, ts};
use anyhow::{Result, bail};
use gridstitch_core::{Config, Project, Stopwatch, StitchError};
use gridstitch_tiler::TilerOptions;
use std::path::PathBuf;

#[derive(clap::Args, Debug)]
#[command(disable_version_flag = true)]
pub struct Subcommand {
	/// project with control points
	#[arg(default_value = "out.pto")]
	pub pto: PathBuf,

	/// skip tiling, only optimize
	#[arg(long)]
	pub no_ts: bool,

	/// tile only when the optimized RMS is at or below this
	#[arg(long, default_value_t = 2.0)]
	pub ts_rms: f64,

	/// abort when a supertile fails instead of skipping it
	#[arg(long)]
	pub no_ignore_errors: bool,

	/// output tile extension
	#[arg(long, default_value = ".jpg")]
	pub out_ext: String,
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let watch = Stopwatch::start();
	let config = Config::load()?;

	let project = Project::from_file(&arguments.pto)?;
	if project.control_points.is_empty() {
		bail!(StitchError::BadInput(
			"project has no control points; run the feature detector first".to_string()
		));
	}
	drop(project);

	log::info!("optimizing {}", arguments.pto.display());
	let report = reopt::reoptimize(&arguments.pto, &arguments.pto, &config)?;

	if arguments.no_ts {
		log::info!("tiling disabled; run it manually");
		return Ok(());
	}

	log::info!("RMS check: need {:.2} <= {:.2}", report.rms_final, arguments.ts_rms);
	if report.rms_final > arguments.ts_rms {
		bail!(StitchError::OptimizerFailed(format!(
			"rms {:.2} above the tiling threshold {:.2}; fix the capture or raise --ts-rms",
			report.rms_final, arguments.ts_rms
		)));
	}

	let settings = ts::TsSettings {
		options: TilerOptions {
			ignore_errors: !arguments.no_ignore_errors,
			ignore_crop: true,
			out_extension: arguments.out_ext.clone(),
			..TilerOptions::default()
		},
		..ts::TsSettings::default()
	};
	ts::tile_project(&arguments.pto, config, &settings)?;

	log::info!("stitch completed in {watch}");
	Ok(())
}
