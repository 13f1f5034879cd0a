//! Project manipulations: cropping, renaming, optimizing.

use super::parse_anchor;
use anyhow::{Result, ensure};
use gridstitch_core::{Config, Project, Stopwatch, SystemRunner, load_step_fractions};
use gridstitch_opt::{PtOptimizer, XyOptions, xy_optimize};
use std::path::{Path, PathBuf};

#[derive(clap::Args, Debug)]
#[command(arg_required_else_help = true, disable_version_flag = true)]
pub struct Subcommand {
	/// project to work on
	#[arg()]
	pto: PathBuf,

	/// output file; defaults to overwriting the input
	#[arg()]
	out: Option<PathBuf>,

	/// set a new crop as left,right,top,bottom and drop unused images
	#[arg(long, value_name = "l,r,t,b", allow_hyphen_values = true)]
	crop: Option<String>,

	/// strip image file names down to their basename
	#[arg(long)]
	basename: bool,

	/// center the project on the canvas
	#[arg(long)]
	center: bool,

	/// skip the default centering after an optimizer pass
	#[arg(long, conflicts_with = "center")]
	no_center: bool,

	/// mark image positions as optimizable
	#[arg(long)]
	set_optimize_xy: bool,

	/// run the statistical xy optimizer
	#[arg(long)]
	xy_opt: bool,

	/// run the external non-linear optimizer
	#[arg(long)]
	ptoptimizer: bool,

	/// keep previous positions as the optimizer starting point
	#[arg(long)]
	no_reoptimize: bool,

	/// xy-opt: keep pair deltas within n standard deviations
	#[arg(long, default_value_t = 3.0)]
	stdev: f64,

	/// xy-opt: anchor at col,row instead of searching from the center
	#[arg(long, value_name = "col,row")]
	anchor_cr: Option<String>,

	/// xy-opt: skip the placement sanity check
	#[arg(long)]
	no_check_poor_opt: bool,
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let watch = Stopwatch::start();
	let out = arguments.out.as_deref().unwrap_or(&arguments.pto);
	log::info!("in: {}, out: {}", arguments.pto.display(), out.display());

	let config = Config::load()?;
	let mut project = Project::from_file(&arguments.pto)?;

	if let Some(crop) = &arguments.crop {
		let parts: Vec<i64> = crop.split(',').map(|p| p.trim().parse()).collect::<Result<_, _>>()?;
		ensure!(parts.len() == 4, "crop needs left,right,top,bottom");
		project.set_crop(parts[0], parts[1], parts[2], parts[3]);
		let dropped = project.remove_low_overlap_images(config.overlap_threshold)?;
		log::info!("crop set; dropped {dropped} image(s) outside it");
	}

	if arguments.basename {
		log::info!("converting image names to basename");
		project.make_basename();
	}

	if arguments.set_optimize_xy {
		project.set_optimize_xy();
	}

	if arguments.xy_opt {
		log::info!("running statistical optimizer");
		let fractions = load_step_fractions(Path::new("."), &config)?;
		let options = XyOptions {
			stdev: Some(arguments.stdev),
			anchor_cr: arguments.anchor_cr.as_deref().map(parse_anchor).transpose()?,
			check_poor_opt: !arguments.no_check_poor_opt,
		};
		xy_optimize(&mut project, &config, fractions, &options)?;
		if !arguments.no_center {
			project.center()?;
		}
	}

	if arguments.ptoptimizer {
		log::info!("running external optimizer");
		let runner = SystemRunner;
		let mut optimizer = PtOptimizer::new(&runner, &config);
		optimizer.reoptimize = !arguments.no_reoptimize;
		optimizer.run(&mut project)?;
		if !arguments.no_center {
			project.center()?;
		}
	}

	if arguments.center {
		log::info!("centering");
		project.center()?;
	}

	log::info!("saving to {}", out.display());
	project.save_as(out)?;
	log::info!("completed in {watch}");
	Ok(())
}
