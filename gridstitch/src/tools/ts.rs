//! The tile stitcher front end.
//!
//! Takes an optimized, cropped project and renders the output tile
//! directory through the supertile pipeline, then assembles the cached
//! supertiles into a single composite when they fit in memory.

use anyhow::Result;
use gridstitch_core::{Config, Project, Stopwatch, StitchError, SystemRunner, mem_to_pixels, parse_size};
use gridstitch_tiler::{PlanOptions, Tiler, TilerOptions, TilerReport, singlify};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(clap::Args, Debug)]
#[command(disable_version_flag = true)]
pub struct Subcommand {
	/// project to render
	#[arg(default_value = "out.pto")]
	pub pto: PathBuf,

	/// supertile width (size string)
	#[arg(long)]
	pub stw: Option<String>,

	/// supertile height (size string)
	#[arg(long)]
	pub sth: Option<String>,

	/// supertile pixel budget (size string, e.g. 600m)
	#[arg(long)]
	pub stp: Option<String>,

	/// supertile memory budget (size string, converted to pixels)
	#[arg(long)]
	pub stm: Option<String>,

	/// render everything as one supertile
	#[arg(long)]
	pub full: bool,

	/// supertile x step (advanced)
	#[arg(long)]
	pub st_xstep: Option<i64>,

	/// supertile y step (advanced)
	#[arg(long)]
	pub st_ystep: Option<i64>,

	/// clip buffer width (advanced)
	#[arg(long)]
	pub clip_width: Option<i64>,

	/// clip buffer height (advanced)
	#[arg(long)]
	pub clip_height: Option<i64>,

	/// abort when a supertile fails instead of skipping it
	#[arg(long)]
	pub no_ignore_errors: bool,

	/// require the project to be cropped
	#[arg(long)]
	pub no_ignore_crop: bool,

	/// extra arguments passed to the remapper
	#[arg(long)]
	pub nona_args: Option<String>,

	/// extra arguments passed to the blender
	#[arg(long)]
	pub enblend_args: Option<String>,

	/// serialize blender runs across processes with a lock file
	#[arg(long)]
	pub enblend_lock: bool,

	/// slower blender options that are more likely to succeed
	#[arg(long)]
	pub safer_mode: bool,

	/// disable seam optimization entirely
	#[arg(long)]
	pub safest_mode: bool,

	/// worker threads
	#[arg(long)]
	pub threads: Option<usize>,

	/// stop after this many supertiles (debug)
	#[arg(long)]
	pub st_limit: Option<usize>,

	/// calculate stitch parameters and exit
	#[arg(long)]
	pub dry: bool,

	/// output tile extension
	#[arg(long, default_value = ".jpg")]
	pub out_ext: String,

	/// output tile directory
	#[arg(long, default_value = "out")]
	pub out_dir: PathBuf,

	/// supertile cache directory
	#[arg(long, default_value = "st")]
	pub st_dir: PathBuf,

	/// log directory
	#[arg(long, default_value = "xyts")]
	pub log_dir: PathBuf,

	/// composite output directory; empty disables the composite
	#[arg(long, default_value = "single")]
	pub single_dir: PathBuf,

	/// composite file name
	#[arg(long, default_value = "out.jpg")]
	pub single_fn: String,
}

/// Everything `run` resolves before handing off to the tiler; `stitch`
/// builds this directly.
pub struct TsSettings {
	pub out_dir: PathBuf,
	pub st_dir: PathBuf,
	pub log_dir: PathBuf,
	pub single_target: Option<PathBuf>,
	pub options: TilerOptions,
}

impl Default for TsSettings {
	fn default() -> Self {
		TsSettings {
			out_dir: PathBuf::from("out"),
			st_dir: PathBuf::from("st"),
			log_dir: PathBuf::from("xyts"),
			single_target: Some(PathBuf::from("single/out.jpg")),
			options: TilerOptions {
				ignore_crop: true,
				..TilerOptions::default()
			},
		}
	}
}

/// Renders the tile directory and, when configured, the composite.
pub fn tile_project(pto: &Path, config: Config, settings: &TsSettings) -> Result<TilerReport> {
	let project = Project::from_file(pto)?;
	let origin = project.bounds().map(|b| (b.left, b.top))?;

	let mut tiler = Tiler::new(
		project,
		config,
		Arc::new(SystemRunner),
		&settings.out_dir,
		&settings.st_dir,
		&settings.log_dir,
		settings.options.clone(),
	)?;
	let report = tiler.run()?;

	if let Some(single_target) = &settings.single_target {
		if settings.options.dry {
			log::info!("dry run: skipping composite");
		} else {
			make_single(&settings.st_dir, origin, single_target)?;
		}
	}
	Ok(report)
}

fn make_single(st_dir: &Path, origin: (i64, i64), target: &Path) -> Result<()> {
	let mut st_files: Vec<PathBuf> = std::fs::read_dir(st_dir)?
		.filter_map(|e| e.ok().map(|e| e.path()))
		.filter(|p| {
			p.file_name()
				.and_then(|n| n.to_str())
				.is_some_and(|n| n.starts_with("st_") && n.ends_with(".jpg"))
		})
		.collect();
	st_files.sort();
	if st_files.is_empty() {
		log::warn!("no cached supertiles in {}; skipping the composite", st_dir.display());
		return Ok(());
	}

	if let Some(parent) = target.parent() {
		std::fs::create_dir_all(parent)?;
	}
	match singlify(&st_files, origin, target, gridstitch_tiler::DEFAULT_PIXEL_LIMIT) {
		Ok((w, h)) => log::info!("composite {}x{} written to {}", w, h, target.display()),
		Err(err) => match err.downcast_ref::<StitchError>() {
			Some(StitchError::HugeImage(pixels)) => {
				log::warn!("composite of {pixels} pixels exceeds the decompression limit, skipped");
			}
			_ => return Err(err),
		},
	}
	Ok(())
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let watch = Stopwatch::start();
	let mut config = Config::load()?;
	config.enblend_safer_mode = arguments.safer_mode;
	config.enblend_safest_mode = arguments.safest_mode;

	let stp = match (&arguments.stp, &arguments.stm) {
		(Some(stp), _) => Some(parse_size(stp)?),
		(None, Some(stm)) => Some(mem_to_pixels(parse_size(stm)?)),
		(None, None) => None,
	};

	let split_args = |s: &Option<String>| -> Vec<String> {
		s.as_deref()
			.map(|s| s.split_whitespace().map(str::to_string).collect())
			.unwrap_or_default()
	};

	let settings = TsSettings {
		out_dir: arguments.out_dir.clone(),
		st_dir: arguments.st_dir.clone(),
		log_dir: arguments.log_dir.clone(),
		single_target: if arguments.single_dir.as_os_str().is_empty() {
			None
		} else {
			Some(arguments.single_dir.join(&arguments.single_fn))
		},
		options: TilerOptions {
			plan: PlanOptions {
				stw: arguments.stw.as_deref().map(parse_size).transpose()?.map(|v| v as i64),
				sth: arguments.sth.as_deref().map(parse_size).transpose()?.map(|v| v as i64),
				stp,
				clip_width: arguments.clip_width,
				clip_height: arguments.clip_height,
				xstep: arguments.st_xstep,
				ystep: arguments.st_ystep,
				full: arguments.full,
				..PlanOptions::default()
			},
			threads: arguments.threads.unwrap_or(0),
			ignore_errors: !arguments.no_ignore_errors,
			ignore_crop: !arguments.no_ignore_crop,
			enblend_lock: arguments.enblend_lock,
			nona_args: split_args(&arguments.nona_args),
			enblend_args: split_args(&arguments.enblend_args),
			st_limit: arguments.st_limit,
			dry: arguments.dry,
			out_extension: arguments.out_ext.clone(),
		},
	};

	let report = tile_project(&arguments.pto, config, &settings)?;
	log::info!(
		"wrote {} tile(s) ({} failure(s)) in {watch}",
		report.tiles_written,
		report.failures
	);
	if report.stale_workers > 0 {
		anyhow::bail!(StitchError::StaleWorker(report.stale_workers));
	}
	Ok(())
}
