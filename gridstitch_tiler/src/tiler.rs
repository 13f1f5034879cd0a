//! The coordinator: owns the plan, the worker pool and every write to the
//! output tile directory.
//!
//! The loop never blocks: each cycle drains finished supertiles (slicing
//! them into output tiles) and feeds idle workers the next plan entry that
//! still has open tiles. Supertiles may finish in any order; a tile is
//! written exactly once because the coordinator is the only writer and
//! checks the open set before each write.

use crate::plan::{PlanOptions, StBounds, TilePlan};
use crate::profile;
use crate::tileset::{TileSet, tile_filename};
use crate::worker::{Worker, WorkerContext, WorkerReply, spawn_worker};
use anyhow::{Context, Result, bail};
use gridstitch_core::{CommandRunner, Config, Project, Stopwatch, StitchError, format_size, pixels_to_mem};
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Quality of the output tiles.
const TILE_JPEG_QUALITY: u8 = 95;
/// Hard cap on supertile pixels, whatever the configuration says.
const ST_PIXEL_CAP: u64 = 1 << 30;
/// Warn when nothing has progressed for this long.
const STALL_WARN_AFTER: Duration = Duration::from_secs(4 * 60 * 60);
/// Memory sampling interval.
const PROFILE_EVERY: Duration = Duration::from_secs(5);
/// Per-worker shutdown grace.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TilerOptions {
	pub plan: PlanOptions,
	/// Worker threads; 0 derives from CPU count and the memory budget.
	pub threads: usize,
	/// Keep going when a supertile fails (the default); strict mode aborts.
	pub ignore_errors: bool,
	/// Allow tiling an uncropped project.
	pub ignore_crop: bool,
	pub enblend_lock: bool,
	pub nona_args: Vec<String>,
	pub enblend_args: Vec<String>,
	/// Stop after this many supertiles (debug).
	pub st_limit: Option<usize>,
	/// Plan and report without producing anything.
	pub dry: bool,
	pub out_extension: String,
}

impl Default for TilerOptions {
	fn default() -> Self {
		TilerOptions {
			plan: PlanOptions::default(),
			threads: 0,
			ignore_errors: true,
			ignore_crop: false,
			enblend_lock: false,
			nona_args: Vec::new(),
			enblend_args: Vec::new(),
			st_limit: None,
			dry: false,
			out_extension: ".jpg".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct TilerReport {
	pub tiles_written: usize,
	pub total_tiles: usize,
	pub supertiles_processed: usize,
	pub failures: usize,
	pub stale_workers: usize,
	pub peak_mem: u64,
}

/// Worker count and supertile pixel budget for the available memory.
///
/// The pixel budget is capped at 2^30 to bound the worst-case allocation;
/// the worker count is however many supertiles fit in the memory budget at
/// ~20 bytes/pixel, at most one per CPU, and never less than one.
pub fn derive_workers(config: &Config, stp: u64) -> (usize, u64) {
	let stp = stp.min(ST_PIXEL_CAP);
	let per_st_mem = pixels_to_mem(stp).max(1);
	let max_safe = (config.max_mem / per_st_mem) as usize;
	let threads = config.threads().min(max_safe).max(1);
	log::info!(
		"memory {}B fits {max_safe} concurrent supertile(s) of {} pixels; using {threads} worker(s)",
		format_size(config.max_mem),
		format_size(stp),
	);
	(threads, stp)
}

pub struct Tiler {
	project: Project,
	config: Config,
	runner: Arc<dyn CommandRunner>,
	out_dir: PathBuf,
	st_dir: PathBuf,
	log_dir: PathBuf,
	options: TilerOptions,
	plan: TilePlan,
	threads: usize,
	tiles: TileSet,
	running: Arc<AtomicBool>,
}

impl std::fmt::Debug for Tiler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Tiler")
			.field("project", &self.project)
			.field("config", &self.config)
			.field("out_dir", &self.out_dir)
			.field("st_dir", &self.st_dir)
			.field("log_dir", &self.log_dir)
			.field("options", &self.options)
			.field("plan", &self.plan)
			.field("threads", &self.threads)
			.field("tiles", &self.tiles)
			.field("running", &self.running)
			.finish()
	}
}

impl Tiler {
	pub fn new(
		project: Project,
		config: Config,
		runner: Arc<dyn CommandRunner>,
		out_dir: &Path,
		st_dir: &Path,
		log_dir: &Path,
		options: TilerOptions,
	) -> Result<Tiler> {
		if project.crop().is_none() && !options.ignore_crop {
			bail!(StitchError::BadInput(
				"project is not cropped; crop it or pass the ignore-crop override".to_string()
			));
		}
		let (img_w, img_h, _fov) = project.verify_uniform_images()?;
		let bounds = project.bounds()?;

		// resolve the supertile sizing policy against the config defaults
		let mut plan_options = options.plan.clone();
		let explicit_size = plan_options.stw.is_some() || plan_options.sth.is_some() || plan_options.full;
		if let Some(stp) = plan_options.stp {
			plan_options.stp = Some(stp.min(ST_PIXEL_CAP));
		} else if !explicit_size {
			plan_options.stp = Some(config.st_max_pix.min(ST_PIXEL_CAP));
		}

		let plan = TilePlan::new(bounds, img_w, img_h, &plan_options)?;
		let threads = if plan.is_full() {
			// one supertile, no point in a pool
			1
		} else if options.threads > 0 {
			options.threads
		} else {
			derive_workers(&config, plan.supertile_pixels()).0
		};

		let rows = plan.rows();
		let cols = plan.cols();
		Ok(Tiler {
			project,
			config,
			runner,
			out_dir: out_dir.to_path_buf(),
			st_dir: st_dir.to_path_buf(),
			log_dir: log_dir.to_path_buf(),
			options,
			plan,
			threads,
			tiles: TileSet::new(rows, cols),
			running: Arc::new(AtomicBool::new(true)),
		})
	}

	/// Shared cancellation flag; clear it to stop the run after the current
	/// subprocesses finish.
	pub fn cancel_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.running)
	}

	pub fn run(&mut self) -> Result<TilerReport> {
		let watch = Stopwatch::start();
		log::info!(
			"tiling {}x{} canvas into {} tiles ({} rows x {} cols) with {} worker(s)",
			self.plan.width(),
			self.plan.height(),
			self.plan.expected_tiles(),
			self.plan.rows(),
			self.plan.cols(),
			self.threads,
		);

		std::fs::create_dir_all(&self.out_dir)?;
		std::fs::create_dir_all(&self.st_dir)?;
		std::fs::create_dir_all(&self.log_dir)?;
		self.tiles.seed_from_dir(&self.out_dir)?;
		self.tiles.dump(&self.log_dir, "begin_")?;

		let entries = self.plan.supertiles();
		log::info!("plan: {} supertile(s)", entries.len());

		let mut report = TilerReport {
			total_tiles: self.tiles.total(),
			..TilerReport::default()
		};

		if self.options.dry {
			log::info!("dry run: stopping after planning");
			return Ok(report);
		}

		let context = Arc::new(WorkerContext {
			project: self.project.clone(),
			config: self.config.clone(),
			st_dir: self.st_dir.clone(),
			runner: Arc::clone(&self.runner),
			nona_args: self.options.nona_args.clone(),
			enblend_args: self.options.enblend_args.clone(),
			enblend_lock: self.options.enblend_lock,
		});
		let workers: Vec<Worker> = (0..self.threads)
			.map(|i| spawn_worker(i, Arc::clone(&context), Arc::clone(&self.running)))
			.collect::<Result<_>>()?;

		let result = self.event_loop(&workers, &entries, &mut report);

		report.stale_workers = shutdown(&workers, &self.running);
		self.tiles.dump(&self.log_dir, "final_")?;
		result?;

		log::info!(
			"processed {} supertile(s), wrote {} tile(s) ({} / {} closed) in {watch}, peak memory {}B",
			report.supertiles_processed,
			report.tiles_written,
			self.tiles.closed_count(),
			report.total_tiles,
			format_size(report.peak_mem),
		);

		if self.tiles.closed_count() != report.total_tiles {
			log::error!(
				"expected {} tiles but only {} are done; first missing: {:?}",
				report.total_tiles,
				self.tiles.closed_count(),
				self.tiles.first_open(10),
			);
			if !self.options.ignore_errors {
				bail!(StitchError::BadInput(format!(
					"tile set incomplete: {} of {} missing",
					self.tiles.open_count(),
					report.total_tiles
				)));
			}
		}
		Ok(report)
	}

	fn event_loop(&mut self, workers: &[Worker], entries: &[StBounds], report: &mut TilerReport) -> Result<()> {
		let mut next = 0usize;
		let mut in_flight = vec![0usize; workers.len()];
		let mut last_progress = Instant::now();
		let mut last_profile = Instant::now() - PROFILE_EVERY;
		let mut stop_submitting = false;

		loop {
			let mut progress = false;

			for worker in workers {
				while let Ok(reply) = worker.replies.try_recv() {
					progress = true;
					report.supertiles_processed += 1;
					match reply {
						WorkerReply::Done { worker: id, bounds, path } => {
							in_flight[id] -= 1;
							log::info!("worker {id}: finished supertile {bounds:?}");
							report.tiles_written += self.slice_supertile(&path, &bounds)?;
						}
						WorkerReply::Failed { worker: id, bounds, error } => {
							in_flight[id] -= 1;
							report.failures += 1;
							log::error!("worker {id}: supertile {bounds:?} failed: {error}");
							if !self.options.ignore_errors {
								bail!(StitchError::CommandFailed {
									command: "supertile".to_string(),
									stderr: error,
								});
							}
							log::warn!("continuing despite supertile failure");
						}
					}
					if let Some(limit) = self.options.st_limit {
						if report.supertiles_processed >= limit {
							log::warn!("supertile limit {limit} reached, stopping submission");
							stop_submitting = true;
						}
					}
				}
			}

			if !self.running.load(Ordering::SeqCst) {
				log::warn!("cancelled; letting outstanding work drain");
				stop_submitting = true;
			}

			for worker in workers {
				if stop_submitting || in_flight[worker.id] > 0 {
					continue;
				}
				while next < entries.len() {
					let bounds = entries[next];
					next += 1;
					let wanted = self
						.plan
						.tiles_in_supertile(&bounds)?
						.iter()
						.filter(|t| !self.tiles.is_closed(t.row, t.col))
						.count();
					if wanted == 0 {
						log::info!("skipping supertile {bounds:?}: no tiles needed");
						continue;
					}
					log::info!(
						"submitting supertile {} / {} ({bounds:?}, {wanted} tile(s) wanted) to worker {}",
						next,
						entries.len(),
						worker.id,
					);
					worker.jobs.send(bounds).context("worker job queue closed")?;
					in_flight[worker.id] += 1;
					progress = true;
					break;
				}
			}

			if last_profile.elapsed() >= PROFILE_EVERY {
				report.peak_mem = report.peak_mem.max(profile::self_subtree_rss());
				last_profile = Instant::now();
			}

			let outstanding: usize = in_flight.iter().sum();
			if (next >= entries.len() || stop_submitting) && outstanding == 0 {
				return Ok(());
			}

			if progress {
				last_progress = Instant::now();
			} else {
				if last_progress.elapsed() >= STALL_WARN_AFTER {
					log::warn!("no progress for {}s; workers may be stuck", last_progress.elapsed().as_secs());
					last_progress = Instant::now();
				}
				std::thread::sleep(Duration::from_millis(20));
			}
		}
	}

	/// Cuts every still-open tile of this supertile out of the finished
	/// raster. Partial tiles on canvas edges are padded with black.
	fn slice_supertile(&mut self, path: &Path, bounds: &StBounds) -> Result<usize> {
		let raster = image::open(path)
			.with_context(|| format!("loading supertile {}", path.display()))?
			.to_rgb8();
		let (tw, th) = (self.plan.tile_width(), self.plan.tile_height());

		let mut written = 0;
		for tile in self.plan.tiles_in_supertile(bounds)? {
			if self.tiles.is_closed(tile.row, tile.col) {
				continue;
			}
			let x_off = tile.x - bounds.x0;
			let y_off = tile.y - bounds.y0;
			let copy_w = (i64::from(raster.width()) - x_off).clamp(0, tw);
			let copy_h = (i64::from(raster.height()) - y_off).clamp(0, th);
			if copy_w == 0 || copy_h == 0 {
				continue;
			}

			let mut out = RgbImage::new(tw as u32, th as u32);
			let view = image::imageops::crop_imm(&raster, x_off as u32, y_off as u32, copy_w as u32, copy_h as u32);
			image::imageops::replace(&mut out, &view.to_image(), 0, 0);

			let tile_path = self.out_dir.join(tile_filename(tile.row, tile.col, &self.options.out_extension));
			save_tile(&out, &tile_path)?;
			self.tiles.mark_closed(tile.row, tile.col);
			written += 1;
		}
		if written == 0 {
			log::warn!("supertile {bounds:?}: {}", StitchError::NoTilesGenerated);
		} else {
			log::info!(
				"sliced {written} tile(s) from supertile {bounds:?} ({} / {} total)",
				self.tiles.closed_count(),
				self.tiles.total(),
			);
		}
		Ok(written)
	}
}

fn save_tile(img: &RgbImage, path: &Path) -> Result<()> {
	if path.extension().is_some_and(|e| e == "jpg" || e == "jpeg") {
		let mut file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
		JpegEncoder::new_with_quality(&mut file, TILE_JPEG_QUALITY)
			.encode_image(img)
			.with_context(|| format!("encoding {}", path.display()))?;
	} else {
		img.save(path).with_context(|| format!("writing {}", path.display()))?;
	}
	Ok(())
}

/// Stops the pool: clears the running flag, grants each worker a short
/// grace period, and reports how many failed to stop.
fn shutdown(workers: &[Worker], running: &AtomicBool) -> usize {
	running.store(false, Ordering::SeqCst);
	let mut stale = 0;
	for worker in workers {
		let deadline = Instant::now() + SHUTDOWN_GRACE;
		while !worker.finished.load(Ordering::SeqCst) && Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(10));
		}
		if worker.finished.load(Ordering::SeqCst) {
			log::debug!("worker {}: stopped", worker.id);
		} else {
			log::warn!("worker {}: did not stop within the grace period", worker.id);
			stale += 1;
		}
	}
	stale
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testutil::{FakeStitchRunner, canvas_color, test_project};
	use std::sync::Mutex;

	struct Setup {
		_root: tempfile::TempDir,
		out_dir: PathBuf,
		st_dir: PathBuf,
		log_dir: PathBuf,
	}

	fn setup() -> Setup {
		let root = tempfile::tempdir().unwrap();
		let out_dir = root.path().join("out");
		let st_dir = root.path().join("st");
		let log_dir = root.path().join("log");
		Setup {
			out_dir,
			st_dir,
			log_dir,
			_root: root,
		}
	}

	fn options() -> TilerOptions {
		TilerOptions {
			plan: PlanOptions {
				stw: Some(800),
				sth: Some(800),
				clip_width: Some(100),
				clip_height: Some(100),
				..PlanOptions::default()
			},
			threads: 2,
			..TilerOptions::default()
		}
	}

	fn build(setup: &Setup, runner: Arc<FakeStitchRunner>, options: TilerOptions) -> Tiler {
		Tiler::new(
			test_project(),
			Config::default(),
			runner,
			&setup.out_dir,
			&setup.st_dir,
			&setup.log_dir,
			options,
		)
		.unwrap()
	}

	#[test]
	fn full_run_produces_every_tile() {
		let setup = setup();
		let runner = Arc::new(FakeStitchRunner::default());
		let mut tiler = build(&setup, runner, options());
		let report = tiler.run().unwrap();

		assert_eq!(report.total_tiles, 16);
		assert_eq!(report.tiles_written, 16);
		assert_eq!(report.failures, 0);
		assert_eq!(report.stale_workers, 0);

		for row in 0..4 {
			for col in 0..4 {
				let path = setup.out_dir.join(format!("y{row:03}_x{col:03}.jpg"));
				let tile = image::open(&path).unwrap().to_rgb8();
				assert_eq!((tile.width(), tile.height()), (250, 250));
			}
		}

		// tile (0,0) holds canvas pixel (0,0); JPEG is lossy, allow slack
		let tile = image::open(setup.out_dir.join("y000_x000.jpg")).unwrap().to_rgb8();
		let expected = canvas_color(0, 0);
		let got = tile.get_pixel(0, 0);
		for channel in 0..3 {
			assert!(
				(i32::from(got[channel]) - i32::from(expected[channel])).abs() <= 10,
				"channel {channel}: {got:?} vs {expected:?}"
			);
		}

		// a mid-canvas tile carries the right region of the mosaic
		let tile = image::open(setup.out_dir.join("y001_x002.jpg")).unwrap().to_rgb8();
		let expected = canvas_color(500, 250);
		let got = tile.get_pixel(0, 0);
		assert!((i32::from(got[0]) - i32::from(expected[0])).abs() <= 10);
		assert!((i32::from(got[1]) - i32::from(expected[1])).abs() <= 10);
	}

	#[test]
	fn bottom_edge_tiles_are_padded_black() {
		let setup = setup();
		let runner = Arc::new(FakeStitchRunner::default());
		let mut tiler = build(&setup, runner, options());
		tiler.run().unwrap();

		// canvas is 800 high, row 3 starts at y=750: only 50 px of content
		let tile = image::open(setup.out_dir.join("y003_x000.jpg")).unwrap().to_rgb8();
		let pixel = tile.get_pixel(10, 200);
		assert!(pixel[0] <= 10 && pixel[1] <= 10 && pixel[2] <= 10, "expected padding, got {pixel:?}");
	}

	#[test]
	fn restart_finds_nothing_to_do() {
		let setup = setup();
		let runner = Arc::new(FakeStitchRunner::default());
		let mut tiler = build(&setup, Arc::clone(&runner), options());
		tiler.run().unwrap();
		let calls_after_first = runner.calls.lock().unwrap().len();
		assert!(calls_after_first > 0);

		let mut tiler = build(&setup, Arc::clone(&runner), options());
		let report = tiler.run().unwrap();
		assert_eq!(report.tiles_written, 0);
		assert_eq!(report.supertiles_processed, 0);
		// no external tool ran again
		assert_eq!(runner.calls.lock().unwrap().len(), calls_after_first);
	}

	#[test]
	fn partial_restart_reuses_supertile_cache() {
		let setup = setup();
		let runner = Arc::new(FakeStitchRunner::default());
		let mut tiler = build(&setup, Arc::clone(&runner), options());
		tiler.run().unwrap();

		// drop half the output tiles but keep the supertile cache
		for col in 0..4 {
			std::fs::remove_file(setup.out_dir.join(format!("y001_x{col:03}.jpg"))).unwrap();
		}
		let calls_before = runner.calls.lock().unwrap().len();

		let mut tiler = build(&setup, Arc::clone(&runner), options());
		let report = tiler.run().unwrap();
		assert_eq!(report.tiles_written, 4);
		// the cache short-circuit kept the external tools idle
		assert_eq!(runner.calls.lock().unwrap().len(), calls_before);

		for col in 0..4 {
			assert!(setup.out_dir.join(format!("y001_x{col:03}.jpg")).exists());
		}
	}

	#[test]
	fn lenient_mode_skips_failed_supertile() {
		// the supertile at x=200 is the only producer of the last column
		let setup = setup();
		let runner = Arc::new(FakeStitchRunner {
			fail_on_left: Mutex::new(Some(200)),
			..FakeStitchRunner::default()
		});
		let mut tiler = build(&setup, runner, options());
		let report = tiler.run().unwrap();
		assert_eq!(report.failures, 1);
		// column 3 never got produced, everything else did
		assert_eq!(report.tiles_written, 12);
		assert!(!setup.out_dir.join("y000_x003.jpg").exists());
		assert!(setup.out_dir.join("y000_x002.jpg").exists());
	}

	#[test]
	fn strict_mode_aborts_on_failure() {
		let setup = setup();
		let runner = Arc::new(FakeStitchRunner {
			fail_on_left: Mutex::new(Some(0)),
			..FakeStitchRunner::default()
		});
		let mut options = options();
		options.ignore_errors = false;
		let mut tiler = build(&setup, runner, options);
		let err = tiler.run().unwrap_err();
		assert!(matches!(
			err.downcast_ref::<StitchError>(),
			Some(StitchError::CommandFailed { .. })
		));
	}

	#[test]
	fn uncropped_project_rejected() {
		let setup = setup();
		let mut project = test_project();
		project.uncrop();
		let err = Tiler::new(
			project,
			Config::default(),
			Arc::new(FakeStitchRunner::default()),
			&setup.out_dir,
			&setup.st_dir,
			&setup.log_dir,
			options(),
		)
		.unwrap_err();
		assert!(matches!(err.downcast_ref::<StitchError>(), Some(StitchError::BadInput(_))));
	}

	#[test]
	fn dry_run_writes_nothing() {
		let setup = setup();
		let runner = Arc::new(FakeStitchRunner::default());
		let mut opts = options();
		opts.dry = true;
		let mut tiler = build(&setup, Arc::clone(&runner), opts);
		let report = tiler.run().unwrap();
		assert_eq!(report.tiles_written, 0);
		assert!(runner.calls.lock().unwrap().is_empty());
		assert_eq!(std::fs::read_dir(&setup.out_dir).unwrap().count(), 0);
	}

	#[test]
	fn state_dumps_written() {
		let setup = setup();
		let runner = Arc::new(FakeStitchRunner::default());
		let mut tiler = build(&setup, runner, options());
		tiler.run().unwrap();
		assert!(setup.log_dir.join("begin_open_list.txt").exists());
		assert!(setup.log_dir.join("final_closed_list.txt").exists());
		let closed = std::fs::read_to_string(setup.log_dir.join("final_closed_list.txt")).unwrap();
		assert_eq!(closed.lines().count(), 16);
	}

	#[test]
	fn memory_cap_clamps_workers() {
		// 1 GB budget with 100 MP supertiles fits zero concurrent
		// supertiles; the count clamps to a single worker
		let mut config = Config::default();
		config.max_mem = 1_000_000_000;
		config.threads = 0;
		let (threads, stp) = derive_workers(&config, 100_000_000);
		assert_eq!(threads, 1);
		assert_eq!(stp, 100_000_000);
	}

	#[test]
	fn pixel_budget_capped() {
		let config = Config::default();
		let (_, stp) = derive_workers(&config, u64::MAX);
		assert_eq!(stp, 1 << 30);
	}
}
