//! Supertile workers.
//!
//! Each worker owns a read-only clone of the project and loops on its job
//! queue: crop, remap, blend, cache. The heavy lifting happens in external
//! subprocesses, so a worker thread is mostly bookkeeping plus one image
//! re-encode; crashes of the external tools surface as typed failure
//! replies rather than taking the process down.

use crate::blender::Blender;
use crate::plan::StBounds;
use crate::remapper::Remapper;
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use gridstitch_core::{CommandRunner, Config, Project};
use image::codecs::jpeg::JpegEncoder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Quality of the supertile cache files.
const ST_JPEG_QUALITY: u8 = 90;

/// Everything a worker needs, shared read-only.
pub struct WorkerContext {
	pub project: Project,
	pub config: Config,
	pub st_dir: PathBuf,
	pub runner: Arc<dyn CommandRunner>,
	pub nona_args: Vec<String>,
	pub enblend_args: Vec<String>,
	pub enblend_lock: bool,
}

/// Outbound message from a worker.
#[derive(Debug)]
pub enum WorkerReply {
	Done {
		worker: usize,
		bounds: StBounds,
		path: PathBuf,
	},
	Failed {
		worker: usize,
		bounds: StBounds,
		error: String,
	},
}

/// Handle the coordinator keeps per worker.
pub struct Worker {
	pub id: usize,
	pub jobs: Sender<StBounds>,
	pub replies: Receiver<WorkerReply>,
	pub finished: Arc<AtomicBool>,
}

pub fn spawn_worker(id: usize, context: Arc<WorkerContext>, running: Arc<AtomicBool>) -> Result<Worker> {
	let (job_tx, job_rx) = bounded::<StBounds>(1);
	let (reply_tx, reply_rx) = bounded::<WorkerReply>(4);
	let finished = Arc::new(AtomicBool::new(false));

	let thread_finished = Arc::clone(&finished);
	std::thread::Builder::new()
		.name(format!("st-worker-{id}"))
		.spawn(move || {
			run_worker(id, &context, &running, &job_rx, &reply_tx);
			thread_finished.store(true, Ordering::SeqCst);
		})
		.context("spawning worker thread")?;

	Ok(Worker {
		id,
		jobs: job_tx,
		replies: reply_rx,
		finished,
	})
}

fn run_worker(
	id: usize,
	context: &WorkerContext,
	running: &AtomicBool,
	jobs: &Receiver<StBounds>,
	replies: &Sender<WorkerReply>,
) {
	log::debug!("worker {id}: starting");
	while running.load(Ordering::SeqCst) {
		let bounds = match jobs.recv_timeout(Duration::from_millis(100)) {
			Ok(bounds) => bounds,
			Err(RecvTimeoutError::Timeout) => continue,
			Err(RecvTimeoutError::Disconnected) => break,
		};

		let reply = match try_supertile(id, context, &bounds) {
			Ok(path) => WorkerReply::Done {
				worker: id,
				bounds,
				path,
			},
			Err(error) => WorkerReply::Failed {
				worker: id,
				bounds,
				error: format!("{error:#}"),
			},
		};
		if replies.send(reply).is_err() {
			break;
		}
	}
	log::debug!("worker {id}: exiting");
}

/// Produces (or finds) the cached image for one supertile.
fn try_supertile(id: usize, context: &WorkerContext, bounds: &StBounds) -> Result<PathBuf> {
	let dst = context.st_dir.join(bounds.cache_filename());
	if dst.exists() {
		log::info!("worker {id}: supertile short circuit on existing {}", dst.display());
		return Ok(dst);
	}

	let scratch = tempfile::Builder::new()
		.prefix(&format!("st_{:06}x_{:06}y_", bounds.x0, bounds.y0))
		.tempdir()
		.context("creating supertile scratch directory")?;

	// a fresh project cropped to this supertile; control points are
	// irrelevant to remapping and only bloat the file
	let mut pto = context.project.copy_without_control_points();
	pto.set_crop(bounds.x0, bounds.x1, bounds.y0, bounds.y1);
	let dropped = pto.remove_low_overlap_images(context.config.overlap_threshold)?;
	if dropped > 0 {
		log::debug!("worker {id}: dropped {dropped} image(s) with insufficient overlap");
	}
	let pto_path = scratch.path().join("st.pto");
	pto.save_as(&pto_path)?;

	log::info!("worker {id}: remapping supertile {bounds:?}");
	let mut remapper = Remapper::new(context.runner.as_ref(), &context.config.tools.nona);
	remapper.extra_args = context.nona_args.clone();
	let remapped = remapper.remap(&pto_path, &scratch.path().join("st_"), scratch.path())?;

	log::info!("worker {id}: blending {} remapped image(s)", remapped.len());
	let mut blender = Blender::new(context.runner.as_ref(), &context.config);
	blender.extra_args = context.enblend_args.clone();
	blender.lock = context.enblend_lock;
	let blended = scratch.path().join("blended.tif");
	blender.blend(&remapped, &blended, scratch.path())?;

	save_jpeg(&blended, &dst, ST_JPEG_QUALITY)?;

	if context.config.keep_temp {
		let kept = scratch.keep();
		log::info!("worker {id}: keeping scratch {}", kept.display());
	}
	log::info!("worker {id}: supertile ready at {}", dst.display());
	Ok(dst)
}

fn save_jpeg(src: &Path, dst: &Path, quality: u8) -> Result<()> {
	let img = image::open(src)
		.with_context(|| format!("loading blended supertile {}", src.display()))?
		.to_rgb8();
	let mut file = std::fs::File::create(dst).with_context(|| format!("creating {}", dst.display()))?;
	JpegEncoder::new_with_quality(&mut file, quality)
		.encode_image(&img)
		.with_context(|| format!("encoding {}", dst.display()))?;
	Ok(())
}

/// Runs one supertile synchronously, bypassing the queues. Lets a caller
/// (and the tests) exercise the exact worker path without a pool.
pub fn run_supertile_inline(context: &WorkerContext, bounds: &StBounds) -> Result<PathBuf> {
	try_supertile(0, context, bounds)
}
