//! Driver for the external non-linear position optimizer.
//!
//! The binary is picky about its input: it rejects unknown panorama keys,
//! needs a sub-180 FOV everywhere, and silently reuses stale positions
//! unless they are zeroed. `prepare` strips a cloned project down to what
//! the tool accepts, `run` invokes it and folds the resulting `o`-line
//! positions back into the original project.

use anyhow::{Context, Result, bail};
use gridstitch_core::{CommandRunner, Config, Project, StitchError};
use std::path::{Path, PathBuf};

/// Keys the external optimizer tolerates on an image line.
const IMAGE_KEY_WHITELIST: &[&str] = &[
	"w", "h", "f", "Va", "Vb", "Vc", "Vd", "Vx", "Vy", "d", "e", "g", "t", "v", "Vm", "n",
];

pub struct PtOptimizer<'a> {
	runner: &'a dyn CommandRunner,
	tool: String,
	debug_path: PathBuf,
	/// Abort when the reported RMS exceeds this; around 25 is normal, so a
	/// large value here signals a real problem. `None` disables the check.
	pub rms_threshold: Option<f64>,
	/// Zero out previous positions so the tool cannot anchor on them.
	pub reoptimize: bool,
}

impl<'a> PtOptimizer<'a> {
	pub fn new(runner: &'a dyn CommandRunner, config: &Config) -> PtOptimizer<'a> {
		PtOptimizer {
			runner,
			tool: config.tools.ptoptimizer.clone(),
			debug_path: PathBuf::from(format!("{}optimizer_failed.pto", config.temp_base)),
			rms_threshold: Some(250.0),
			reoptimize: true,
		}
	}

	/// Optimizes `project` in place and returns the reported RMS error.
	pub fn run(&self, project: &mut Project) -> Result<f64> {
		project.verify_uniform_images()?;

		let mut prepared = project.clone();
		prepare(&mut prepared, self.reoptimize)?;

		let scratch = tempfile::tempdir().context("creating optimizer scratch directory")?;
		let pto_path = scratch.path().join("opt.pto");
		prepared.save_as(&pto_path)?;

		let output = self
			.runner
			.run(&self.tool, &[pto_path.to_string_lossy().to_string()], None)?;
		if !output.success() {
			// keep the failing input around for inspection
			if let Err(err) = prepared.save_as(&self.debug_path) {
				log::warn!("could not persist failing project: {err}");
			} else {
				log::error!("failing project saved to {}", self.debug_path.display());
			}
			bail!(StitchError::OptimizerFailed(format!(
				"{} exited with status {}: {}",
				self.tool,
				output.status,
				output.stderr.trim()
			)));
		}

		// the tool rewrites the project file in place, appending o-lines
		// and a comment like "# final rms error 24.0394 units"
		let optimized = Project::from_file(&pto_path)?;
		let rms = parse_rms(&optimized)
			.ok_or_else(|| StitchError::OptimizerFailed("optimizer reported no rms error".to_string()))?;
		log::info!("optimizer RMS error: {rms:.4}");
		if let Some(threshold) = self.rms_threshold {
			if rms > threshold {
				bail!(StitchError::OptimizerFailed(format!(
					"rms error {rms:.1} exceeds threshold {threshold:.1}"
				)));
			}
		}

		merge(project, &optimized)?;
		Ok(rms)
	}
}

fn parse_rms(project: &Project) -> Option<f64> {
	for comment in &project.comments {
		if let Some(rest) = comment.trim().strip_prefix("final rms error") {
			return rest.split_whitespace().next()?.parse().ok();
		}
	}
	None
}

/// Strips a project down to what the external optimizer accepts.
pub fn prepare(project: &mut Project, reoptimize: bool) -> Result<()> {
	let pl = &mut project.panorama;
	pl.exposure = None;
	pl.response = None;
	pl.extras.remove("E");
	pl.extras.remove("R");
	if pl.fov.is_none_or(|v| v >= 180.0) {
		log::debug!("clamping panorama field of view to 179");
		pl.fov = Some(179.0);
	}

	for il in &mut project.images {
		if il.fov.is_none_or(|v| v >= 180.0) {
			il.fov = Some(51.0);
		}

		// some toolchains write -1 dimensions; recover them from the file
		if il.width.is_none_or(|w| w <= 0) || il.height.is_none_or(|h| h <= 0) {
			let fn_ = il.filename()?.to_string();
			let (w, h) = image::image_dimensions(Path::new(&fn_))
				.with_context(|| format!("reading dimensions of {fn_}"))?;
			il.width = Some(i64::from(w));
			il.height = Some(i64::from(h));
		}

		if reoptimize || il.x.is_none() {
			il.x = Some(0.0);
		}
		if reoptimize || il.y.is_none() {
			il.y = Some(0.0);
		}

		il.retain_extras(IMAGE_KEY_WHITELIST);
	}
	Ok(())
}

/// Copies the optimized positions back onto the original project, matching
/// `o` lines to `i` lines by order.
pub fn merge(project: &mut Project, optimized: &Project) -> Result<()> {
	let base_n = project.images.len();
	let opt_n = optimized.optimizer_outputs.len();
	if base_n != opt_n {
		bail!(StitchError::OptimizerFailed(format!(
			"optimizer returned {opt_n} position lines for {base_n} images"
		)));
	}
	for (il, ol) in project.images.iter_mut().zip(&optimized.optimizer_outputs) {
		il.x = Some(ol.x.context("optimizer line missing d")?);
		il.y = Some(ol.y.context("optimizer line missing e")?);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use gridstitch_core::ExecOutput;
	use std::fmt::Write as _;
	use std::sync::Mutex;

	const SAMPLE: &str = r#"
p f0 w1000 h800 v250 E0.0 R0
i w256 h256 f0 v51 d0 e0 Eev1 Ra0 n"c000_r000.jpg"
i w256 h256 f0 v51 d-5 e0 Vm5 n"c001_r000.jpg"
c n0 N1 x230 y100 X30 Y100 t0
"#;

	/// Pretends to be the external binary: rewrites the project file with
	/// o-lines and an rms comment.
	struct FakeOptimizer {
		rms: f64,
		exit: i32,
		seen: Mutex<Vec<String>>,
	}

	impl FakeOptimizer {
		fn new(rms: f64, exit: i32) -> FakeOptimizer {
			FakeOptimizer {
				rms,
				exit,
				seen: Mutex::new(Vec::new()),
			}
		}
	}

	impl CommandRunner for FakeOptimizer {
		fn run(&self, _program: &str, args: &[String], _cwd: Option<&Path>) -> Result<ExecOutput> {
			if self.exit != 0 {
				return Ok(ExecOutput {
					stdout: String::new(),
					stderr: "fit diverged".to_string(),
					status: self.exit,
				});
			}
			let path = Path::new(&args[0]);
			let input = std::fs::read_to_string(path)?;
			self.seen.lock().unwrap().push(input.clone());
			let n_images = input.lines().filter(|l| l.starts_with('i')).count();
			let mut output = input;
			writeln!(output, "# final rms error {} units", self.rms).unwrap();
			for i in 0..n_images {
				writeln!(output, "o f0 r0 p0 y0 v51 d{}.5 e-{i} u10 +buf", i * 100).unwrap();
			}
			std::fs::write(path, output)?;
			Ok(ExecOutput {
				stdout: String::new(),
				stderr: String::new(),
				status: 0,
			})
		}
	}

	#[test]
	fn prepare_strips_to_whitelist() {
		let mut project = Project::from_text(SAMPLE).unwrap();
		prepare(&mut project, true).unwrap();

		assert_eq!(project.panorama.exposure, None);
		assert_eq!(project.panorama.response, None);
		assert_eq!(project.panorama.fov, Some(179.0));
		let il = &project.images[0];
		assert_eq!(il.fov, Some(51.0));
		assert_eq!(il.x, Some(0.0));
		assert!(!il.extras.contains_key("Eev"));
		// whitelisted extras stay
		assert!(project.images[1].extras.contains_key("Vm"));
		// reoptimize clears old positions
		assert_eq!(project.images[1].x, Some(0.0));
	}

	#[test]
	fn prepare_keeps_positions_without_reoptimize() {
		let mut project = Project::from_text(SAMPLE).unwrap();
		prepare(&mut project, false).unwrap();
		assert_eq!(project.images[1].x, Some(-5.0));
		// missing positions still get a placeholder
		assert_eq!(project.images[0].y, Some(0.0));
	}

	#[test]
	fn run_merges_positions_back() {
		let mut project = Project::from_text(SAMPLE).unwrap();
		let runner = FakeOptimizer::new(24.04, 0);
		let config = Config::default();
		let rms = PtOptimizer::new(&runner, &config).run(&mut project).unwrap();

		assert!((rms - 24.04).abs() < 1e-9);
		assert_eq!(project.images[0].x, Some(0.5));
		assert_eq!(project.images[1].x, Some(100.5));
		assert_eq!(project.images[1].y, Some(-1.0));
		// the original keeps its control points
		assert_eq!(project.control_points.len(), 1);

		// the prepared project the tool saw was stripped
		let seen = runner.seen.lock().unwrap();
		assert!(!seen[0].contains("E0"));
		assert!(!seen[0].contains("Eev"));
	}

	#[test]
	fn excessive_rms_is_fatal() {
		let mut project = Project::from_text(SAMPLE).unwrap();
		let runner = FakeOptimizer::new(900.0, 0);
		let config = Config::default();
		let err = PtOptimizer::new(&runner, &config).run(&mut project).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<StitchError>(),
			Some(StitchError::OptimizerFailed(_))
		));
	}

	#[test]
	fn nonzero_exit_is_fatal_and_persists_debug_project() {
		let scratch = tempfile::tempdir().unwrap();
		let mut config = Config::default();
		config.temp_base = format!("{}/gst_", scratch.path().display());

		let mut project = Project::from_text(SAMPLE).unwrap();
		let runner = FakeOptimizer::new(0.0, 1);
		let err = PtOptimizer::new(&runner, &config).run(&mut project).unwrap_err();
		assert!(matches!(
			err.downcast_ref::<StitchError>(),
			Some(StitchError::OptimizerFailed(_))
		));
		assert!(scratch.path().join("gst_optimizer_failed.pto").exists());
	}

	#[test]
	fn merge_count_mismatch_is_fatal() {
		let mut project = Project::from_text(SAMPLE).unwrap();
		let optimized = Project::from_text("p f0 w10 h10\no d1 e1\n").unwrap();
		assert!(merge(&mut project, &optimized).is_err());
	}
}
