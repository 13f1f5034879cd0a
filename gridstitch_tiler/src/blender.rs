//! Wrapper around the external blender (`enblend`) plus the optional
//! cross-process serialization lock.
//!
//! Blending is the memory-hungry phase. When several stitches run on one
//! machine the lock file keeps only one blender alive at a time; waiters
//! poll every 100 ms and log progress every 10 minutes.

use anyhow::{Result, bail};
use gridstitch_core::{CommandRunner, Config, StitchError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_PATH: &str = "/tmp/gridstitch-enblend.lock";
const LOCK_RETRY: Duration = Duration::from_millis(100);
const LOCK_LOG_EVERY: Duration = Duration::from_secs(600);

/// Held while the blender runs; releases the lock file on drop.
struct BlendLock {
	path: PathBuf,
}

impl BlendLock {
	fn acquire(path: &Path) -> Result<BlendLock> {
		log::debug!("blender: acquiring lock {}", path.display());
		let mut last_log = Instant::now();
		loop {
			match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
				Ok(_) => {
					log::debug!("blender: lock acquired");
					return Ok(BlendLock { path: path.to_path_buf() });
				}
				Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
					if last_log.elapsed() >= LOCK_LOG_EVERY {
						log::info!("blender: still waiting for lock {}", path.display());
						last_log = Instant::now();
					}
					std::thread::sleep(LOCK_RETRY);
				}
				Err(err) => return Err(err.into()),
			}
		}
	}
}

impl Drop for BlendLock {
	fn drop(&mut self) {
		if let Err(err) = std::fs::remove_file(&self.path) {
			log::warn!("blender: could not release lock {}: {err}", self.path.display());
		}
	}
}

pub struct Blender<'a> {
	runner: &'a dyn CommandRunner,
	tool: String,
	opts: Vec<String>,
	pub extra_args: Vec<String>,
	pub lock: bool,
	lock_path: PathBuf,
}

impl<'a> Blender<'a> {
	pub fn new(runner: &'a dyn CommandRunner, config: &Config) -> Blender<'a> {
		let mut opts = Vec::new();
		if config.enblend_safer_mode {
			// more memory, less likely to give up on a hard seam
			opts.push("--fine-mask".to_string());
		}
		if config.enblend_safest_mode {
			opts.push("--no-optimize".to_string());
		}
		opts.extend(config.enblend_opts.split_whitespace().map(str::to_string));
		Blender {
			runner,
			tool: config.tools.enblend.clone(),
			opts,
			extra_args: Vec::new(),
			lock: false,
			lock_path: PathBuf::from(LOCK_PATH),
		}
	}

	#[cfg(test)]
	fn with_lock_path(mut self, path: PathBuf) -> Self {
		self.lock_path = path;
		self
	}

	/// Blends `inputs` into `output`.
	pub fn blend(&self, inputs: &[PathBuf], output: &Path, cwd: &Path) -> Result<()> {
		let mut args = self.opts.clone();
		args.extend(self.extra_args.iter().cloned());
		args.push("-o".to_string());
		args.push(output.to_string_lossy().to_string());
		for input in inputs {
			args.push(input.to_string_lossy().to_string());
		}

		let _lock = if self.lock {
			Some(BlendLock::acquire(&self.lock_path)?)
		} else {
			None
		};

		let result = self.runner.run(&self.tool, &args, Some(cwd))?;
		if !result.success() {
			bail!(StitchError::CommandFailed {
				command: self.tool.clone(),
				stderr: result.stderr.trim().to_string(),
			});
		}
		Ok(())
	}
}
