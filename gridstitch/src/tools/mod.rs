pub mod dopt;
pub mod iopt;
pub mod pto;
pub mod rename;
pub mod reopt;
pub mod stitch;
pub mod ts;

use anyhow::{Result, bail};
use gridstitch_core::{CommandRunner, Config, StitchError};
use std::path::Path;

/// Parses an `col,row` anchor argument.
pub(crate) fn parse_anchor(s: &str) -> Result<(usize, usize)> {
	let parts: Vec<&str> = s.split(',').collect();
	if parts.len() != 2 {
		bail!("anchor must be col,row");
	}
	Ok((parts[0].trim().parse()?, parts[1].trim().parse()?))
}

/// Runs the external canvas fixer on a saved project file.
pub(crate) fn fix_canvas(config: &Config, runner: &dyn CommandRunner, pto_path: &Path) -> Result<()> {
	let path = pto_path.to_string_lossy().to_string();
	let args = vec![
		"--fov=AUTO".to_string(),
		"--canvas=AUTO".to_string(),
		"-o".to_string(),
		path.clone(),
		path,
	];
	log::info!("fixing canvas with {}", config.tools.pano_modify);
	let output = runner.run(&config.tools.pano_modify, &args, None)?;
	if !output.success() {
		bail!(StitchError::CommandFailed {
			command: config.tools.pano_modify.clone(),
			stderr: output.stderr.trim().to_string(),
		});
	}
	Ok(())
}
