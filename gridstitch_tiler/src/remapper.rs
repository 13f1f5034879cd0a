//! Wrapper around the external remapper (`nona`).
//!
//! Given a cropped project, the remapper projects every relevant source
//! image onto the supertile canvas and writes one TIFF per image. Images
//! that fall outside the canvas produce nothing, so the output list is
//! discovered afterwards rather than predicted.

use anyhow::{Context, Result, bail};
use gridstitch_core::{CommandRunner, StitchError};
use std::path::{Path, PathBuf};

pub struct Remapper<'a> {
	runner: &'a dyn CommandRunner,
	tool: String,
	pub extra_args: Vec<String>,
}

impl<'a> Remapper<'a> {
	pub fn new(runner: &'a dyn CommandRunner, tool: &str) -> Remapper<'a> {
		Remapper {
			runner,
			tool: tool.to_string(),
			extra_args: Vec::new(),
		}
	}

	/// Remaps `project_path` into `<out_prefix>NNNN.tif` files; returns
	/// the files actually produced, sorted.
	pub fn remap(&self, project_path: &Path, out_prefix: &Path, cwd: &Path) -> Result<Vec<PathBuf>> {
		let mut args = self.extra_args.clone();
		args.push("-o".to_string());
		args.push(out_prefix.to_string_lossy().to_string());
		args.push(project_path.to_string_lossy().to_string());

		let output = self.runner.run(&self.tool, &args, Some(cwd))?;
		if !output.success() {
			bail!(StitchError::CommandFailed {
				command: self.tool.clone(),
				stderr: output.stderr.trim().to_string(),
			});
		}

		let dir = out_prefix.parent().context("output prefix has no parent directory")?;
		let stem = out_prefix
			.file_name()
			.map(|s| s.to_string_lossy().to_string())
			.unwrap_or_default();
		let mut produced = Vec::new();
		for entry in std::fs::read_dir(dir)? {
			let entry = entry?;
			let name = entry.file_name().to_string_lossy().to_string();
			if name.starts_with(&stem) && (name.ends_with(".tif") || name.ends_with(".tiff")) {
				produced.push(entry.path());
			}
		}
		produced.sort();
		if produced.is_empty() {
			bail!(StitchError::CommandFailed {
				command: self.tool.clone(),
				stderr: "remapper produced no output images".to_string(),
			});
		}
		Ok(produced)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use gridstitch_core::ExecOutput;

	/// Drops fake remap outputs next to the requested prefix.
	struct FakeNona {
		produce: usize,
	}

	impl CommandRunner for FakeNona {
		fn run(&self, _program: &str, args: &[String], _cwd: Option<&Path>) -> Result<ExecOutput> {
			let prefix = &args[args.iter().position(|a| a == "-o").unwrap() + 1];
			for i in 0..self.produce {
				std::fs::write(format!("{prefix}{i:04}.tif"), b"tif")?;
			}
			Ok(ExecOutput {
				stdout: String::new(),
				stderr: String::new(),
				status: 0,
			})
		}
	}

	#[test]
	fn collects_produced_files_sorted() {
		let dir = tempfile::tempdir().unwrap();
		let runner = FakeNona { produce: 3 };
		let remapper = Remapper::new(&runner, "nona");
		let prefix = dir.path().join("st_");
		let files = remapper.remap(Path::new("st.pto"), &prefix, dir.path()).unwrap();
		assert_eq!(files.len(), 3);
		assert!(files[0].to_string_lossy().ends_with("st_0000.tif"));
		assert!(files[2].to_string_lossy().ends_with("st_0002.tif"));
	}

	#[test]
	fn no_output_is_a_command_failure() {
		let dir = tempfile::tempdir().unwrap();
		let runner = FakeNona { produce: 0 };
		let remapper = Remapper::new(&runner, "nona");
		let err = remapper
			.remap(Path::new("st.pto"), &dir.path().join("st_"), dir.path())
			.unwrap_err();
		assert!(matches!(
			err.downcast_ref::<StitchError>(),
			Some(StitchError::CommandFailed { .. })
		));
	}

	#[test]
	fn nonzero_exit_is_a_command_failure() {
		struct Failing;
		impl CommandRunner for Failing {
			fn run(&self, _program: &str, _args: &[String], _cwd: Option<&Path>) -> Result<ExecOutput> {
				Ok(ExecOutput {
					stdout: String::new(),
					stderr: "cannot open image".to_string(),
					status: 1,
				})
			}
		}
		let dir = tempfile::tempdir().unwrap();
		let remapper = Remapper::new(&Failing, "nona");
		let err = remapper
			.remap(Path::new("st.pto"), &dir.path().join("st_"), dir.path())
			.unwrap_err();
		match err.downcast_ref::<StitchError>() {
			Some(StitchError::CommandFailed { stderr, .. }) => assert_eq!(stderr, "cannot open image"),
			other => panic!("unexpected error {other:?}"),
		}
	}
}
