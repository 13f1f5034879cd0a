//! Subprocess execution behind a trait, so the remapper, blender and
//! external optimizer can be mocked in tests.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ExecOutput {
	pub stdout: String,
	pub stderr: String,
	/// Exit code; -1 when the process was killed by a signal.
	pub status: i32,
}

impl ExecOutput {
	pub fn success(&self) -> bool {
		self.status == 0
	}
}

/// Runs external programs and returns their captured output.
pub trait CommandRunner: Send + Sync {
	fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<ExecOutput>;
}

/// The real thing: `std::process::Command` with captured output.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
	fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<ExecOutput> {
		log::debug!("executing: {program} {}", args.join(" "));
		let mut command = Command::new(program);
		command.args(args);
		if let Some(dir) = cwd {
			command.current_dir(dir);
		}
		let output = command
			.output()
			.with_context(|| format!("spawning {program:?}"))?;
		Ok(ExecOutput {
			stdout: String::from_utf8_lossy(&output.stdout).to_string(),
			stderr: String::from_utf8_lossy(&output.stderr).to_string(),
			status: output.status.code().unwrap_or(-1),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn captures_stdout_and_status() {
		let out = SystemRunner
			.run("sh", &["-c".to_string(), "echo hi; exit 0".to_string()], None)
			.unwrap();
		assert!(out.success());
		assert_eq!(out.stdout.trim(), "hi");
	}

	#[test]
	fn nonzero_exit_reported() {
		let out = SystemRunner
			.run("sh", &["-c".to_string(), "echo bad >&2; exit 3".to_string()], None)
			.unwrap();
		assert!(!out.success());
		assert_eq!(out.status, 3);
		assert_eq!(out.stderr.trim(), "bad");
	}

	#[test]
	fn missing_program_is_an_error() {
		assert!(SystemRunner.run("definitely-not-a-real-binary", &[], None).is_err());
	}
}
