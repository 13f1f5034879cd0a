//! Rename a manually captured image stream into the canonical grid.

use anyhow::{Context, Result, ensure};
use gridstitch_core::{GridLayout, LayoutTag, Parity, RowBreaks};
use std::path::PathBuf;

#[derive(clap::Args, Debug)]
#[command(arg_required_else_help = true, disable_version_flag = true)]
pub struct Subcommand {
	/// directory with the captured images
	#[arg()]
	dir_in: PathBuf,

	/// directory to write cNNN_rNNN.jpg files into
	#[arg()]
	dir_out: PathBuf,

	/// scan pattern: {serp-}{lr|rl}-{ud|du}
	#[arg(long, default_value = "serp-lr-ud")]
	layout: String,

	/// fixed number of columns per row
	#[arg(long, conflicts_with = "endrows")]
	cols: Option<usize>,

	/// comma separated filenames that end their row
	#[arg(long)]
	endrows: Option<String>,

	/// insert a missed-capture placeholder before each named file
	#[arg(long, value_name = "FILES")]
	null_before: Option<String>,

	/// insert a missed-capture placeholder after each named file
	#[arg(long, value_name = "FILES")]
	null_after: Option<String>,

	/// drop even/odd rows (excess overlap decimation)
	#[arg(long, value_parser = ["even", "odd"])]
	drop_rows: Option<String>,

	/// drop even/odd columns
	#[arg(long, value_parser = ["even", "odd"])]
	drop_cols: Option<String>,

	/// actually copy files instead of printing the mapping
	#[arg(long)]
	apply: bool,
}

fn parity(s: &str) -> Parity {
	if s == "even" { Parity::Even } else { Parity::Odd }
}

fn split_list(s: &Option<String>) -> Vec<String> {
	s.as_deref()
		.map(|s| s.split(',').map(str::to_string).collect())
		.unwrap_or_default()
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let tag: LayoutTag = arguments.layout.parse()?;
	let breaks = match (&arguments.cols, &arguments.endrows) {
		(Some(cols), None) => RowBreaks::Columns(*cols),
		(None, Some(endrows)) => RowBreaks::EndRows(endrows.split(',').map(str::to_string).collect()),
		_ => anyhow::bail!("give exactly one of --cols or --endrows"),
	};

	let mut filenames = Vec::new();
	for entry in std::fs::read_dir(&arguments.dir_in)
		.with_context(|| format!("reading {}", arguments.dir_in.display()))?
	{
		let name = entry?.file_name().to_string_lossy().to_string();
		if name.ends_with(".jpg") || name.ends_with(".jpeg") || name.ends_with(".png") || name.ends_with(".tif") {
			filenames.push(name);
		}
	}
	ensure!(!filenames.is_empty(), "no images in {}", arguments.dir_in.display());
	filenames.sort();

	let mut layout = GridLayout::new(tag, breaks);
	layout.null_before = split_list(&arguments.null_before);
	layout.null_after = split_list(&arguments.null_after);
	layout.drop_rows = arguments.drop_rows.as_deref().map(parity);
	layout.drop_cols = arguments.drop_cols.as_deref().map(parity);

	let map = layout.arrange(&filenames)?;
	log::info!("{} cols x {} rows", map.width(), map.height());

	if arguments.apply {
		std::fs::create_dir_all(&arguments.dir_out)?;
	}
	for (col, row, fn_) in map.iter_filled() {
		let dst = format!("c{col:03}_r{row:03}.jpg");
		log::info!("{fn_} -> {dst}");
		if arguments.apply {
			std::fs::copy(arguments.dir_in.join(fn_), arguments.dir_out.join(&dst))
				.with_context(|| format!("copying {fn_}"))?;
		}
	}
	if !arguments.apply {
		log::info!("dry run; pass --apply to copy files");
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(Parser)]
	struct Wrap {
		#[command(flatten)]
		args: Subcommand,
	}

	#[test]
	fn renames_serpentine_capture() {
		let dir_in = tempfile::tempdir().unwrap();
		let dir_out = tempfile::tempdir().unwrap();
		for name in ["img0.jpg", "img1.jpg", "img2.jpg", "img3.jpg"] {
			std::fs::write(dir_in.path().join(name), name.as_bytes()).unwrap();
		}

		let wrap = Wrap::try_parse_from([
			"x",
			dir_in.path().to_str().unwrap(),
			dir_out.path().to_str().unwrap(),
			"--layout",
			"serp-lr-ud",
			"--cols",
			"2",
			"--apply",
		])
		.unwrap();
		run(&wrap.args).unwrap();

		// second row was captured right-to-left
		assert_eq!(
			std::fs::read(dir_out.path().join("c000_r001.jpg")).unwrap(),
			b"img3.jpg"
		);
		assert_eq!(
			std::fs::read(dir_out.path().join("c001_r001.jpg")).unwrap(),
			b"img2.jpg"
		);
	}

	#[test]
	fn dry_run_copies_nothing() {
		let dir_in = tempfile::tempdir().unwrap();
		let dir_out = tempfile::tempdir().unwrap();
		std::fs::write(dir_in.path().join("a.jpg"), b"a").unwrap();
		std::fs::write(dir_in.path().join("b.jpg"), b"b").unwrap();

		let wrap = Wrap::try_parse_from([
			"x",
			dir_in.path().to_str().unwrap(),
			dir_out.path().join("missing").to_str().unwrap(),
			"--cols",
			"2",
		])
		.unwrap();
		run(&wrap.args).unwrap();
		assert!(!dir_out.path().join("missing").exists());
	}
}
