//! Open/closed bookkeeping for output tiles.
//!
//! Every tile starts open and moves to closed exactly once: either when the
//! coordinator writes it, or during the startup directory scan that lets an
//! interrupted run resume. Closed is terminal.

use anyhow::{Result, ensure};
use regex::Regex;
use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::Path;
use std::sync::LazyLock;

static TILE_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^y(\d+)_x(\d+)\.(jpg|jpeg|png|tif|tiff)$").unwrap());

/// Output filename for a tile.
pub fn tile_filename(row: i64, col: i64, extension: &str) -> String {
	format!("y{row:03}_x{col:03}{extension}")
}

#[derive(Debug, Clone)]
pub struct TileSet {
	rows: i64,
	cols: i64,
	open: BTreeSet<(i64, i64)>,
	closed: BTreeSet<(i64, i64)>,
}

impl TileSet {
	/// All tiles of an `rows` x `cols` grid, open.
	pub fn new(rows: i64, cols: i64) -> TileSet {
		let mut open = BTreeSet::new();
		for row in 0..rows {
			for col in 0..cols {
				open.insert((row, col));
			}
		}
		TileSet {
			rows,
			cols,
			open,
			closed: BTreeSet::new(),
		}
	}

	/// Marks every tile already present in `dir` as closed, so a restarted
	/// run only produces what is missing.
	pub fn seed_from_dir(&mut self, dir: &Path) -> Result<usize> {
		let mut seeded = 0;
		for entry in std::fs::read_dir(dir)? {
			let entry = entry?;
			let name = entry.file_name().to_string_lossy().to_string();
			let Some(caps) = TILE_NAME.captures(&name) else {
				continue;
			};
			let row: i64 = caps[1].parse()?;
			let col: i64 = caps[2].parse()?;
			ensure!(
				row < self.rows && col < self.cols,
				"tile {name} is outside the {}x{} grid (stale output directory?)",
				self.rows,
				self.cols
			);
			if self.mark_closed(row, col) {
				seeded += 1;
			}
		}
		log::info!("seeded {seeded} already-done tiles from {}", dir.display());
		Ok(seeded)
	}

	/// Moves a tile from open to closed. Returns false when it was already
	/// closed.
	pub fn mark_closed(&mut self, row: i64, col: i64) -> bool {
		assert!(
			row >= 0 && row < self.rows && col >= 0 && col < self.cols,
			"tile r{row} c{col} outside {}x{} grid",
			self.rows,
			self.cols
		);
		if self.open.remove(&(row, col)) {
			self.closed.insert((row, col));
			true
		} else {
			false
		}
	}

	pub fn is_closed(&self, row: i64, col: i64) -> bool {
		self.closed.contains(&(row, col))
	}

	pub fn open_count(&self) -> usize {
		self.open.len()
	}

	pub fn closed_count(&self) -> usize {
		self.closed.len()
	}

	pub fn total(&self) -> usize {
		(self.rows * self.cols) as usize
	}

	/// The first `limit` still-open tiles, for the missing-tiles diagnostic.
	pub fn first_open(&self, limit: usize) -> Vec<(i64, i64)> {
		self.open.iter().take(limit).copied().collect()
	}

	/// Writes the open and closed lists into `dir` for post-mortems.
	pub fn dump(&self, dir: &Path, prefix: &str) -> Result<()> {
		let write_list = |name: &str, list: &BTreeSet<(i64, i64)>| -> Result<()> {
			let mut file = std::fs::File::create(dir.join(name))?;
			for (row, col) in list {
				writeln!(file, "{row}r,{col}c")?;
			}
			Ok(())
		};
		write_list(&format!("{prefix}open_list.txt"), &self.open)?;
		write_list(&format!("{prefix}closed_list.txt"), &self.closed)?;
		Ok(())
	}
}
