//! This module defines the `CoordMap` struct, the `(col, row) → filename`
//! grid of an XY-stage capture.
//!
//! # Overview
//!
//! Stage captures tag each image with its grid position in the filename
//! (`c0002_r0005.jpg`). `CoordMap` recovers the grid from a set of such
//! names, tolerates missing slots, and provides the traversal orders the
//! optimizers need, most importantly the concentric spiral used to seed
//! wavefront placement from the center of the scan.

use anyhow::{Result, ensure};
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

static TAGGED_CR: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^c(\d+)_r(\d+)\.(jpg|jpeg|png|tif|tiff)$").unwrap());
static TAGGED_RC: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^r(\d+)_c(\d+)\.(jpg|jpeg|png|tif|tiff)$").unwrap());

/// Parses a tagged filename into `(col, row)`.
///
/// Accepts the canonical `cNNN_rNNN` form and the legacy `rNNN_cNNN` form.
/// Paths are reduced to their final component first. Returns `None` for
/// anything else.
pub fn parse_tagged(filename: &str) -> Option<(usize, usize)> {
	let base = Path::new(filename).file_name()?.to_str()?;
	if let Some(caps) = TAGGED_CR.captures(base) {
		return Some((caps[1].parse().ok()?, caps[2].parse().ok()?));
	}
	if let Some(caps) = TAGGED_RC.captures(base) {
		return Some((caps[2].parse().ok()?, caps[1].parse().ok()?));
	}
	None
}

/// A `(col, row) → filename` grid. Slots may be empty.
#[derive(Clone, PartialEq, Eq)]
pub struct CoordMap {
	width: usize,
	height: usize,
	slots: Vec<Option<String>>,
}

impl CoordMap {
	/// Creates an empty map of the given dimensions.
	pub fn new(width: usize, height: usize) -> CoordMap {
		CoordMap {
			width,
			height,
			slots: vec![None; width * height],
		}
	}

	/// Builds a map from tagged filenames.
	///
	/// The grid dimensions are inferred as `max col + 1` × `max row + 1`;
	/// slots not named by any file stay unassigned. Fails if any filename
	/// does not carry a grid tag or if two files claim the same slot.
	pub fn from_tagged_filenames<S: AsRef<str>>(filenames: &[S]) -> Result<CoordMap> {
		ensure!(!filenames.is_empty(), "no tagged filenames given");

		let mut tagged = Vec::with_capacity(filenames.len());
		let mut width = 0;
		let mut height = 0;
		for fn_ in filenames {
			let fn_ = fn_.as_ref();
			let (col, row) = parse_tagged(fn_)
				.ok_or_else(|| anyhow::anyhow!("filename {fn_:?} has no cNNN_rNNN tag"))?;
			width = width.max(col + 1);
			height = height.max(row + 1);
			tagged.push((col, row, fn_.to_string()));
		}

		let mut map = CoordMap::new(width, height);
		for (col, row, fn_) in tagged {
			ensure!(
				map.get(col, row).is_none(),
				"duplicate grid slot c{col} r{row} ({fn_:?})"
			);
			map.set(col, row, fn_);
		}
		Ok(map)
	}

	/// Builds a map by scanning a directory for tagged filenames.
	///
	/// Untagged entries are ignored; this is used to pick the capture set
	/// out of a working directory.
	pub fn from_dir(dir: &Path) -> Result<CoordMap> {
		let mut filenames = Vec::new();
		for entry in std::fs::read_dir(dir)? {
			let entry = entry?;
			let name = entry.file_name().to_string_lossy().to_string();
			if parse_tagged(&name).is_some() {
				filenames.push(name);
			}
		}
		ensure!(!filenames.is_empty(), "no tagged images found in {dir:?}");
		filenames.sort();
		CoordMap::from_tagged_filenames(&filenames)
	}

	pub fn width(&self) -> usize {
		self.width
	}

	pub fn height(&self) -> usize {
		self.height
	}

	/// Number of assigned slots.
	pub fn len(&self) -> usize {
		self.slots.iter().filter(|s| s.is_some()).count()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.iter().all(|s| s.is_none())
	}

	/// Returns the filename at `(col, row)`, or `None` when the slot is
	/// unassigned or out of bounds.
	pub fn get(&self, col: usize, row: usize) -> Option<&str> {
		if col >= self.width || row >= self.height {
			return None;
		}
		self.slots[row * self.width + col].as_deref()
	}

	/// Assigns a slot. Panics when out of bounds.
	pub fn set(&mut self, col: usize, row: usize, filename: String) {
		assert!(col < self.width && row < self.height, "slot c{col} r{row} out of bounds");
		self.slots[row * self.width + col] = Some(filename);
	}

	/// Mirrors the grid left/right in place.
	pub fn flip_lr(&mut self) {
		for row in 0..self.height {
			self.slots[row * self.width..(row + 1) * self.width].reverse();
		}
	}

	/// Iterates `(col, row)` pairs of assigned slots in row-major order.
	pub fn iter_filled(&self) -> impl Iterator<Item = (usize, usize, &str)> {
		self.slots.iter().enumerate().filter_map(|(i, slot)| {
			slot.as_deref().map(|fn_| (i % self.width, i / self.width, fn_))
		})
	}

	/// Yields `(col, row)` in concentric squares expanding outward from the
	/// grid center until the whole grid is covered.
	///
	/// Placement error accumulates with distance from the anchor, so the
	/// optimizers work outward from the middle.
	pub fn iter_center(&self) -> impl Iterator<Item = (usize, usize)> + use<> {
		self.iter_center_from(self.width / 2, self.height / 2)
	}

	/// Like [`iter_center`](Self::iter_center) but spiraling outward from
	/// the given cell. The rings keep expanding until the full grid has been
	/// visited, so every cell is yielded exactly once.
	pub fn iter_center_from(&self, cent_col: usize, cent_row: usize) -> impl Iterator<Item = (usize, usize)> + use<> {
		let (w, h) = (self.width as isize, self.height as isize);
		let (cc, cr) = (cent_col as isize, cent_row as isize);
		let deltas = (cc.max(w - 1 - cc)).max(cr.max(h - 1 - cr)) + 1;

		let mut out = Vec::with_capacity(self.width * self.height);
		for delta in 0..deltas {
			let xmin = (cc - delta).max(0);
			let ymin = (cr - delta).max(0);
			let xmax = (cc + delta + 1).min(w);
			let ymax = (cr + delta + 1).min(h);
			for y in ymin..ymax {
				for x in xmin..xmax {
					if x == cc - delta || x == cc + delta || y == cr - delta || y == cr + delta {
						out.push((x as usize, y as usize));
					}
				}
			}
		}
		out.into_iter()
	}
}

impl fmt::Debug for CoordMap {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CoordMap({}x{}, {} filled)", self.width, self.height, self.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn grid_3x2() -> CoordMap {
		CoordMap::from_tagged_filenames(&[
			"c000_r000.jpg",
			"c001_r000.jpg",
			"c002_r000.jpg",
			"c000_r001.jpg",
			"c001_r001.jpg",
			"c002_r001.jpg",
		])
		.unwrap()
	}

	#[test]
	fn parse_tagged_forms() {
		assert_eq!(parse_tagged("c012_r003.jpg"), Some((12, 3)));
		assert_eq!(parse_tagged("r003_c012.png"), Some((12, 3)));
		assert_eq!(parse_tagged("images/c0_r1.tif"), Some((0, 1)));
		assert_eq!(parse_tagged("c1_r2.bmp"), None);
		assert_eq!(parse_tagged("img_0123.jpg"), None);
	}

	#[test]
	fn dimensions_inferred() {
		let map = grid_3x2();
		assert_eq!(map.width(), 3);
		assert_eq!(map.height(), 2);
		assert_eq!(map.len(), 6);
		assert_eq!(map.get(2, 1), Some("c002_r001.jpg"));
		assert_eq!(map.get(3, 0), None);
	}

	#[test]
	fn missing_slots_allowed() {
		let map = CoordMap::from_tagged_filenames(&["c000_r000.jpg", "c002_r001.jpg"]).unwrap();
		assert_eq!(map.width(), 3);
		assert_eq!(map.height(), 2);
		assert_eq!(map.len(), 2);
		assert_eq!(map.get(1, 0), None);
	}

	#[test]
	fn duplicate_slot_rejected() {
		let result = CoordMap::from_tagged_filenames(&["c000_r000.jpg", "c000_r000.png"]);
		assert!(result.is_err());
	}

	#[test]
	fn flip_lr_mirrors_rows() {
		let mut map = grid_3x2();
		map.flip_lr();
		assert_eq!(map.get(0, 0), Some("c002_r000.jpg"));
		assert_eq!(map.get(2, 0), Some("c000_r000.jpg"));
		assert_eq!(map.get(1, 1), Some("c001_r001.jpg"));
	}

	#[test]
	fn iter_center_covers_grid_once() {
		let map = grid_3x2();
		let cells: Vec<(usize, usize)> = map.iter_center().collect();
		assert_eq!(cells.len(), 6);
		let mut sorted = cells.clone();
		sorted.sort_unstable();
		sorted.dedup();
		assert_eq!(sorted.len(), 6);
		// center of a 3x2 grid is (1, 1)
		assert_eq!(cells[0], (1, 1));
	}

	#[test]
	fn iter_center_rings_expand() {
		let map = CoordMap::new(5, 5);
		let cells: Vec<(usize, usize)> = map.iter_center_from(2, 2).collect();
		assert_eq!(cells.len(), 25);
		assert_eq!(cells[0], (2, 2));
		// first ring is the 8 neighbors
		let ring1: Vec<(usize, usize)> = cells[1..9].to_vec();
		for &(c, r) in &ring1 {
			let d = (c as isize - 2).abs().max((r as isize - 2).abs());
			assert_eq!(d, 1);
		}
	}

	#[test]
	fn iter_center_from_corner() {
		let map = CoordMap::new(4, 3);
		let cells: Vec<(usize, usize)> = map.iter_center_from(0, 0).collect();
		assert_eq!(cells.len(), 12);
		assert_eq!(cells[0], (0, 0));
	}

	#[test]
	fn from_dir_scans_tagged_files() {
		let dir = tempfile::tempdir().unwrap();
		for name in ["c000_r000.jpg", "c001_r000.jpg", "notes.txt"] {
			std::fs::write(dir.path().join(name), b"x").unwrap();
		}
		let map = CoordMap::from_dir(dir.path()).unwrap();
		assert_eq!(map.width(), 2);
		assert_eq!(map.height(), 1);
	}
}
