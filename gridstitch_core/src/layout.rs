//! Arranging a flat capture into a grid.
//!
//! Manually driven stages produce a plain stream of numbered images; the
//! operator only knows the scan pattern (left/right or serpentine, top-down
//! or bottom-up) and where each row ended. `GridLayout` turns that knowledge
//! into a [`CoordMap`] so the files can be renamed into canonical
//! `cNNN_rNNN` form.

use crate::CoordMap;
use anyhow::{Result, bail, ensure};
use std::str::FromStr;

/// Horizontal scan direction of the first (base) row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
	LeftRight,
	RightLeft,
}

/// Vertical ordering of rows in the capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalOrder {
	UpDown,
	DownUp,
}

/// Even/odd selector for row or column decimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
	Even,
	Odd,
}

impl Parity {
	fn matches(self, i: usize) -> bool {
		match self {
			Parity::Even => i % 2 == 0,
			Parity::Odd => i % 2 == 1,
		}
	}
}

/// Layout tag `{serp-|∅}{lr|rl}-{ud|du}`, e.g. `serp-lr-ud` or `rl-du`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTag {
	pub serpentine: bool,
	pub scan: ScanOrder,
	pub vertical: VerticalOrder,
}

impl FromStr for LayoutTag {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<LayoutTag> {
		let (serpentine, rest) = match s.strip_prefix("serp-") {
			Some(rest) => (true, rest),
			None => (false, s),
		};
		let (scan, vertical) = match rest {
			"lr-ud" => (ScanOrder::LeftRight, VerticalOrder::UpDown),
			"lr-du" => (ScanOrder::LeftRight, VerticalOrder::DownUp),
			"rl-ud" => (ScanOrder::RightLeft, VerticalOrder::UpDown),
			"rl-du" => (ScanOrder::RightLeft, VerticalOrder::DownUp),
			_ => bail!("bad layout tag {s:?} (expected {{serp-}}{{lr|rl}}-{{ud|du}})"),
		};
		Ok(LayoutTag { serpentine, scan, vertical })
	}
}

/// How the flat file list breaks into rows.
#[derive(Debug, Clone)]
pub enum RowBreaks {
	/// Fixed number of columns per row.
	Columns(usize),
	/// Each named file ends its row.
	EndRows(Vec<String>),
}

/// A full description of how a sorted capture stream maps onto the grid.
#[derive(Debug, Clone)]
pub struct GridLayout {
	pub tag: LayoutTag,
	pub breaks: RowBreaks,
	/// Insert a placeholder (missed capture) before each named file.
	pub null_before: Vec<String>,
	/// Insert a placeholder after each named file.
	pub null_after: Vec<String>,
	/// Drop rows of this parity (excess-overlap decimation).
	pub drop_rows: Option<Parity>,
	/// Drop columns of this parity.
	pub drop_cols: Option<Parity>,
}

impl GridLayout {
	pub fn new(tag: LayoutTag, breaks: RowBreaks) -> GridLayout {
		GridLayout {
			tag,
			breaks,
			null_before: Vec::new(),
			null_after: Vec::new(),
			drop_rows: None,
			drop_cols: None,
		}
	}

	/// Arranges `filenames` (already sorted in capture order) into a grid.
	///
	/// Rows are bucketed, decimated, un-serpentined, optionally mirrored
	/// vertically, and finally spread over `max_cols` evenly distributed
	/// column indices (`col = round(raw_col * max_cols / row_len)`), which
	/// absorbs rows that came up short.
	pub fn arrange<S: AsRef<str>>(&self, filenames: &[S]) -> Result<CoordMap> {
		ensure!(!filenames.is_empty(), "no filenames to arrange");

		// Placeholders participate in bucketing like ordinary captures.
		let mut stream: Vec<Option<String>> = Vec::with_capacity(filenames.len());
		for fn_ in filenames {
			let fn_ = fn_.as_ref();
			if self.null_before.iter().any(|n| n == fn_) {
				stream.push(None);
			}
			stream.push(Some(fn_.to_string()));
			if self.null_after.iter().any(|n| n == fn_) {
				stream.push(None);
			}
		}

		let mut rows = self.bucket_rows(stream)?;

		if let Some(parity) = self.drop_rows {
			let mut i = 0;
			rows.retain(|_| {
				let keep = !parity.matches(i);
				i += 1;
				keep
			});
			ensure!(!rows.is_empty(), "row decimation removed every row");
		}
		if let Some(parity) = self.drop_cols {
			for row in &mut rows {
				let mut i = 0;
				row.retain(|_| {
					let keep = !parity.matches(i);
					i += 1;
					keep
				});
			}
		}

		// Undo the acquisition direction so every stored row reads
		// left-to-right. For serpentine captures alternate rows flip; the
		// base parity depends on which way the first row went.
		for (i, row) in rows.iter_mut().enumerate() {
			let reversed = match (self.tag.serpentine, self.tag.scan) {
				(false, ScanOrder::LeftRight) => false,
				(false, ScanOrder::RightLeft) => true,
				(true, ScanOrder::LeftRight) => i % 2 == 1,
				(true, ScanOrder::RightLeft) => i % 2 == 0,
			};
			if reversed {
				row.reverse();
			}
		}

		if self.tag.vertical == VerticalOrder::DownUp {
			rows.reverse();
		}

		let max_cols = rows.iter().map(Vec::len).max().unwrap_or(0);
		ensure!(max_cols > 0, "all rows are empty");

		let mut map = CoordMap::new(max_cols, rows.len());
		for (row_i, row) in rows.iter().enumerate() {
			let row_len = row.len();
			for (raw_col, slot) in row.iter().enumerate() {
				if let Some(fn_) = slot {
					let col = ((raw_col as f64 / row_len as f64) * max_cols as f64).round() as usize;
					map.set(col.min(max_cols - 1), row_i, fn_.clone());
				}
			}
		}
		Ok(map)
	}

	fn bucket_rows(&self, stream: Vec<Option<String>>) -> Result<Vec<Vec<Option<String>>>> {
		match &self.breaks {
			RowBreaks::Columns(cols) => {
				ensure!(*cols > 0, "column count must be positive");
				Ok(stream.chunks(*cols).map(<[Option<String>]>::to_vec).collect())
			}
			RowBreaks::EndRows(endrows) => {
				let mut rows = Vec::new();
				let mut current: Vec<Option<String>> = Vec::new();
				let mut end_i = 0;
				for slot in stream {
					let ends = matches!((&slot, endrows.get(end_i)), (Some(fn_), Some(end)) if fn_ == end);
					current.push(slot);
					if ends {
						rows.push(std::mem::take(&mut current));
						end_i += 1;
					}
				}
				if !current.is_empty() {
					rows.push(current);
				}
				ensure!(
					end_i == endrows.len(),
					"end-row file {:?} never seen in input",
					endrows[end_i]
				);
				Ok(rows)
			}
		}
	}
}
