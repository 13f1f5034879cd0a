//! Pair deltas: the average offset between two grid-adjacent images,
//! inferred from the control points that join them.
//!
//! The maps are keyed by the `(col, row)` of the right/lower image of each
//! pair, so `(0, 0)` never appears. A `None` value records a pair whose
//! delta was rejected (or that never had control points); the distinction
//! matters to the wavefront, which must not bridge rejected pairs.

use crate::stats;
use anyhow::Result;
use gridstitch_core::{CoordMap, Project, StepFractions};
use std::collections::HashMap;

pub type Delta = (f64, f64);

/// Pair deltas for horizontal (`x`) and vertical (`y`) neighbors.
#[derive(Debug, Clone, Default)]
pub struct PairMap {
	pub x: HashMap<(usize, usize), Option<Delta>>,
	pub y: HashMap<(usize, usize), Option<Delta>>,
}

impl PairMap {
	/// Builds the delta index for every grid-adjacent image pair.
	///
	/// Signs follow the global convention: a positive delta means the
	/// right/lower image sits right of / below its neighbor by that many
	/// pixels of local image coordinates.
	pub fn build(project: &Project, icm: &CoordMap) -> Result<PairMap> {
		// control points indexed by their (n, N) image pair
		let mut cp_index: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
		for (i, cp) in project.control_points.iter().enumerate() {
			cp_index.entry((cp.n, cp.upper_n)).or_default().push(i);
		}

		let filename_index = project.filename_index();
		let index_of = |fn_: &str| filename_index.get(fn_).copied();

		let pair_delta = |lower: usize, upper: usize| -> Option<Delta> {
			let mut dxs = Vec::new();
			let mut dys = Vec::new();
			for &i in cp_index.get(&(lower, upper)).into_iter().flatten() {
				let cp = &project.control_points[i];
				dxs.push(cp.x - cp.upper_x);
				dys.push(cp.y - cp.upper_y);
			}
			for &i in cp_index.get(&(upper, lower)).into_iter().flatten() {
				let cp = &project.control_points[i];
				dxs.push(cp.upper_x - cp.x);
				dys.push(cp.upper_y - cp.y);
			}
			if dxs.is_empty() {
				None
			} else {
				Some((stats::mean(&dxs), stats::mean(&dys)))
			}
		};

		let mut pairs = PairMap::default();
		for row in 0..icm.height() {
			for col in 0..icm.width() {
				let Some(this) = icm.get(col, row).and_then(&index_of) else {
					continue;
				};
				if col > 0 {
					let delta = icm
						.get(col - 1, row)
						.and_then(&index_of)
						.and_then(|left| pair_delta(left, this));
					pairs.x.insert((col, row), delta);
				}
				if row > 0 {
					let delta = icm
						.get(col, row - 1)
						.and_then(&index_of)
						.and_then(|above| pair_delta(above, this));
					pairs.y.insert((col, row), delta);
				}
			}
		}
		Ok(pairs)
	}

	/// Rejects pairs grossly outside the expected stage movement.
	///
	/// When moving one column the image should shift about `ox` pixels in x
	/// and nothing in y; the tolerances are `expected + img_width * thresh`
	/// along the movement axis and `img_width * thresh` across it. A failed
	/// check invalidates both the x and y pair at that grid slot.
	pub fn reject_overlap_outliers(
		&mut self,
		img_width: f64,
		img_height: f64,
		fractions: StepFractions,
		thresh: f64,
	) -> usize {
		let ox = img_width * fractions.x;
		let oy = img_height * fractions.y;
		let tol_x1 = ox + img_width * thresh;
		let tol_y1 = oy + img_width * thresh;
		let tol_2 = img_width * thresh;

		let mut rejected = Vec::new();
		for (&key, delta) in &self.x {
			let Some((dx, dy)) = delta else { continue };
			if (dx - ox).abs() > tol_x1 || dy.abs() > tol_2 {
				log::info!(
					"pair c{} r{}: x-delta ({dx:.1}, {dy:.1}) outside expected overlap, rejecting",
					key.0,
					key.1
				);
				rejected.push(key);
			}
		}
		for (&key, delta) in &self.y {
			let Some((dx, dy)) = delta else { continue };
			if dx.abs() > tol_2 || (dy - oy).abs() > tol_y1 {
				log::info!(
					"pair c{} r{}: y-delta ({dx:.1}, {dy:.1}) outside expected overlap, rejecting",
					key.0,
					key.1
				);
				rejected.push(key);
			}
		}

		for key in &rejected {
			if let Some(slot) = self.x.get_mut(key) {
				*slot = None;
			}
			if let Some(slot) = self.y.get_mut(key) {
				*slot = None;
			}
		}
		rejected.len()
	}

	/// Rejects pairs outside `mean ± stdev_limit * sd`, computed separately
	/// per row-parity stratum so serpentine backlash (two distinct delta
	/// distributions) does not inflate the deviation.
	pub fn reject_distribution_outliers(&mut self, stdev_limit: f64) -> usize {
		let mut removed = 0;
		for parity in 0..2 {
			removed += reject_stratum(&mut self.x, parity, stdev_limit);
			removed += reject_stratum(&mut self.y, parity, stdev_limit);
		}
		removed
	}

	/// Stratum-filtered mean of the x-pair deltas (rows of `parity`).
	pub fn mean_x_for_parity(&self, parity: usize) -> Option<Delta> {
		mean_of(self.x.iter().filter(|((_, row), _)| row % 2 == parity))
	}

	/// Mean of the y-pair deltas joining INTO rows of `parity`.
	pub fn mean_y_for_parity(&self, parity: usize) -> Option<Delta> {
		mean_of(self.y.iter().filter(|((_, row), _)| row % 2 == parity))
	}

	/// Mean over every valid y-pair, regardless of stratum.
	pub fn mean_y(&self) -> Option<Delta> {
		mean_of(self.y.iter())
	}
}

fn mean_of<'a>(pairs: impl Iterator<Item = (&'a (usize, usize), &'a Option<Delta>)>) -> Option<Delta> {
	let deltas: Vec<Delta> = pairs.filter_map(|(_, d)| *d).collect();
	if deltas.is_empty() {
		return None;
	}
	let dxs: Vec<f64> = deltas.iter().map(|d| d.0).collect();
	let dys: Vec<f64> = deltas.iter().map(|d| d.1).collect();
	Some((stats::mean(&dxs), stats::mean(&dys)))
}

fn reject_stratum(pairs: &mut HashMap<(usize, usize), Option<Delta>>, parity: usize, stdev_limit: f64) -> usize {
	let stratum: Vec<((usize, usize), Delta)> = pairs
		.iter()
		.filter(|((_, row), _)| row % 2 == parity)
		.filter_map(|(k, d)| d.map(|d| (*k, d)))
		.collect();
	if stratum.len() <= 1 {
		log::debug!("stratum parity {parity}: insufficient data for deviation filter");
		return 0;
	}

	let dxs: Vec<f64> = stratum.iter().map(|(_, d)| d.0).collect();
	let dys: Vec<f64> = stratum.iter().map(|(_, d)| d.1).collect();
	let (x_u, x_sd) = (stats::mean(&dxs), stats::stdev_sample(&dxs));
	let (y_u, y_sd) = (stats::mean(&dys), stats::stdev_sample(&dys));
	let x_range = (x_u - x_sd * stdev_limit, x_u + x_sd * stdev_limit);
	let y_range = (y_u - y_sd * stdev_limit, y_u + y_sd * stdev_limit);

	let mut removed = 0;
	for ((col, row), (dx, dy)) in stratum {
		if dx < x_range.0 || dx > x_range.1 || dy < y_range.0 || dy > y_range.1 {
			log::info!("pair c{col} r{row}: delta ({dx:.1}, {dy:.1}) outside distribution, rejecting");
			pairs.insert((col, row), None);
			removed += 1;
		}
	}
	removed
}
