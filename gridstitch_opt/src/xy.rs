//! The statistical position optimizer.
//!
//! Infers each image's global `(x, y)` from control points alone:
//!
//! 1. build the pair-delta index,
//! 2. reject outlier pairs (expected overlap, then per-parity distribution),
//! 3. anchor one well-connected image near the grid center at `(0, 0)`,
//! 4. propagate positions outward in waves over valid pairs,
//! 5. extrapolate any stranded images from grid-wide delta means,
//! 6. optionally flag placements that disagree with the expected stage step.
//!
//! Placement works outward from the center because every pair crossed adds
//! its own error; the anchor's neighborhood stays tight.

use crate::pairs::{Delta, PairMap};
use anyhow::{Context, Result, bail};
use gridstitch_core::{Config, CoordMap, Project, StepFractions, StitchError};
use std::collections::HashMap;

pub type ClosedSet = HashMap<(usize, usize), (f64, f64)>;

#[derive(Debug, Clone)]
pub struct XyOptions {
	/// Distribution filter width in standard deviations; `None` disables.
	pub stdev: Option<f64>,
	/// Anchor at this `(col, row)` instead of searching from the center.
	pub anchor_cr: Option<(usize, usize)>,
	/// Compare final placements against the expected stage step.
	pub check_poor_opt: bool,
}

impl Default for XyOptions {
	fn default() -> Self {
		XyOptions {
			stdev: Some(3.0),
			anchor_cr: None,
			check_poor_opt: true,
		}
	}
}

/// Runs the optimizer, writing positions into `project`.
///
/// Returns the solved `(col, row) → (x, y)` set. Fails with
/// [`StitchError::NoAnchor`] when no image carries a control point and with
/// [`StitchError::BadInput`] on mismatched image dimensions.
pub fn xy_optimize(
	project: &mut Project,
	config: &Config,
	fractions: StepFractions,
	options: &XyOptions,
) -> Result<ClosedSet> {
	let (img_w, img_h, _fov) = project.verify_uniform_images()?;

	let filenames: Vec<String> = project
		.images
		.iter()
		.map(|il| il.filename().map(str::to_string))
		.collect::<Result<_>>()?;
	let icm = CoordMap::from_tagged_filenames(&filenames)?;

	if let Ok(rms) = project.rms_error() {
		log::info!("pre-optimization RMS error: {rms:.3}");
	}

	let mut pairs = PairMap::build(project, &icm)?;
	let rejected = pairs.reject_overlap_outliers(img_w as f64, img_h as f64, fractions, config.overlap_outlier_thresh);
	if rejected > 0 {
		log::warn!("rejected {rejected} pair(s) outside expected overlap");
	}
	if let Some(stdev) = options.stdev {
		let rejected = pairs.reject_distribution_outliers(stdev);
		if rejected > 0 {
			log::warn!("rejected {rejected} pair(s) outside the delta distribution");
		}
	}

	let (anchor_c, anchor_r) = choose_anchor(project, &icm, options.anchor_cr)?;
	let mut closed: ClosedSet = HashMap::new();
	closed.insert((anchor_c, anchor_r), (0.0, 0.0));
	set_position(project, &icm, anchor_c, anchor_r, 0.0, 0.0)?;

	attach_adjacent(project, &icm, &pairs, &mut closed)?;
	for parity in 0..2 {
		attach_linear(project, &icm, &pairs, &mut closed, parity)?;
	}

	// every image should be reachable by now
	for (col, row, fn_) in icm.iter_filled() {
		if !closed.contains_key(&(col, row)) {
			bail!(StitchError::BadInput(format!("could not place image {fn_}")));
		}
	}

	if options.check_poor_opt {
		check_poor_opt(project, &icm, config, img_w as f64 * fractions.x, img_h as f64 * fractions.y)?;
	}

	let rms = project.rms_error()?;
	log::info!("final RMS error: {rms:.3}");
	Ok(closed)
}

fn set_position(project: &mut Project, icm: &CoordMap, col: usize, row: usize, x: f64, y: f64) -> Result<()> {
	let fn_ = icm.get(col, row).context("no image at grid slot")?;
	let (index, _) = project
		.image_by_filename(fn_)
		.with_context(|| format!("image {fn_} not in project"))?;
	project.images[index].x = Some(x);
	project.images[index].y = Some(y);
	Ok(())
}

/// Picks the anchor: the given slot, or the first spiral candidate that
/// exists and joins at least one control point.
fn choose_anchor(project: &Project, icm: &CoordMap, use_cr: Option<(usize, usize)>) -> Result<(usize, usize)> {
	let filename_index = project.filename_index();
	let mut cp_counts: HashMap<usize, usize> = HashMap::new();
	for cp in &project.control_points {
		*cp_counts.entry(cp.n).or_default() += 1;
		*cp_counts.entry(cp.upper_n).or_default() += 1;
	}

	let usable = |col: usize, row: usize| -> bool {
		icm
			.get(col, row)
			.and_then(|fn_| filename_index.get(fn_))
			.is_some_and(|index| cp_counts.get(index).copied().unwrap_or(0) > 0)
	};

	if let Some((col, row)) = use_cr {
		if !usable(col, row) {
			bail!(StitchError::BadInput(format!(
				"anchor c{col} r{row} does not exist or has no control points"
			)));
		}
		log::info!("anchor image: c{col} r{row} (given)");
		return Ok((col, row));
	}

	for (col, row) in icm.iter_center() {
		if usable(col, row) {
			log::info!("anchor image: c{col} r{row}");
			return Ok((col, row));
		}
	}
	bail!(StitchError::NoAnchor)
}

/// Position estimates for `(col, row)` from its placed 4-neighbors whose
/// joining pair delta is still valid.
fn neighbor_estimates(pairs: &PairMap, closed: &ClosedSet, col: usize, row: usize) -> Vec<(f64, f64)> {
	let mut estimates = Vec::new();

	// left neighbor: our delta leads away from it
	if col > 0 {
		if let (Some(&o), Some(&Some((dx, dy)))) = (closed.get(&(col - 1, row)), pairs.x.get(&(col, row))) {
			estimates.push((o.0 - dx, o.1 - dy));
		}
	}
	// right neighbor: its delta leads back to us
	if let (Some(&o), Some(&Some((dx, dy)))) = (closed.get(&(col + 1, row)), pairs.x.get(&(col + 1, row))) {
		estimates.push((o.0 + dx, o.1 + dy));
	}
	if row > 0 {
		if let (Some(&o), Some(&Some((dx, dy)))) = (closed.get(&(col, row - 1)), pairs.y.get(&(col, row))) {
			estimates.push((o.0 - dx, o.1 - dy));
		}
	}
	if let (Some(&o), Some(&Some((dx, dy)))) = (closed.get(&(col, row + 1)), pairs.y.get(&(col, row + 1))) {
		estimates.push((o.0 + dx, o.1 + dy));
	}
	estimates
}

/// Wavefront propagation: sweep the grid, placing any image with at least
/// one placed neighbor, until a full sweep changes nothing.
fn attach_adjacent(project: &mut Project, icm: &CoordMap, pairs: &PairMap, closed: &mut ClosedSet) -> Result<()> {
	let mut iterations = 0;
	loop {
		iterations += 1;
		let mut fixes = 0;
		for row in 0..icm.height() {
			for col in 0..icm.width() {
				if closed.contains_key(&(col, row)) || icm.get(col, row).is_none() {
					continue;
				}
				let estimates = neighbor_estimates(pairs, closed, col, row);
				if estimates.is_empty() {
					continue;
				}
				let n = estimates.len() as f64;
				let x = estimates.iter().map(|e| e.0).sum::<f64>() / n;
				let y = estimates.iter().map(|e| e.1).sum::<f64>() / n;
				set_position(project, icm, col, row, x, y)?;
				closed.insert((col, row), (x, y));
				fixes += 1;
			}
		}
		if fixes == 0 {
			break;
		}
	}
	log::debug!(
		"wavefront: {iterations} sweeps, {} / {} images placed",
		closed.len(),
		icm.len()
	);
	Ok(())
}

/// Last resort for images the wavefront could not reach: extrapolate from
/// the nearest solved image of the same row parity using grid-wide delta
/// means.
fn attach_linear(
	project: &mut Project,
	icm: &CoordMap,
	pairs: &PairMap,
	closed: &mut ClosedSet,
	parity: usize,
) -> Result<()> {
	let unplaced: Vec<(usize, usize)> = icm
		.iter_filled()
		.filter(|(col, row, _)| row % 2 == parity && !closed.contains_key(&(*col, *row)))
		.map(|(col, row, _)| (col, row))
		.collect();
	if unplaced.is_empty() {
		return Ok(());
	}

	let mean_x = pairs
		.mean_x_for_parity(parity)
		.context("no valid x-pair deltas to extrapolate from")?;
	let mean_y: Delta = pairs
		.mean_y_for_parity(parity)
		.or_else(|| pairs.mean_y())
		.context("no valid y-pair deltas to extrapolate from")?;

	// only anchor to images solved before this pass
	let solved: ClosedSet = closed.clone();
	for (col, row) in unplaced {
		let (anch_c, anch_r) = icm
			.iter_center_from(col, row)
			.filter(|(_, r)| r % 2 == parity)
			.find(|slot| solved.contains_key(slot))
			.ok_or_else(|| StitchError::BadInput(format!("no solved image to extrapolate c{col} r{row} from")))?;
		let (anch_x, anch_y) = solved[&(anch_c, anch_r)];

		let dc = col as f64 - anch_c as f64;
		let dr = row as f64 - anch_r as f64;
		let x = anch_x - dc * mean_x.0 - dr * mean_y.0;
		let y = anch_y - dc * mean_x.1 - dr * mean_y.1;
		log::info!("extrapolating c{col} r{row} from c{anch_c} r{anch_r} => ({x:.1}, {y:.1})");
		set_position(project, icm, col, row, x, y)?;
		closed.insert((col, row), (x, y));
	}
	Ok(())
}

/// Flags placements whose neighbor deltas disagree with the expected stage
/// step. Diagnostics only, nothing is rejected.
fn check_poor_opt(project: &Project, icm: &CoordMap, config: &Config, ox: f64, oy: f64) -> Result<()> {
	let tol_1 = |expected: f64| expected + config.poor_opt_thresh;
	let tol_2 = config.poor_opt_thresh;

	let position = |fn_: &str| -> Option<(f64, f64)> {
		let (_, il) = project.image_by_filename(fn_)?;
		Some((il.x?, il.y?))
	};

	let mut fails = 0;
	for (col, row, fn_) in icm.iter_filled() {
		let Some((x, y)) = position(fn_) else { continue };
		if col > 0 {
			if let Some((lx, ly)) = icm.get(col - 1, row).and_then(&position) {
				let (dx, dy) = (lx - x, ly - y);
				if (dx - ox).abs() > tol_1(ox) {
					log::warn!("{fn_}: x step {dx:.0} outside expected {ox:.0}");
					fails += 1;
				}
				if dy.abs() > tol_2 {
					log::warn!("{fn_}: y drift {dy:.0} across an x step");
					fails += 1;
				}
			}
		}
		if row > 0 {
			if let Some((ux, uy)) = icm.get(col, row - 1).and_then(&position) {
				let (dx, dy) = (ux - x, uy - y);
				if dx.abs() > tol_2 {
					log::warn!("{fn_}: x drift {dx:.0} across a y step");
					fails += 1;
				}
				if (dy - oy).abs() > tol_1(oy) {
					log::warn!("{fn_}: y step {dy:.0} outside expected {oy:.0}");
					fails += 1;
				}
			}
		}
	}
	if fails > 0 {
		log::warn!("{fails} suspicious placement(s); inspect before tiling");
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_abs_diff_eq;
	use gridstitch_core::Project;
	use std::fmt::Write as _;

	/// Builds a grid project with control points derived from ideal
	/// positions plus per-point noise supplied by `noise`.
	fn grid_project(
		cols: usize,
		rows: usize,
		step: f64,
		mut noise: impl FnMut() -> f64,
	) -> (Project, Vec<Vec<usize>>) {
		let (w, h) = (256, 256);
		let mut text = String::from("p f0 w10000 h10000 v179\n");
		let mut index = vec![vec![0usize; cols]; rows];
		let mut i = 0;
		for row in 0..rows {
			for col in 0..cols {
				writeln!(text, "i w{w} h{h} f0 v51 n\"c{col:03}_r{row:03}.jpg\"").unwrap();
				index[row][col] = i;
				i += 1;
			}
		}
		for row in 0..rows {
			for col in 0..cols {
				if col > 0 {
					let (n, upper) = (index[row][col - 1], index[row][col]);
					writeln!(
						text,
						"c n{n} N{upper} x{} y{} X{} Y{} t0",
						230.0 + noise(),
						128.0 + noise(),
						230.0 - step,
						128.0
					)
					.unwrap();
				}
				if row > 0 {
					let (n, upper) = (index[row - 1][col], index[row][col]);
					writeln!(
						text,
						"c n{n} N{upper} x{} y{} X{} Y{} t0",
						128.0 + noise(),
						230.0 + noise(),
						128.0,
						230.0 - step
					)
					.unwrap();
				}
			}
		}
		(Project::from_text(&text).unwrap(), index)
	}

	fn defaults() -> (Config, StepFractions) {
		(Config::default(), StepFractions { x: 0.7, y: 0.7 })
	}

	#[test]
	fn perfect_grid_recovers_step() {
		// 3x3 grid, 256x256 images, 200 px step, anchored at the center
		let (mut project, index) = grid_project(3, 3, 200.0, || 0.0);
		let (config, fractions) = defaults();
		let options = XyOptions {
			anchor_cr: Some((1, 1)),
			..XyOptions::default()
		};
		let closed = xy_optimize(&mut project, &config, fractions, &options).unwrap();

		assert_eq!(closed.len(), 9);
		assert_eq!(closed[&(1, 1)], (0.0, 0.0));
		for row in 0..3 {
			for col in 0..3 {
				let il = &project.images[index[row][col]];
				// positive positions are left/up of the anchor
				let expected_x = (1.0 - col as f64) * 200.0;
				let expected_y = (1.0 - row as f64) * 200.0;
				assert_abs_diff_eq!(il.x.unwrap(), expected_x, epsilon = 1e-3);
				assert_abs_diff_eq!(il.y.unwrap(), expected_y, epsilon = 1e-3);
			}
		}
		assert_abs_diff_eq!(project.rms_error().unwrap(), 0.0, epsilon = 1e-9);
	}

	#[test]
	fn anchor_found_without_hint() {
		let (mut project, _) = grid_project(3, 3, 200.0, || 0.0);
		let (config, fractions) = defaults();
		let closed = xy_optimize(&mut project, &config, fractions, &XyOptions::default()).unwrap();
		// spiral starts at the grid center
		assert_eq!(closed[&(1, 1)], (0.0, 0.0));
	}

	#[test]
	fn no_control_points_means_no_anchor() {
		let (mut project, _) = grid_project(2, 2, 200.0, || 0.0);
		project.control_points.clear();
		let (config, fractions) = defaults();
		let err = xy_optimize(&mut project, &config, fractions, &XyOptions::default()).unwrap_err();
		assert!(matches!(err.downcast_ref::<StitchError>(), Some(StitchError::NoAnchor)));
	}

	#[test]
	fn bad_anchor_hint_rejected() {
		let (mut project, _) = grid_project(2, 2, 200.0, || 0.0);
		let (config, fractions) = defaults();
		let options = XyOptions {
			anchor_cr: Some((7, 7)),
			..XyOptions::default()
		};
		let err = xy_optimize(&mut project, &config, fractions, &options).unwrap_err();
		assert!(matches!(err.downcast_ref::<StitchError>(), Some(StitchError::BadInput(_))));
	}

	#[test]
	fn mismatched_dimensions_fatal() {
		let (mut project, _) = grid_project(2, 2, 200.0, || 0.0);
		project.images[3].width = Some(512);
		let (config, fractions) = defaults();
		let err = xy_optimize(&mut project, &config, fractions, &XyOptions::default()).unwrap_err();
		assert!(matches!(err.downcast_ref::<StitchError>(), Some(StitchError::BadInput(_))));
	}

	#[test]
	fn displaced_control_point_is_neutralized() {
		// an 8x3 grid with one horizontal pair displaced 50 px: inside the
		// overlap tolerance but far outside the per-stratum distribution
		// (14 even-row x-pairs put the 3-sigma cut at ~40 px); positions
		// must still match the clean solution
		let (mut project, index) = grid_project(8, 3, 200.0, || 0.0);
		let victim = project
			.control_points
			.iter_mut()
			.find(|cp| cp.n == index[0][1] && cp.upper_n == index[0][2])
			.unwrap();
		victim.x += 50.0;

		let (config, fractions) = defaults();
		let options = XyOptions {
			anchor_cr: Some((1, 1)),
			..XyOptions::default()
		};
		xy_optimize(&mut project, &config, fractions, &options).unwrap();

		for row in 0..3 {
			for col in 0..8 {
				let il = &project.images[index[row][col]];
				let expected_x = (1.0 - col as f64) * 200.0;
				let expected_y = (1.0 - row as f64) * 200.0;
				assert_abs_diff_eq!(il.x.unwrap(), expected_x, epsilon = 1.0);
				assert_abs_diff_eq!(il.y.unwrap(), expected_y, epsilon = 1.0);
			}
		}
	}

	#[test]
	fn noisy_grid_stays_weakly_consistent() {
		// uniform noise of amplitude sigma on every control point; the mean
		// absolute residual against the ideal grid must stay within 2 sigma
		let sigma = 0.75;
		let mut state: u64 = 0x2545F4914F6CDD1D;
		let mut noise = move || {
			// xorshift, mapped to [-sigma, sigma]
			state ^= state << 13;
			state ^= state >> 7;
			state ^= state << 17;
			(state >> 11) as f64 / (1u64 << 53) as f64 * 2.0 * sigma - sigma
		};

		let (mut project, index) = grid_project(5, 5, 200.0, &mut noise);
		let (config, fractions) = defaults();
		let options = XyOptions {
			anchor_cr: Some((2, 2)),
			check_poor_opt: false,
			..XyOptions::default()
		};
		xy_optimize(&mut project, &config, fractions, &options).unwrap();

		// residuals vs the ideal grid, with the common offset removed
		let mut residuals = Vec::new();
		for row in 0..5 {
			for col in 0..5 {
				let il = &project.images[index[row][col]];
				let rx = il.x.unwrap() - (2.0 - col as f64) * 200.0;
				let ry = il.y.unwrap() - (2.0 - row as f64) * 200.0;
				residuals.push((rx, ry));
			}
		}
		let n = residuals.len() as f64;
		let (ux, uy) = residuals
			.iter()
			.fold((0.0, 0.0), |acc, r| (acc.0 + r.0 / n, acc.1 + r.1 / n));
		let mean_abs = residuals
			.iter()
			.map(|(rx, ry)| ((rx - ux).powi(2) + (ry - uy).powi(2)).sqrt())
			.sum::<f64>()
			/ n;
		assert!(mean_abs <= 2.0 * sigma, "mean residual {mean_abs} vs sigma {sigma}");
	}

	#[test]
	fn gap_filled_by_linear_extrapolation() {
		// cut the only control points reaching the corner image; it must be
		// placed by extrapolation and still land on the grid
		let (mut project, index) = grid_project(3, 3, 200.0, || 0.0);
		let corner = index[2][2];
		project.control_points.retain(|cp| cp.n != corner && cp.upper_n != corner);

		let (config, fractions) = defaults();
		let options = XyOptions {
			anchor_cr: Some((1, 1)),
			..XyOptions::default()
		};
		let closed = xy_optimize(&mut project, &config, fractions, &options).unwrap();
		assert_eq!(closed.len(), 9);
		let il = &project.images[corner];
		assert_abs_diff_eq!(il.x.unwrap(), -200.0, epsilon = 1e-6);
		assert_abs_diff_eq!(il.y.unwrap(), -200.0, epsilon = 1e-6);
	}
}
