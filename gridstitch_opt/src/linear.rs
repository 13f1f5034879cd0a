//! The linear-regression re-optimizer.
//!
//! Treats the capture as a near-perfect grid and fits, per row-parity
//! stratum `p`,
//!
//! ```text
//! x = α(p)·col + β(p)·row + γ(p)
//! y = δ(p)·col + ε(p)·row + ζ(p)
//! ```
//!
//! then re-places every image from the fitted model. Splitting by row
//! parity captures serpentine backlash: alternate rows approach from
//! opposite directions and settle with a constant offset, which lands in
//! the γ/ζ terms.

use crate::stats;
use anyhow::{Context, Result, bail, ensure};
use gridstitch_core::{CoordMap, ImageLine, Project, StitchError};

#[derive(Debug, Clone)]
pub struct LinearOptions {
	/// Row-parity strata: 2 for serpentine captures, 1 when the stage
	/// compensates backlash.
	pub r_orders: usize,
	/// Skip empty grid slots instead of failing.
	pub allow_missing: bool,
}

impl Default for LinearOptions {
	fn default() -> Self {
		LinearOptions {
			r_orders: 2,
			allow_missing: false,
		}
	}
}

/// The fitted model, one coefficient set per stratum.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSolution {
	pub x_dc: Vec<f64>,
	pub x_dr: Vec<f64>,
	pub x_c: Vec<f64>,
	pub y_dc: Vec<f64>,
	pub y_dr: Vec<f64>,
	pub y_c: Vec<f64>,
}

type Selector = fn(&ImageLine) -> Option<f64>;

/// Per-row fits of `selector` against the column index; returns the
/// outlier-trimmed mean slope over `rows`.
fn regress_rows(
	icm: &CoordMap,
	project: &Project,
	rows: impl Iterator<Item = usize>,
	selector: Selector,
	allow_missing: bool,
) -> Result<f64> {
	let mut slopes = Vec::new();
	for row in rows {
		let mut cols = Vec::new();
		let mut deps = Vec::new();
		for col in 0..icm.width() {
			let Some(fn_) = icm.get(col, row) else {
				ensure!(allow_missing, "c{col} r{row} not in map");
				continue;
			};
			let (_, il) = project
				.image_by_filename(fn_)
				.with_context(|| format!("image {fn_} not in project"))?;
			cols.push(col as f64);
			deps.push(selector(il).with_context(|| format!("image {fn_} has no position"))?);
		}
		if cols.is_empty() {
			ensure!(allow_missing, "row {row} has no images to fit");
			continue;
		}
		slopes.push(stats::fit_line(&cols, &deps).0);
	}
	if slopes.is_empty() {
		ensure!(allow_missing, "no rows to fit");
		return Ok(0.0);
	}
	stats::outlier_mean(&slopes, 2.0)
}

/// Per-column fits of `selector` against the row index over the stratum's
/// rows only (mixing strata would fold the backlash offset into the
/// slope), aggregated the same way.
fn regress_cols(
	icm: &CoordMap,
	project: &Project,
	stratum_rows: &[usize],
	selector: Selector,
	allow_missing: bool,
) -> Result<f64> {
	let mut slopes = Vec::new();
	for col in 0..icm.width() {
		let mut rows = Vec::new();
		let mut deps = Vec::new();
		for &row in stratum_rows {
			let Some(fn_) = icm.get(col, row) else {
				ensure!(allow_missing, "c{col} r{row} not in map");
				continue;
			};
			let (_, il) = project
				.image_by_filename(fn_)
				.with_context(|| format!("image {fn_} not in project"))?;
			rows.push(row as f64);
			deps.push(selector(il).with_context(|| format!("image {fn_} has no position"))?);
		}
		if rows.is_empty() {
			ensure!(allow_missing, "column {col} has no images to fit");
			continue;
		}
		slopes.push(stats::fit_line(&rows, &deps).0);
	}
	if slopes.is_empty() {
		ensure!(allow_missing, "no columns to fit");
		return Ok(0.0);
	}
	stats::outlier_mean(&slopes, 2.0)
}

/// Constant terms: what is left of each stratum image's position after the
/// slope terms are subtracted, outlier-trimmed and averaged.
fn constants(
	icm: &CoordMap,
	project: &Project,
	solution: &mut LinearSolution,
	r_orders: usize,
	allow_missing: bool,
) -> Result<()> {
	for p in 0..r_orders {
		let mut x_cs = Vec::new();
		let mut y_cs = Vec::new();
		for col in 0..icm.width() {
			for row in (p..icm.height()).step_by(r_orders) {
				let Some(fn_) = icm.get(col, row) else {
					ensure!(allow_missing, "c{col} r{row} not in map");
					continue;
				};
				let (_, il) = project
					.image_by_filename(fn_)
					.with_context(|| format!("image {fn_} not in project"))?;
				let x = il.x.with_context(|| format!("image {fn_} has no position"))?;
				let y = il.y.with_context(|| format!("image {fn_} has no position"))?;
				x_cs.push(x - solution.x_dc[p] * col as f64 - solution.x_dr[p] * row as f64);
				y_cs.push(y - solution.y_dc[p] * col as f64 - solution.y_dr[p] * row as f64);
			}
		}
		ensure!(allow_missing || !x_cs.is_empty(), "stratum {p} has no images");
		if x_cs.is_empty() {
			solution.x_c.push(0.0);
			solution.y_c.push(0.0);
		} else {
			solution.x_c.push(stats::outlier_mean(&x_cs, 2.0)?);
			solution.y_c.push(stats::outlier_mean(&y_cs, 2.0)?);
		}
	}
	Ok(())
}

/// Fits the model to the project's current positions and re-places every
/// image from it. Returns the fitted solution.
pub fn linear_reoptimize(project: &mut Project, options: &LinearOptions) -> Result<LinearSolution> {
	if options.r_orders == 0 {
		bail!(StitchError::BadInput("cannot fit with zero row orders".to_string()));
	}
	let r_orders = options.r_orders;
	let allow_missing = options.allow_missing;

	let filenames: Vec<String> = project
		.images
		.iter()
		.map(|il| il.filename().map(str::to_string))
		.collect::<Result<_>>()?;
	let icm = CoordMap::from_tagged_filenames(&filenames)?;

	let mut solution = LinearSolution {
		x_dc: Vec::new(),
		x_dr: Vec::new(),
		x_c: Vec::new(),
		y_dc: Vec::new(),
		y_dr: Vec::new(),
		y_c: Vec::new(),
	};
	let sel_x: Selector = |il| il.x;
	let sel_y: Selector = |il| il.y;

	for p in 0..r_orders {
		let stratum_rows: Vec<usize> = (p..icm.height()).step_by(r_orders).collect();
		solution
			.x_dc
			.push(regress_rows(&icm, project, stratum_rows.iter().copied(), sel_x, allow_missing)?);
		solution
			.x_dr
			.push(regress_cols(&icm, project, &stratum_rows, sel_x, allow_missing)?);
		solution
			.y_dc
			.push(regress_rows(&icm, project, stratum_rows.iter().copied(), sel_y, allow_missing)?);
		solution
			.y_dr
			.push(regress_cols(&icm, project, &stratum_rows, sel_y, allow_missing)?);
	}

	constants(&icm, project, &mut solution, r_orders, allow_missing)?;

	for p in 0..r_orders {
		log::info!(
			"stratum {p}: x = {:.4}c + {:.4}r + {:.4}, y = {:.4}c + {:.4}r + {:.4}",
			solution.x_dc[p],
			solution.x_dr[p],
			solution.x_c[p],
			solution.y_dc[p],
			solution.y_dr[p],
			solution.y_c[p],
		);
	}

	// place every image from the fitted model
	for row in 0..icm.height() {
		for col in 0..icm.width() {
			let Some(fn_) = icm.get(col, row) else {
				ensure!(allow_missing, "c{col} r{row} not in map");
				continue;
			};
			let index = project
				.image_by_filename(fn_)
				.with_context(|| format!("image {fn_} not in project"))?
				.0;
			let p = row % r_orders;
			let (c, r) = (col as f64, row as f64);
			project.images[index].x = Some(solution.x_dc[p] * c + solution.x_dr[p] * r + solution.x_c[p]);
			project.images[index].y = Some(solution.y_dc[p] * c + solution.y_dr[p] * r + solution.y_c[p]);
		}
	}

	if let Ok(rms) = project.rms_error() {
		log::info!("final RMS error: {rms:.3}");
	}
	Ok(solution)
}
