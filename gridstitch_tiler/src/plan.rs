//! Supertile planning: how the cropped canvas splits into overlapping
//! supertiles, and which output tiles each supertile is allowed to emit.
//!
//! # Overview
//!
//! Blend artifacts concentrate near supertile borders, so a `clip` margin
//! inside every non-canvas edge is off limits for tile extraction. For the
//! canvas to stay fully covered, consecutive supertiles must step by less
//! than their size: `step = st − 2·clip − 2·tile`. Supertiles that would
//! stick out past the canvas are shifted back so they end exactly on the
//! edge, which keeps the full blend buffer inside the canvas.

use anyhow::{Result, bail, ensure};
use gridstitch_core::{CropRect, StitchError};
use itertools::Itertools;

/// One supertile: a rectangle in global canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StBounds {
	pub x0: i64,
	pub x1: i64,
	pub y0: i64,
	pub y1: i64,
}

impl StBounds {
	pub fn width(&self) -> i64 {
		self.x1 - self.x0
	}

	pub fn height(&self) -> i64 {
		self.y1 - self.y0
	}

	pub fn pixels(&self) -> u64 {
		(self.width() * self.height()).max(0) as u64
	}

	/// Cache filename of this supertile, keyed by its upper-left corner.
	pub fn cache_filename(&self) -> String {
		format!("st_{:06}x_{:06}y.jpg", self.x0, self.y0)
	}
}

/// An output tile assignment within a supertile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRef {
	pub row: i64,
	pub col: i64,
	/// Upper-left corner in global canvas coordinates.
	pub x: i64,
	pub y: i64,
}

/// Supertile sizing policy.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
	/// Output tile size; defaults to 250x250.
	pub tile_width: Option<i64>,
	pub tile_height: Option<i64>,
	/// Fixed supertile size.
	pub stw: Option<i64>,
	pub sth: Option<i64>,
	/// Pixel budget for automatic supertile sizing.
	pub stp: Option<u64>,
	/// Clip buffer; defaults to 1.5x the image size.
	pub clip_width: Option<i64>,
	pub clip_height: Option<i64>,
	/// Step overrides (advanced).
	pub xstep: Option<i64>,
	pub ystep: Option<i64>,
	/// One supertile covering the whole canvas.
	pub full: bool,
}

/// The resolved plan geometry.
#[derive(Debug, Clone)]
pub struct TilePlan {
	x0: i64,
	x1: i64,
	y0: i64,
	y1: i64,
	tw: i64,
	th: i64,
	stw: i64,
	sth: i64,
	clip_w: i64,
	clip_h: i64,
	xstep: i64,
	ystep: i64,
	full: bool,
}

/// Smallest value `>= v` that is `align + k * mult`.
fn ceil_mult(v: i64, mult: i64, align: i64) -> i64 {
	align + (v - align).div_euclid(mult) * mult + if (v - align).rem_euclid(mult) == 0 { 0 } else { mult }
}

impl TilePlan {
	/// Resolves the plan geometry for a cropped canvas.
	///
	/// `img_width`/`img_height` are the uniform capture dimensions; they
	/// drive the default clip (1.5x) and the default supertile size (4x).
	pub fn new(bounds: CropRect, img_width: i64, img_height: i64, options: &PlanOptions) -> Result<TilePlan> {
		ensure!(bounds.width() > 0 && bounds.height() > 0, "empty canvas");
		let tw = options.tile_width.unwrap_or(250);
		let th = options.tile_height.unwrap_or(250);
		ensure!(tw > 0 && th > 0, "bad tile size {tw}x{th}");

		let mut plan = TilePlan {
			x0: bounds.left,
			x1: bounds.right,
			y0: bounds.top,
			y1: bounds.bottom,
			tw,
			th,
			stw: 0,
			sth: 0,
			clip_w: options.clip_width.unwrap_or((img_width as f64 * 1.5) as i64),
			clip_h: options.clip_height.unwrap_or((img_height as f64 * 1.5) as i64),
			xstep: 0,
			ystep: 0,
			full: options.full,
		};

		if options.full {
			plan.stw = plan.width();
			plan.sth = plan.height();
			plan.clip_w = 1;
			plan.clip_h = 1;
			plan.xstep = 1;
			plan.ystep = 1;
			return Ok(plan);
		}

		if let Some(stp) = options.stp {
			ensure!(
				options.stw.is_none() && options.sth.is_none(),
				"cannot combine a pixel budget with an explicit supertile size"
			);
			let (stw, sth) = plan.auto_size(stp)?;
			plan.stw = stw;
			plan.sth = sth;
		} else {
			plan.stw = options.stw.unwrap_or(img_width * 4);
			plan.sth = options.sth.unwrap_or(img_height * 4);
		}

		// a supertile no larger than one image has no blend seams to hide
		if plan.stw <= img_width {
			plan.clip_w = 0;
		}
		if plan.sth <= img_height {
			plan.clip_h = 0;
		}

		plan.recalc_step()?;
		if let Some(xstep) = options.xstep {
			plan.xstep = xstep;
		}
		if let Some(ystep) = options.ystep {
			plan.ystep = ystep;
		}
		ensure!(plan.xstep > 0 && plan.ystep > 0, "bad supertile step");

		let st_pixels = plan.stw * plan.sth;
		let clipped = (plan.stw - 2 * plan.clip_w) * (plan.sth - 2 * plan.clip_h);
		log::debug!(
			"supertile {}x{}, clip {}x{}, step {}x{}, center efficiency {:.1}%",
			plan.stw,
			plan.sth,
			plan.clip_w,
			plan.clip_h,
			plan.xstep,
			plan.ystep,
			100.0 * clipped as f64 / st_pixels as f64
		);
		Ok(plan)
	}

	fn recalc_step(&mut self) -> Result<()> {
		self.xstep = self.stw - 2 * self.clip_w - 2 * self.tw;
		if self.xstep <= 0 {
			bail!(StitchError::InvalidClip(format!(
				"clip width {} leaves no x step in supertile width {} (tile {})",
				self.clip_w, self.stw, self.tw
			)));
		}
		self.ystep = self.sth - 2 * self.clip_h - 2 * self.th;
		if self.ystep <= 0 {
			bail!(StitchError::InvalidClip(format!(
				"clip height {} leaves no y step in supertile height {} (tile {})",
				self.clip_h, self.sth, self.th
			)));
		}
		Ok(())
	}

	/// Sweeps candidate supertile widths for a pixel budget, keeping the
	/// candidate that needs the fewest supertiles (perimeter breaks ties,
	/// since errors concentrate at edges), then trims away the overshoot of
	/// the last supertile in each axis.
	fn auto_size(&self, stp: u64) -> Result<(i64, i64)> {
		let aspect_max = 2.0;
		let min_stwh = ((stp as f64 / aspect_max).sqrt()) as i64;
		let max_stwh = ((stp as f64 * aspect_max).sqrt()) as i64;

		let mut best: Option<(usize, i64, i64, i64)> = None;
		let mut check_w = min_stwh.max(self.tw);
		while check_w < max_stwh {
			let check_h = (stp / check_w as u64) as i64;
			match self.sized(check_w, check_h) {
				Err(err) if err.downcast_ref::<StitchError>().is_some() => {
					log::debug!("discarding {check_w}x{check_h}: {err}");
				}
				Err(err) => return Err(err),
				Ok(trial) => {
					let n = trial.supertiles().len();
					let perimeter = 2 * (check_w + check_h);
					if n > 0 && best.is_none_or(|(bn, bp, ..)| n < bn || (n == bn && perimeter < bp)) {
						best = Some((n, perimeter, check_w, check_h));
						if n == 1 {
							break;
						}
					}
				}
			}
			check_w += 100;
		}

		let Some((best_n, _, mut stw, mut sth)) = best else {
			bail!(StitchError::InvalidClip(format!(
				"no valid supertile size for a {stp} pixel budget"
			)));
		};
		log::debug!("best sweep candidate: {best_n} supertiles at {stw}x{sth}");

		// trimming only helps when overshoot is spread over several tiles
		if best_n > 1 {
			let trial = self.sized(stw, sth)?;
			let (w_sts, w_extra, h_sts, h_extra) = trial.overshoot();
			stw -= w_extra / w_sts.max(1);
			sth -= h_extra / h_sts.max(1);
			log::debug!("trimmed supertile to {stw}x{sth} ({w_extra}/{h_extra} px overshoot)");
		}
		Ok((stw, sth))
	}

	fn sized(&self, stw: i64, sth: i64) -> Result<TilePlan> {
		let mut trial = self.clone();
		trial.stw = stw;
		trial.sth = sth;
		trial.recalc_step()?;
		Ok(trial)
	}

	/// Supertile count and single-side overshoot past the canvas edge for
	/// the current geometry, per axis.
	fn overshoot(&self) -> (i64, i64, i64, i64) {
		let mut w_sts = 0;
		let mut w_extra = 0;
		let mut x = self.x0;
		while x < self.x1 {
			w_sts += 1;
			if x + self.stw >= self.x1 {
				w_extra = x + self.stw - self.x1;
				break;
			}
			x += self.xstep;
		}
		let mut h_sts = 0;
		let mut h_extra = 0;
		let mut y = self.y0;
		while y < self.y1 {
			h_sts += 1;
			if y + self.sth >= self.y1 {
				h_extra = y + self.sth - self.y1;
				break;
			}
			y += self.ystep;
		}
		(w_sts, w_extra, h_sts, h_extra)
	}

	// ------------------------------------------------------------------
	// Queries
	// ------------------------------------------------------------------

	pub fn width(&self) -> i64 {
		self.x1 - self.x0
	}

	pub fn height(&self) -> i64 {
		self.y1 - self.y0
	}

	pub fn tile_width(&self) -> i64 {
		self.tw
	}

	pub fn tile_height(&self) -> i64 {
		self.th
	}

	pub fn is_full(&self) -> bool {
		self.full
	}

	pub fn supertile_pixels(&self) -> u64 {
		(self.stw * self.sth) as u64
	}

	/// Output tile grid dimensions; partial edge tiles count.
	pub fn rows(&self) -> i64 {
		(self.height() + self.th - 1) / self.th
	}

	pub fn cols(&self) -> i64 {
		(self.width() + self.tw - 1) / self.tw
	}

	pub fn expected_tiles(&self) -> u64 {
		(self.rows() * self.cols()) as u64
	}

	// ------------------------------------------------------------------
	// Generation
	// ------------------------------------------------------------------

	/// All supertiles in row-major plan order.
	///
	/// Steps by `(xstep, ystep)`; a supertile that would extend past the
	/// canvas is shifted back to end exactly on the edge.
	pub fn supertiles(&self) -> Vec<StBounds> {
		let mut out = Vec::new();
		let mut y = self.y0;
		loop {
			let y_done = y + self.sth >= self.y1;
			let (sy0, sy1) = if y_done {
				((self.y1 - self.sth).max(self.y0), self.y1)
			} else {
				(y, y + self.sth)
			};

			let mut x = self.x0;
			loop {
				let x_done = x + self.stw >= self.x1;
				let (sx0, sx1) = if x_done {
					((self.x1 - self.stw).max(self.x0), self.x1)
				} else {
					(x, x + self.stw)
				};
				out.push(StBounds {
					x0: sx0,
					x1: sx1,
					y0: sy0,
					y1: sy1,
				});
				if x_done {
					break;
				}
				x += self.xstep;
			}
			if y_done {
				break;
			}
			y += self.ystep;
		}
		out
	}

	/// Output tiles this supertile may produce.
	///
	/// A tile qualifies when it lies inside the supertile and outside the
	/// clip margin of every edge that is not a canvas edge. On canvas
	/// edges the margin drops to zero and partial tiles (later padded
	/// black) are allowed.
	pub fn tiles_in_supertile(&self, st: &StBounds) -> Result<Vec<TileRef>> {
		let xt0 = ceil_mult(st.x0, self.tw, self.x0);
		let xt1 = ceil_mult(st.x1, self.tw, self.x0);
		let yt0 = ceil_mult(st.y0, self.th, self.y0);
		let yt1 = ceil_mult(st.y1, self.th, self.y0);
		ensure!(xt0 < xt1 && yt0 < yt1, "supertile {st:?} holds no tile positions");

		let skip_xl = st.x0 == self.x0;
		let skip_xh = st.x1 == self.x1;
		let skip_yl = st.y0 == self.y0;
		let skip_yh = st.y1 == self.y1;

		let ys = (yt0..yt1).step_by(self.th as usize);
		let xs = (xt0..xt1).step_by(self.tw as usize);
		let tiles = ys
			.cartesian_product(xs)
			.filter(|&(y, x)| {
				if !skip_yl && y < st.y0 + self.clip_h {
					return false;
				}
				if !skip_yh && y + self.th > st.y1 - self.clip_h {
					return false;
				}
				if !skip_xl && x < st.x0 + self.clip_w {
					return false;
				}
				if !skip_xh && x + self.tw > st.x1 - self.clip_w {
					return false;
				}
				true
			})
			.map(|(y, x)| TileRef {
				row: (y - self.y0) / self.th,
				col: (x - self.x0) / self.tw,
				x,
				y,
			})
			.collect();
		Ok(tiles)
	}
}
