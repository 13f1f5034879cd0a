//! The in-memory panorama project: one `p` header, ordered `i` image lines,
//! `c` control points referencing images by index, and the bookkeeping
//! lines the external tools expect around them.
//!
//! Images are identified by their position among the `i` lines; control
//! points store those indices, never references, which keeps the model
//! acyclic and makes deletion a renumbering pass.

mod lines;
mod token;

pub use lines::{
	AbsolutePointLine, ControlPointLine, CropRect, ImageLine, ModeLine, OptimizerLine, PanoramaLine, VariableLine,
};

use crate::StitchError;
use anyhow::{Context, Result, bail, ensure};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// A parsed project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Project {
	pub panorama: PanoramaLine,
	pub mode: Option<ModeLine>,
	pub images: Vec<ImageLine>,
	pub control_points: Vec<ControlPointLine>,
	pub variables: Vec<VariableLine>,
	pub optimizer_outputs: Vec<OptimizerLine>,
	pub absolute_points: Vec<AbsolutePointLine>,
	pub comments: Vec<String>,
}

impl Project {
	pub fn from_file(path: &Path) -> Result<Project> {
		let text = std::fs::read_to_string(path)
			.with_context(|| format!("reading project {}", path.display()))?;
		Project::from_text(&text).with_context(|| format!("parsing project {}", path.display()))
	}

	pub fn from_text(text: &str) -> Result<Project> {
		let mut project = Project::default();
		let mut saw_panorama = false;

		for (line_no, raw) in text.lines().enumerate() {
			let raw = raw.trim();
			if raw.is_empty() {
				continue;
			}
			let (prefix, rest) = raw.split_at(1);
			let parsed: Result<()> = (|| {
				match prefix {
					"p" => {
						project.panorama = PanoramaLine::parse(rest)?;
						saw_panorama = true;
					}
					"m" => project.mode = Some(ModeLine::parse(rest)?),
					"i" => project.images.push(ImageLine::parse(rest)?),
					"c" => project.control_points.push(ControlPointLine::parse(rest)?),
					"v" => project.variables.push(VariableLine::parse(rest)?),
					"o" => project.optimizer_outputs.push(OptimizerLine::parse(rest)?),
					"C" => project.absolute_points.push(AbsolutePointLine::parse(rest)?),
					"#" => project.comments.push(rest.trim_start().to_string()),
					// end-of-project sentinel; optimizer output follows it
					"*" => {}
					_ => bail!("unrecognized line kind {prefix:?}"),
				}
				Ok(())
			})();
			parsed.with_context(|| format!("line {}: {raw:?}", line_no + 1))?;
		}

		ensure!(saw_panorama, "project has no panorama line");
		project.check_indices()?;
		Ok(project)
	}

	fn check_indices(&self) -> Result<()> {
		let n_images = self.images.len();
		for cp in &self.control_points {
			ensure!(
				cp.n < n_images && cp.upper_n < n_images,
				"control point references image {} but project has {n_images} images",
				cp.n.max(cp.upper_n)
			);
		}
		Ok(())
	}

	pub fn save_as(&self, path: &Path) -> Result<()> {
		std::fs::write(path, self.to_text())
			.with_context(|| format!("writing project {}", path.display()))
	}

	pub fn to_text(&self) -> String {
		let mut out = String::new();
		for comment in &self.comments {
			out.push_str("# ");
			out.push_str(comment);
			out.push('\n');
		}
		self.panorama.write(&mut out);
		if let Some(mode) = &self.mode {
			mode.write(&mut out);
		}
		for image in &self.images {
			image.write(&mut out);
		}
		for cp in &self.control_points {
			cp.write(&mut out);
		}
		for var in &self.variables {
			var.write(&mut out);
		}
		out.push_str("*\n");
		for o in &self.optimizer_outputs {
			o.write(&mut out);
		}
		for c in &self.absolute_points {
			c.write(&mut out);
		}
		out
	}

	/// Builds the filename → image-index map.
	pub fn filename_index(&self) -> HashMap<String, usize> {
		self
			.images
			.iter()
			.enumerate()
			.filter_map(|(i, il)| il.name.clone().map(|n| (n, i)))
			.collect()
	}

	pub fn image_by_filename(&self, filename: &str) -> Option<(usize, &ImageLine)> {
		self
			.images
			.iter()
			.enumerate()
			.find(|(_, il)| il.name.as_deref() == Some(filename))
	}

	/// Removes the given images together with every control point that
	/// references them, renumbering the surviving points.
	pub fn del_images(&mut self, indices: &BTreeSet<usize>) {
		if indices.is_empty() {
			return;
		}

		// old index -> new index; None when dropped
		let mut remap = vec![None; self.images.len()];
		let mut next = 0;
		for (i, slot) in remap.iter_mut().enumerate() {
			if !indices.contains(&i) {
				*slot = Some(next);
				next += 1;
			}
		}

		let mut keep = 0;
		self.images.retain(|_| {
			let keeping = remap[keep].is_some();
			keep += 1;
			keeping
		});

		self.control_points.retain_mut(|cp| {
			match (remap[cp.n], remap[cp.upper_n]) {
				(Some(n), Some(upper_n)) => {
					cp.n = n;
					cp.upper_n = upper_n;
					true
				}
				_ => false,
			}
		});

		// optimize-variable lines reference stale indices; regenerate
		if !self.variables.is_empty() {
			self.set_optimize_xy();
		}
	}

	/// A copy with control points (and stale optimizer output) stripped,
	/// cheap enough to hand to every supertile worker.
	pub fn copy_without_control_points(&self) -> Project {
		let mut copy = self.clone();
		copy.control_points.clear();
		copy.optimizer_outputs.clear();
		copy.absolute_points.clear();
		copy
	}

	/// Marks `d`/`e` of every image as optimizable.
	pub fn set_optimize_xy(&mut self) {
		self.variables = (0..self.images.len()).map(VariableLine::for_image).collect();
		self.variables.push(VariableLine::default());
	}

	// ------------------------------------------------------------------
	// Panorama bounds
	// ------------------------------------------------------------------

	pub fn set_crop(&mut self, left: i64, right: i64, top: i64, bottom: i64) {
		self.panorama.crop = Some(CropRect { left, right, top, bottom });
	}

	pub fn uncrop(&mut self) {
		self.panorama.crop = None;
	}

	pub fn crop(&self) -> Option<CropRect> {
		self.panorama.crop
	}

	/// Crop bounds when set, otherwise the full canvas.
	pub fn bounds(&self) -> Result<CropRect> {
		if let Some(crop) = self.panorama.crop {
			return Ok(crop);
		}
		let width = self.panorama.width.context("panorama line has no width")?;
		let height = self.panorama.height.context("panorama line has no height")?;
		Ok(CropRect {
			left: 0,
			right: width,
			top: 0,
			bottom: height,
		})
	}

	// ------------------------------------------------------------------
	// Whole-project checks and transforms
	// ------------------------------------------------------------------

	/// All images must share width, height and FOV.
	pub fn verify_uniform_images(&self) -> Result<(i64, i64, f64)> {
		let first = self
			.images
			.first()
			.ok_or_else(|| StitchError::BadInput("project has no images".to_string()))?;
		let (w, h) = (first.width, first.height);
		let v = first.fov;
		for il in &self.images {
			if il.width != w || il.height != h || il.fov != v {
				return Err(
					StitchError::BadInput(format!(
						"image {:?} is {:?}x{:?} v{:?}, expected {w:?}x{h:?} v{v:?}",
						il.name, il.width, il.height, il.fov
					))
					.into(),
				);
			}
		}
		Ok((
			w.ok_or_else(|| StitchError::BadInput("images have no width".to_string()))?,
			h.ok_or_else(|| StitchError::BadInput("images have no height".to_string()))?,
			v.unwrap_or(51.0),
		))
	}

	/// Mean control-point residual distance under the current positions.
	pub fn rms_error(&self) -> Result<f64> {
		ensure!(!self.control_points.is_empty(), "project has no control points");
		let mut sum = 0.0;
		for cp in &self.control_points {
			let lower = &self.images[cp.n];
			let upper = &self.images[cp.upper_n];
			let (ld, le) = (
				lower.x.context("image missing x position")?,
				lower.y.context("image missing y position")?,
			);
			let (ud, ue) = (
				upper.x.context("image missing x position")?,
				upper.y.context("image missing y position")?,
			);
			// positions are positive left/up, pixel coordinates positive
			// down/right; the subtraction keeps the signs consistent
			let dx = (ld - cp.x) - (ud - cp.upper_x);
			let dy = (le - cp.y) - (ue - cp.upper_y);
			sum += (dx * dx + dy * dy).sqrt();
		}
		Ok(sum / self.control_points.len() as f64)
	}

	/// Translates all image positions so the occupied area centers on the
	/// canvas.
	pub fn center(&mut self) -> Result<()> {
		let pano_w = self.panorama.width.context("panorama line has no width")? as f64;
		let pano_h = self.panorama.height.context("panorama line has no height")? as f64;

		let mut bounds: Option<(f64, f64, f64, f64)> = None;
		for il in &self.images {
			let (x0, y0, x1, y1) = il.canvas_rect(pano_w, pano_h)?;
			bounds = Some(match bounds {
				None => (x0, y0, x1, y1),
				Some((bx0, by0, bx1, by1)) => (bx0.min(x0), by0.min(y0), bx1.max(x1), by1.max(y1)),
			});
		}
		let (bx0, by0, bx1, by1) = bounds.context("project has no images")?;

		let shift_x = (bx0 + bx1) / 2.0 - pano_w / 2.0;
		let shift_y = (by0 + by1) / 2.0 - pano_h / 2.0;
		for il in &mut self.images {
			// canvas x = C - d: moving content left means growing d
			il.x = Some(il.x.unwrap_or(0.0) + shift_x);
			il.y = Some(il.y.unwrap_or(0.0) + shift_y);
		}
		Ok(())
	}

	/// Strips image paths down to their final component.
	pub fn make_basename(&mut self) {
		for il in &mut self.images {
			if let Some(name) = &il.name {
				if let Some(base) = Path::new(name).file_name().and_then(|b| b.to_str()) {
					il.name = Some(base.to_string());
				}
			}
		}
	}

	/// Drops images whose overlap fraction with the current crop is below
	/// `threshold`. The blend tool fails hard on inputs it cannot use, so
	/// supertile workers call this after cropping.
	pub fn remove_low_overlap_images(&mut self, threshold: f64) -> Result<usize> {
		let crop = self.crop().context("project is not cropped")?;
		let pano_w = self.panorama.width.context("panorama line has no width")? as f64;
		let pano_h = self.panorama.height.context("panorama line has no height")? as f64;

		let mut drop = BTreeSet::new();
		for (i, il) in self.images.iter().enumerate() {
			let (x0, y0, x1, y1) = il.canvas_rect(pano_w, pano_h)?;
			let ox = (x1.min(crop.right as f64) - x0.max(crop.left as f64)).max(0.0);
			let oy = (y1.min(crop.bottom as f64) - y0.max(crop.top as f64)).max(0.0);
			let frac = (ox * oy) / ((x1 - x0) * (y1 - y0));
			if frac < threshold {
				drop.insert(i);
			}
		}
		let n = drop.len();
		self.del_images(&drop);
		Ok(n)
	}
}
