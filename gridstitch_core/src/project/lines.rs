//! Typed line kinds of the project format.
//!
//! Each kind knows its schema (which keys are ints, floats or quoted
//! strings) and its preferred print order. Keys outside the schema are held
//! verbatim in an `extras` map so unknown vendor keys survive a load/save
//! round trip.

use super::token::tokenize;
use anyhow::{Context, Result, ensure};
use std::collections::BTreeMap;
use std::fmt::Write as _;

fn push_extras(out: &mut String, extras: &BTreeMap<String, String>) {
	for (key, value) in extras {
		write!(out, " {key}{value}").unwrap();
	}
}

/// Explicit crop rectangle of the panorama line (`S"l,r,t,b"`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRect {
	pub left: i64,
	pub right: i64,
	pub top: i64,
	pub bottom: i64,
}

impl CropRect {
	pub fn width(&self) -> i64 {
		(self.right - self.left).abs()
	}

	pub fn height(&self) -> i64 {
		(self.bottom - self.top).abs()
	}

	fn parse(s: &str) -> Result<CropRect> {
		let parts: Vec<i64> = s
			.split(',')
			.map(|p| p.trim().parse::<i64>().context("bad crop component"))
			.collect::<Result<_>>()?;
		ensure!(parts.len() == 4, "crop needs 4 components, got {}", parts.len());
		Ok(CropRect {
			left: parts[0],
			right: parts[1],
			top: parts[2],
			bottom: parts[3],
		})
	}
}

/// The `p` header: canvas size, FOV, output options and optional crop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanoramaLine {
	pub projection: Option<i64>,
	pub width: Option<i64>,
	pub height: Option<i64>,
	pub fov: Option<f64>,
	pub name: Option<String>,
	pub exposure: Option<f64>,
	pub response: Option<i64>,
	pub crop: Option<CropRect>,
	pub extras: BTreeMap<String, String>,
}

impl PanoramaLine {
	pub fn parse(rest: &str) -> Result<PanoramaLine> {
		let mut line = PanoramaLine::default();
		for token in tokenize(rest)? {
			match token.key.as_str() {
				"f" => line.projection = Some(token.int()?),
				"w" => line.width = Some(token.int()?),
				"h" => line.height = Some(token.int()?),
				"v" => line.fov = Some(token.float()?),
				"n" => line.name = Some(token.string()?),
				"E" => line.exposure = Some(token.float()?),
				"R" => line.response = Some(token.int()?),
				"S" => line.crop = Some(CropRect::parse(&token.string()?)?),
				_ => {
					line.extras.insert(token.key, token.value.raw());
				}
			}
		}
		Ok(line)
	}

	pub fn write(&self, out: &mut String) {
		out.push('p');
		if let Some(v) = self.projection {
			write!(out, " f{v}").unwrap();
		}
		if let Some(v) = self.width {
			write!(out, " w{v}").unwrap();
		}
		if let Some(v) = self.height {
			write!(out, " h{v}").unwrap();
		}
		if let Some(v) = self.fov {
			write!(out, " v{v}").unwrap();
		}
		if let Some(v) = &self.name {
			write!(out, " n\"{v}\"").unwrap();
		}
		if let Some(v) = self.exposure {
			write!(out, " E{v}").unwrap();
		}
		if let Some(v) = self.response {
			write!(out, " R{v}").unwrap();
		}
		if let Some(c) = &self.crop {
			write!(out, " S\"{},{},{},{}\"", c.left, c.right, c.top, c.bottom).unwrap();
		}
		push_extras(out, &self.extras);
		out.push('\n');
	}
}

/// The `m` mode line. Only carried for tool compatibility.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeLine {
	pub extras: BTreeMap<String, String>,
}

impl ModeLine {
	pub fn parse(rest: &str) -> Result<ModeLine> {
		let mut line = ModeLine::default();
		for token in tokenize(rest)? {
			line.extras.insert(token.key, token.value.raw());
		}
		Ok(line)
	}

	pub fn write(&self, out: &mut String) {
		out.push('m');
		push_extras(out, &self.extras);
		out.push('\n');
	}
}

/// An `i` image line: dimensions, lens, FOV, position and filename.
///
/// Positions `d`/`e` follow the global convention of the rest of the
/// pipeline: positive values move the image left/up on the canvas, zero
/// places its center at the canvas center.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageLine {
	pub width: Option<i64>,
	pub height: Option<i64>,
	pub lens: Option<i64>,
	pub fov: Option<f64>,
	pub x: Option<f64>,
	pub y: Option<f64>,
	pub name: Option<String>,
	pub extras: BTreeMap<String, String>,
}

impl ImageLine {
	pub fn parse(rest: &str) -> Result<ImageLine> {
		let mut line = ImageLine::default();
		for token in tokenize(rest)? {
			match token.key.as_str() {
				"w" => line.width = Some(token.int()?),
				"h" => line.height = Some(token.int()?),
				"f" => line.lens = Some(token.int()?),
				"v" => line.fov = Some(token.float()?),
				"d" => line.x = Some(token.float()?),
				"e" => line.y = Some(token.float()?),
				"n" => line.name = Some(token.string()?),
				_ => {
					line.extras.insert(token.key, token.value.raw());
				}
			}
		}
		Ok(line)
	}

	pub fn write(&self, out: &mut String) {
		out.push('i');
		if let Some(v) = self.width {
			write!(out, " w{v}").unwrap();
		}
		if let Some(v) = self.height {
			write!(out, " h{v}").unwrap();
		}
		if let Some(v) = self.lens {
			write!(out, " f{v}").unwrap();
		}
		if let Some(v) = self.fov {
			write!(out, " v{v}").unwrap();
		}
		if let Some(v) = self.x {
			write!(out, " d{v}").unwrap();
		}
		if let Some(v) = self.y {
			write!(out, " e{v}").unwrap();
		}
		push_extras(out, &self.extras);
		if let Some(v) = &self.name {
			write!(out, " n\"{v}\"").unwrap();
		}
		out.push('\n');
	}

	pub fn filename(&self) -> Result<&str> {
		self.name.as_deref().context("image line has no filename")
	}

	/// Upper-left canvas position under the center-anchored placement
	/// convention. Requires dimensions to be known.
	pub fn canvas_rect(&self, pano_w: f64, pano_h: f64) -> Result<(f64, f64, f64, f64)> {
		let w = self.width.context("image line has no width")? as f64;
		let h = self.height.context("image line has no height")? as f64;
		let x = self.x.context("image line has no x position")?;
		let y = self.y.context("image line has no y position")?;
		let x0 = pano_w / 2.0 - w / 2.0 - x;
		let y0 = pano_h / 2.0 - h / 2.0 - y;
		Ok((x0, y0, x0 + w, y0 + h))
	}

	/// Retain only the given keys among `extras`. Typed fields are kept.
	pub fn retain_extras(&mut self, keys: &[&str]) {
		self.extras.retain(|k, _| keys.contains(&k.as_str()));
	}
}

/// A `c` control point asserting that a pixel in the lower-index image
/// corresponds to a pixel in the upper-index image.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPointLine {
	pub n: usize,
	pub upper_n: usize,
	pub x: f64,
	pub y: f64,
	pub upper_x: f64,
	pub upper_y: f64,
	pub kind: i64,
	pub extras: BTreeMap<String, String>,
}

impl ControlPointLine {
	pub fn parse(rest: &str) -> Result<ControlPointLine> {
		let mut n = None;
		let mut upper_n = None;
		let (mut x, mut y, mut upper_x, mut upper_y) = (None, None, None, None);
		let mut kind = 0;
		let mut extras = BTreeMap::new();
		for token in tokenize(rest)? {
			match token.key.as_str() {
				"n" => n = Some(token.int()? as usize),
				"N" => upper_n = Some(token.int()? as usize),
				"x" => x = Some(token.float()?),
				"y" => y = Some(token.float()?),
				"X" => upper_x = Some(token.float()?),
				"Y" => upper_y = Some(token.float()?),
				"t" => kind = token.int()?,
				_ => {
					extras.insert(token.key, token.value.raw());
				}
			}
		}
		let line = ControlPointLine {
			n: n.context("control point missing n")?,
			upper_n: upper_n.context("control point missing N")?,
			x: x.context("control point missing x")?,
			y: y.context("control point missing y")?,
			upper_x: upper_x.context("control point missing X")?,
			upper_y: upper_y.context("control point missing Y")?,
			kind,
			extras,
		};
		ensure!(line.n != line.upper_n, "control point references image {} twice", line.n);
		Ok(line)
	}

	pub fn write(&self, out: &mut String) {
		write!(
			out,
			"c n{} N{} x{} y{} X{} Y{} t{}",
			self.n, self.upper_n, self.x, self.y, self.upper_x, self.upper_y, self.kind
		)
		.unwrap();
		push_extras(out, &self.extras);
		out.push('\n');
	}
}

/// A `v` line marking image position variables as optimizable. An empty
/// `v` acts as a list terminator and is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableLine {
	pub entries: Vec<(String, usize)>,
}

impl VariableLine {
	pub fn parse(rest: &str) -> Result<VariableLine> {
		let mut entries = Vec::new();
		for token in tokenize(rest)? {
			let value = token.int()? as usize;
			entries.push((token.key, value));
		}
		Ok(VariableLine { entries })
	}

	pub fn for_image(index: usize) -> VariableLine {
		VariableLine {
			entries: vec![("d".to_string(), index), ("e".to_string(), index)],
		}
	}

	/// The image index referenced by this line, if consistent.
	pub fn index(&self) -> Result<Option<usize>> {
		let mut index = None;
		for (_, i) in &self.entries {
			match index {
				None => index = Some(*i),
				Some(prev) => ensure!(prev == *i, "variable line indices disagree: {prev} vs {i}"),
			}
		}
		Ok(index)
	}

	pub fn write(&self, out: &mut String) {
		out.push('v');
		for (key, index) in &self.entries {
			write!(out, " {key}{index}").unwrap();
		}
		out.push('\n');
	}
}

/// An `o` line as emitted by the external optimizer: the re-optimized
/// position of one image, matched to `i` lines by order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerLine {
	pub x: Option<f64>,
	pub y: Option<f64>,
	pub fov: Option<f64>,
	pub extras: BTreeMap<String, String>,
}

impl OptimizerLine {
	pub fn parse(rest: &str) -> Result<OptimizerLine> {
		let mut line = OptimizerLine::default();
		for token in tokenize(rest)? {
			match token.key.as_str() {
				"d" => line.x = Some(token.float()?),
				"e" => line.y = Some(token.float()?),
				"v" => line.fov = Some(token.float()?),
				_ => {
					line.extras.insert(token.key, token.value.raw());
				}
			}
		}
		Ok(line)
	}

	pub fn write(&self, out: &mut String) {
		out.push('o');
		if let Some(v) = self.fov {
			write!(out, " v{v}").unwrap();
		}
		if let Some(v) = self.x {
			write!(out, " d{v}").unwrap();
		}
		if let Some(v) = self.y {
			write!(out, " e{v}").unwrap();
		}
		push_extras(out, &self.extras);
		out.push('\n');
	}
}

/// A `C` line: per-control-point residuals reported by the external
/// optimizer. Parsed for completeness, never interpreted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbsolutePointLine {
	pub image: Option<i64>,
	pub point: Option<i64>,
	pub extras: BTreeMap<String, String>,
}

impl AbsolutePointLine {
	pub fn parse(rest: &str) -> Result<AbsolutePointLine> {
		let mut line = AbsolutePointLine::default();
		for token in tokenize(rest)? {
			match token.key.as_str() {
				"i" => line.image = Some(token.int()?),
				"c" => line.point = Some(token.int()?),
				_ => {
					line.extras.insert(token.key, token.value.raw());
				}
			}
		}
		Ok(line)
	}

	pub fn write(&self, out: &mut String) {
		out.push('C');
		if let Some(v) = self.image {
			write!(out, " i{v}").unwrap();
		}
		if let Some(v) = self.point {
			write!(out, " c{v}").unwrap();
		}
		push_extras(out, &self.extras);
		out.push('\n');
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn panorama_line_round_trip() {
		let line = PanoramaLine::parse(r#"f0 w10000 h8000 v179 n"TIFF_m c:LZW" E0.0 R0 S"0,1000,0,800""#).unwrap();
		assert_eq!(line.width, Some(10000));
		assert_eq!(line.crop.unwrap().width(), 1000);

		let mut out = String::new();
		line.write(&mut out);
		let again = PanoramaLine::parse(out.trim_start_matches('p')).unwrap();
		assert_eq!(line, again);
	}

	#[test]
	fn image_line_round_trip_with_extras() {
		let line = ImageLine::parse(r#"w3264 h2448 f0 v51 d-12.5 e3 Eev1 Ra0 n"c000_r000.jpg""#).unwrap();
		assert_eq!(line.name.as_deref(), Some("c000_r000.jpg"));
		assert_eq!(line.x, Some(-12.5));
		assert_eq!(line.extras.get("Eev").map(String::as_str), Some("1"));

		let mut out = String::new();
		line.write(&mut out);
		let again = ImageLine::parse(out.trim_start_matches('i')).unwrap();
		assert_eq!(line, again);
	}

	#[test]
	fn image_canvas_rect() {
		let line = ImageLine {
			width: Some(100),
			height: Some(80),
			x: Some(0.0),
			y: Some(0.0),
			..ImageLine::default()
		};
		// centered image on a 1000x800 canvas
		let (x0, y0, x1, y1) = line.canvas_rect(1000.0, 800.0).unwrap();
		assert_eq!((x0, y0, x1, y1), (450.0, 360.0, 550.0, 440.0));

		// positive d moves the image left
		let line = ImageLine { x: Some(50.0), ..line };
		let (x0, ..) = line.canvas_rect(1000.0, 800.0).unwrap();
		assert_eq!(x0, 400.0);
	}

	#[test]
	fn control_point_rejects_self_reference() {
		assert!(ControlPointLine::parse("n1 N1 x0 y0 X0 Y0 t0").is_err());
	}

	#[test]
	fn control_point_round_trip() {
		let line = ControlPointLine::parse("n0 N1 x1444.778035 y233.742619 X1225.863118 Y967.737131 t0").unwrap();
		assert_eq!(line.n, 0);
		assert_eq!(line.upper_n, 1);
		let mut out = String::new();
		line.write(&mut out);
		assert_eq!(line, ControlPointLine::parse(out.trim_start_matches('c')).unwrap());
	}

	#[test]
	fn variable_line_index() {
		let line = VariableLine::parse("d3 e3").unwrap();
		assert_eq!(line.index().unwrap(), Some(3));
		assert!(VariableLine::parse("d3 e4").unwrap().index().is_err());
		assert_eq!(VariableLine::default().index().unwrap(), None);
	}

	#[test]
	fn optimizer_line_keeps_buf_tokens() {
		let line = OptimizerLine::parse("f0 r0 p0 y0 v51 d-12.584355 e-1706.852324 u10 +buf -buf").unwrap();
		assert_eq!(line.x, Some(-12.584355));
		assert!(line.extras.contains_key("+buf"));
		let mut out = String::new();
		line.write(&mut out);
		assert!(out.contains("+buf"));
	}
}
