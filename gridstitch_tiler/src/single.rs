//! Assembling the cached supertiles into one composite image.
//!
//! Mostly a convenience for small and medium projects; the tile directory
//! is the real product. Supertile cache names carry their global position,
//! so the composite is a straight paste-up. Oversized canvases are refused
//! with [`StitchError::HugeImage`] so a giant scan cannot take the run down
//! right at the end.

use anyhow::{Context, Result, bail};
use gridstitch_core::StitchError;
use image::RgbImage;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Refuse composites above 2 gigapixels.
pub const DEFAULT_PIXEL_LIMIT: u64 = 2_000_000_000;

static ST_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^st_(\d+)x_(\d+)y\.(jpg|jpeg|png|tif|tiff)$").unwrap());

fn parse_st_position(path: &Path) -> Option<(i64, i64)> {
	let name = path.file_name()?.to_str()?;
	let caps = ST_NAME.captures(name)?;
	Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Pastes the supertile images into one composite and writes it to `out`.
///
/// `origin` is the canvas position of the crop's upper-left corner (the
/// supertile coordinates are global). Returns the composite dimensions.
pub fn singlify(st_files: &[PathBuf], origin: (i64, i64), out: &Path, pixel_limit: u64) -> Result<(u32, u32)> {
	bail_if_empty(st_files)?;

	// first pass: composite dimensions from headers only
	let mut width: i64 = 0;
	let mut height: i64 = 0;
	let mut placed = Vec::new();
	for path in st_files {
		let (x, y) = parse_st_position(path)
			.with_context(|| format!("supertile {} has no position tag", path.display()))?;
		let (w, h) = image::image_dimensions(path).with_context(|| format!("probing {}", path.display()))?;
		let (dx, dy) = (x - origin.0, y - origin.1);
		width = width.max(dx + i64::from(w));
		height = height.max(dy + i64::from(h));
		placed.push((path.clone(), dx, dy));
	}

	let pixels = (width * height) as u64;
	if pixels > pixel_limit {
		bail!(StitchError::HugeImage(pixels));
	}

	let mut composite = RgbImage::new(width as u32, height as u32);
	for (path, dx, dy) in placed {
		let st = image::open(&path)
			.with_context(|| format!("loading supertile {}", path.display()))?
			.to_rgb8();
		image::imageops::replace(&mut composite, &st, dx, dy);
	}
	composite.save(out).with_context(|| format!("writing {}", out.display()))?;
	Ok((width as u32, height as u32))
}

fn bail_if_empty(st_files: &[PathBuf]) -> Result<()> {
	if st_files.is_empty() {
		bail!(StitchError::BadInput("no supertiles to assemble".to_string()));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::Rgb;

	fn write_st(dir: &Path, x: i64, y: i64, w: u32, h: u32, color: Rgb<u8>) -> PathBuf {
		let path = dir.join(format!("st_{x:06}x_{y:06}y.png"));
		let img = RgbImage::from_pixel(w, h, color);
		img.save(&path).unwrap();
		path
	}

	#[test]
	fn pastes_supertiles_at_positions() {
		let dir = tempfile::tempdir().unwrap();
		let a = write_st(dir.path(), 0, 0, 40, 30, Rgb([255, 0, 0]));
		let b = write_st(dir.path(), 20, 0, 40, 30, Rgb([0, 255, 0]));
		let out = dir.path().join("single.png");

		let (w, h) = singlify(&[a, b], (0, 0), &out, DEFAULT_PIXEL_LIMIT).unwrap();
		assert_eq!((w, h), (60, 30));

		let composite = image::open(&out).unwrap().to_rgb8();
		assert_eq!(*composite.get_pixel(0, 0), Rgb([255, 0, 0]));
		// later supertile wins the overlap
		assert_eq!(*composite.get_pixel(30, 0), Rgb([0, 255, 0]));
		assert_eq!(*composite.get_pixel(59, 29), Rgb([0, 255, 0]));
	}

	#[test]
	fn origin_offsets_are_subtracted() {
		let dir = tempfile::tempdir().unwrap();
		let a = write_st(dir.path(), 100, 50, 20, 20, Rgb([1, 2, 3]));
		let out = dir.path().join("single.png");
		let (w, h) = singlify(&[a], (100, 50), &out, DEFAULT_PIXEL_LIMIT).unwrap();
		assert_eq!((w, h), (20, 20));
	}

	#[test]
	fn oversized_composite_refused() {
		let dir = tempfile::tempdir().unwrap();
		let a = write_st(dir.path(), 0, 0, 100, 100, Rgb([0, 0, 0]));
		let out = dir.path().join("single.png");
		let err = singlify(&[a], (0, 0), &out, 100).unwrap_err();
		assert!(matches!(err.downcast_ref::<StitchError>(), Some(StitchError::HugeImage(_))));
		assert!(!out.exists());
	}

	#[test]
	fn no_supertiles_rejected() {
		let out = PathBuf::from("/tmp/never-written.png");
		assert!(singlify(&[], (0, 0), &out, DEFAULT_PIXEL_LIMIT).is_err());
	}
}
