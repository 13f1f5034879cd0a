//! Shared test doubles: a project covering a 1000x800 canvas and a fake
//! runner standing in for the remap/blend binaries.

use anyhow::Result;
use gridstitch_core::{CommandRunner, ExecOutput, Project};
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::Mutex;

/// 5x4 grid of 256x256 images covering a 1000x800 canvas at a 200 px step.
pub fn test_project() -> Project {
	let mut text = String::from("p f0 w1000 h800 v179 S\"0,1000,0,800\"\n");
	for row in 0..4 {
		for col in 0..5 {
			// upper-left of each image lands at (col*200, row*200)
			let d = 500 - 128 - col * 200;
			let e = 400 - 128 - row * 200;
			text.push_str(&format!(
				"i w256 h256 f0 v51 d{d} e{e} n\"c{col:03}_r{row:03}.jpg\"\n"
			));
		}
	}
	Project::from_text(&text).unwrap()
}

/// Color of the mosaic at a global canvas position; distinct enough that a
/// mis-placed tile shows immediately, and far from the black padding.
pub fn canvas_color(gx: i64, gy: i64) -> Rgb<u8> {
	Rgb([(gx.rem_euclid(199) + 17) as u8, (gy.rem_euclid(199) + 17) as u8, 31])
}

/// Stands in for both external tools.
///
/// `nona` renders the cropped canvas region with [`canvas_color`] and
/// writes it as the single remapped TIFF; `enblend` copies its first input
/// to the requested output. Set `fail_on_left` to make the remap of the
/// supertile starting at that x fail once.
#[derive(Default)]
pub struct FakeStitchRunner {
	pub calls: Mutex<Vec<String>>,
	pub fail_on_left: Mutex<Option<i64>>,
}

impl CommandRunner for FakeStitchRunner {
	fn run(&self, program: &str, args: &[String], _cwd: Option<&Path>) -> Result<ExecOutput> {
		self.calls.lock().unwrap().push(program.to_string());
		let ok = ExecOutput {
			stdout: String::new(),
			stderr: String::new(),
			status: 0,
		};

		if program == "nona" {
			let prefix = &args[args.iter().position(|a| a == "-o").unwrap() + 1];
			let pto_path = args.last().unwrap();
			let project = Project::from_file(Path::new(pto_path))?;
			let crop = project.crop().expect("supertile project must be cropped");

			if *self.fail_on_left.lock().unwrap() == Some(crop.left) {
				*self.fail_on_left.lock().unwrap() = None;
				return Ok(ExecOutput {
					stdout: String::new(),
					stderr: "remap blew up".to_string(),
					status: 1,
				});
			}

			let mut img = RgbImage::new(crop.width() as u32, crop.height() as u32);
			for (px, py, pixel) in img.enumerate_pixels_mut() {
				*pixel = canvas_color(crop.left + i64::from(px), crop.top + i64::from(py));
			}
			img.save(format!("{prefix}0000.tif"))?;
			return Ok(ok);
		}

		if program == "enblend" {
			let out_pos = args.iter().position(|a| a == "-o").unwrap();
			let out = &args[out_pos + 1];
			let first_input = &args[out_pos + 2];
			std::fs::copy(first_input, out)?;
			return Ok(ok);
		}

		Ok(ok)
	}
}
