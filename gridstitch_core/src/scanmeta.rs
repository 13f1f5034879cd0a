//! Expected-overlap metadata written by the capture planner.
//!
//! Two generations of files can sit next to the images: `scan.json` (kept
//! verbatim from the acquisition) and the newer `out.json`. Each has two
//! schema variants, detected by which keys are present. `out.json` wins
//! when both files exist.

use crate::Config;
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::path::Path;

/// Per-axis fraction of an image NOT shared with its neighbor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepFractions {
	pub x: f64,
	pub y: f64,
}

fn as_f64(value: &Value, what: &str) -> Result<f64> {
	value.as_f64().with_context(|| format!("{what} is not a number"))
}

fn parse_scan_json(j: &Value) -> Result<(f64, f64)> {
	if j.get("p").is_some() {
		// v2 carries the computed per-axis values
		let x = as_f64(&j["computed"]["x"]["overlap"], "scan.json computed.x.overlap")?;
		let y = as_f64(&j["computed"]["y"]["overlap"], "scan.json computed.y.overlap")?;
		Ok((x, y))
	} else if let Some(overlap) = j.get("overlap") {
		let v = as_f64(overlap, "scan.json overlap")?;
		Ok((v, v))
	} else {
		bail!("unknown scan.json format");
	}
}

fn parse_out_json(j: &Value) -> Result<(f64, f64)> {
	if j.get("x").and_then(|x| x.get("overlap")).is_some() {
		let x = as_f64(&j["x"]["overlap"], "out.json x.overlap")?;
		let y = as_f64(&j["y"]["overlap"], "out.json y.overlap")?;
		Ok((x, y))
	} else if j.get("planner").is_some() {
		let x = as_f64(&j["planner"]["x"]["overlap"], "out.json planner.x.overlap")?;
		let y = as_f64(&j["planner"]["y"]["overlap"], "out.json planner.y.overlap")?;
		Ok((x, y))
	} else {
		bail!("unknown out.json format");
	}
}

/// Loads the step fractions for a capture directory, falling back to the
/// configured defaults when no metadata is present.
pub fn load_step_fractions(dir: &Path, config: &Config) -> Result<StepFractions> {
	let mut fractions = StepFractions {
		x: config.step_frac_x,
		y: config.step_frac_y,
	};

	let scan_path = dir.join("scan.json");
	if scan_path.exists() {
		let j: Value = serde_json::from_str(&std::fs::read_to_string(&scan_path)?)
			.with_context(|| format!("parsing {}", scan_path.display()))?;
		let (x, y) = parse_scan_json(&j)?;
		fractions = StepFractions { x, y };
	}

	let out_path = dir.join("out.json");
	if out_path.exists() {
		let j: Value = serde_json::from_str(&std::fs::read_to_string(&out_path)?)
			.with_context(|| format!("parsing {}", out_path.display()))?;
		let (x, y) = parse_out_json(&j)?;
		fractions = StepFractions { x, y };
	}

	log::info!("image step fractions: x {:.3}, y {:.3}", fractions.x, fractions.y);
	Ok(fractions)
}
