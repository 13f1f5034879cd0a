//! Runtime configuration.
//!
//! A `Config` is built once at process entry (from `$HOME/.gridstitchrc`
//! plus environment overrides) and passed down explicitly; nothing in the
//! pipeline reads configuration behind the caller's back.

use crate::utils::parse_size;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// External tool invocations. Each entry is the program name or path.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
	pub nona: String,
	pub enblend: String,
	pub pano_modify: String,
	pub ptoptimizer: String,
}

impl Default for ToolPaths {
	fn default() -> Self {
		ToolPaths {
			nona: "nona".to_string(),
			enblend: "enblend".to_string(),
			pano_modify: "pano_modify".to_string(),
			ptoptimizer: "PToptimizer".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TilerSection {
	st_max_pix: Option<String>,
	threads: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct BlenderSection {
	opts: Option<String>,
}

/// On-disk layout of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
	mem: Option<u64>,
	keep_temp: Option<bool>,
	overlap_threshold: Option<f64>,
	temp_base: Option<String>,
	ts: TilerSection,
	enblend: BlenderSection,
	tools: Option<ToolPaths>,
}

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
	/// Total memory budget in bytes for concurrent supertiles.
	pub max_mem: u64,
	/// Cap on pixels per supertile.
	pub st_max_pix: u64,
	/// Tiler worker threads; 0 selects the CPU count.
	pub threads: usize,
	/// Extra CLI arguments for the blender.
	pub enblend_opts: String,
	/// Prefix for scratch files.
	pub temp_base: String,
	pub keep_temp: bool,
	/// Minimum supertile overlap fraction an image needs to be kept.
	pub overlap_threshold: f64,
	/// Fraction of an image NOT shared with its neighbor, per axis.
	pub step_frac_x: f64,
	pub step_frac_y: f64,
	/// Pixel tolerance when flagging poorly optimized placements.
	pub poor_opt_thresh: f64,
	/// Pair deltas further than this fraction of the image width from the
	/// expected overlap are discarded.
	pub overlap_outlier_thresh: f64,
	/// Slower blender options that are more likely to succeed.
	pub enblend_safer_mode: bool,
	/// Disable seam optimization entirely.
	pub enblend_safest_mode: bool,
	pub tools: ToolPaths,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			max_mem: default_max_mem(),
			st_max_pix: 1_000_000_000,
			threads: 0,
			enblend_opts: String::new(),
			temp_base: "/tmp/gst_".to_string(),
			keep_temp: false,
			overlap_threshold: 0.0,
			step_frac_x: 0.7,
			step_frac_y: 0.7,
			poor_opt_thresh: 175.0,
			overlap_outlier_thresh: 0.10,
			enblend_safer_mode: false,
			enblend_safest_mode: false,
			tools: ToolPaths::default(),
		}
	}
}

/// 75% of physical memory, or 8 GB when it cannot be detected.
fn default_max_mem() -> u64 {
	detect_total_memory().map_or(8_000_000_000, |total| total * 3 / 4)
}

fn detect_total_memory() -> Option<u64> {
	let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
	for line in meminfo.lines() {
		if let Some(rest) = line.strip_prefix("MemTotal:") {
			let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
			return Some(kb * 1024);
		}
	}
	None
}

impl Config {
	/// Loads `$HOME/.gridstitchrc` (when present) and applies environment
	/// overrides.
	pub fn load() -> Result<Config> {
		let mut config = match std::env::var_os("HOME") {
			Some(home) => Config::from_path(&PathBuf::from(home).join(".gridstitchrc"))?,
			None => Config::default(),
		};
		config.apply_env_from(|key| std::env::var(key).ok())?;
		Ok(config)
	}

	/// Loads a config file; a missing file yields the defaults.
	pub fn from_path(path: &Path) -> Result<Config> {
		if !path.exists() {
			return Ok(Config::default());
		}
		let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
		Config::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
	}

	pub fn from_json(text: &str) -> Result<Config> {
		let file: ConfigFile = serde_json::from_str(text)?;
		let mut config = Config::default();
		if let Some(mem) = file.mem {
			config.max_mem = mem;
		}
		if let Some(keep) = file.keep_temp {
			config.keep_temp = keep;
		}
		if let Some(thresh) = file.overlap_threshold {
			config.overlap_threshold = thresh;
		}
		if let Some(base) = file.temp_base {
			config.temp_base = base;
		}
		if let Some(pix) = file.ts.st_max_pix {
			config.st_max_pix = parse_size(&pix)?;
		}
		if let Some(threads) = file.ts.threads {
			config.threads = threads;
		}
		if let Some(opts) = file.enblend.opts {
			config.enblend_opts = opts;
		}
		if let Some(tools) = file.tools {
			config.tools = tools;
		}
		Ok(config)
	}

	/// Applies `XY_*` environment overrides read through `get`.
	pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
		if let Some(v) = get("XY_OPT_THRESH") {
			self.poor_opt_thresh = v.parse().context("bad XY_OPT_THRESH")?;
		}
		if let Some(v) = get("XY_OVERLAP_OUTLIER_THRESH") {
			self.overlap_outlier_thresh = v.parse().context("bad XY_OVERLAP_OUTLIER_THRESH")?;
		}
		// the per-axis variables win over the shared one
		if let Some(v) = get("XY_STEP_FRAC") {
			let frac: f64 = v.parse().context("bad XY_STEP_FRAC")?;
			self.step_frac_x = frac;
			self.step_frac_y = frac;
		}
		if let Some(v) = get("XY_STEP_FRAC_X") {
			self.step_frac_x = v.parse().context("bad XY_STEP_FRAC_X")?;
		}
		if let Some(v) = get("XY_STEP_FRAC_Y") {
			self.step_frac_y = v.parse().context("bad XY_STEP_FRAC_Y")?;
		}
		Ok(())
	}

	/// Worker thread count, resolving 0 to the CPU count.
	pub fn threads(&self) -> usize {
		if self.threads > 0 { self.threads } else { num_cpus::get() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_sane() {
		let config = Config::default();
		assert_eq!(config.step_frac_x, 0.7);
		assert_eq!(config.overlap_outlier_thresh, 0.10);
		assert_eq!(config.st_max_pix, 1_000_000_000);
		assert!(config.max_mem > 0);
		assert!(config.threads() >= 1);
	}

	#[test]
	fn parses_config_json() {
		let config = Config::from_json(
			r#"{
				"mem": 2000000000,
				"ts": {"st_max_pix": "600m", "threads": 3},
				"enblend": {"opts": "--fine-mask"},
				"tools": {"enblend": "/opt/enblend"}
			}"#,
		)
		.unwrap();
		assert_eq!(config.max_mem, 2_000_000_000);
		assert_eq!(config.st_max_pix, 600_000_000);
		assert_eq!(config.threads, 3);
		assert_eq!(config.enblend_opts, "--fine-mask");
		assert_eq!(config.tools.enblend, "/opt/enblend");
		// unspecified tools keep their defaults
		assert_eq!(config.tools.nona, "nona");
	}

	#[test]
	fn env_overrides() {
		let mut config = Config::default();
		config
			.apply_env_from(|key| match key {
				"XY_OPT_THRESH" => Some("220".to_string()),
				"XY_STEP_FRAC" => Some("0.6".to_string()),
				"XY_STEP_FRAC_Y" => Some("0.65".to_string()),
				_ => None,
			})
			.unwrap();
		assert_eq!(config.poor_opt_thresh, 220.0);
		assert_eq!(config.step_frac_x, 0.6);
		assert_eq!(config.step_frac_y, 0.65);
	}

	#[test]
	fn bad_env_value_rejected() {
		let mut config = Config::default();
		let result = config.apply_env_from(|key| (key == "XY_OPT_THRESH").then(|| "nope".to_string()));
		assert!(result.is_err());
	}

	#[test]
	fn missing_file_yields_defaults() {
		let config = Config::from_path(Path::new("/nonexistent/.gridstitchrc")).unwrap();
		assert_eq!(config, Config::default());
	}
}
