//! Statistics helpers for the optimizers.

use anyhow::{Result, ensure};

pub fn mean(values: &[f64]) -> f64 {
	values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n-1 denominator).
pub fn stdev_sample(values: &[f64]) -> f64 {
	let u = mean(values);
	let variance = values.iter().map(|v| (v - u) * (v - u)).sum::<f64>() / (values.len() - 1) as f64;
	variance.sqrt()
}

/// Population standard deviation (n denominator).
pub fn stdev_population(values: &[f64]) -> f64 {
	let u = mean(values);
	let variance = values.iter().map(|v| (v - u) * (v - u)).sum::<f64>() / values.len() as f64;
	variance.sqrt()
}

/// Mean after dropping values more than `stdevs` population deviations from
/// the raw mean. Falls back to the raw mean when the filter removes
/// everything (all-equal inputs have zero deviation).
pub fn outlier_mean(values: &[f64], stdevs: f64) -> Result<f64> {
	ensure!(!values.is_empty(), "no values to average");
	let u = mean(values);
	let sd = stdev_population(values);
	let kept: Vec<f64> = values.iter().copied().filter(|v| (v - u).abs() < stdevs * sd).collect();
	if kept.is_empty() { Ok(u) } else { Ok(mean(&kept)) }
}

/// Degree-1 least squares fit, `y ≈ slope * x + intercept`.
///
/// A degenerate fit (fewer than two distinct x values) yields slope 0.
pub fn fit_line(xs: &[f64], ys: &[f64]) -> (f64, f64) {
	debug_assert_eq!(xs.len(), ys.len());
	let ux = mean(xs);
	let uy = mean(ys);
	let denominator: f64 = xs.iter().map(|x| (x - ux) * (x - ux)).sum();
	if denominator == 0.0 {
		return (0.0, uy);
	}
	let numerator: f64 = xs.iter().zip(ys).map(|(x, y)| (x - ux) * (y - uy)).sum();
	let slope = numerator / denominator;
	(slope, uy - slope * ux)
}
