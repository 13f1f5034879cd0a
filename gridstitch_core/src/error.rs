//! Typed error kinds shared across the pipeline.
//!
//! Library code returns `anyhow::Result`; errors that callers need to match
//! on (to decide between abort and continue) are raised as `StitchError` so
//! they survive `downcast_ref` through an `anyhow` chain.

use thiserror::Error;

/// Fatal and recoverable failure kinds of the stitching pipeline.
#[derive(Debug, Error)]
pub enum StitchError {
	/// Missing images, unreadable project or mismatched image dimensions.
	#[error("bad input: {0}")]
	BadInput(String),

	/// The optimizer could not find any image with control points.
	#[error("no anchor image found (project has no usable control points)")]
	NoAnchor,

	/// The supertile geometry leaves no room between the clip margins.
	#[error("invalid clip: {0}")]
	InvalidClip(String),

	/// The external optimizer exited nonzero or its RMS exceeded the limit.
	#[error("optimizer failed: {0}")]
	OptimizerFailed(String),

	/// A remap or blend subprocess exited nonzero. Recoverable in lenient
	/// mode: the supertile is skipped and a failure counter incremented.
	#[error("command failed: {command}: {stderr}")]
	CommandFailed { command: String, stderr: String },

	/// The tile-selection predicate matched nothing inside a supertile.
	#[error("supertile produced no tiles")]
	NoTilesGenerated,

	/// Workers did not stop within the shutdown grace period.
	#[error("{0} worker(s) did not stop within the shutdown grace period")]
	StaleWorker(usize),

	/// The composite image would exceed the decompression limit.
	#[error("image of {0} pixels exceeds the decompression limit")]
	HugeImage(u64),
}
