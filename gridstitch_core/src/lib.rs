//! Core types for the gridstitch toolbox.
//!
//! This crate holds everything the optimizers and the tiler share: the
//! coordinate map of an XY-stage capture, the line-oriented panorama project
//! model, runtime configuration, scan metadata, subprocess execution and a
//! handful of small utilities.

mod config;
mod coord_map;
mod error;
mod exec;
mod layout;
mod project;
mod scanmeta;
mod utils;

pub use config::{Config, ToolPaths};
pub use coord_map::CoordMap;
pub use error::StitchError;
pub use exec::{CommandRunner, ExecOutput, SystemRunner};
pub use layout::{GridLayout, LayoutTag, Parity, RowBreaks, ScanOrder, VerticalOrder};
pub use project::{
	AbsolutePointLine, ControlPointLine, CropRect, ImageLine, ModeLine, OptimizerLine, PanoramaLine, Project,
	VariableLine,
};
pub use scanmeta::{StepFractions, load_step_fractions};
pub use utils::{Stopwatch, format_size, mem_to_pixels, parse_size, pixels_to_mem};
