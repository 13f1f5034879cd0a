//! The supertile tiler.
//!
//! Turns a globally-optimized project into a directory of fixed-size output
//! tiles without ever holding the full mosaic in memory. The cropped canvas
//! is partitioned into overlapping supertiles; a worker pool remaps and
//! blends each one through the external panorama tools; the coordinator
//! slices every finished supertile into output tiles, honoring a clip
//! buffer so blend seams never reach a tile.

mod blender;
mod plan;
mod profile;
mod remapper;
mod single;
#[cfg(test)]
mod testutil;
mod tileset;
mod tiler;
mod worker;

pub use blender::Blender;
pub use plan::{PlanOptions, StBounds, TilePlan};
pub use remapper::Remapper;
pub use single::{DEFAULT_PIXEL_LIMIT, singlify};
pub use tileset::TileSet;
pub use tiler::{Tiler, TilerOptions, TilerReport, derive_workers};
pub use worker::WorkerReply;
