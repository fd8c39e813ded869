//! Tilecast: a geospatial map-tile proxy.
//!
//! Serves the tiles of reference-frame-structured pyramids (metatiles,
//! meshes, navtiles, masks, credits) generated on demand from GDAL rasters.
//! The library side holds the generator registry, the tile-generation code
//! and the calipers measurement tool; the binaries wire them to a CLI and
//! an HTTP front-end.

pub mod calipers;
pub mod generator;
pub mod http;
pub mod resources;
pub mod support;

mod file_info;
pub use file_info::*;
