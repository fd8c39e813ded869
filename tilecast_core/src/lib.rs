//! Core data model for tilecast.
//!
//! Contains the tile coordinate types, resource model with change
//! classification, reference frames, tile indices, metatiles and the
//! sink/error seams shared by the server and the measurement tools.

pub mod definition;
pub use definition::Definition;

mod constants;
mod error;
mod mask_tree;
mod math;
mod metatile;
mod reference_frame;
mod resource;
mod sink;
mod tile_index;
mod types;

pub use constants::*;
pub use error::*;
pub use mask_tree::*;
pub use math::*;
pub use metatile::*;
pub use reference_frame::*;
pub use resource::*;
pub use sink::*;
pub use tile_index::*;
pub use types::*;

/// Microseconds since the Unix epoch. Used for `readySince` stamps and
/// update-request bookkeeping.
pub fn usec_from_epoch() -> u64 {
	use std::time::{SystemTime, UNIX_EPOCH};
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_micros() as u64)
		.unwrap_or(0)
}
