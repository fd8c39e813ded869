/// Nominal size of a (bound layer) tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Area of a nominal tile in pixels.
pub fn tile_area() -> f64 {
	(TILE_SIZE * TILE_SIZE) as f64
}

/// Samples along one tile edge during metatile synthesis, as a binary
/// logarithm.
///
/// NB: Do Not Change!
///
/// This constant has huge impact on dataset stability. Changing this value
/// may break data already served to the outer world.
pub const METATILE_SAMPLES_PER_TILE_BIN_LOG: u32 = 3;

/// Samples along one tile edge during metatile synthesis.
pub const METATILE_SAMPLES_PER_TILE: u32 = 1 << METATILE_SAMPLES_PER_TILE_BIN_LOG;
