//! Typed requests submitted to the worker pool.
//!
//! Every request carries a stable fingerprint derived from all of its
//! semantically significant fields; the pool executes each fingerprint at
//! most once and broadcasts the result to all waiters.

use serde::{Deserialize, Serialize};
use tilecast_core::Extents2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RasterOperation {
	/// Plain image warp; channels follow the source band count.
	Image,
	/// Single-channel height grid.
	Dem,
	/// Three-channel (average, minimum, maximum) height summary; each
	/// output pixel approximates a local 3-value summary of the source.
	ValueMinMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resampling {
	NearestNeighbour,
	Bilinear,
	Cubic,
	CubicSpline,
	Lanczos,
	Average,
	Min,
	Max,
	/// DEM-appropriate resampling.
	Dem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterRequest {
	pub operation: RasterOperation,
	pub dataset: String,
	/// Target SRS definition.
	pub srs: String,
	pub extents: Extents2,
	pub size: (u32, u32),
	pub resampling: Resampling,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mask: Option<String>,
}

impl RasterRequest {
	pub fn fingerprint(&self) -> u64 {
		let mut hash = Fingerprint::new();
		hash.push_u64(match self.operation {
			RasterOperation::Image => 1,
			RasterOperation::Dem => 2,
			RasterOperation::ValueMinMax => 3,
		});
		hash.push_str(&self.dataset);
		hash.push_str(&self.srs);
		hash.push_extents(&self.extents);
		hash.push_u64(u64::from(self.size.0) << 32 | u64::from(self.size.1));
		hash.push_str(&format!("{:?}", self.resampling));
		if let Some(mask) = &self.mask {
			hash.push_str(mask);
		}
		hash.finish()
	}
}

/// A DEM usable for heightcoding: dataset path plus optional geoid grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemDataset {
	pub dataset: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub geoid_grid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HeightcodeMode {
	/// Replace any existing vertical component.
	Always,
	/// Keep existing vertical components, fill in missing ones.
	Auto,
	/// Never touch the vertical component.
	Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeightcodeConfig {
	/// SRS the heights are sampled in; defaults to the first DEM's SRS.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub working_srs: Option<String>,
	/// SRS of the produced geometry; defaults to the vector dataset's SRS.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub output_srs: Option<String>,
	/// Layers to process; all when absent.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub layers: Option<Vec<String>>,
	/// Features outside these (working-SRS) extents are dropped.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub clip_extents: Option<Extents2>,
	pub mode: HeightcodeMode,
}

impl Default for HeightcodeConfig {
	fn default() -> HeightcodeConfig {
		HeightcodeConfig {
			working_srs: None,
			output_srs: None,
			layers: None,
			clip_extents: None,
			mode: HeightcodeMode::Always,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeightcodeRequest {
	pub vector_dataset: String,
	pub raster_datasets: Vec<DemDataset>,
	pub config: HeightcodeConfig,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub vector_geoid_grid: Option<String>,
}

impl HeightcodeRequest {
	pub fn fingerprint(&self) -> u64 {
		let mut hash = Fingerprint::new();
		hash.push_u64(0x48_43);
		hash.push_str(&self.vector_dataset);
		for dem in &self.raster_datasets {
			hash.push_str(&dem.dataset);
			hash.push_str(dem.geoid_grid.as_deref().unwrap_or(""));
		}
		hash.push_str(&serde_json::to_string(&self.config).unwrap_or_default());
		hash.push_str(self.vector_geoid_grid.as_deref().unwrap_or(""));
		hash.finish()
	}
}

/// A navtile payload used as the primary height source when heightcoding
/// against already-generated data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavtileInfo {
	pub path: String,
	pub extents: Extents2,
	pub sds_srs: String,
	pub nav_srs: String,
	pub height_range: (f64, f64),
	pub size: (u32, u32),
	/// Raw f32 height grid, row-major, little-endian.
	pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavHeightcodeRequest {
	pub vector_dataset: String,
	pub navtile: NavtileInfo,
	pub config: HeightcodeConfig,
	/// DEM consulted where the navtile has no data.
	pub fallback_dataset: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub geoid_grid: Option<String>,
}

impl NavHeightcodeRequest {
	pub fn fingerprint(&self) -> u64 {
		let mut hash = Fingerprint::new();
		hash.push_u64(0x4e_48_43);
		hash.push_str(&self.vector_dataset);
		hash.push_str(&self.navtile.path);
		hash.push_extents(&self.navtile.extents);
		hash.push_str(&self.navtile.sds_srs);
		hash.push_str(&self.navtile.nav_srs);
		hash.push_u64(self.navtile.height_range.0.to_bits());
		hash.push_u64(self.navtile.height_range.1.to_bits());
		hash.push_bytes(&self.navtile.raw);
		hash.push_str(&serde_json::to_string(&self.config).unwrap_or_default());
		hash.push_str(&self.fallback_dataset);
		hash.push_str(self.geoid_grid.as_deref().unwrap_or(""));
		hash.finish()
	}
}

/// FNV-1a, 64 bit. Stable across processes and runs, unlike the std hasher.
struct Fingerprint {
	state: u64,
}

impl Fingerprint {
	fn new() -> Fingerprint {
		Fingerprint {
			state: 0xcbf2_9ce4_8422_2325,
		}
	}

	fn push_bytes(&mut self, bytes: &[u8]) {
		for &byte in bytes {
			self.state ^= u64::from(byte);
			self.state = self.state.wrapping_mul(0x0000_0100_0000_01b3);
		}
		// length separator, so that ("ab", "c") != ("a", "bc")
		self.push_raw_u64(bytes.len() as u64);
	}

	fn push_str(&mut self, text: &str) {
		self.push_bytes(text.as_bytes());
	}

	fn push_u64(&mut self, value: u64) {
		self.push_raw_u64(value);
	}

	fn push_extents(&mut self, extents: &Extents2) {
		for value in [extents.x_min, extents.y_min, extents.x_max, extents.y_max] {
			self.push_raw_u64(value.to_bits());
		}
	}

	fn push_raw_u64(&mut self, value: u64) {
		for byte in value.to_le_bytes() {
			self.state ^= u64::from(byte);
			self.state = self.state.wrapping_mul(0x0000_0100_0000_01b3);
		}
	}

	fn finish(&self) -> u64 {
		self.state
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn raster_request() -> RasterRequest {
		RasterRequest {
			operation: RasterOperation::ValueMinMax,
			dataset: "dem/alps".to_owned(),
			srs: "+proj=webmerc +datum=WGS84".to_owned(),
			extents: Extents2::new(0.0, 0.0, 100.0, 100.0),
			size: (65, 65),
			resampling: Resampling::Dem,
			mask: None,
		}
	}

	#[test]
	fn fingerprint_is_stable() {
		let a = raster_request();
		let b = raster_request();
		assert_eq!(a.fingerprint(), b.fingerprint());
	}

	#[test]
	fn fingerprint_tracks_every_field() {
		let base = raster_request();
		let base_print = base.fingerprint();

		let mut changed = base.clone();
		changed.operation = RasterOperation::Dem;
		assert_ne!(changed.fingerprint(), base_print);

		let mut changed = base.clone();
		changed.dataset = "dem/andes".to_owned();
		assert_ne!(changed.fingerprint(), base_print);

		let mut changed = base.clone();
		changed.extents = Extents2::new(0.0, 0.0, 100.0, 200.0);
		assert_ne!(changed.fingerprint(), base_print);

		let mut changed = base.clone();
		changed.size = (33, 33);
		assert_ne!(changed.fingerprint(), base_print);

		let mut changed = base.clone();
		changed.resampling = Resampling::Average;
		assert_ne!(changed.fingerprint(), base_print);
	}

	#[test]
	fn heightcode_fingerprint_tracks_dem_list() {
		let base = HeightcodeRequest {
			vector_dataset: "roads.shp".to_owned(),
			raster_datasets: vec![DemDataset {
				dataset: "dem/alps".to_owned(),
				geoid_grid: None,
			}],
			config: HeightcodeConfig::default(),
			vector_geoid_grid: None,
		};
		let mut changed = base.clone();
		changed.raster_datasets.push(DemDataset {
			dataset: "dem/andes".to_owned(),
			geoid_grid: None,
		});
		assert_ne!(base.fingerprint(), changed.fingerprint());
	}

	#[test]
	fn request_json_round_trip() {
		let request = raster_request();
		let text = serde_json::to_string(&request).unwrap();
		let parsed: RasterRequest = serde_json::from_str(&text).unwrap();
		assert_eq!(parsed, request);
		assert_eq!(parsed.fingerprint(), request.fingerprint());
	}
}
