//! Common surface-generator pieces: tileset properties and file layout.

use super::GeneratorCore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tilecast_core::{LodRange, TileIndex, TileRange, definition::SurfaceDem};

pub const CONFIG_FILE: &str = "tileset.conf";
pub const INDEX_FILE: &str = "tileset.index";

/// Persisted surface properties (`tileset.conf`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilesetProperties {
	pub id: String,
	pub reference_frame: String,
	#[serde(default)]
	pub credits: Vec<String>,
	pub lod_range: LodRange,
	pub tile_range: TileRange,
	#[serde(default)]
	pub revision: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nominal_texel_size: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub merge_bottom_lod: Option<u8>,
}

impl TilesetProperties {
	pub fn load(path: &Path) -> Result<TilesetProperties> {
		let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {path:?}"))?;
		serde_json::from_str(&text).with_context(|| format!("invalid tileset config {path:?}"))
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		let text = serde_json::to_string_pretty(self)?;
		std::fs::write(path, text).with_context(|| format!("cannot write {path:?}"))
	}

	/// Applies the tuning knobs of a definition; returns true when
	/// something changed and the properties need re-saving.
	pub fn update(&mut self, definition: &SurfaceDem) -> bool {
		let mut changed = false;

		if self.nominal_texel_size != definition.nominal_texel_size {
			self.nominal_texel_size = definition.nominal_texel_size;
			changed = true;
		}

		if self.merge_bottom_lod != definition.merge_bottom_lod {
			self.merge_bottom_lod = definition.merge_bottom_lod;
			changed = true;
		}

		changed
	}
}

pub fn config_path(core: &GeneratorCore) -> PathBuf {
	core.root().join(CONFIG_FILE)
}

pub fn index_path(core: &GeneratorCore) -> PathBuf {
	core.root().join(INDEX_FILE)
}

/// Loads previously generated surface files; `None` when the surface was
/// never prepared (or its files are unreadable).
pub fn load_surface_files(core: &GeneratorCore) -> Option<(TilesetProperties, TileIndex)> {
	let config = config_path(core);
	let index = index_path(core);
	if !config.exists() || !index.exists() {
		return None;
	}

	match (TilesetProperties::load(&config), TileIndex::load_path(&index)) {
		(Ok(properties), Ok(index)) => Some((properties, index)),
		(Err(err), _) | (_, Err(err)) => {
			log::info!("Generator for <{}> not ready: {err:#}", core.resource().id);
			None
		}
	}
}

/// The layer-definition document served as `definition.json`.
pub fn definition_document(core: &GeneratorCore, properties: &TilesetProperties) -> serde_json::Value {
	let url = core.url();
	serde_json::json!({
		"id": properties.id,
		"referenceFrame": properties.reference_frame,
		"revision": properties.revision,
		"credits": properties.credits,
		"lodRange": [properties.lod_range.min, properties.lod_range.max],
		"tileRange": [
			[properties.tile_range.x_min, properties.tile_range.y_min],
			[properties.tile_range.x_max, properties.tile_range.y_max]
		],
		"metaUrl": format!("{url}{{lod}}-{{x}}-{{y}}.meta"),
		"meshUrl": format!("{url}{{lod}}-{{x}}-{{y}}.mesh"),
		"navtileUrl": format!("{url}{{lod}}-{{x}}-{{y}}.navtile"),
		"maskUrl": format!("{url}{{lod}}-{{x}}-{{y}}.mask"),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn properties() -> TilesetProperties {
		TilesetProperties {
			id: "terrain/alps".to_owned(),
			reference_frame: "webmerc".to_owned(),
			credits: vec![],
			lod_range: LodRange::new(2, 5).unwrap(),
			tile_range: TileRange::new(0, 0, 1, 1).unwrap(),
			revision: 2,
			nominal_texel_size: None,
			merge_bottom_lod: None,
		}
	}

	#[test]
	fn properties_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join(CONFIG_FILE);
		let props = properties();
		props.save(&path).unwrap();
		assert_eq!(TilesetProperties::load(&path).unwrap(), props);
	}

	#[test]
	fn update_tracks_tuning_knobs() {
		let mut props = properties();
		let mut definition = SurfaceDem {
			dataset: "dem/alps".to_owned(),
			mask: None,
			geoid_grid: None,
			heightcoding_alias: None,
			nominal_texel_size: Some(8.0),
			merge_bottom_lod: None,
			display_size: None,
			introspection: Default::default(),
		};

		assert!(props.update(&definition));
		assert_eq!(props.nominal_texel_size, Some(8.0));
		assert!(!props.update(&definition));

		definition.nominal_texel_size = None;
		assert!(props.update(&definition));
		assert_eq!(props.nominal_texel_size, None);
	}
}
