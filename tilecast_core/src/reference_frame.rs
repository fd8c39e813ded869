//! Reference frames: hierarchical spatial partitionings of the globe.
//!
//! A reference frame is a quadtree rooted at a single node; selected
//! subtrees are re-rooted by further nodes, each with its own spatial
//! reference system and extents. A tile is owned by its nearest ancestor
//! node; [`NodeInfo`] resolves that ownership and derives the tile's extents
//! in the owning node's SRS by binary subdivision.

use crate::{Extents2, TileId};
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// One structural node of a reference frame's division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RfNode {
	pub id: TileId,
	/// SRS id, resolved through the [`Registry`].
	pub srs: String,
	/// Node extents in the node's own SRS.
	pub extents: Extents2,
	/// Unproductive nodes are structural only; no data is sampled in them.
	#[serde(default = "default_true")]
	pub productive: bool,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RfModel {
	pub physical_srs: String,
	pub navigation_srs: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceFrame {
	#[serde(default)]
	pub description: String,
	pub meta_binary_order: u8,
	pub model: RfModel,
	#[serde(with = "node_list")]
	pub nodes: BTreeMap<TileId, RfNode>,
}

impl ReferenceFrame {
	pub fn node(&self, id: &TileId) -> Option<&RfNode> {
		self.nodes.get(id)
	}

	pub fn nodes(&self) -> impl Iterator<Item = &RfNode> {
		self.nodes.values()
	}

	pub fn root(&self) -> Option<&RfNode> {
		self.nodes.get(&TileId::root())
	}

	/// Nearest ancestor node owning `tile` (including `tile` itself).
	pub fn find_node(&self, tile: TileId) -> Option<&RfNode> {
		let mut id = tile;
		loop {
			if let Some(node) = self.nodes.get(&id) {
				return Some(node);
			}
			if id.lod == 0 {
				return None;
			}
			id = id.parent();
		}
	}

	/// True when `tile` belongs to the reference frame tree.
	pub fn valid(&self, tile: TileId) -> bool {
		self.find_node(tile).is_some()
	}

	/// Number of tiles along one metatile edge.
	pub fn metatile_size(&self) -> u32 {
		1 << self.meta_binary_order
	}
}

/// A tile resolved within a reference frame: the owning subtree root and the
/// tile's extents in that node's SRS.
#[derive(Debug, Clone)]
pub struct NodeInfo<'a> {
	pub node: &'a RfNode,
	pub tile: TileId,
	pub extents: Extents2,
}

impl<'a> NodeInfo<'a> {
	/// Resolves `tile` to its owning node; `None` when the tile lies
	/// outside the reference frame tree.
	pub fn find(rf: &'a ReferenceFrame, tile: TileId) -> Option<NodeInfo<'a>> {
		let node = rf.find_node(tile)?;
		Some(NodeInfo {
			node,
			tile,
			extents: tile_extents(node, tile),
		})
	}

	pub fn srs(&self) -> &str {
		&self.node.srs
	}

	pub fn productive(&self) -> bool {
		self.node.productive
	}

	pub fn inside(&self, p: [f64; 2]) -> bool {
		self.node.extents.contains(p)
	}
}

/// Extents of `tile` in the SRS of its owning `node`, derived by quadtree
/// subdivision of the node extents. `tile` must lie under `node`.
pub fn tile_extents(node: &RfNode, tile: TileId) -> Extents2 {
	let depth = tile.lod - node.id.lod;
	let size = node.extents.size();
	let scale = f64::from(1u32 << depth);
	let width = size.width / scale;
	let height = size.height / scale;

	// tile y grows southward from the node's upper-left corner
	let dx = f64::from(tile.x - (node.id.x << depth));
	let dy = f64::from(tile.y - (node.id.y << depth));
	let x_min = node.extents.x_min + dx * width;
	let y_max = node.extents.y_max - dy * height;

	Extents2::new(x_min, y_max - height, x_min + width, y_max)
}

/// SRS definition held by the registry. The `def` string is anything the
/// coordinate library accepts (proj4, WKT, `EPSG:` code).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrsDefinition {
	pub def: String,
	#[serde(default)]
	pub description: String,
}

/// Registry of reference frames and SRS definitions, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
	pub reference_frames: HashMap<String, ReferenceFrame>,
	pub srs: HashMap<String, SrsDefinition>,
}

impl Registry {
	pub fn from_path(path: &Path) -> Result<Registry> {
		let text = std::fs::read_to_string(path).with_context(|| format!("cannot read registry {path:?}"))?;
		Registry::from_json(&text)
	}

	pub fn from_json(text: &str) -> Result<Registry> {
		let registry: Registry = serde_json::from_str(text).context("invalid registry")?;
		for (id, rf) in &registry.reference_frames {
			ensure!(rf.root().is_some(), "reference frame <{id}> has no root node");
			for node in rf.nodes() {
				ensure!(
					registry.srs.contains_key(&node.srs),
					"reference frame <{id}> references unknown srs <{}>",
					node.srs
				);
			}
			ensure!(
				registry.srs.contains_key(&rf.model.physical_srs),
				"reference frame <{id}> references unknown physical srs"
			);
			ensure!(
				registry.srs.contains_key(&rf.model.navigation_srs),
				"reference frame <{id}> references unknown navigation srs"
			);
		}
		Ok(registry)
	}

	pub fn reference_frame(&self, id: &str) -> Result<&ReferenceFrame> {
		self
			.reference_frames
			.get(id)
			.with_context(|| format!("unknown reference frame <{id}>"))
	}

	pub fn srs_def(&self, id: &str) -> Result<&SrsDefinition> {
		self.srs.get(id).with_context(|| format!("unknown srs <{id}>"))
	}

	/// Built-in single-frame registry: a web-mercator pyramid with WGS84
	/// navigation and a geocentric physical system. Used as the default
	/// when no registry file is configured.
	pub fn builtin() -> Registry {
		const WEBMERC_HALF: f64 = 20037508.342789244;
		let mut srs = HashMap::new();
		srs.insert(
			"pseudomerc".to_owned(),
			SrsDefinition {
				def: "+proj=webmerc +datum=WGS84 +no_defs".to_owned(),
				description: "Web Mercator".to_owned(),
			},
		);
		srs.insert(
			"geographic".to_owned(),
			SrsDefinition {
				def: "+proj=longlat +datum=WGS84 +no_defs".to_owned(),
				description: "WGS84 geographic".to_owned(),
			},
		);
		srs.insert(
			"geocentric".to_owned(),
			SrsDefinition {
				def: "+proj=geocent +datum=WGS84 +no_defs".to_owned(),
				description: "WGS84 geocentric".to_owned(),
			},
		);

		let mut nodes = BTreeMap::new();
		nodes.insert(
			TileId::root(),
			RfNode {
				id: TileId::root(),
				srs: "pseudomerc".to_owned(),
				extents: Extents2::new(-WEBMERC_HALF, -WEBMERC_HALF, WEBMERC_HALF, WEBMERC_HALF),
				productive: true,
			},
		);

		let mut reference_frames = HashMap::new();
		reference_frames.insert(
			"webmerc".to_owned(),
			ReferenceFrame {
				description: "Web Mercator pyramid".to_owned(),
				meta_binary_order: 5,
				model: RfModel {
					physical_srs: "geocentric".to_owned(),
					navigation_srs: "geographic".to_owned(),
				},
				nodes,
			},
		);

		Registry {
			reference_frames,
			srs,
		}
	}
}

/// Serializes the node map as a plain list, keyed by the node ids inside.
mod node_list {
	use super::*;
	use serde::{Deserializer, Serializer, ser::SerializeSeq};

	pub fn serialize<S: Serializer>(nodes: &BTreeMap<TileId, RfNode>, serializer: S) -> Result<S::Ok, S::Error> {
		let mut seq = serializer.serialize_seq(Some(nodes.len()))?;
		for node in nodes.values() {
			seq.serialize_element(node)?;
		}
		seq.end()
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<TileId, RfNode>, D::Error> {
		let nodes = Vec::<RfNode>::deserialize(deserializer)?;
		Ok(nodes.into_iter().map(|node| (node.id, node)).collect())
	}
}
