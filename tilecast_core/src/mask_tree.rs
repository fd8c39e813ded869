//! Hierarchical bitmask restricting valid tiles.
//!
//! A mask tree is a set of quads (tiles at arbitrary depth); everything
//! under a marked quad is valid, everything else is not. A missing mask
//! means "everything valid" and is expressed as `Option<MaskTree>` at call
//! sites.

use crate::TileId;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct MaskTree {
	/// Marked quads per lod.
	quads: BTreeMap<u8, HashSet<(u32, u32)>>,
	/// Tiles with a marked self-or-descendant, per lod.
	coverage: BTreeMap<u8, HashSet<(u32, u32)>>,
}

impl MaskTree {
	pub fn new(quads: impl IntoIterator<Item = TileId>) -> MaskTree {
		let mut tree = MaskTree::default();
		for quad in quads {
			tree.quads.entry(quad.lod).or_default().insert((quad.x, quad.y));
		}
		tree.rebuild_coverage();
		tree
	}

	/// Loads a mask from a JSON list of quads (`[{"lod":…,"x":…,"y":…}]`).
	pub fn from_path(path: &Path) -> Result<MaskTree> {
		let text = std::fs::read_to_string(path).with_context(|| format!("cannot read mask {path:?}"))?;
		let quads: Vec<TileId> = serde_json::from_str(&text).context("invalid mask file")?;
		Ok(MaskTree::new(quads))
	}

	/// True when `tile` is at least partially covered by the mask: a marked
	/// quad lies on the path above it or somewhere in its subtree.
	pub fn covers(&self, tile: TileId) -> bool {
		// marked ancestor (or the tile itself)
		for (&lod, quads) in self.quads.range(..=tile.lod) {
			let ancestor = tile.ancestor_at(lod);
			if quads.contains(&(ancestor.x, ancestor.y)) {
				return true;
			}
		}
		// marked descendant
		self
			.coverage
			.get(&tile.lod)
			.is_some_and(|layer| layer.contains(&(tile.x, tile.y)))
	}

	fn rebuild_coverage(&mut self) {
		let Some(&max_lod) = self.quads.keys().next_back() else {
			return;
		};
		let mut below: HashSet<(u32, u32)> = HashSet::new();
		for lod in (0..=max_lod).rev() {
			let mut layer = below.clone();
			if let Some(quads) = self.quads.get(&lod) {
				layer.extend(quads.iter().copied());
			}
			below = layer.iter().map(|&(x, y)| (x / 2, y / 2)).collect();
			self.coverage.insert(lod, layer);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn marked_quad_covers_subtree() {
		let tree = MaskTree::new([TileId::new(2, 1, 1).unwrap()]);
		assert!(tree.covers(TileId::new(2, 1, 1).unwrap()));
		assert!(tree.covers(TileId::new(4, 5, 6).unwrap()));
		assert!(!tree.covers(TileId::new(4, 8, 6).unwrap()));
	}

	#[test]
	fn ancestors_of_marked_quad_are_partial() {
		let tree = MaskTree::new([TileId::new(3, 5, 2).unwrap()]);
		assert!(tree.covers(TileId::new(1, 1, 0).unwrap()));
		assert!(tree.covers(TileId::root()));
		assert!(!tree.covers(TileId::new(1, 0, 0).unwrap()));
	}

	#[test]
	fn empty_mask_covers_nothing() {
		let tree = MaskTree::new([]);
		assert!(!tree.covers(TileId::root()));
	}
}
