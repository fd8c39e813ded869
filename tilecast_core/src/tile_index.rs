//! Tile index: per-tile content flags with subtree queries.
//!
//! The index maps tile ids to a small bitset ([`tile_flags`]) and answers
//! two queries: the flags of a single tile and whether any descendant of a
//! tile produces content. It is built once (during generator preparation or
//! loaded from disk) and immutable afterwards; subtree queries are served
//! from coverage sets propagated upward at build time.

use crate::TileId;
use anyhow::{Result, ensure};
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;

pub mod tile_flags {
	pub const MESH: u8 = 0x01;
	pub const WATERTIGHT: u8 = 0x02;
	pub const NAVTILE: u8 = 0x04;

	/// A tile is real when it carries a mesh.
	pub fn is_real(flags: u8) -> bool {
		flags & MESH != 0
	}

	pub fn is_watertight(flags: u8) -> bool {
		flags & WATERTIGHT != 0
	}
}

const MAGIC: &[u8; 4] = b"TCTI";
const VERSION: u16 = 1;

#[derive(Debug, Default)]
pub struct TileIndexBuilder {
	lods: BTreeMap<u8, HashMap<(u32, u32), u8>>,
}

impl TileIndexBuilder {
	pub fn new() -> TileIndexBuilder {
		TileIndexBuilder::default()
	}

	/// Ors `flags` into the tile's bitset.
	pub fn set(&mut self, tile: TileId, flags: u8) {
		if flags == 0 {
			return;
		}
		*self.lods.entry(tile.lod).or_default().entry((tile.x, tile.y)).or_insert(0) |= flags;
	}

	pub fn build(self) -> TileIndex {
		let mut index = TileIndex {
			lods: self.lods,
			coverage: Vec::new(),
		};
		index.rebuild_coverage();
		index
	}
}

#[derive(Debug)]
pub struct TileIndex {
	lods: BTreeMap<u8, HashMap<(u32, u32), u8>>,
	/// `coverage[lod]` holds tiles with a flagged self-or-descendant.
	coverage: Vec<HashSet<(u32, u32)>>,
}

impl TileIndex {
	pub fn builder() -> TileIndexBuilder {
		TileIndexBuilder::new()
	}

	pub fn get(&self, tile: TileId) -> u8 {
		self
			.lods
			.get(&tile.lod)
			.and_then(|layer| layer.get(&(tile.x, tile.y)))
			.copied()
			.unwrap_or(0)
	}

	/// True when any tile in the subtree rooted at `tile` (including
	/// `tile` itself) carries a flag.
	pub fn valid_subtree(&self, tile: TileId) -> bool {
		self
			.coverage
			.get(tile.lod as usize)
			.is_some_and(|layer| layer.contains(&(tile.x, tile.y)))
	}

	pub fn max_lod(&self) -> Option<u8> {
		self.lods.keys().next_back().copied()
	}

	pub fn is_empty(&self) -> bool {
		self.lods.values().all(|layer| layer.is_empty())
	}

	fn rebuild_coverage(&mut self) {
		let Some(max_lod) = self.max_lod() else {
			self.coverage = Vec::new();
			return;
		};

		let mut coverage: Vec<HashSet<(u32, u32)>> = vec![HashSet::new(); max_lod as usize + 1];
		for lod in (0..=max_lod).rev() {
			let mut layer: HashSet<(u32, u32)> = self
				.lods
				.get(&lod)
				.map(|tiles| tiles.iter().filter(|(_, &flags)| flags != 0).map(|(&id, _)| id).collect())
				.unwrap_or_default();
			if (lod as usize) < max_lod as usize {
				for &(x, y) in &coverage[lod as usize + 1] {
					layer.insert((x / 2, y / 2));
				}
			}
			coverage[lod as usize] = layer;
		}
		self.coverage = coverage;
	}

	pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
		writer.write_all(MAGIC)?;
		writer.write_u16::<LE>(VERSION)?;
		writer.write_u8(self.lods.len() as u8)?;
		for (&lod, tiles) in &self.lods {
			writer.write_u8(lod)?;
			writer.write_u32::<LE>(tiles.len() as u32)?;
			let mut sorted: Vec<_> = tiles.iter().collect();
			sorted.sort();
			for (&(x, y), &flags) in sorted {
				writer.write_u32::<LE>(x)?;
				writer.write_u32::<LE>(y)?;
				writer.write_u8(flags)?;
			}
		}
		Ok(())
	}

	pub fn load<R: Read>(reader: &mut R) -> Result<TileIndex> {
		let mut magic = [0u8; 4];
		reader.read_exact(&mut magic)?;
		ensure!(&magic == MAGIC, "not a tile index file");
		let version = reader.read_u16::<LE>()?;
		ensure!(version == VERSION, "unsupported tile index version {version}");

		let lod_count = reader.read_u8()?;
		let mut lods = BTreeMap::new();
		for _ in 0..lod_count {
			let lod = reader.read_u8()?;
			let count = reader.read_u32::<LE>()?;
			let mut tiles = HashMap::with_capacity(count as usize);
			for _ in 0..count {
				let x = reader.read_u32::<LE>()?;
				let y = reader.read_u32::<LE>()?;
				let flags = reader.read_u8()?;
				tiles.insert((x, y), flags);
			}
			lods.insert(lod, tiles);
		}

		let mut index = TileIndex {
			lods,
			coverage: Vec::new(),
		};
		index.rebuild_coverage();
		Ok(index)
	}

	pub fn save_path(&self, path: &Path) -> Result<()> {
		let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
		self.save(&mut writer)
	}

	pub fn load_path(path: &Path) -> Result<TileIndex> {
		let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
		TileIndex::load(&mut reader)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tile_flags::{MESH, NAVTILE, WATERTIGHT};

	fn sample_index() -> TileIndex {
		let mut builder = TileIndex::builder();
		builder.set(TileId::new(3, 1, 1).unwrap(), MESH | NAVTILE);
		builder.set(TileId::new(3, 2, 1).unwrap(), MESH | WATERTIGHT);
		builder.set(TileId::new(5, 10, 9).unwrap(), MESH);
		builder.build()
	}

	#[test]
	fn get_returns_flags() {
		let index = sample_index();
		assert_eq!(index.get(TileId::new(3, 1, 1).unwrap()), MESH | NAVTILE);
		assert_eq!(index.get(TileId::new(3, 0, 0).unwrap()), 0);
	}

	#[test]
	fn valid_subtree_matches_brute_force() {
		let index = sample_index();

		// ancestors of flagged tiles
		assert!(index.valid_subtree(TileId::root()));
		assert!(index.valid_subtree(TileId::new(2, 0, 0).unwrap()));
		assert!(index.valid_subtree(TileId::new(4, 5, 4).unwrap()));
		// flagged tile itself
		assert!(index.valid_subtree(TileId::new(5, 10, 9).unwrap()));

		// outside any flagged subtree
		assert!(!index.valid_subtree(TileId::new(2, 3, 3).unwrap()));
		assert!(!index.valid_subtree(TileId::new(4, 4, 4).unwrap()));
		// deeper than the index reaches
		assert!(!index.valid_subtree(TileId::new(6, 20, 18).unwrap()));
	}

	#[test]
	fn save_load_round_trip() {
		let index = sample_index();
		let mut buffer = Vec::new();
		index.save(&mut buffer).unwrap();

		let loaded = TileIndex::load(&mut buffer.as_slice()).unwrap();
		assert_eq!(loaded.get(TileId::new(3, 2, 1).unwrap()), MESH | WATERTIGHT);
		assert!(loaded.valid_subtree(TileId::new(4, 5, 4).unwrap()));
		assert_eq!(loaded.max_lod(), Some(5));
	}

	#[test]
	fn load_rejects_garbage() {
		assert!(TileIndex::load(&mut &b"nope"[..]).is_err());
	}

	#[test]
	fn empty_index() {
		let index = TileIndex::builder().build();
		assert!(index.is_empty());
		assert!(!index.valid_subtree(TileId::root()));
	}
}
