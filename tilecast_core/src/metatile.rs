//! Metatiles: per-tile metadata blocks.
//!
//! A metatile covers a square block of tiles (edge length `2^binary_order`)
//! and carries one [`MetaNode`] per tile: content flags, physical extents,
//! navigation height range, geometry extents with surrogate height, texel or
//! display size, child validity and credits.

use crate::{Extents3, TileId};
use anyhow::{Result, ensure};
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub mod meta_flags {
	pub const GEOMETRY_PRESENT: u16 = 0x01;
	pub const NAVTILE_PRESENT: u16 = 0x02;
	pub const APPLY_TEXEL_SIZE: u16 = 0x04;
	pub const APPLY_DISPLAY_SIZE: u16 = 0x08;

	/// Child validity bits, ordered ul, ur, ll, lr.
	pub const UL_CHILD: u16 = 0x10;
	pub const ALL_CHILDREN: u16 = 0xf0;

	pub fn child_bit(index: u8) -> u16 {
		UL_CHILD << index
	}
}

/// Height range in the navigation frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightRange {
	pub min: f64,
	pub max: f64,
}

impl HeightRange {
	pub fn empty() -> HeightRange {
		HeightRange {
			min: f64::INFINITY,
			max: f64::NEG_INFINITY,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.min > self.max
	}

	pub fn unite(&self, other: &HeightRange) -> HeightRange {
		HeightRange {
			min: self.min.min(other.min),
			max: self.max.max(other.max),
		}
	}
}

/// Geometry extents in the spatial division space: a vertical range plus a
/// surrogate height representing the tile's surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeomExtents {
	pub z_min: f64,
	pub z_max: f64,
	pub surrogate: f64,
}

impl GeomExtents {
	pub fn empty() -> GeomExtents {
		GeomExtents {
			z_min: f64::INFINITY,
			z_max: f64::NEG_INFINITY,
			surrogate: f64::NAN,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.z_min > self.z_max
	}

	/// Merges the vertical range; the surrogate is set separately.
	pub fn update(&mut self, other: &GeomExtents) {
		self.z_min = self.z_min.min(other.z_min);
		self.z_max = self.z_max.max(other.z_max);
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaNode {
	pub flags: u16,
	/// 3D extents in physical space.
	pub extents: Extents3,
	pub height_range: HeightRange,
	pub geom_extents: GeomExtents,
	pub texel_size: f64,
	pub display_size: u32,
	pub credits: Vec<String>,
}

impl Default for MetaNode {
	fn default() -> MetaNode {
		MetaNode {
			flags: 0,
			extents: Extents3::empty(),
			height_range: HeightRange::empty(),
			geom_extents: GeomExtents::empty(),
			texel_size: 0.0,
			display_size: 0,
			credits: Vec::new(),
		}
	}
}

impl MetaNode {
	pub fn geometry(&self) -> bool {
		self.flags & meta_flags::GEOMETRY_PRESENT != 0
	}

	pub fn set_geometry(&mut self, value: bool) {
		self.set_flag(meta_flags::GEOMETRY_PRESENT, value);
	}

	pub fn navtile(&self) -> bool {
		self.flags & meta_flags::NAVTILE_PRESENT != 0
	}

	pub fn set_navtile(&mut self, value: bool) {
		self.set_flag(meta_flags::NAVTILE_PRESENT, value);
	}

	pub fn apply_texel_size(&mut self, value: bool) {
		self.set_flag(meta_flags::APPLY_TEXEL_SIZE, value);
	}

	pub fn apply_display_size(&mut self, value: bool) {
		self.set_flag(meta_flags::APPLY_DISPLAY_SIZE, value);
	}

	pub fn child(&self, index: u8) -> bool {
		self.flags & meta_flags::child_bit(index) != 0
	}

	/// Sets the validity bit of the child in quadrant `index`
	/// (the quadrant numbering of [`TileId::child`]).
	pub fn set_child(&mut self, index: u8, valid: bool) {
		self.set_flag(meta_flags::child_bit(index), valid);
	}

	pub fn update_credits(&mut self, credits: &[String]) {
		for credit in credits {
			if !self.credits.contains(credit) {
				self.credits.push(credit.clone());
			}
		}
	}

	fn set_flag(&mut self, bit: u16, value: bool) {
		if value {
			self.flags |= bit;
		} else {
			self.flags &= !bit;
		}
	}
}

const MAGIC: &[u8; 4] = b"TCMT";
const VERSION: u16 = 1;

#[derive(Debug)]
pub struct MetaTile {
	id: TileId,
	origin: TileId,
	binary_order: u8,
	nodes: Vec<Option<MetaNode>>,
}

impl MetaTile {
	/// Creates an empty metatile for the block containing `id`.
	pub fn new(id: TileId, binary_order: u8) -> MetaTile {
		let mask = !((1u32 << binary_order) - 1);
		let origin = TileId {
			lod: id.lod,
			x: id.x & mask,
			y: id.y & mask,
		};
		let size = 1usize << binary_order;
		MetaTile {
			id,
			origin,
			binary_order,
			nodes: vec![None; size * size],
		}
	}

	pub fn id(&self) -> TileId {
		self.id
	}

	pub fn origin(&self) -> TileId {
		self.origin
	}

	/// Tiles along one metatile edge.
	pub fn size(&self) -> u32 {
		1 << self.binary_order
	}

	fn index(&self, tile: TileId) -> Option<usize> {
		if tile.lod != self.origin.lod {
			return None;
		}
		let dx = tile.x.checked_sub(self.origin.x)?;
		let dy = tile.y.checked_sub(self.origin.y)?;
		let size = self.size();
		if dx >= size || dy >= size {
			return None;
		}
		Some((dy * size + dx) as usize)
	}

	pub fn set(&mut self, tile: TileId, node: MetaNode) {
		let index = self.index(tile).expect("tile outside of metatile");
		self.nodes[index] = Some(node);
	}

	pub fn get(&self, tile: TileId) -> Option<&MetaNode> {
		self.nodes[self.index(tile)?].as_ref()
	}

	pub fn node_count(&self) -> usize {
		self.nodes.iter().filter(|node| node.is_some()).count()
	}

	pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
		writer.write_all(MAGIC)?;
		writer.write_u16::<LE>(VERSION)?;
		writer.write_u8(self.origin.lod)?;
		writer.write_u32::<LE>(self.origin.x)?;
		writer.write_u32::<LE>(self.origin.y)?;
		writer.write_u8(self.binary_order)?;

		// credit table shared by all nodes
		let mut credits: Vec<&String> = Vec::new();
		for node in self.nodes.iter().flatten() {
			for credit in &node.credits {
				if !credits.contains(&credit) {
					credits.push(credit);
				}
			}
		}
		writer.write_u16::<LE>(credits.len() as u16)?;
		for credit in &credits {
			writer.write_u16::<LE>(credit.len() as u16)?;
			writer.write_all(credit.as_bytes())?;
		}

		for node in &self.nodes {
			let Some(node) = node else {
				writer.write_u8(0)?;
				continue;
			};
			writer.write_u8(1)?;
			writer.write_u16::<LE>(node.flags)?;
			for value in [
				node.extents.x_min,
				node.extents.y_min,
				node.extents.z_min,
				node.extents.x_max,
				node.extents.y_max,
				node.extents.z_max,
				node.height_range.min,
				node.height_range.max,
				node.geom_extents.z_min,
				node.geom_extents.z_max,
				node.geom_extents.surrogate,
				node.texel_size,
			] {
				writer.write_f64::<LE>(value)?;
			}
			writer.write_u32::<LE>(node.display_size)?;
			writer.write_u8(node.credits.len() as u8)?;
			for credit in &node.credits {
				let index = credits.iter().position(|c| *c == credit).unwrap();
				writer.write_u16::<LE>(index as u16)?;
			}
		}
		Ok(())
	}

	pub fn load<R: Read>(reader: &mut R) -> Result<MetaTile> {
		let mut magic = [0u8; 4];
		reader.read_exact(&mut magic)?;
		ensure!(&magic == MAGIC, "not a metatile");
		let version = reader.read_u16::<LE>()?;
		ensure!(version == VERSION, "unsupported metatile version {version}");

		let lod = reader.read_u8()?;
		let x = reader.read_u32::<LE>()?;
		let y = reader.read_u32::<LE>()?;
		let binary_order = reader.read_u8()?;
		let mut metatile = MetaTile::new(TileId { lod, x, y }, binary_order);

		let credit_count = reader.read_u16::<LE>()?;
		let mut credits = Vec::with_capacity(credit_count as usize);
		for _ in 0..credit_count {
			let len = reader.read_u16::<LE>()?;
			let mut buffer = vec![0u8; len as usize];
			reader.read_exact(&mut buffer)?;
			credits.push(String::from_utf8(buffer)?);
		}

		let count = metatile.nodes.len();
		for index in 0..count {
			if reader.read_u8()? == 0 {
				continue;
			}
			let mut node = MetaNode {
				flags: reader.read_u16::<LE>()?,
				..MetaNode::default()
			};
			let mut values = [0.0f64; 12];
			for value in &mut values {
				*value = reader.read_f64::<LE>()?;
			}
			node.extents = Extents3 {
				x_min: values[0],
				y_min: values[1],
				z_min: values[2],
				x_max: values[3],
				y_max: values[4],
				z_max: values[5],
			};
			node.height_range = HeightRange {
				min: values[6],
				max: values[7],
			};
			node.geom_extents = GeomExtents {
				z_min: values[8],
				z_max: values[9],
				surrogate: values[10],
			};
			node.texel_size = values[11];
			node.display_size = reader.read_u32::<LE>()?;
			let node_credits = reader.read_u8()?;
			for _ in 0..node_credits {
				let credit = reader.read_u16::<LE>()? as usize;
				ensure!(credit < credits.len(), "credit index out of range");
				node.credits.push(credits[credit].clone());
			}
			metatile.nodes[index] = Some(node);
		}

		Ok(metatile)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn origin_is_aligned() {
		let metatile = MetaTile::new(TileId::new(6, 37, 42).unwrap(), 5);
		assert_eq!(metatile.origin(), TileId::new(6, 32, 32).unwrap());
		assert_eq!(metatile.size(), 32);
	}

	#[test]
	fn set_get_round_trip() {
		let mut metatile = MetaTile::new(TileId::new(4, 5, 9).unwrap(), 2);
		assert_eq!(metatile.origin(), TileId::new(4, 4, 8).unwrap());

		let mut node = MetaNode::default();
		node.set_geometry(true);
		node.set_child(2, true);
		node.texel_size = 3.25;
		metatile.set(TileId::new(4, 5, 9).unwrap(), node.clone());

		let stored = metatile.get(TileId::new(4, 5, 9).unwrap()).unwrap();
		assert!(stored.geometry());
		assert!(stored.child(2));
		assert!(!stored.child(0));
		assert_eq!(stored.texel_size, 3.25);
		assert!(metatile.get(TileId::new(4, 4, 8).unwrap()).is_none());
	}

	#[test]
	#[should_panic(expected = "outside of metatile")]
	fn set_outside_panics() {
		let mut metatile = MetaTile::new(TileId::new(4, 5, 9).unwrap(), 2);
		metatile.set(TileId::new(4, 8, 8).unwrap(), MetaNode::default());
	}

	#[test]
	fn height_range_unite() {
		let empty = HeightRange::empty();
		assert!(empty.is_empty());
		let range = empty.unite(&HeightRange { min: 3.0, max: 5.0 });
		let range = range.unite(&HeightRange { min: -1.0, max: 4.0 });
		assert_eq!(range, HeightRange { min: -1.0, max: 5.0 });
	}

	#[test]
	fn save_load_round_trip() {
		let mut metatile = MetaTile::new(TileId::new(3, 2, 2).unwrap(), 1);
		let mut node = MetaNode::default();
		node.set_geometry(true);
		node.set_navtile(true);
		node.apply_texel_size(true);
		node.extents.update([1.0, 2.0, 3.0]);
		node.extents.update([4.0, 5.0, 6.0]);
		node.height_range = HeightRange { min: 100.0, max: 200.0 };
		node.geom_extents = GeomExtents {
			z_min: 90.0,
			z_max: 210.0,
			surrogate: 150.0,
		};
		node.texel_size = 12.5;
		node.update_credits(&["cartographers".to_owned()]);
		metatile.set(TileId::new(3, 2, 3).unwrap(), node.clone());

		let mut buffer = Vec::new();
		metatile.save(&mut buffer).unwrap();
		let loaded = MetaTile::load(&mut buffer.as_slice()).unwrap();

		assert_eq!(loaded.origin(), metatile.origin());
		assert_eq!(loaded.node_count(), 1);
		let stored = loaded.get(TileId::new(3, 2, 3).unwrap()).unwrap();
		assert_eq!(stored, &node);
	}
}
