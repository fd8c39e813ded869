//! Inclusive tile ranges.
//!
//! A [`TileRange`] is a rectangle of tile coordinates at one (implicit) lod,
//! with both corners included. The empty state uses inverted corners so that
//! a range can be grown point by point.

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileRange {
	pub x_min: u32,
	pub y_min: u32,
	pub x_max: u32,
	pub y_max: u32,
}

impl TileRange {
	pub fn new(x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Result<TileRange> {
		ensure!(
			x_min <= x_max && y_min <= y_max,
			"invalid tile range ({x_min}, {y_min}, {x_max}, {y_max})"
		);
		Ok(TileRange {
			x_min,
			y_min,
			x_max,
			y_max,
		})
	}

	/// Range growable via [`TileRange::update`]; empty until the first point.
	pub fn empty() -> TileRange {
		TileRange {
			x_min: u32::MAX,
			y_min: u32::MAX,
			x_max: 0,
			y_max: 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.x_min > self.x_max || self.y_min > self.y_max
	}

	pub fn update(&mut self, x: u32, y: u32) {
		self.x_min = self.x_min.min(x);
		self.y_min = self.y_min.min(y);
		self.x_max = self.x_max.max(x);
		self.y_max = self.y_max.max(y);
	}

	pub fn contains(&self, x: u32, y: u32) -> bool {
		x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
	}

	pub fn intersect(&self, other: &TileRange) -> Option<TileRange> {
		let range = TileRange {
			x_min: self.x_min.max(other.x_min),
			y_min: self.y_min.max(other.y_min),
			x_max: self.x_max.min(other.x_max),
			y_max: self.y_max.min(other.y_max),
		};
		if range.is_empty() { None } else { Some(range) }
	}

	/// Width and height in tiles.
	pub fn size(&self) -> (u32, u32) {
		if self.is_empty() {
			(0, 0)
		} else {
			(self.x_max - self.x_min + 1, self.y_max - self.y_min + 1)
		}
	}

	/// This range re-expressed `levels` lods deeper (covering all children).
	pub fn scaled_down(&self, levels: u8) -> TileRange {
		TileRange {
			x_min: self.x_min << levels,
			y_min: self.y_min << levels,
			x_max: ((self.x_max + 1) << levels) - 1,
			y_max: ((self.y_max + 1) << levels) - 1,
		}
	}

	/// This range re-expressed `levels` lods shallower.
	pub fn scaled_up(&self, levels: u8) -> TileRange {
		TileRange {
			x_min: self.x_min >> levels,
			y_min: self.y_min >> levels,
			x_max: self.x_max >> levels,
			y_max: self.y_max >> levels,
		}
	}

	pub fn iter(&self, lod: u8) -> impl Iterator<Item = TileId> + '_ {
		let range = *self;
		(range.y_min..=range.y_max)
			.flat_map(move |y| (range.x_min..=range.x_max).map(move |x| TileId { lod, x, y }))
	}
}

impl fmt::Display for TileRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{},{}:{},{}", self.x_min, self.y_min, self.x_max, self.y_max)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn update_grows_from_empty() {
		let mut range = TileRange::empty();
		assert!(range.is_empty());
		range.update(4, 7);
		range.update(2, 9);
		assert_eq!(range, TileRange::new(2, 7, 4, 9).unwrap());
	}

	#[test]
	fn intersect_disjoint_is_none() {
		let a = TileRange::new(0, 0, 3, 3).unwrap();
		let b = TileRange::new(4, 4, 5, 5).unwrap();
		assert!(a.intersect(&b).is_none());
	}

	#[test]
	fn intersect_overlap() {
		let a = TileRange::new(0, 0, 3, 3).unwrap();
		let b = TileRange::new(2, 1, 5, 5).unwrap();
		assert_eq!(a.intersect(&b), Some(TileRange::new(2, 1, 3, 3).unwrap()));
	}

	#[test]
	fn scaling_round_trip() {
		let range = TileRange::new(1, 2, 3, 3).unwrap();
		let down = range.scaled_down(2);
		assert_eq!(down, TileRange::new(4, 8, 15, 15).unwrap());
		assert_eq!(down.scaled_up(2), range);
	}

	#[test]
	fn iter_covers_rectangle() {
		let range = TileRange::new(1, 1, 2, 2).unwrap();
		let tiles: Vec<TileId> = range.iter(3).collect();
		assert_eq!(tiles.len(), 4);
		assert_eq!(tiles[0], TileId::new(3, 1, 1).unwrap());
		assert_eq!(tiles[3], TileId::new(3, 2, 2).unwrap());
	}
}
