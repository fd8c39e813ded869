use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive range of levels of detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LodRange {
	pub min: u8,
	pub max: u8,
}

impl LodRange {
	pub fn new(min: u8, max: u8) -> Result<LodRange> {
		ensure!(min <= max, "invalid lod range ({min}, {max})");
		Ok(LodRange { min, max })
	}

	pub fn contains(&self, lod: u8) -> bool {
		lod >= self.min && lod <= self.max
	}

	pub fn iter(&self) -> impl Iterator<Item = u8> {
		self.min..=self.max
	}
}

impl fmt::Display for LodRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{},{}", self.min, self.max)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn contains_is_inclusive() {
		let range = LodRange::new(3, 7).unwrap();
		assert!(range.contains(3));
		assert!(range.contains(7));
		assert!(!range.contains(2));
		assert!(!range.contains(8));
	}

	#[test]
	fn iterates_all_lods() {
		let lods: Vec<u8> = LodRange::new(2, 5).unwrap().iter().collect();
		assert_eq!(lods, vec![2, 3, 4, 5]);
	}

	#[test]
	fn rejects_inverted_range() {
		assert!(LodRange::new(5, 2).is_err());
	}
}
