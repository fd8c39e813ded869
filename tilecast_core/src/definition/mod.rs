//! Driver-specific resource definitions.
//!
//! Each generator driver has its own definition shape; the registry only
//! sees the common surface: JSON round-tripping and change classification.
//! Modeled as a tagged enum, one variant per driver.

mod surface_dem;
pub use surface_dem::*;

mod tms_raster_patchwork;
pub use tms_raster_patchwork::*;

use crate::{Changed, GeneratorKind, GeneratorType};
use anyhow::{Result, bail};

#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
	SurfaceDem(SurfaceDem),
	TmsRasterPatchwork(TmsRasterPatchwork),
}

impl Definition {
	/// Parses the definition blob of a resource with the given generator
	/// descriptor.
	pub fn from_json(generator: &GeneratorKind, value: &serde_json::Value) -> Result<Definition> {
		Ok(match (generator.kind, generator.driver.as_str()) {
			(GeneratorType::Surface, SurfaceDem::DRIVER) => Definition::SurfaceDem(serde_json::from_value(value.clone())?),
			(GeneratorType::Tms, TmsRasterPatchwork::DRIVER) => {
				Definition::TmsRasterPatchwork(serde_json::from_value(value.clone())?)
			}
			_ => bail!("unknown generator <{generator}>"),
		})
	}

	pub fn to_json(&self) -> Result<serde_json::Value> {
		Ok(match self {
			Definition::SurfaceDem(definition) => serde_json::to_value(definition)?,
			Definition::TmsRasterPatchwork(definition) => serde_json::to_value(definition)?,
		})
	}

	/// Classifies the difference between two definitions. Mismatched
	/// drivers are always incompatible.
	pub fn changed(&self, other: &Definition) -> Changed {
		match (self, other) {
			(Definition::SurfaceDem(mine), Definition::SurfaceDem(theirs)) => mine.changed(theirs),
			(Definition::TmsRasterPatchwork(mine), Definition::TmsRasterPatchwork(theirs)) => mine.changed(theirs),
			_ => Changed::Yes,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn surface_kind() -> GeneratorKind {
		GeneratorKind::new(GeneratorType::Surface, SurfaceDem::DRIVER)
	}

	#[test]
	fn unknown_driver_is_rejected() {
		let kind = GeneratorKind::new(GeneratorType::Tms, "tms-windyty");
		assert!(Definition::from_json(&kind, &json!({})).is_err());
	}

	#[test]
	fn json_round_trip_is_unchanged() {
		let value = json!({
			"dataset": "dem/alps",
			"mask": "dem/alps.mask",
			"nominalTexelSize": 8.0
		});
		let a = Definition::from_json(&surface_kind(), &value).unwrap();
		let b = Definition::from_json(&surface_kind(), &a.to_json().unwrap()).unwrap();
		assert_eq!(a.changed(&b), Changed::No);
	}

	#[test]
	fn driver_mismatch_is_incompatible() {
		let a = Definition::from_json(&surface_kind(), &json!({"dataset": "dem/alps"})).unwrap();
		let b = Definition::from_json(
			&GeneratorKind::new(GeneratorType::Tms, TmsRasterPatchwork::DRIVER),
			&json!({}),
		)
		.unwrap();
		assert_eq!(a.changed(&b), Changed::Yes);
	}
}
