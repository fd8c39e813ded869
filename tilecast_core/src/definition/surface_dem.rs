use crate::{Changed, ResourceId};
use serde::{Deserialize, Serialize};

/// Introspection hints attached to a surface: what the viewer should drape
/// on it and where to put the initial camera. Never affects produced tiles.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Introspection {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tms: Option<IntrospectionLayer>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub position: Option<[f64; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrospectionLayer {
	pub group: String,
	pub id: String,
}

impl IntrospectionLayer {
	pub fn resource_id(&self, reference_frame: &str) -> ResourceId {
		ResourceId::new(reference_frame, &self.group, &self.id)
	}
}

/// Definition of a DEM-backed surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceDem {
	/// Path to the DEM dataset, relative to the resource root.
	pub dataset: String,

	/// Optional mask dataset restricting valid tiles.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mask: Option<String>,

	/// Optional geoid grid applied on top of the DEM's vertical datum.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub geoid_grid: Option<String>,

	/// Alias under which heightcoding requests may refer to this DEM.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub heightcoding_alias: Option<String>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub nominal_texel_size: Option<f64>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub merge_bottom_lod: Option<u8>,

	/// Fixed display size instead of a computed texel size.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub display_size: Option<u32>,

	#[serde(default, skip_serializing_if = "is_default_introspection")]
	pub introspection: Introspection,
}

fn is_default_introspection(introspection: &Introspection) -> bool {
	*introspection == Introspection::default()
}

impl SurfaceDem {
	pub const DRIVER: &'static str = "surface-dem";

	pub fn changed(&self, other: &SurfaceDem) -> Changed {
		// different input data produce different tiles
		if self.dataset != other.dataset {
			return Changed::Yes;
		}
		if self.mask != other.mask {
			return Changed::Yes;
		}
		if self.geoid_grid != other.geoid_grid {
			return Changed::Yes;
		}
		if self.display_size != other.display_size {
			return Changed::Yes;
		}

		// manually set tuning can be changed safely
		if self.nominal_texel_size != other.nominal_texel_size {
			return Changed::Safely;
		}
		if self.merge_bottom_lod != other.merge_bottom_lod {
			return Changed::Safely;
		}
		if self.heightcoding_alias != other.heightcoding_alias {
			return Changed::Safely;
		}

		// introspection can safely change
		if self.introspection != other.introspection {
			return Changed::Safely;
		}

		Changed::No
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn parse(value: serde_json::Value) -> SurfaceDem {
		serde_json::from_value(value).unwrap()
	}

	#[test]
	fn minimal_definition_parses() {
		let definition = parse(json!({"dataset": "dem/alps"}));
		assert_eq!(definition.dataset, "dem/alps");
		assert!(definition.mask.is_none());
	}

	#[test]
	fn dataset_change_is_incompatible() {
		let a = parse(json!({"dataset": "dem/alps"}));
		let b = parse(json!({"dataset": "dem/andes"}));
		assert_eq!(a.changed(&b), Changed::Yes);
	}

	#[test]
	fn geoid_change_is_incompatible() {
		let a = parse(json!({"dataset": "dem/alps"}));
		let b = parse(json!({"dataset": "dem/alps", "geoidGrid": "egm96_15.gtx"}));
		assert_eq!(a.changed(&b), Changed::Yes);
	}

	#[test]
	fn tuning_changes_safely() {
		let a = parse(json!({"dataset": "dem/alps", "nominalTexelSize": 10.0}));
		let b = parse(json!({"dataset": "dem/alps", "nominalTexelSize": 20.0}));
		assert_eq!(a.changed(&b), Changed::Safely);
	}

	#[test]
	fn introspection_changes_safely() {
		let a = parse(json!({"dataset": "dem/alps"}));
		let b = parse(json!({
			"dataset": "dem/alps",
			"introspection": {"tms": {"group": "imagery", "id": "alps-ophoto"}}
		}));
		assert_eq!(a.changed(&b), Changed::Safely);
	}
}
