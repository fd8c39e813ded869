//! The resource model.
//!
//! A resource describes one served dataset: its identity within a reference
//! frame, the generator that materializes it, a driver-specific definition
//! and the serving envelope (lod range, tile range, credits, cache policy).
//! Comparing two versions of the same resource yields a [`Changed`] verdict
//! that drives the registry's update logic.

use crate::{LodRange, TileRange, definition::Definition};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a served resource: (reference frame, group, id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
	pub reference_frame: String,
	pub group: String,
	pub id: String,
}

impl ResourceId {
	pub fn new(reference_frame: &str, group: &str, id: &str) -> ResourceId {
		ResourceId {
			reference_frame: reference_frame.to_owned(),
			group: group.to_owned(),
			id: id.to_owned(),
		}
	}

	/// `<group>/<id>` part, unique within one reference frame.
	pub fn full_id(&self) -> String {
		format!("{}/{}", self.group, self.id)
	}
}

impl fmt::Display for ResourceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}/{}", self.reference_frame, self.group, self.id)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorType {
	Tms,
	Surface,
	Geodata,
}

impl fmt::Display for GeneratorType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			GeneratorType::Tms => write!(f, "tms"),
			GeneratorType::Surface => write!(f, "surface"),
			GeneratorType::Geodata => write!(f, "geodata"),
		}
	}
}

/// Generator descriptor: the broad type plus the concrete driver name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GeneratorKind {
	#[serde(rename = "type")]
	pub kind: GeneratorType,
	pub driver: String,
}

impl GeneratorKind {
	pub fn new(kind: GeneratorType, driver: &str) -> GeneratorKind {
		GeneratorKind {
			kind,
			driver: driver.to_owned(),
		}
	}
}

impl fmt::Display for GeneratorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.kind, self.driver)
	}
}

/// Verdict of comparing two definitions of the same resource.
///
/// Ordered by severity so that combined verdicts can be merged with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Changed {
	/// Identical.
	No,
	/// Cosmetic change; apply without touching the revision.
	Safely,
	/// Same output, but caches must be busted; bump revision and apply.
	WithRevisionBump,
	/// Incompatible change; subject to the freeze policy.
	Yes,
}

/// Classes of served files, each with its own cache-control policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileClass {
	Config,
	File,
	Data,
	Registry,
	Support,
	Unknown,
}

/// Per-file-class max-age settings, in seconds. Negative means no caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileClassSettings {
	pub config: i64,
	pub file: i64,
	pub data: i64,
	pub registry: i64,
	pub support: i64,
}

impl Default for FileClassSettings {
	fn default() -> FileClassSettings {
		FileClassSettings {
			config: -1,
			file: -1,
			data: 604800,
			registry: 604800,
			support: 604800,
		}
	}
}

impl FileClassSettings {
	/// Max age for a file class; `None` disables caching.
	pub fn max_age(&self, file_class: FileClass) -> Option<i64> {
		let age = match file_class {
			FileClass::Config => self.config,
			FileClass::File => self.file,
			FileClass::Data => self.data,
			FileClass::Registry => self.registry,
			FileClass::Support => self.support,
			FileClass::Unknown => -1,
		};
		(age >= 0).then_some(age)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
	pub id: ResourceId,
	pub generator: GeneratorKind,
	#[serde(default)]
	pub comment: String,
	#[serde(default)]
	pub revision: u32,
	#[serde(default)]
	pub credits: Vec<String>,
	pub lod_range: LodRange,
	pub tile_range: TileRange,
	pub definition: serde_json::Value,
	#[serde(default)]
	pub file_class_settings: FileClassSettings,
}

impl Resource {
	/// Parses the driver-specific definition blob.
	pub fn definition(&self) -> Result<Definition> {
		Definition::from_json(&self.generator, &self.definition)
			.with_context(|| format!("invalid definition of resource <{}>", self.id))
	}

	/// Classifies the difference between two versions of the same resource.
	///
	/// The revision counter and the comment are bookkeeping and never count
	/// as a change; credits can be updated safely.
	pub fn changed(&self, other: &Resource) -> Changed {
		if self.id != other.id || self.generator != other.generator {
			return Changed::Yes;
		}
		if self.lod_range != other.lod_range || self.tile_range != other.tile_range {
			return Changed::Yes;
		}

		let definition = match (self.definition(), other.definition()) {
			(Ok(mine), Ok(theirs)) => mine.changed(&theirs),
			// unparseable on either side: fall back to raw comparison
			_ => {
				if self.definition == other.definition {
					Changed::No
				} else {
					Changed::Yes
				}
			}
		};

		let credits = if self.credits == other.credits {
			Changed::No
		} else {
			Changed::Safely
		};

		definition.max(credits)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn surface_resource(definition: serde_json::Value) -> Resource {
		Resource {
			id: ResourceId::new("webmerc", "terrain", "alps"),
			generator: GeneratorKind::new(GeneratorType::Surface, "surface-dem"),
			comment: String::new(),
			revision: 0,
			credits: vec!["cartographers".to_owned()],
			lod_range: LodRange::new(5, 15).unwrap(),
			tile_range: TileRange::new(0, 0, 1, 1).unwrap(),
			definition,
			file_class_settings: FileClassSettings::default(),
		}
	}

	#[test]
	fn changed_is_reflexive() {
		let resource = surface_resource(json!({"dataset": "dem/alps"}));
		assert_eq!(resource.changed(&resource), Changed::No);
	}

	#[rstest::rstest]
	#[case(json!({"dataset": "dem/alps"}), json!({"dataset": "dem/alps"}), Changed::No)]
	#[case(
		json!({"dataset": "dem/alps", "nominalTexelSize": 10.0}),
		json!({"dataset": "dem/alps", "nominalTexelSize": 20.0}),
		Changed::Safely
	)]
	#[case(json!({"dataset": "dem/alps"}), json!({"dataset": "dem/andes"}), Changed::Yes)]
	#[case(
		json!({"dataset": "dem/alps"}),
		json!({"dataset": "dem/alps", "geoidGrid": "egm96_15.gtx"}),
		Changed::Yes
	)]
	fn classification(#[case] a: serde_json::Value, #[case] b: serde_json::Value, #[case] expected: Changed) {
		let a = surface_resource(a);
		let b = surface_resource(b);
		// symmetric in value equality
		assert_eq!(a.changed(&b), expected);
		assert_eq!(b.changed(&a), expected);
	}

	#[test]
	fn revision_and_comment_do_not_count() {
		let a = surface_resource(json!({"dataset": "dem/alps"}));
		let mut b = a.clone();
		b.revision = 9;
		b.comment = "manually reviewed".to_owned();
		assert_eq!(a.changed(&b), Changed::No);
	}

	#[test]
	fn credit_updates_are_safe() {
		let a = surface_resource(json!({"dataset": "dem/alps"}));
		let mut b = a.clone();
		b.credits.push("surveyors".to_owned());
		assert_eq!(a.changed(&b), Changed::Safely);
	}

	#[test]
	fn lod_range_change_is_incompatible() {
		let a = surface_resource(json!({"dataset": "dem/alps"}));
		let mut b = a.clone();
		b.lod_range = LodRange::new(5, 16).unwrap();
		assert_eq!(a.changed(&b), Changed::Yes);
	}

	#[test]
	fn resource_json_round_trip_is_unchanged() {
		let a = surface_resource(json!({
			"dataset": "dem/alps",
			"geoidGrid": "egm96_15.gtx",
			"nominalTexelSize": 12.5
		}));
		let text = serde_json::to_string(&a).unwrap();
		let b: Resource = serde_json::from_str(&text).unwrap();
		assert_eq!(a.changed(&b), Changed::No);
	}

	#[test]
	fn file_class_settings_max_age() {
		let settings = FileClassSettings::default();
		assert_eq!(settings.max_age(FileClass::Config), None);
		assert_eq!(settings.max_age(FileClass::Data), Some(604800));
		assert_eq!(settings.max_age(FileClass::Unknown), None);
	}
}
