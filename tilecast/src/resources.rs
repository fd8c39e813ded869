//! Resource backends: where the authoritative resource set comes from.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tilecast_core::{Resource, ResourceId};

/// Source of the authoritative resource set, polled by the registry's
/// updater; preparation failures are reported back through `error`.
pub trait ResourceBackend: Send + Sync {
	fn load(&self) -> Result<BTreeMap<ResourceId, Resource>>;

	fn error(&self, id: &ResourceId, message: &str);
}

/// Backend reading a JSON file holding a list of resources.
pub struct FileResourceBackend {
	path: PathBuf,
	errors: Mutex<BTreeMap<ResourceId, String>>,
}

impl FileResourceBackend {
	pub fn new(path: PathBuf) -> FileResourceBackend {
		FileResourceBackend {
			path,
			errors: Mutex::new(BTreeMap::new()),
		}
	}

	/// Last reported error per resource, for introspection.
	pub fn errors(&self) -> BTreeMap<ResourceId, String> {
		self.errors.lock().unwrap().clone()
	}
}

impl ResourceBackend for FileResourceBackend {
	fn load(&self) -> Result<BTreeMap<ResourceId, Resource>> {
		let text = std::fs::read_to_string(&self.path)
			.with_context(|| format!("cannot read resource file {:?}", self.path))?;
		let resources: Vec<Resource> = serde_json::from_str(&text).context("invalid resource file")?;

		let mut map = BTreeMap::new();
		for resource in resources {
			// drop resources with unparseable definitions instead of
			// taking the whole set down
			if let Err(err) = resource.definition() {
				log::error!("skipping resource <{}>: {err:#}", resource.id);
				continue;
			}
			if let Some(previous) = map.insert(resource.id.clone(), resource) {
				log::warn!("duplicate resource <{}> in {:?}", previous.id, self.path);
			}
		}
		Ok(map)
	}

	fn error(&self, id: &ResourceId, message: &str) {
		log::error!("resource <{id}> failed to prepare: {message}");
		self.errors.lock().unwrap().insert(id.clone(), message.to_owned());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::io::Write;

	fn resource_json(id: &str, dataset: &str) -> serde_json::Value {
		json!({
			"id": {"referenceFrame": "webmerc", "group": "terrain", "id": id},
			"generator": {"type": "surface", "driver": "surface-dem"},
			"lodRange": {"min": 2, "max": 5},
			"tileRange": {"xMin": 0, "yMin": 0, "xMax": 0, "yMax": 0},
			"definition": {"dataset": dataset}
		})
	}

	#[test]
	fn loads_resource_list() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		let body = serde_json::to_string(&vec![
			resource_json("alps", "dem/alps"),
			resource_json("andes", "dem/andes"),
		])
		.unwrap();
		file.write_all(body.as_bytes()).unwrap();

		let backend = FileResourceBackend::new(file.path().to_path_buf());
		let resources = backend.load().unwrap();
		assert_eq!(resources.len(), 2);
		assert!(resources.contains_key(&ResourceId::new("webmerc", "terrain", "alps")));
	}

	#[test]
	fn skips_invalid_definitions() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		let mut bad = resource_json("broken", "dem/broken");
		bad["generator"]["driver"] = serde_json::Value::from("no-such-driver");
		let body = serde_json::to_string(&vec![resource_json("alps", "dem/alps"), bad]).unwrap();
		file.write_all(body.as_bytes()).unwrap();

		let backend = FileResourceBackend::new(file.path().to_path_buf());
		let resources = backend.load().unwrap();
		assert_eq!(resources.len(), 1);
	}

	#[test]
	fn records_reported_errors() {
		let backend = FileResourceBackend::new(PathBuf::from("/nonexistent.json"));
		assert!(backend.load().is_err());

		let id = ResourceId::new("webmerc", "terrain", "alps");
		backend.error(&id, "dataset unreadable");
		assert_eq!(backend.errors().get(&id).unwrap(), "dataset unreadable");
	}
}
