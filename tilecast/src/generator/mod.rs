//! Generators: one per served resource.
//!
//! A generator owns a resource, its on-disk root and whatever component
//! state it needs to serve tiles. Generators are created by process-global
//! factories keyed by the resource's generator descriptor, prepared off the
//! request path and serve only once ready. Common lifecycle state (resource
//! merging against the stored `resource.json`, the ready flag, the root
//! directory) lives in [`GeneratorCore`].

mod registry;
pub use registry::*;

mod surface;
pub use surface::*;

mod surface_dem;
pub use surface_dem::*;

mod tms_raster_patchwork;
pub use tms_raster_patchwork::*;

use crate::FileInfo;
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Weak};
use tilecast_core::{
	Changed, GenerateError, GeneratorKind, GeneratorType, Registry, Resource, ResourceId, Sink, usec_from_epoch,
};
use tilecast_gdal::Arsenal;

const RESOURCE_FILE: &str = "resource.json";

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
	/// Root of the per-generator store (`<root>/<rf>/<group>/<id>/`).
	pub root: PathBuf,
	/// Datasets referenced by definitions are resolved against this root.
	pub resource_root: PathBuf,
	/// Generator types whose incompatible changes are rejected.
	pub freeze: BTreeSet<GeneratorType>,
	/// Updater period in seconds; zero or negative means "explicit
	/// requests only".
	pub resource_update_period: i64,
}

impl Default for GeneratorConfig {
	fn default() -> GeneratorConfig {
		GeneratorConfig {
			root: PathBuf::from("store"),
			resource_root: PathBuf::from("."),
			freeze: BTreeSet::from([GeneratorType::Surface]),
			resource_update_period: 300,
		}
	}
}

impl GeneratorConfig {
	pub fn freezes(&self, generator_type: GeneratorType) -> bool {
		self.freeze.contains(&generator_type)
	}
}

/// Cross-generator lookup seam; implemented by the registry and handed to
/// generators as a non-owning reference.
pub trait GeneratorFinder: Send + Sync {
	/// Returns a ready generator, never an unready one.
	fn find_generator(&self, generator_type: GeneratorType, id: &ResourceId) -> Option<Arc<dyn Generator>>;
}

pub struct Params {
	pub config: GeneratorConfig,
	pub registry: Arc<Registry>,
	pub resource: Resource,
	pub system: bool,
	pub replace: Option<Arc<dyn Generator>>,
	pub finder: Weak<dyn GeneratorFinder>,
}

/// A unit of tile-generation work. `Done` means the response was already
/// written to the sink; `Run` is deferred to an I/O worker and may call
/// into the GDAL pool.
pub enum Task {
	Done,
	Run(Box<dyn FnOnce(&dyn Sink, &Arsenal) + Send>),
}

pub trait Generator: Send + Sync {
	fn core(&self) -> &GeneratorCore;

	/// Component-specific preparation; runs on the preparation pool.
	fn prepare_impl(&self, arsenal: &Arsenal) -> Result<()>;

	/// Resolves a file request into an immediate response or a deferred
	/// task. Only called on ready generators.
	fn generate_file(&self, file_info: &FileInfo, sink: &dyn Sink) -> Result<Task, GenerateError>;
}

impl dyn Generator {
	pub fn prepare(&self, arsenal: &Arsenal) -> Result<()> {
		self.prepare_impl(arsenal)?;
		self.core().make_ready()?;
		Ok(())
	}

	pub fn resource(&self) -> &Resource {
		self.core().resource()
	}

	pub fn id(&self) -> &ResourceId {
		&self.core().resource().id
	}

	pub fn ready(&self) -> bool {
		self.core().ready()
	}

	pub fn system(&self) -> bool {
		self.core().system()
	}

	pub fn changed(&self, resource: &Resource) -> Changed {
		self.core().resource().changed(resource)
	}

	pub fn updated_since(&self, timestamp: u64) -> bool {
		self.core().ready_since() > timestamp
	}

	pub fn take_replace(&self) -> Option<Arc<dyn Generator>> {
		self.core().take_replace()
	}
}

/// Common generator state and the stored-definition merge logic.
pub struct GeneratorCore {
	config: GeneratorConfig,
	registry: Arc<Registry>,
	resource: Resource,
	root: PathBuf,
	system: bool,
	fresh: bool,
	change_enforced: AtomicBool,
	ready: AtomicBool,
	ready_since: AtomicU64,
	replace: Mutex<Option<Arc<dyn Generator>>>,
	finder: Weak<dyn GeneratorFinder>,
}

impl GeneratorCore {
	/// Builds the common state: creates the generator root, replays the
	/// stored `resource.json` (merging revisions) and applies the freeze
	/// policy on incompatible definitions.
	pub fn new(params: Params) -> Result<GeneratorCore> {
		let Params {
			config,
			registry,
			mut resource,
			system,
			replace,
			finder,
		} = params;

		let root = config
			.root
			.join(&resource.id.reference_frame)
			.join(&resource.id.group)
			.join(&resource.id.id);
		let freshly_created = !root.exists();
		std::fs::create_dir_all(&root).with_context(|| format!("cannot create generator root {root:?}"))?;

		let resource_file = root.join(RESOURCE_FILE);
		let mut fresh = false;
		let mut change_enforced = false;

		if freshly_created || !resource_file.exists() || system {
			// new or forced new resource (system)
			fresh = true;
		} else {
			// reopen of existing dataset
			let mut saved = load_resource(&resource_file)?;

			// merge both revisions; at least manually changed revision is used
			resource.revision = resource.revision.max(saved.revision);
			saved.revision = resource.revision;

			let freeze = config.freezes(saved.generator.kind);

			match saved.changed(&resource) {
				Changed::WithRevisionBump => {
					resource.revision += 1;
					change_enforced = true;
					log::info!(
						"Bumped resource <{}> revision to {} due to definition change.",
						resource.id,
						resource.revision
					);
					save_resource(&resource_file, &resource)?;
				}
				Changed::No | Changed::Safely => {
					// nothing or something non-destructive changed; re-save
					save_resource(&resource_file, &resource)?;
				}
				Changed::Yes => {
					if freeze {
						// different setup, use stored definition
						log::warn!(
							"Definition of resource <{}> differs from the one stored at {root:?}; using stored definition.",
							resource.id
						);
						let file_class_settings = resource.file_class_settings.clone();
						resource = saved;
						resource.file_class_settings = file_class_settings;
					} else {
						resource.revision += 1;
						change_enforced = true;
						log::warn!(
							"Definition of resource <{}> differs from the one stored at {root:?}; bumped revision to {} due to disabled resource freezing.",
							resource.id,
							resource.revision
						);
					}
				}
			}
		}

		Ok(GeneratorCore {
			config,
			registry,
			resource,
			root,
			system,
			fresh,
			change_enforced: AtomicBool::new(change_enforced),
			ready: AtomicBool::new(false),
			ready_since: AtomicU64::new(0),
			replace: Mutex::new(replace),
			finder,
		})
	}

	pub fn resource(&self) -> &Resource {
		&self.resource
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn config(&self) -> &GeneratorConfig {
		&self.config
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn system(&self) -> bool {
		self.system
	}

	pub fn ready(&self) -> bool {
		self.ready.load(Ordering::Acquire)
	}

	pub fn ready_since(&self) -> u64 {
		self.ready_since.load(Ordering::Acquire)
	}

	/// Persists the definition when needed and flips the ready flag.
	pub fn make_ready(&self) -> Result<()> {
		if self.fresh || self.change_enforced.swap(false, Ordering::SeqCst) {
			save_resource(&self.root.join(RESOURCE_FILE), &self.resource)?;
		}

		self.ready.store(true, Ordering::Release);
		self.ready_since.store(usec_from_epoch(), Ordering::Release);

		log::info!(
			"Ready to serve resource <{}> (type <{}>).",
			self.resource.id,
			self.resource.generator
		);
		Ok(())
	}

	pub fn check_ready(&self) -> Result<(), GenerateError> {
		if self.ready() {
			Ok(())
		} else {
			Err(GenerateError::Unavailable("Generator not ready.".to_owned()))
		}
	}

	pub fn take_replace(&self) -> Option<Arc<dyn Generator>> {
		self.replace.lock().unwrap().take()
	}

	pub fn finder(&self) -> Option<Arc<dyn GeneratorFinder>> {
		self.finder.upgrade()
	}

	pub fn url(&self) -> String {
		let id = &self.resource.id;
		format!(
			"/{}/{}/{}/{}/",
			id.reference_frame, self.resource.generator.kind, id.group, id.id
		)
	}

	/// Resolves a dataset path against the resource root; URLs pass
	/// through untouched.
	pub fn absolute_dataset(&self, path: &str) -> String {
		let lowercase = path.to_ascii_lowercase();
		if lowercase.starts_with("http:") || lowercase.starts_with("https:") || lowercase.starts_with("ftp:") {
			return path.to_owned();
		}
		self.config.resource_root.join(path).to_string_lossy().into_owned()
	}

	/// Like [`GeneratorCore::absolute_dataset`], with the reference-frame
	/// id appended as an extension; `None` when the file does not exist.
	pub fn absolute_dataset_rf(&self, path: &str) -> Option<PathBuf> {
		let path = PathBuf::from(format!(
			"{}.{}",
			self.absolute_dataset(path),
			self.resource.id.reference_frame
		));
		path.exists().then_some(path)
	}

	pub fn reference_frame(&self) -> Result<&tilecast_core::ReferenceFrame, GenerateError> {
		self
			.registry
			.reference_frame(&self.resource.id.reference_frame)
			.map_err(|err| GenerateError::InvalidConfiguration(format!("{err:#}")))
	}
}

fn load_resource(path: &Path) -> Result<Resource> {
	let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {path:?}"))?;
	serde_json::from_str(&text).with_context(|| format!("invalid resource file {path:?}"))
}

fn save_resource(path: &Path, resource: &Resource) -> Result<()> {
	let text = serde_json::to_string_pretty(resource)?;
	std::fs::write(path, text).with_context(|| format!("cannot write {path:?}"))
}

pub trait GeneratorFactory: Send + Sync {
	fn kind(&self) -> GeneratorKind;

	/// System factories get one synthetic instance per reference frame,
	/// immune to updater removal.
	fn system_instance(&self) -> bool {
		false
	}

	fn create(&self, params: Params) -> Result<Arc<dyn Generator>>;
}

/// Process-global factory map; populated once, read-only afterwards.
static FACTORIES: LazyLock<HashMap<GeneratorKind, Arc<dyn GeneratorFactory>>> = LazyLock::new(|| {
	let factories: Vec<Arc<dyn GeneratorFactory>> =
		vec![Arc::new(SurfaceDemFactory), Arc::new(TmsRasterPatchworkFactory)];
	factories.into_iter().map(|factory| (factory.kind(), factory)).collect()
});

pub fn find_factory(kind: &GeneratorKind) -> Result<Arc<dyn GeneratorFactory>, GenerateError> {
	FACTORIES
		.get(kind)
		.cloned()
		.ok_or_else(|| GenerateError::UnknownGenerator(format!("Unknown generator type <{kind}>.")))
}

pub fn factories() -> impl Iterator<Item = &'static Arc<dyn GeneratorFactory>> {
	FACTORIES.values()
}

/// Creates a generator for `params.resource` via the registered factory.
pub fn create(params: Params) -> Result<Arc<dyn Generator>> {
	let factory = find_factory(&params.resource.generator)?;
	factory.create(params)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use tilecast_core::{LodRange, TileRange};

	fn surface_resource(dataset: &Path) -> Resource {
		Resource {
			id: ResourceId::new("webmerc", "terrain", "alps"),
			generator: GeneratorKind::new(GeneratorType::Surface, "surface-dem"),
			comment: String::new(),
			revision: 0,
			credits: vec!["cartographers".to_owned()],
			lod_range: LodRange::new(2, 4).unwrap(),
			tile_range: TileRange::new(0, 0, 3, 3).unwrap(),
			definition: json!({"dataset": dataset.to_str().unwrap()}),
			file_class_settings: Default::default(),
		}
	}

	fn params(root: &Path, resource: Resource) -> Params {
		Params {
			config: GeneratorConfig {
				root: root.to_path_buf(),
				resource_root: PathBuf::from("/"),
				..Default::default()
			},
			registry: Arc::new(Registry::builtin()),
			resource,
			system: false,
			replace: None,
			finder: Weak::<Generators>::new(),
		}
	}

	#[test]
	fn fresh_core_persists_on_make_ready() {
		let dir = tempfile::tempdir().unwrap();
		let resource = surface_resource(Path::new("dem/alps.tif"));
		let core = GeneratorCore::new(params(dir.path(), resource.clone())).unwrap();
		assert!(!core.ready());

		let resource_file = core.root().join(RESOURCE_FILE);
		assert!(!resource_file.exists());

		core.make_ready().unwrap();
		assert!(core.ready());
		assert!(resource_file.exists());

		let saved = load_resource(&resource_file).unwrap();
		assert_eq!(saved.changed(&resource), Changed::No);
	}

	#[test]
	fn ready_since_is_monotonic() {
		let dir = tempfile::tempdir().unwrap();
		let resource = surface_resource(Path::new("dem/alps.tif"));
		let core = GeneratorCore::new(params(dir.path(), resource)).unwrap();

		core.make_ready().unwrap();
		let first = core.ready_since();
		assert!(first > 0);
		core.make_ready().unwrap();
		assert!(core.ready_since() >= first);
	}

	#[test]
	fn reopen_merges_revision() {
		let dir = tempfile::tempdir().unwrap();
		let mut resource = surface_resource(Path::new("dem/alps.tif"));
		resource.revision = 3;

		let core = GeneratorCore::new(params(dir.path(), resource.clone())).unwrap();
		core.make_ready().unwrap();

		// reopen with a lower revision: the stored one wins
		resource.revision = 1;
		let core = GeneratorCore::new(params(dir.path(), resource)).unwrap();
		assert_eq!(core.resource().revision, 3);
	}

	#[test]
	fn incompatible_change_on_frozen_type_keeps_stored() {
		let dir = tempfile::tempdir().unwrap();
		let resource = surface_resource(Path::new("dem/alps.tif"));
		let core = GeneratorCore::new(params(dir.path(), resource.clone())).unwrap();
		core.make_ready().unwrap();

		let mut changed = resource.clone();
		changed.definition = json!({"dataset": "dem/andes.tif"});
		let core = GeneratorCore::new(params(dir.path(), changed)).unwrap();

		// surface is frozen by default: the stored definition wins
		assert_eq!(core.resource().changed(&resource), Changed::No);
	}

	#[test]
	fn incompatible_change_without_freeze_bumps_revision() {
		let dir = tempfile::tempdir().unwrap();
		let resource = surface_resource(Path::new("dem/alps.tif"));
		{
			let core = GeneratorCore::new(params(dir.path(), resource.clone())).unwrap();
			core.make_ready().unwrap();
		}

		let mut changed = resource.clone();
		changed.definition = json!({"dataset": "dem/andes.tif"});
		let mut p = params(dir.path(), changed.clone());
		p.config.freeze.clear();
		let core = GeneratorCore::new(p).unwrap();

		assert_eq!(core.resource().revision, 1);
		assert_eq!(core.resource().changed(&changed), Changed::No);
	}

	#[test]
	fn safe_change_is_applied_without_bump() {
		let dir = tempfile::tempdir().unwrap();
		let resource = surface_resource(Path::new("dem/alps.tif"));
		{
			let core = GeneratorCore::new(params(dir.path(), resource.clone())).unwrap();
			core.make_ready().unwrap();
		}

		let mut changed = resource.clone();
		changed.definition = json!({"dataset": "dem/alps.tif", "nominalTexelSize": 20.0});
		let core = GeneratorCore::new(params(dir.path(), changed.clone())).unwrap();

		assert_eq!(core.resource().revision, 0);
		assert_eq!(core.resource().changed(&changed), Changed::No);
	}

	#[test]
	fn unknown_factory_is_reported() {
		let kind = GeneratorKind::new(GeneratorType::Tms, "tms-windyty");
		assert!(matches!(
			find_factory(&kind),
			Err(GenerateError::UnknownGenerator(_))
		));
	}

	#[test]
	fn absolute_dataset_passes_urls_through() {
		let dir = tempfile::tempdir().unwrap();
		let resource = surface_resource(Path::new("dem/alps.tif"));
		let core = GeneratorCore::new(params(dir.path(), resource)).unwrap();

		assert_eq!(
			core.absolute_dataset("https://example.com/dem.tif"),
			"https://example.com/dem.tif"
		);
		assert_eq!(core.absolute_dataset("dem/alps.tif"), "/dem/alps.tif");
	}
}
