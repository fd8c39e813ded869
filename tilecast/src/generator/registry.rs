//! The generator registry.
//!
//! Maintains the live set of generators, reconciles it periodically with
//! the resource backend and dispatches tile-generation lookups. The serving
//! set is a pair of sorted maps under one mutex: the primary unique index
//! by resource id (which also serves reference-frame scans, since ids sort
//! by reference frame first) and a (rf, type, group, id) index for
//! directory browsing. Lookups copy the generator pointer and drop the lock
//! immediately.

use super::{Generator, GeneratorConfig, GeneratorFinder, Params};
use crate::resources::ResourceBackend;
use anyhow::Result;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;
use tilecast_core::{
	Changed, GenerateError, GeneratorType, LodRange, Registry, Resource, ResourceId, TileRange, usec_from_epoch,
};
use tilecast_gdal::Arsenal;

/// Sentinel thrown out of the add/replace path when the registry is
/// stopped mid-diff.
#[derive(Debug, thiserror::Error)]
#[error("update aborted")]
struct AbortedUpdate;

/// Group name of auto-registered system resources.
pub const SYSTEM_GROUP: &str = "system";

type TypeKey = (String, GeneratorType, String, String);

#[derive(Default)]
struct Serving {
	by_id: BTreeMap<ResourceId, Arc<dyn Generator>>,
	by_type: BTreeMap<TypeKey, Arc<dyn Generator>>,
}

impl Serving {
	fn type_key(generator: &Arc<dyn Generator>) -> TypeKey {
		let resource = generator.resource();
		(
			resource.id.reference_frame.clone(),
			resource.generator.kind,
			resource.id.group.clone(),
			resource.id.id.clone(),
		)
	}

	fn insert(&mut self, generator: Arc<dyn Generator>) {
		self.by_type.insert(Self::type_key(&generator), generator.clone());
		self.by_id.insert(generator.id().clone(), generator);
	}

	fn remove(&mut self, id: &ResourceId) -> Option<Arc<dyn Generator>> {
		let generator = self.by_id.remove(id)?;
		self.by_type.remove(&Serving::type_key(&generator));
		Some(generator)
	}
}

struct UpdaterControl {
	request: Mutex<bool>,
	cond: Condvar,
}

pub(super) struct Inner {
	config: GeneratorConfig,
	registry: Arc<Registry>,
	backend: Arc<dyn ResourceBackend>,
	serving: Mutex<Serving>,
	ready: AtomicBool,
	running: AtomicBool,
	preparing: AtomicI32,
	last_update: AtomicU64,
	updater: UpdaterControl,
	arsenal: RwLock<Option<Arsenal>>,
	prepare_pool: Mutex<Option<tokio::runtime::Runtime>>,
	self_ref: Mutex<Weak<Inner>>,
}

/// The registry handle. Cheap to clone; `stop` tears the threads down.
#[derive(Clone)]
pub struct Generators {
	inner: Arc<Inner>,
	updater_thread: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl Generators {
	pub fn new(
		config: GeneratorConfig,
		registry: Arc<Registry>,
		backend: Arc<dyn ResourceBackend>,
	) -> Result<Generators> {
		let inner = Arc::new(Inner {
			config,
			registry,
			backend,
			serving: Mutex::new(Serving::default()),
			ready: AtomicBool::new(false),
			running: AtomicBool::new(false),
			preparing: AtomicI32::new(0),
			last_update: AtomicU64::new(0),
			updater: UpdaterControl {
				request: Mutex::new(false),
				cond: Condvar::new(),
			},
			arsenal: RwLock::new(None),
			prepare_pool: Mutex::new(None),
			self_ref: Mutex::new(Weak::new()),
		});
		*inner.self_ref.lock().unwrap() = Arc::downgrade(&inner);

		register_system_generators(&inner)?;

		Ok(Generators {
			inner,
			updater_thread: Arc::new(Mutex::new(None)),
		})
	}

	/// Starts the updater thread and the preparation pool. System
	/// generators queued during construction are prepared now.
	pub fn start(&self, arsenal: Arsenal) -> Result<()> {
		*self.inner.arsenal.write().unwrap() = Some(arsenal);

		let pool = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(1)
			.max_blocking_threads(5)
			.thread_name("prepare")
			.enable_all()
			.build()?;
		*self.inner.prepare_pool.lock().unwrap() = Some(pool);

		self.inner.running.store(true, Ordering::SeqCst);

		// prepare system generators registered at construction
		let unready: Vec<Arc<dyn Generator>> = {
			let serving = self.inner.serving.lock().unwrap();
			serving.by_id.values().filter(|g| !g.ready()).cloned().collect()
		};
		for generator in unready {
			prepare(&self.inner, generator);
		}

		let inner = self.inner.clone();
		*self.updater_thread.lock().unwrap() = Some(
			std::thread::Builder::new()
				.name("updater".to_owned())
				.spawn(move || updater(&inner))?,
		);

		Ok(())
	}

	pub fn stop(&self) {
		if !self.inner.running.swap(false, Ordering::SeqCst) {
			return;
		}

		self.inner.updater.cond.notify_all();
		if let Some(handle) = self.updater_thread.lock().unwrap().take() {
			let _ = handle.join();
		}

		if let Some(pool) = self.inner.prepare_pool.lock().unwrap().take() {
			pool.shutdown_timeout(Duration::from_secs(5));
		}

		*self.inner.arsenal.write().unwrap() = None;
	}

	/// Returns the generator serving `resource_id`, ready or not; `None`
	/// when missing or of a different type.
	pub fn generator(
		&self,
		generator_type: GeneratorType,
		resource_id: &ResourceId,
	) -> Result<Option<Arc<dyn Generator>>, GenerateError> {
		self.inner.check_ready()?;

		let generator = {
			let serving = self.inner.serving.lock().unwrap();
			serving.by_id.get(resource_id).cloned()
		};

		Ok(generator.filter(|generator| generator.resource().generator.kind == generator_type))
	}

	/// Ready generators serving the given reference frame.
	pub fn reference_frame(&self, reference_frame: &str) -> Result<Vec<Arc<dyn Generator>>, GenerateError> {
		self.inner.check_ready()?;

		let serving = self.inner.serving.lock().unwrap();
		let start = ResourceId::new(reference_frame, "", "");
		Ok(
			serving
				.by_id
				.range((Bound::Included(start), Bound::Unbounded))
				.take_while(|(id, _)| id.reference_frame == reference_frame)
				.filter(|(_, generator)| generator.ready())
				.map(|(_, generator)| generator.clone())
				.collect(),
		)
	}

	pub fn list_groups(&self, reference_frame: &str, generator_type: GeneratorType) -> Result<Vec<String>, GenerateError> {
		self.inner.check_ready()?;

		let serving = self.inner.serving.lock().unwrap();
		let start: TypeKey = (reference_frame.to_owned(), generator_type, String::new(), String::new());
		let mut out: Vec<String> = Vec::new();
		for ((rf, kind, group, _), _) in serving.by_type.range((Bound::Included(start), Bound::Unbounded)) {
			if rf != reference_frame || *kind != generator_type {
				break;
			}
			if out.last().map(String::as_str) != Some(group.as_str()) {
				out.push(group.clone());
			}
		}
		Ok(out)
	}

	pub fn list_ids(
		&self,
		reference_frame: &str,
		generator_type: GeneratorType,
		group: &str,
	) -> Result<Vec<String>, GenerateError> {
		self.inner.check_ready()?;

		let serving = self.inner.serving.lock().unwrap();
		let start: TypeKey = (
			reference_frame.to_owned(),
			generator_type,
			group.to_owned(),
			String::new(),
		);
		Ok(
			serving
				.by_type
				.range((Bound::Included(start), Bound::Unbounded))
				.take_while(|((rf, kind, g, _), _)| rf == reference_frame && *kind == generator_type && g == group)
				.map(|((_, _, _, id), _)| id.clone())
				.collect(),
		)
	}

	pub fn has(&self, resource_id: &ResourceId) -> bool {
		self.inner.serving.lock().unwrap().by_id.contains_key(resource_id)
	}

	pub fn is_ready(&self, resource_id: &ResourceId) -> bool {
		self
			.inner
			.serving
			.lock()
			.unwrap()
			.by_id
			.get(resource_id)
			.map(|generator| generator.ready())
			.unwrap_or(false)
	}

	pub fn url(&self, resource_id: &ResourceId) -> Result<String, GenerateError> {
		let serving = self.inner.serving.lock().unwrap();
		serving
			.by_id
			.get(resource_id)
			.map(|generator| generator.core().url())
			.ok_or_else(|| GenerateError::UnknownGenerator(format!("No such generator <{resource_id}>")))
	}

	/// True when the given resource became ready after `timestamp`.
	pub fn resource_updated_since(&self, resource_id: &ResourceId, timestamp: u64) -> Result<bool, GenerateError> {
		let serving = self.inner.serving.lock().unwrap();
		serving
			.by_id
			.get(resource_id)
			.map(|generator| generator.updated_since(timestamp))
			.ok_or_else(|| GenerateError::UnknownGenerator(format!("No such generator <{resource_id}>")))
	}

	/// True when any updater pass finished after `timestamp`.
	pub fn updated_since(&self, timestamp: u64) -> bool {
		self.inner.last_update.load(Ordering::SeqCst) > timestamp
	}

	/// Asks the updater to run; returns the request timestamp.
	pub fn request_update(&self) -> u64 {
		let start = usec_from_epoch();
		*self.inner.updater.request.lock().unwrap() = true;
		self.inner.updater.cond.notify_one();
		start
	}

	/// One-line status per generator.
	pub fn stat(&self) -> String {
		let generators: Vec<Arc<dyn Generator>> = {
			let serving = self.inner.serving.lock().unwrap();
			serving.by_id.values().cloned().collect()
		};
		let mut out = String::new();
		for generator in generators {
			let resource = generator.resource();
			out.push_str(&format!(
				"<{}> (type <{}>){}\n",
				resource.id,
				resource.generator,
				if generator.ready() { "" } else { " not ready" }
			));
		}
		out
	}
}

impl GeneratorFinder for Generators {
	fn find_generator(&self, generator_type: GeneratorType, id: &ResourceId) -> Option<Arc<dyn Generator>> {
		self.inner.find_generator(generator_type, id)
	}
}

impl GeneratorFinder for Inner {
	fn find_generator(&self, generator_type: GeneratorType, id: &ResourceId) -> Option<Arc<dyn Generator>> {
		let generator = self.serving.lock().unwrap().by_id.get(id).cloned()?;
		if generator.resource().generator.kind != generator_type || !generator.ready() {
			return None;
		}
		Some(generator)
	}
}

impl Inner {
	fn check_ready(&self) -> Result<(), GenerateError> {
		if self.ready.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(GenerateError::Unavailable("Server not ready.".to_owned()))
		}
	}

	fn params(&self, resource: Resource, system: bool, replace: Option<Arc<dyn Generator>>) -> Params {
		let finder: Weak<dyn GeneratorFinder> = self.self_ref.lock().unwrap().clone();
		Params {
			config: self.config.clone(),
			registry: self.registry.clone(),
			resource,
			system,
			replace,
			finder,
		}
	}

	/// Atomically swaps a prepared replacement into the slot of its
	/// predecessor; concurrent readers see one or the other, never
	/// neither.
	fn replace(&self, original: &Arc<dyn Generator>, replacement: Arc<dyn Generator>) {
		let mut serving = self.serving.lock().unwrap();
		serving.remove(original.id());
		serving.insert(replacement);
		log::info!("Replaced resource <{}> with new definition.", original.id());
	}
}

/// Creates one synthetic resource per reference frame for every factory
/// that declares itself a system instance.
fn register_system_generators(inner: &Arc<Inner>) -> Result<()> {
	for factory in super::factories() {
		if !factory.system_instance() {
			continue;
		}
		let kind = factory.kind();
		for rf_id in inner.registry.reference_frames.keys() {
			log::info!("About to register {kind} generator for reference frame {rf_id}.");

			let resource = Resource {
				id: ResourceId::new(rf_id, SYSTEM_GROUP, &kind.driver),
				generator: kind.clone(),
				comment: "autoregistered resource".to_owned(),
				revision: 0,
				credits: Vec::new(),
				lod_range: LodRange::new(0, 22)?,
				tile_range: TileRange::new(0, 0, 0, 0)?,
				definition: serde_json::json!({}),
				file_class_settings: Default::default(),
			};

			let generator = factory.create(inner.params(resource, true, None))?;
			inner.serving.lock().unwrap().insert(generator);
		}
	}
	Ok(())
}

/// The updater thread: periodically pulls the resource set from the
/// backend and reconciles the registry against it.
fn updater(inner: &Arc<Inner>) {
	// invalidate any update request
	*inner.updater.request.lock().unwrap() = false;
	inner.last_update.store(0, Ordering::SeqCst);

	while inner.running.load(Ordering::SeqCst) {
		// default sleep time in seconds
		let period = inner.config.resource_update_period;
		let mut sleep = Duration::from_secs(period.max(0) as u64);

		match inner.backend.load().and_then(|resources| update(inner, resources)) {
			Ok(()) => {
				inner.last_update.store(usec_from_epoch(), Ordering::SeqCst);
			}
			Err(err) if err.is::<AbortedUpdate>() => {}
			Err(err) => {
				log::error!("Resource info update failed: <{err:#}>.");
				if period > 0 {
					sleep = Duration::from_secs(5);
				}
			}
		}

		// sleep for the configured time or until an explicit request
		let guard = inner.updater.request.lock().unwrap();
		let predicate = |request: &mut bool| inner.running.load(Ordering::SeqCst) && !*request;
		let mut guard = if period > 0 {
			inner.updater.cond.wait_timeout_while(guard, sleep, predicate).unwrap().0
		} else {
			inner.updater.cond.wait_while(guard, predicate).unwrap()
		};
		*guard = false;
	}
}

/// One reconciliation pass: merge-walk the sorted current and incoming
/// sets and apply additions, removals and replacements.
fn update(inner: &Arc<Inner>, resources: BTreeMap<ResourceId, Resource>) -> Result<()> {
	log::debug!("Updating resources.");

	let current: Vec<(ResourceId, Arc<dyn Generator>)> = {
		let serving = inner.serving.lock().unwrap();
		serving.by_id.iter().map(|(id, g)| (id.clone(), g.clone())).collect()
	};
	let incoming: Vec<(&ResourceId, &Resource)> = resources.iter().collect();

	let mut to_add: Vec<Arc<dyn Generator>> = Vec::new();
	let mut to_remove: Vec<Arc<dyn Generator>> = Vec::new();
	let mut to_replace: Vec<Arc<dyn Generator>> = Vec::new();

	let add = |to_add: &mut Vec<Arc<dyn Generator>>, resource: &Resource| -> Result<()> {
		if !inner.running.load(Ordering::SeqCst) {
			return Err(AbortedUpdate.into());
		}
		match super::create(inner.params(resource.clone(), false, None)) {
			Ok(generator) => to_add.push(generator),
			Err(err) => {
				log::error!("Failed to create generator for resource <{}>: <{err:#}>.", resource.id);
			}
		}
		Ok(())
	};

	let replace = |to_replace: &mut Vec<Arc<dyn Generator>>,
	               resource: &Resource,
	               original: &Arc<dyn Generator>|
	 -> Result<()> {
		if !inner.running.load(Ordering::SeqCst) {
			return Err(AbortedUpdate.into());
		}
		match super::create(inner.params(resource.clone(), false, Some(original.clone()))) {
			Ok(generator) => to_replace.push(generator),
			Err(err) => {
				log::error!(
					"Failed to re-create generator for resource <{}>: <{err:#}>.",
					resource.id
				);
			}
		}
		Ok(())
	};

	// merge-walk both sorted sequences
	let mut in_index = 0;
	let mut cur_index = 0;
	while in_index < incoming.len() && cur_index < current.len() {
		let (resource_id, resource) = incoming[in_index];
		let (serving_id, generator) = &current[cur_index];

		if resource_id < serving_id {
			// new resource
			add(&mut to_add, resource)?;
			in_index += 1;
		} else if serving_id < resource_id {
			// removed resource
			if !generator.system() {
				to_remove.push(generator.clone());
			}
			cur_index += 1;
		} else {
			// existing resource
			match generator.changed(resource) {
				Changed::No => {}
				Changed::Yes => {
					if !inner.config.freezes(resource.generator.kind) {
						replace(&mut to_replace, resource, generator)?;
					} else {
						log::warn!(
							"Definition of resource <{}> differs from the served one; resource type is frozen, keeping the served definition.",
							resource.id
						);
					}
				}
				Changed::Safely | Changed::WithRevisionBump => {
					replace(&mut to_replace, resource, generator)?;
				}
			}
			in_index += 1;
			cur_index += 1;
		}
	}

	// process tail: added resources
	for &(_, resource) in &incoming[in_index..] {
		add(&mut to_add, resource)?;
	}

	// process tail: removed resources
	for (_, generator) in &current[cur_index..] {
		if !generator.system() {
			to_remove.push(generator.clone());
		}
	}

	// add stuff
	for generator in to_add {
		inner.serving.lock().unwrap().insert(generator.clone());
		if !generator.ready() {
			prepare(inner, generator);
		}
	}

	// remove stuff
	for generator in to_remove {
		inner.serving.lock().unwrap().remove(generator.id());
	}

	// replace stuff (after preparation)
	for generator in to_replace {
		if !generator.ready() {
			prepare(inner, generator);
		} else if let Some(original) = generator.take_replace() {
			inner.replace(&original, generator);
		}
	}

	log::debug!("Resources updated.");
	if !inner.ready.swap(true, Ordering::SeqCst) {
		log::info!("Ready to serve.");
	}

	// wait till all pending resources are available
	while inner.preparing.load(Ordering::SeqCst) > 0 && inner.running.load(Ordering::SeqCst) {
		std::thread::sleep(Duration::from_millis(100));
	}

	Ok(())
}

/// Queues preparation on the pool; a failed preparation removes the
/// generator from the serving set and reports to the backend.
fn prepare(inner: &Arc<Inner>, generator: Arc<dyn Generator>) {
	inner.preparing.fetch_add(1, Ordering::SeqCst);

	let handle = {
		let pool = inner.prepare_pool.lock().unwrap();
		match pool.as_ref() {
			Some(pool) => pool.handle().clone(),
			None => {
				// not started yet; the generator stays unready and is
				// retried on the next start
				inner.preparing.fetch_sub(1, Ordering::SeqCst);
				return;
			}
		}
	};

	let inner = inner.clone();
	handle.spawn_blocking(move || {
		let arsenal = inner.arsenal.read().unwrap().clone();
		let result = match arsenal {
			Some(arsenal) => generator.prepare(&arsenal),
			None => Err(anyhow::anyhow!("no arsenal available")),
		};

		if let Err(err) = result {
			log::warn!(
				"Failed to prepare generator for <{}> ({err:#}); removing from set of known generators.",
				generator.id()
			);
			inner.backend.error(generator.id(), &format!("{err:#}"));

			// remove this generator only; a failed replacement must not
			// take its still-serving predecessor down with it
			let mut serving = inner.serving.lock().unwrap();
			let is_serving = serving
				.by_id
				.get(generator.id())
				.is_some_and(|current| Arc::ptr_eq(current, &generator));
			if is_serving {
				serving.remove(generator.id());
			}
		} else if let Some(original) = generator.take_replace() {
			inner.replace(&original, generator.clone());
		}

		inner.preparing.fetch_sub(1, Ordering::SeqCst);
	});
}
