//! Parent-side interface to the worker pool.
//!
//! [`GdalWarper`] owns the shared region, the forked workers and two
//! service threads: a collector that copies finished responses out of the
//! arena and a keeper that reaps dead workers, fails their in-flight
//! requests and forks replacements. Identical in-flight requests are
//! deduplicated by fingerprint: each fingerprint is computed by a worker at
//! most once and every waiter receives the same shared result.

use crate::process::{JoinError, Process};
use crate::raster::{Heightcoded, Raster};
use crate::requests::{HeightcodeRequest, NavHeightcodeRequest, RasterRequest};
use crate::shm::{
	ERR_WORKER_DIED, REQUEST_HEIGHTCODE, REQUEST_NAV_HEIGHTCODE, REQUEST_RASTER, SLOT_DONE, SLOT_FAILED,
	SLOT_PROCESSING, SLOT_QUEUED, SharedRegion, Slot,
};
use crate::worker::worker_main;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tilecast_core::{GenerateError, Sink};

#[derive(Debug, Clone)]
pub struct WarperOptions {
	/// Number of worker processes forked at start.
	pub process_count: usize,
	/// Size of the shared-memory region in bytes.
	pub region_size: usize,
	/// How long a submitter waits for arena space before giving up.
	pub submit_timeout: Duration,
}

impl Default for WarperOptions {
	fn default() -> WarperOptions {
		WarperOptions {
			process_count: 4,
			region_size: 64 * 1024 * 1024,
			submit_timeout: Duration::from_secs(30),
		}
	}
}

#[derive(Clone)]
enum ResponsePayload {
	Raster(Arc<Raster>),
	Heightcoded(Arc<Heightcoded>),
}

/// One deduplicated in-flight computation; waiters block on `cond` until
/// the collector publishes the shared result.
struct InFlight {
	result: Mutex<Option<Result<ResponsePayload, GenerateError>>>,
	cond: Condvar,
}

impl InFlight {
	fn new() -> InFlight {
		InFlight {
			result: Mutex::new(None),
			cond: Condvar::new(),
		}
	}

	fn complete(&self, result: Result<ResponsePayload, GenerateError>) {
		*self.result.lock().unwrap() = Some(result);
		self.cond.notify_all();
	}
}

#[derive(Default)]
struct Pending {
	by_fingerprint: HashMap<u64, Arc<InFlight>>,
	by_slot: HashMap<usize, (u64, Arc<InFlight>)>,
}

struct Inner {
	region: SharedRegion,
	options: WarperOptions,
	running: AtomicBool,
	workers: Mutex<Vec<Process>>,
	pending: Mutex<Pending>,
	/// Requests actually placed in the queue; dedup'd attachments do not
	/// count.
	enqueued: AtomicU64,
}

#[derive(Clone)]
pub struct GdalWarper {
	inner: Arc<Inner>,
	threads: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
}

impl GdalWarper {
	pub fn new(options: WarperOptions) -> Result<GdalWarper> {
		let region = SharedRegion::create(options.region_size).context("cannot create shared region")?;
		let inner = Arc::new(Inner {
			region,
			options,
			running: AtomicBool::new(true),
			workers: Mutex::new(Vec::new()),
			pending: Mutex::new(Pending::default()),
			enqueued: AtomicU64::new(0),
		});

		// fork workers before any service threads exist
		{
			let mut workers = inner.workers.lock().unwrap();
			for _ in 0..inner.options.process_count.max(1) {
				workers.push(spawn_worker(&inner)?);
			}
		}

		let mut threads = Vec::new();
		{
			let inner = inner.clone();
			threads.push(
				std::thread::Builder::new()
					.name("gdal-collector".to_owned())
					.spawn(move || collector_loop(&inner))?,
			);
		}
		{
			let inner = inner.clone();
			threads.push(
				std::thread::Builder::new()
					.name("gdal-keeper".to_owned())
					.spawn(move || keeper_loop(&inner))?,
			);
		}

		Ok(GdalWarper {
			inner,
			threads: Arc::new(Mutex::new(threads)),
		})
	}

	/// Warps a raster; identical concurrent requests share one computation.
	pub fn warp(&self, request: &RasterRequest, sink: &dyn Sink) -> Result<Arc<Raster>, GenerateError> {
		let payload = serde_json::to_vec(request)
			.map_err(|err| GenerateError::InternalError(format!("cannot serialize request: {err}")))?;
		match self.submit(request.fingerprint(), REQUEST_RASTER, payload, sink)? {
			ResponsePayload::Raster(raster) => Ok(raster),
			ResponsePayload::Heightcoded(_) => Err(GenerateError::InternalError("response kind mismatch".to_owned())),
		}
	}

	/// Heightcodes a vector dataset against a DEM stack.
	pub fn heightcode(&self, request: &HeightcodeRequest, sink: &dyn Sink) -> Result<Arc<Heightcoded>, GenerateError> {
		let payload = serde_json::to_vec(request)
			.map_err(|err| GenerateError::InternalError(format!("cannot serialize request: {err}")))?;
		match self.submit(request.fingerprint(), REQUEST_HEIGHTCODE, payload, sink)? {
			ResponsePayload::Heightcoded(heightcoded) => Ok(heightcoded),
			ResponsePayload::Raster(_) => Err(GenerateError::InternalError("response kind mismatch".to_owned())),
		}
	}

	/// Heightcodes a vector dataset against a navtile with a DEM fallback.
	pub fn nav_heightcode(
		&self,
		request: &NavHeightcodeRequest,
		sink: &dyn Sink,
	) -> Result<Arc<Heightcoded>, GenerateError> {
		let payload = serde_json::to_vec(request)
			.map_err(|err| GenerateError::InternalError(format!("cannot serialize request: {err}")))?;
		match self.submit(request.fingerprint(), REQUEST_NAV_HEIGHTCODE, payload, sink)? {
			ResponsePayload::Heightcoded(heightcoded) => Ok(heightcoded),
			ResponsePayload::Raster(_) => Err(GenerateError::InternalError("response kind mismatch".to_owned())),
		}
	}

	/// Requests actually handed to workers since start; deduplicated
	/// attachments do not move this counter.
	pub fn enqueued_count(&self) -> u64 {
		self.inner.enqueued.load(Ordering::SeqCst)
	}

	/// Number of requests currently being executed by workers.
	pub fn busy_workers(&self) -> usize {
		self.inner.region.lock().slots_in_state(SLOT_PROCESSING).len()
	}

	/// Pids of the live worker processes.
	pub fn worker_pids(&self) -> Vec<i32> {
		self.inner.workers.lock().unwrap().iter().map(|worker| worker.id()).collect()
	}

	/// Shuts the pool down: signals workers, joins them and the service
	/// threads, and fails any still-waiting requests.
	pub fn stop(&self) {
		if !self.inner.running.swap(false, Ordering::SeqCst) {
			return;
		}
		self.inner.region.lock().set_shutdown();

		{
			// give idle workers a chance to exit cleanly, then kill the
			// stragglers (a worker wedged inside GDAL never notices the
			// shutdown flag)
			let mut workers = self.inner.workers.lock().unwrap();
			let deadline = Instant::now() + Duration::from_secs(2);
			for worker in workers.iter_mut() {
				loop {
					match worker.join(true) {
						Ok(_) | Err(JoinError::Sys(_)) => break,
						Err(JoinError::Alive) => {
							if Instant::now() >= deadline {
								let _ = worker.kill();
								let _ = worker.join(false);
								break;
							}
							std::thread::sleep(Duration::from_millis(50));
						}
					}
				}
			}
			workers.clear();
		}

		for handle in self.threads.lock().unwrap().drain(..) {
			let _ = handle.join();
		}

		let mut pending = self.inner.pending.lock().unwrap();
		for (_, entry) in pending.by_fingerprint.drain() {
			entry.complete(Err(GenerateError::Unavailable("gdal pool stopped".to_owned())));
		}
		pending.by_slot.clear();
	}

	fn submit(
		&self,
		fingerprint: u64,
		kind: u32,
		payload: Vec<u8>,
		sink: &dyn Sink,
	) -> Result<ResponsePayload, GenerateError> {
		if !self.inner.running.load(Ordering::SeqCst) {
			return Err(GenerateError::Unavailable("gdal pool not running".to_owned()));
		}

		// dedup: attach to an identical in-flight request when possible
		let (entry, fresh) = {
			let mut pending = self.inner.pending.lock().unwrap();
			match pending.by_fingerprint.get(&fingerprint) {
				Some(entry) => (entry.clone(), false),
				None => {
					let entry = Arc::new(InFlight::new());
					pending.by_fingerprint.insert(fingerprint, entry.clone());
					(entry.clone(), true)
				}
			}
		};

		if fresh {
			if let Err(err) = self.enqueue(fingerprint, kind, payload, &entry) {
				self.inner.pending.lock().unwrap().by_fingerprint.remove(&fingerprint);
				entry.complete(Err(err.clone()));
				return Err(err);
			}
		}

		self.wait(&entry, sink)
	}

	fn enqueue(&self, fingerprint: u64, kind: u32, payload: Vec<u8>, entry: &Arc<InFlight>) -> Result<(), GenerateError> {
		let deadline = Instant::now() + self.inner.options.submit_timeout;
		let parent_pid = std::process::id() as i32;

		let mut lock = self.inner.region.lock();
		loop {
			if !self.inner.running.load(Ordering::SeqCst) {
				return Err(GenerateError::Unavailable("gdal pool stopped".to_owned()));
			}

			if let Some(slot_index) = lock.find_empty_slot() {
				if let Some(offset) = lock.alloc(payload.len(), parent_pid) {
					lock.write_bytes(offset, &payload);
					let slot = lock.slot_mut(slot_index);
					*slot = Slot {
						state: SLOT_QUEUED,
						kind,
						owner_pid: 0,
						request_offset: offset,
						request_len: payload.len() as u32,
						response_offset: 0,
						response_len: 0,
						error_code: 0,
					};
					lock.push_queue(slot_index as u32);
					lock.signal_request();
					self.inner.enqueued.fetch_add(1, Ordering::SeqCst);

					// region lock is still held, so the collector cannot
					// observe the finished slot before this mapping exists
					self
						.inner
						.pending
						.lock()
						.unwrap()
						.by_slot
						.insert(slot_index, (fingerprint, entry.clone()));
					return Ok(());
				}
			}

			// back-pressure: wait for a slot or for arena space
			if Instant::now() >= deadline {
				return Err(GenerateError::InternalError(
					"shared memory exhausted while submitting request".to_owned(),
				));
			}
			lock.wait_space(Duration::from_millis(250));
		}
	}

	fn wait(&self, entry: &Arc<InFlight>, sink: &dyn Sink) -> Result<ResponsePayload, GenerateError> {
		let mut guard = entry.result.lock().unwrap();
		loop {
			if let Some(result) = guard.as_ref() {
				return result.clone();
			}
			// dropping the waiter on abort leaves the computation running
			// to its natural end; remaining waiters still get the result
			sink.check_aborted()?;
			let (next, _) = entry.cond.wait_timeout(guard, Duration::from_millis(100)).unwrap();
			guard = next;
		}
	}
}

#[derive(Clone)]
pub struct Arsenal {
	pub warper: GdalWarper,
}

impl Arsenal {
	pub fn new(options: WarperOptions) -> Result<Arsenal> {
		Ok(Arsenal {
			warper: GdalWarper::new(options)?,
		})
	}

	pub fn stop(&self) {
		self.warper.stop();
	}
}

fn spawn_worker(inner: &Arc<Inner>) -> Result<Process> {
	let region = &inner.region;
	Process::spawn(|| worker_main(region))
}

fn collector_loop(inner: &Arc<Inner>) {
	while inner.running.load(Ordering::SeqCst) {
		let mut completed: Vec<(Arc<InFlight>, u32, u32, Vec<u8>)> = Vec::new();
		{
			let mut lock = inner.region.lock();
			let ready: Vec<usize> = lock
				.slots_in_state(SLOT_DONE)
				.into_iter()
				.chain(lock.slots_in_state(SLOT_FAILED))
				.collect();

			if !ready.is_empty() {
				let mut pending = inner.pending.lock().unwrap();
				for slot_index in ready {
					let Some((fingerprint, entry)) = pending.by_slot.remove(&slot_index) else {
						continue;
					};
					pending.by_fingerprint.remove(&fingerprint);

					let slot = lock.slot(slot_index);
					let payload = if slot.response_len > 0 {
						let bytes = lock.bytes(slot.response_offset, slot.response_len as usize).to_vec();
						lock.free(slot.response_offset);
						bytes
					} else {
						Vec::new()
					};

					*lock.slot_mut(slot_index) = Slot {
						state: crate::shm::SLOT_EMPTY,
						kind: 0,
						owner_pid: 0,
						request_offset: 0,
						request_len: 0,
						response_offset: 0,
						response_len: 0,
						error_code: 0,
					};
					completed.push((entry, slot.kind, slot.error_code, payload));
				}
				lock.broadcast_space();
			}

			if completed.is_empty() {
				lock.wait_response(Duration::from_millis(200));
			}
		}

		for (entry, kind, error_code, payload) in completed {
			entry.complete(decode_response(kind, error_code, payload));
		}
	}
}

fn decode_response(kind: u32, error_code: u32, payload: Vec<u8>) -> Result<ResponsePayload, GenerateError> {
	match error_code {
		0 => match kind {
			REQUEST_RASTER => Raster::decode(&payload)
				.map(|raster| ResponsePayload::Raster(Arc::new(raster)))
				.map_err(|err| GenerateError::InternalError(format!("cannot decode raster response: {err}"))),
			REQUEST_HEIGHTCODE | REQUEST_NAV_HEIGHTCODE => {
				Ok(ResponsePayload::Heightcoded(Arc::new(Heightcoded { data: payload })))
			}
			other => Err(GenerateError::InternalError(format!("unknown response kind {other}"))),
		},
		ERR_WORKER_DIED => Err(GenerateError::InternalError("worker died".to_owned())),
		_ => Err(GenerateError::InternalError(
			String::from_utf8_lossy(&payload).into_owned(),
		)),
	}
}

fn keeper_loop(inner: &Arc<Inner>) {
	while inner.running.load(Ordering::SeqCst) {
		std::thread::sleep(Duration::from_millis(200));

		let mut dead = Vec::new();
		{
			let mut workers = inner.workers.lock().unwrap();
			for worker in workers.iter_mut() {
				let pid = worker.id();
				match worker.join(true) {
					Err(JoinError::Alive) => {}
					Ok(status) => {
						log::warn!("gdal worker {pid} terminated ({status:?})");
						dead.push(pid);
					}
					Err(JoinError::Sys(err)) => {
						log::error!("cannot check gdal worker {pid}: {err}");
					}
				}
			}
			if dead.is_empty() {
				continue;
			}
			workers.retain(|worker| worker.joinable());

			if !inner.running.load(Ordering::SeqCst) {
				continue;
			}

			// fail the dead workers' in-flight requests and reclaim their
			// orphaned arena blocks
			{
				let mut lock = inner.region.lock();
				for slot_index in lock.slots_in_state(SLOT_PROCESSING) {
					let slot = lock.slot(slot_index);
					if dead.contains(&slot.owner_pid) {
						let slot = lock.slot_mut(slot_index);
						slot.state = SLOT_FAILED;
						slot.error_code = ERR_WORKER_DIED;
						slot.response_offset = 0;
						slot.response_len = 0;
					}
				}
				for &pid in &dead {
					lock.sweep_dead(pid);
				}
				lock.bump_generation();
				lock.broadcast_response();
				lock.broadcast_space();
			}

			for _ in &dead {
				match spawn_worker(inner) {
					Ok(worker) => workers.push(worker),
					Err(err) => log::error!("cannot respawn gdal worker: {err:#}"),
				}
			}
		}
	}
}
