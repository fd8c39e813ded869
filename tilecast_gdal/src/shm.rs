//! Shared-memory request queue and payload arena.
//!
//! One anonymous `MAP_SHARED` region is created before the workers fork.
//! It holds a control header (a process-shared robust mutex plus three
//! condition variables), a fixed slot table and a block arena for request
//! and response payloads. All access goes through [`RegionLock`], an RAII
//! guard over the header mutex; a worker dying while holding the mutex is
//! recovered via `EOWNERDEAD`.
//!
//! Blocks record their owning pid so that allocations orphaned by a dead
//! worker can be swept without touching live payloads.

use anyhow::{Result, bail, ensure};
use std::io;
use std::mem::size_of;
use std::time::Duration;

pub(crate) const SLOT_COUNT: usize = 64;

pub(crate) const SLOT_EMPTY: u32 = 0;
pub(crate) const SLOT_QUEUED: u32 = 1;
pub(crate) const SLOT_PROCESSING: u32 = 2;
pub(crate) const SLOT_DONE: u32 = 3;
pub(crate) const SLOT_FAILED: u32 = 4;

pub(crate) const ERR_NONE: u32 = 0;
pub(crate) const ERR_GDAL: u32 = 1;
pub(crate) const ERR_WORKER_DIED: u32 = 2;

pub(crate) const REQUEST_RASTER: u32 = 1;
pub(crate) const REQUEST_HEIGHTCODE: u32 = 2;
pub(crate) const REQUEST_NAV_HEIGHTCODE: u32 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot {
	pub state: u32,
	pub kind: u32,
	pub owner_pid: i32,
	pub request_offset: u32,
	pub request_len: u32,
	pub response_offset: u32,
	pub response_len: u32,
	pub error_code: u32,
}

#[repr(C)]
struct Header {
	mutex: libc::pthread_mutex_t,
	request_cond: libc::pthread_cond_t,
	response_cond: libc::pthread_cond_t,
	space_cond: libc::pthread_cond_t,
	shutdown: u32,
	generation: u32,
	queue_head: u32,
	queue_len: u32,
	queue: [u32; SLOT_COUNT],
	slots: [Slot; SLOT_COUNT],
	arena_offset: u32,
	arena_size: u32,
}

const BLOCK_ALIGN: u32 = 16;

#[repr(C)]
struct BlockHeader {
	/// Total block size including this header; blocks are contiguous, so
	/// the arena can be walked linearly.
	size: u32,
	in_use: u32,
	owner_pid: i32,
	_pad: u32,
}

const BLOCK_HEADER_SIZE: u32 = size_of::<BlockHeader>() as u32;

pub(crate) struct SharedRegion {
	base: *mut u8,
	size: usize,
}

// The region is plain shared memory; all mutation happens under the
// process-shared mutex inside it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
	/// Maps and initializes a fresh region of `size` bytes.
	pub fn create(size: usize) -> Result<SharedRegion> {
		ensure!(
			size >= size_of::<Header>() + 4096,
			"shared region too small ({size} bytes)"
		);

		// SAFETY: anonymous shared mapping, inherited by forked workers.
		let base = unsafe {
			libc::mmap(
				std::ptr::null_mut(),
				size,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_SHARED | libc::MAP_ANONYMOUS,
				-1,
				0,
			)
		};
		if base == libc::MAP_FAILED {
			bail!("mmap failed: {}", io::Error::last_os_error());
		}

		let region = SharedRegion {
			base: base.cast(),
			size,
		};

		// SAFETY: the mapping is zeroed and exclusively ours until the
		// first fork; initialize the process-shared primitives in place.
		unsafe {
			let header = region.header();

			let mut mutex_attr: libc::pthread_mutexattr_t = std::mem::zeroed();
			libc::pthread_mutexattr_init(&mut mutex_attr);
			libc::pthread_mutexattr_setpshared(&mut mutex_attr, libc::PTHREAD_PROCESS_SHARED);
			libc::pthread_mutexattr_setrobust(&mut mutex_attr, libc::PTHREAD_MUTEX_ROBUST);
			libc::pthread_mutex_init(&mut (*header).mutex, &mutex_attr);
			libc::pthread_mutexattr_destroy(&mut mutex_attr);

			let mut cond_attr: libc::pthread_condattr_t = std::mem::zeroed();
			libc::pthread_condattr_init(&mut cond_attr);
			libc::pthread_condattr_setpshared(&mut cond_attr, libc::PTHREAD_PROCESS_SHARED);
			libc::pthread_condattr_setclock(&mut cond_attr, libc::CLOCK_MONOTONIC);
			libc::pthread_cond_init(&mut (*header).request_cond, &cond_attr);
			libc::pthread_cond_init(&mut (*header).response_cond, &cond_attr);
			libc::pthread_cond_init(&mut (*header).space_cond, &cond_attr);
			libc::pthread_condattr_destroy(&mut cond_attr);

			let arena_offset = align_up(size_of::<Header>() as u32, 64);
			(*header).arena_offset = arena_offset;
			(*header).arena_size = (size as u32) - arena_offset;

			// the whole arena starts as one free block
			let block = region.block(arena_offset);
			(*block).size = (*header).arena_size;
			(*block).in_use = 0;
			(*block).owner_pid = 0;
		}

		Ok(region)
	}

	fn header(&self) -> *mut Header {
		self.base.cast()
	}

	fn block(&self, offset: u32) -> *mut BlockHeader {
		debug_assert!((offset as usize) + size_of::<BlockHeader>() <= self.size);
		// SAFETY: offset is within the mapping (asserted above).
		unsafe { self.base.add(offset as usize).cast() }
	}

	/// Locks the header mutex, recovering it when the previous owner died.
	pub fn lock(&self) -> RegionLock<'_> {
		// SAFETY: the mutex was initialized in `create`.
		unsafe {
			let rc = libc::pthread_mutex_lock(&mut (*self.header()).mutex);
			if rc == libc::EOWNERDEAD {
				libc::pthread_mutex_consistent(&mut (*self.header()).mutex);
			} else if rc != 0 {
				panic!("pthread_mutex_lock failed: {rc}");
			}
		}
		RegionLock { region: self }
	}
}

impl Drop for SharedRegion {
	fn drop(&mut self) {
		// SAFETY: unmapping our own mapping; workers hold their own copy
		// of the mapping and are unaffected.
		unsafe {
			libc::munmap(self.base.cast(), self.size);
		}
	}
}

fn align_up(value: u32, alignment: u32) -> u32 {
	(value + alignment - 1) & !(alignment - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
	Signaled,
	TimedOut,
}

/// RAII guard over the region mutex; the only way to touch the queue,
/// slots and arena.
pub(crate) struct RegionLock<'a> {
	region: &'a SharedRegion,
}

impl RegionLock<'_> {
	fn header(&self) -> *mut Header {
		self.region.header()
	}

	pub fn shutdown(&self) -> bool {
		unsafe { (*self.header()).shutdown != 0 }
	}

	pub fn set_shutdown(&mut self) {
		unsafe { (*self.header()).shutdown = 1 };
		self.broadcast_request();
		self.broadcast_response();
		self.broadcast_space();
	}

	pub fn generation(&self) -> u32 {
		unsafe { (*self.header()).generation }
	}

	pub fn bump_generation(&mut self) {
		unsafe { (*self.header()).generation += 1 };
	}

	pub fn slot(&self, index: usize) -> Slot {
		unsafe { (*self.header()).slots[index] }
	}

	pub fn slot_mut(&mut self, index: usize) -> &mut Slot {
		unsafe { &mut (*self.header()).slots[index] }
	}

	pub fn find_empty_slot(&self) -> Option<usize> {
		(0..SLOT_COUNT).find(|&index| self.slot(index).state == SLOT_EMPTY)
	}

	pub fn slots_in_state(&self, state: u32) -> Vec<usize> {
		(0..SLOT_COUNT).filter(|&index| self.slot(index).state == state).collect()
	}

	pub fn push_queue(&mut self, slot_index: u32) {
		unsafe {
			let header = &mut *self.header();
			debug_assert!((header.queue_len as usize) < SLOT_COUNT);
			let tail = (header.queue_head + header.queue_len) as usize % SLOT_COUNT;
			header.queue[tail] = slot_index;
			header.queue_len += 1;
		}
	}

	pub fn pop_queue(&mut self) -> Option<u32> {
		unsafe {
			let header = &mut *self.header();
			if header.queue_len == 0 {
				return None;
			}
			let slot_index = header.queue[header.queue_head as usize];
			header.queue_head = (header.queue_head + 1) % SLOT_COUNT as u32;
			header.queue_len -= 1;
			Some(slot_index)
		}
	}

	/// Allocates `len` payload bytes; returns the data offset, or `None`
	/// when the arena is exhausted (the caller waits on the space
	/// condition).
	pub fn alloc(&mut self, len: usize, owner_pid: i32) -> Option<u32> {
		let need = align_up(len as u32 + BLOCK_HEADER_SIZE, BLOCK_ALIGN);
		unsafe {
			let header = &*self.header();
			let arena_end = header.arena_offset + header.arena_size;
			let mut offset = header.arena_offset;
			while offset + BLOCK_HEADER_SIZE <= arena_end {
				let block = self.region.block(offset);
				if (*block).size == 0 {
					// corrupted chain; refuse to walk further
					return None;
				}
				if (*block).in_use == 0 {
					// coalesce the run of free blocks starting here
					loop {
						let next = offset + (*block).size;
						if next + BLOCK_HEADER_SIZE > arena_end {
							break;
						}
						let next_block = self.region.block(next);
						if (*next_block).in_use != 0 || (*next_block).size == 0 {
							break;
						}
						(*block).size += (*next_block).size;
					}

					if (*block).size >= need {
						let remainder = (*block).size - need;
						if remainder > BLOCK_HEADER_SIZE + BLOCK_ALIGN {
							let tail = self.region.block(offset + need);
							(*tail).size = remainder;
							(*tail).in_use = 0;
							(*tail).owner_pid = 0;
							(*block).size = need;
						}
						(*block).in_use = 1;
						(*block).owner_pid = owner_pid;
						return Some(offset + BLOCK_HEADER_SIZE);
					}
				}
				offset += (*block).size;
			}
		}
		None
	}

	/// Frees the block whose payload starts at `data_offset`.
	pub fn free(&mut self, data_offset: u32) {
		if data_offset < BLOCK_HEADER_SIZE {
			return;
		}
		unsafe {
			let block = self.region.block(data_offset - BLOCK_HEADER_SIZE);
			(*block).in_use = 0;
			(*block).owner_pid = 0;
		}
	}

	/// Frees blocks owned by a dead worker that no slot references
	/// anymore; they were allocated between a crash and the bookkeeping
	/// that would have recorded them.
	pub fn sweep_dead(&mut self, dead_pid: i32) {
		let mut referenced = Vec::new();
		for index in 0..SLOT_COUNT {
			let slot = self.slot(index);
			if slot.state != SLOT_EMPTY {
				if slot.request_len > 0 {
					referenced.push(slot.request_offset);
				}
				if slot.response_len > 0 {
					referenced.push(slot.response_offset);
				}
			}
		}

		unsafe {
			let header = &*self.header();
			let arena_end = header.arena_offset + header.arena_size;
			let mut offset = header.arena_offset;
			while offset + BLOCK_HEADER_SIZE <= arena_end {
				let block = self.region.block(offset);
				if (*block).size == 0 {
					break;
				}
				let data_offset = offset + BLOCK_HEADER_SIZE;
				if (*block).in_use != 0 && (*block).owner_pid == dead_pid && !referenced.contains(&data_offset) {
					(*block).in_use = 0;
					(*block).owner_pid = 0;
				}
				offset += (*block).size;
			}
		}
	}

	pub fn bytes(&self, data_offset: u32, len: usize) -> &[u8] {
		debug_assert!(data_offset as usize + len <= self.region.size);
		// SAFETY: the range lies within the mapping; the caller holds the
		// region lock so nobody mutates it concurrently.
		unsafe { std::slice::from_raw_parts(self.region.base.add(data_offset as usize), len) }
	}

	pub fn write_bytes(&mut self, data_offset: u32, data: &[u8]) {
		debug_assert!(data_offset as usize + data.len() <= self.region.size);
		// SAFETY: as in `bytes`.
		unsafe {
			std::ptr::copy_nonoverlapping(data.as_ptr(), self.region.base.add(data_offset as usize), data.len());
		}
	}

	pub fn wait_request(&mut self, timeout: Duration) -> WaitOutcome {
		unsafe { self.wait(&mut (*self.header()).request_cond as *mut _, timeout) }
	}

	pub fn wait_response(&mut self, timeout: Duration) -> WaitOutcome {
		unsafe { self.wait(&mut (*self.header()).response_cond as *mut _, timeout) }
	}

	pub fn wait_space(&mut self, timeout: Duration) -> WaitOutcome {
		unsafe { self.wait(&mut (*self.header()).space_cond as *mut _, timeout) }
	}

	pub fn signal_request(&self) {
		unsafe { libc::pthread_cond_signal(&mut (*self.header()).request_cond) };
	}

	pub fn broadcast_request(&self) {
		unsafe { libc::pthread_cond_broadcast(&mut (*self.header()).request_cond) };
	}

	pub fn broadcast_response(&self) {
		unsafe { libc::pthread_cond_broadcast(&mut (*self.header()).response_cond) };
	}

	pub fn broadcast_space(&self) {
		unsafe { libc::pthread_cond_broadcast(&mut (*self.header()).space_cond) };
	}

	unsafe fn wait(&mut self, cond: *mut libc::pthread_cond_t, timeout: Duration) -> WaitOutcome {
		let mut now: libc::timespec = std::mem::zeroed();
		libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
		let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
		let deadline = libc::timespec {
			tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
			tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
		};

		let rc = libc::pthread_cond_timedwait(cond, &mut (*self.header()).mutex, &deadline);
		match rc {
			0 => WaitOutcome::Signaled,
			libc::ETIMEDOUT => WaitOutcome::TimedOut,
			libc::EOWNERDEAD => {
				libc::pthread_mutex_consistent(&mut (*self.header()).mutex);
				WaitOutcome::Signaled
			}
			other => panic!("pthread_cond_timedwait failed: {other}"),
		}
	}
}

impl Drop for RegionLock<'_> {
	fn drop(&mut self) {
		// SAFETY: we hold the lock.
		unsafe {
			libc::pthread_mutex_unlock(&mut (*self.header()).mutex);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn region() -> SharedRegion {
		SharedRegion::create(256 * 1024).unwrap()
	}

	#[test]
	fn alloc_free_reuse() {
		let region = region();
		let mut lock = region.lock();

		let a = lock.alloc(1000, 1).unwrap();
		let b = lock.alloc(1000, 1).unwrap();
		assert_ne!(a, b);

		lock.write_bytes(a, &[7u8; 1000]);
		assert_eq!(lock.bytes(a, 1000)[999], 7);

		lock.free(a);
		let c = lock.alloc(900, 1).unwrap();
		// freed space is reused
		assert_eq!(c, a);
		lock.free(b);
		lock.free(c);
	}

	#[test]
	fn alloc_exhaustion_returns_none() {
		let region = region();
		let mut lock = region.lock();
		let mut offsets = Vec::new();
		while let Some(offset) = lock.alloc(16 * 1024, 1) {
			offsets.push(offset);
		}
		assert!(!offsets.is_empty());
		// freeing everything coalesces the arena back into one run
		for offset in offsets {
			lock.free(offset);
		}
		assert!(lock.alloc(128 * 1024, 1).is_some());
	}

	#[test]
	fn sweep_reclaims_orphans_only() {
		let region = region();
		let mut lock = region.lock();

		let orphan = lock.alloc(512, 42).unwrap();
		let referenced = lock.alloc(512, 42).unwrap();

		// a slot still references the second block
		let slot = lock.slot_mut(0);
		slot.state = SLOT_PROCESSING;
		slot.request_offset = referenced;
		slot.request_len = 512;

		lock.sweep_dead(42);

		// the orphan is reusable, the referenced block is not
		assert_eq!(lock.alloc(512, 1), Some(orphan));
		assert_ne!(lock.alloc(512, 1), Some(referenced));
	}

	#[test]
	fn queue_is_fifo() {
		let region = region();
		let mut lock = region.lock();
		assert_eq!(lock.pop_queue(), None);
		lock.push_queue(3);
		lock.push_queue(9);
		assert_eq!(lock.pop_queue(), Some(3));
		assert_eq!(lock.pop_queue(), Some(9));
		assert_eq!(lock.pop_queue(), None);
	}

	#[test]
	fn timed_wait_times_out() {
		let region = region();
		let mut lock = region.lock();
		let outcome = lock.wait_request(Duration::from_millis(20));
		assert_eq!(outcome, WaitOutcome::TimedOut);
	}

	#[test]
	fn slots_start_empty() {
		let region = region();
		let lock = region.lock();
		assert_eq!(lock.find_empty_slot(), Some(0));
		assert_eq!(lock.slots_in_state(SLOT_EMPTY).len(), SLOT_COUNT);
	}
}
