//! Worker-process main loop.
//!
//! A worker pops queued requests from the shared region, runs the GDAL
//! operation with no locks held and publishes the result (or error message)
//! back into the arena. Workers never touch the parent's dedup state; they
//! only see slots.

use crate::ops;
use crate::shm::{
	REQUEST_HEIGHTCODE, REQUEST_NAV_HEIGHTCODE, REQUEST_RASTER, SLOT_DONE, SLOT_FAILED, SLOT_PROCESSING, SharedRegion,
	ERR_GDAL,
};
use std::time::Duration;

pub(crate) fn worker_main(region: &SharedRegion) {
	crate::register_all();
	let pid = std::process::id() as i32;
	// SAFETY: plain getppid.
	let parent = unsafe { libc::getppid() };
	log::debug!("spawned gdal worker pid {pid}");

	loop {
		// pop one request under the lock
		let (slot_index, kind, request) = {
			let mut lock = region.lock();
			loop {
				if lock.shutdown() {
					return;
				}
				// a reparented worker has lost its server; bail out
				if unsafe { libc::getppid() } != parent {
					return;
				}
				if let Some(slot_index) = lock.pop_queue() {
					let slot_index = slot_index as usize;
					let (offset, len, kind) = {
						let slot = lock.slot_mut(slot_index);
						slot.state = SLOT_PROCESSING;
						slot.owner_pid = pid;
						(slot.request_offset, slot.request_len, slot.kind)
					};
					let request = lock.bytes(offset, len as usize).to_vec();
					// the payload is copied out; release it right away
					lock.free(offset);
					let slot = lock.slot_mut(slot_index);
					slot.request_offset = 0;
					slot.request_len = 0;
					lock.broadcast_space();
					break (slot_index, kind, request);
				}
				lock.wait_request(Duration::from_millis(500));
			}
		};

		// run the GDAL operation unlocked; this is the expensive part
		let result = execute(kind, &request);

		// publish the outcome
		let (payload, error_code): (Vec<u8>, u32) = match result {
			Ok(bytes) => (bytes, 0),
			Err(err) => {
				log::warn!("gdal operation failed: {err:#}");
				(format!("{err:#}").into_bytes(), ERR_GDAL)
			}
		};

		let mut lock = region.lock();

		let offset = if payload.is_empty() {
			0
		} else {
			let offset = loop {
				if let Some(offset) = lock.alloc(payload.len(), pid) {
					break offset;
				}
				if lock.shutdown() {
					return;
				}
				lock.wait_space(Duration::from_millis(500));
			};
			lock.write_bytes(offset, &payload);
			offset
		};

		let slot = lock.slot_mut(slot_index);
		slot.response_offset = offset;
		slot.response_len = payload.len() as u32;
		slot.error_code = error_code;
		slot.state = if error_code == 0 { SLOT_DONE } else { SLOT_FAILED };
		lock.broadcast_response();
	}
}

fn execute(kind: u32, request: &[u8]) -> anyhow::Result<Vec<u8>> {
	match kind {
		REQUEST_RASTER => {
			let request: crate::RasterRequest = serde_json::from_slice(request)?;
			Ok(ops::warp_raster(&request)?.encode())
		}
		REQUEST_HEIGHTCODE => {
			let request: crate::HeightcodeRequest = serde_json::from_slice(request)?;
			ops::heightcode(&request)
		}
		REQUEST_NAV_HEIGHTCODE => {
			let request: crate::NavHeightcodeRequest = serde_json::from_slice(request)?;
			ops::nav_heightcode(&request)
		}
		other => anyhow::bail!("unknown request kind {other}"),
	}
}
