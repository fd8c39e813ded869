//! GDAL support for tilecast.
//!
//! GDAL is treated as an untrusted, non-thread-safe, occasionally-leaking
//! library: all warp and heightcoding work runs in forked worker processes
//! that communicate with the server over a shared-memory queue
//! ([`GdalWarper`]). The crate also provides the thin in-process pieces that
//! are safe to link directly: coordinate converters ([`CsConvertor`]) and
//! dataset probing ([`DatasetDescriptor`]).

mod dataset;
mod ops;
mod process;
mod raster;
mod requests;
mod shm;
mod srs;
mod warper;
mod worker;

pub use dataset::*;
pub use process::*;
pub use raster::*;
pub use requests::*;
pub use srs::*;
pub use warper::*;

/// Registers all GDAL drivers. Call once at startup, before the worker
/// pool forks.
pub fn register_all() {
	gdal::DriverManager::register_all();
}
