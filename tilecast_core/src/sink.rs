//! The response channel between generators and the front-end.
//!
//! A [`Sink`] is handed to every tile-generation task; it carries content or
//! an error back to the client and lets long computations poll for client
//! aborts at block boundaries.

use crate::{FileClass, GenerateError};

/// Metadata attached to served content.
#[derive(Debug, Clone)]
pub struct SinkFileInfo {
	pub content_type: String,
	pub file_class: FileClass,
	pub last_modified: Option<i64>,
	pub headers: Vec<(String, String)>,
}

impl SinkFileInfo {
	pub fn new(content_type: &str, file_class: FileClass) -> SinkFileInfo {
		SinkFileInfo {
			content_type: content_type.to_owned(),
			file_class,
			last_modified: None,
			headers: Vec::new(),
		}
	}

	pub fn add_header(mut self, name: &str, value: &str) -> SinkFileInfo {
		self.headers.push((name.to_owned(), value.to_owned()));
		self
	}
}

pub trait Sink: Send + Sync {
	/// Sends content to the client. At most one of `content`/`error` is
	/// called per request.
	fn content(&self, data: Vec<u8>, info: &SinkFileInfo);

	/// Sends an error to the client.
	fn error(&self, err: GenerateError);

	/// Returns `Err(Aborted)` when the client has gone away. Tasks poll
	/// this at block boundaries; an abort unwinds the task but never
	/// preempts an in-flight warp.
	fn check_aborted(&self) -> Result<(), GenerateError>;

	/// Adds a response header.
	fn add_header(&self, name: &str, value: &str);
}

/// Sink that collects everything in memory; the test workhorse and the
/// backing store of the HTTP bridge.
#[derive(Default)]
pub struct BufferSink {
	state: std::sync::Mutex<BufferSinkState>,
	aborted: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
pub struct BufferSinkState {
	pub content: Option<(Vec<u8>, SinkFileInfo)>,
	pub error: Option<GenerateError>,
	pub headers: Vec<(String, String)>,
}

impl BufferSink {
	pub fn new() -> BufferSink {
		BufferSink::default()
	}

	pub fn abort(&self) {
		self.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
	}

	pub fn take(&self) -> BufferSinkState {
		std::mem::take(&mut *self.state.lock().unwrap())
	}
}

impl Sink for BufferSink {
	fn content(&self, data: Vec<u8>, info: &SinkFileInfo) {
		self.state.lock().unwrap().content = Some((data, info.clone()));
	}

	fn error(&self, err: GenerateError) {
		self.state.lock().unwrap().error = Some(err);
	}

	fn check_aborted(&self) -> Result<(), GenerateError> {
		if self.aborted.load(std::sync::atomic::Ordering::SeqCst) {
			Err(GenerateError::Aborted)
		} else {
			Ok(())
		}
	}

	fn add_header(&self, name: &str, value: &str) {
		self
			.state
			.lock()
			.unwrap()
			.headers
			.push((name.to_owned(), value.to_owned()));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn buffer_sink_collects_content() {
		let sink = BufferSink::new();
		sink.content(vec![1, 2, 3], &SinkFileInfo::new("application/octet-stream", FileClass::Data));
		let state = sink.take();
		assert_eq!(state.content.unwrap().0, vec![1, 2, 3]);
		assert!(state.error.is_none());
	}

	#[test]
	fn buffer_sink_reports_abort() {
		let sink = BufferSink::new();
		assert!(sink.check_aborted().is_ok());
		sink.abort();
		assert!(matches!(sink.check_aborted(), Err(GenerateError::Aborted)));
	}
}
