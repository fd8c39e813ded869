//! HTTP front-end.
//!
//! Parses request paths into file requests, drives generator tasks on the
//! blocking pool and translates sink results into responses. The routing is
//! deliberately thin; everything interesting happens behind the registry.

use crate::generator::{Generators, Task};
use crate::FileInfo;
use axum::{
	Router,
	body::Body,
	extract::State,
	http::{StatusCode, Uri, header},
	response::Response,
	routing::get,
};
use std::sync::Arc;
use tilecast_core::{BufferSink, BufferSinkState, FileClassSettings, GenerateError, Sink};
use tilecast_gdal::Arsenal;

pub struct ServerState {
	pub generators: Generators,
	pub arsenal: Arsenal,
}

pub fn router(state: Arc<ServerState>) -> Router {
	Router::new()
		.route("/status", get(|| async { "ready!" }))
		.route(
			"/stat",
			get(|State(state): State<Arc<ServerState>>| async move { state.generators.stat() }),
		)
		.fallback(get(serve_file))
		.with_state(state)
}

async fn serve_file(uri: Uri, State(state): State<Arc<ServerState>>) -> Response<Body> {
	let path = uri.path().to_owned();

	let outcome = tokio::task::spawn_blocking(move || {
		let sink = BufferSink::new();
		let settings = match serve_path(&state, &path, &sink) {
			Ok(settings) => Some(settings),
			Err(err) => {
				sink.error(err);
				None
			}
		};
		(sink.take(), settings)
	})
	.await;

	match outcome {
		Ok((sink_state, settings)) => into_response(sink_state, settings),
		Err(err) => {
			log::error!("request task failed: {err}");
			plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
		}
	}
}

/// Resolves the path to a generator and runs the resulting task to
/// completion. Returns the resource's file-class settings so that the
/// response can carry the right cache-control.
fn serve_path(state: &ServerState, path: &str, sink: &dyn Sink) -> Result<FileClassSettings, GenerateError> {
	let file_info = FileInfo::parse(path)?;

	let generator = state
		.generators
		.generator(file_info.generator_type, &file_info.resource)?
		.ok_or_else(|| GenerateError::NotFound(format!("No resource <{}>.", file_info.resource)))?;
	generator.core().check_ready()?;

	let settings = generator.resource().file_class_settings.clone();
	match generator.generate_file(&file_info, sink)? {
		Task::Done => {}
		Task::Run(task) => task(sink, &state.arsenal),
	}
	Ok(settings)
}

fn into_response(state: BufferSinkState, settings: Option<FileClassSettings>) -> Response<Body> {
	if let Some(err) = state.error {
		if matches!(err, GenerateError::EmptyDebugMask(_)) {
			// the debug interface expects an empty image, not an error
			return Response::builder()
				.status(StatusCode::OK)
				.header(header::CONTENT_TYPE, "image/png")
				.body(Body::empty())
				.expect("static response");
		}
		let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		return plain_response(status, &err.to_string());
	}

	let Some((data, info)) = state.content else {
		return plain_response(StatusCode::NOT_FOUND, "Not Found");
	};

	let cache_control = settings
		.and_then(|settings| settings.max_age(info.file_class))
		.map(|age| format!("public, max-age={age}"))
		.unwrap_or_else(|| "no-cache".to_owned());

	let mut builder = Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, info.content_type)
		.header(header::CACHE_CONTROL, cache_control);
	for (name, value) in info.headers.iter().chain(state.headers.iter()) {
		builder = builder.header(name, value);
	}
	builder.body(Body::from(data)).unwrap_or_else(|err| {
		log::error!("cannot build response: {err}");
		plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
	})
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(message.to_owned()))
		.expect("static response")
}
