//! Error taxonomy shared by generators, the registry and the front-end.

use thiserror::Error;

/// Errors surfaced through the [`crate::Sink`] while generating content.
///
/// The front-end maps each kind to a transport status; the core never
/// retries on its own.
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
	/// Requested tile or file does not exist for this resource.
	#[error("not found: {0}")]
	NotFound(String),

	/// Debug endpoint for a missing tile; serves an empty mask instead of
	/// a plain 404.
	#[error("empty debug mask: {0}")]
	EmptyDebugMask(String),

	/// Generator or server not ready yet.
	#[error("unavailable: {0}")]
	Unavailable(String),

	/// No factory registered for the resource's generator type.
	#[error("unknown generator: {0}")]
	UnknownGenerator(String),

	/// Resource definition rejected by its generator.
	#[error("invalid configuration: {0}")]
	InvalidConfiguration(String),

	/// Programmer error or lost worker.
	#[error("internal error: {0}")]
	InternalError(String),

	/// Request cancelled by the client.
	#[error("request aborted")]
	Aborted,
}

impl GenerateError {
	pub fn http_status(&self) -> u16 {
		match self {
			GenerateError::NotFound(_) => 404,
			GenerateError::EmptyDebugMask(_) => 200,
			GenerateError::Unavailable(_) => 503,
			GenerateError::UnknownGenerator(_) => 404,
			GenerateError::InvalidConfiguration(_) => 500,
			GenerateError::InternalError(_) => 500,
			GenerateError::Aborted => 499,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_mapping() {
		assert_eq!(GenerateError::NotFound("x".into()).http_status(), 404);
		assert_eq!(GenerateError::Unavailable("x".into()).http_status(), 503);
		assert_eq!(GenerateError::Aborted.http_status(), 499);
	}
}
