//! Seam between the orchestrator and whatever talks to the external API.

use async_trait::async_trait;
use thiserror::Error;

/// Result of one synchronization call.
///
/// An `error` next to a record count means the call got part of the data (e.g. some pages
/// failed), which is reported as a partial run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallResponse {
	pub record_count: u64,
	pub error: Option<String>,
}

impl CallResponse {
	#[must_use]
	pub const fn complete(record_count: u64) -> Self {
		Self {
			record_count,
			error: None,
		}
	}
}

/// Raw answer to a validation probe, classified by [`crate::probe::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
	pub status_code: u16,
	pub detail: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
	#[error("request timed out")]
	Timeout,
	#[error("connection failed: {0}")]
	Connection(String),
	#[error("unexpected status {status}: {detail}")]
	Status { status: u16, detail: String },
	#[error("response did not match the expected schema: {0}")]
	SchemaMismatch(String),
	#[error("{0}")]
	Other(String),
}

#[async_trait]
pub trait ExternalApi: Send + Sync + 'static {
	/// Synchronizes `process` through endpoint `version`.
	async fn call(&self, process: &str, version: &str) -> Result<CallResponse, ApiError>;

	/// Performs the lightest request able to tell whether `version` of `process` still answers
	/// with the expected contract.
	async fn probe(&self, process: &str, version: &str) -> Result<ProbeResponse, ApiError>;
}
