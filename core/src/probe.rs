use crate::{
	api::{ApiError, ExternalApi, ProbeResponse},
	clock::Clock,
	endpoint::ValidationRecord,
	ErrorKind,
};

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Error string of results for which the external API could not be reached at all.
pub const UNREACHABLE: &str = "unreachable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValidationOutcome {
	Valid,
	/// The external API answered and the version is gone or speaks another contract.
	Invalid,
	/// No usable answer, nothing is known about the version.
	Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
	pub process: String,
	pub version: String,
	pub is_valid: bool,
	pub status: String,
	pub error: Option<String>,
	pub outcome: ValidationOutcome,
	pub checked_at: DateTime<Utc>,
}

impl ValidationResult {
	#[must_use]
	pub fn error_kind(&self) -> Option<ErrorKind> {
		match self.outcome {
			ValidationOutcome::Valid => None,
			ValidationOutcome::Invalid => Some(ErrorKind::ValidationMismatch),
			ValidationOutcome::Unreachable => Some(ErrorKind::ExternalUnavailable),
		}
	}

	#[must_use]
	pub fn to_record(&self) -> ValidationRecord {
		ValidationRecord {
			valid: self.is_valid,
			outcome: self.outcome,
			checked_at: self.checked_at,
			detail: self.status.clone(),
		}
	}

	fn unreachable(process: &str, version: &str, status: String, checked_at: DateTime<Utc>) -> Self {
		Self {
			process: process.to_owned(),
			version: version.to_owned(),
			is_valid: false,
			status,
			error: Some(UNREACHABLE.to_owned()),
			outcome: ValidationOutcome::Unreachable,
			checked_at,
		}
	}
}

/// Maps a probe answer onto valid / invalid / unreachable.
///
/// Only 404 and 410 prove that a version is gone. Other non-2xx answers (server errors, error
/// limiting, expired tokens) say nothing about the version and are reported as unreachable.
#[must_use]
pub fn classify(
	process: &str,
	version: &str,
	response: Result<ProbeResponse, ApiError>,
	checked_at: DateTime<Utc>,
) -> ValidationResult {
	let invalid = |status: String| ValidationResult {
		process: process.to_owned(),
		version: version.to_owned(),
		is_valid: false,
		status,
		error: None,
		outcome: ValidationOutcome::Invalid,
		checked_at,
	};

	match response {
		Ok(ProbeResponse {
			status_code: 200..=299,
			detail,
		}) => ValidationResult {
			process: process.to_owned(),
			version: version.to_owned(),
			is_valid: true,
			status: if detail.is_empty() {
				"ok".to_owned()
			} else {
				detail
			},
			error: None,
			outcome: ValidationOutcome::Valid,
			checked_at,
		},

		Ok(ProbeResponse {
			status_code: status_code @ (404 | 410),
			detail,
		})
		| Err(ApiError::Status {
			status: status_code @ (404 | 410),
			detail,
		}) => invalid(format!(
			"endpoint {version} answered {status_code}, version no longer served: {detail}"
		)),

		Err(ApiError::SchemaMismatch(detail)) => invalid(format!("schema mismatch: {detail}")),

		Ok(ProbeResponse {
			status_code,
			detail,
		})
		| Err(ApiError::Status {
			status: status_code,
			detail,
		}) => ValidationResult::unreachable(
			process,
			version,
			format!("http {status_code}: {detail}"),
			checked_at,
		),

		Err(e @ (ApiError::Timeout | ApiError::Connection(_) | ApiError::Other(_))) => {
			ValidationResult::unreachable(process, version, e.to_string(), checked_at)
		}
	}
}

/// Stateless checker of endpoint versions against the external API.
#[derive(Clone)]
pub struct ValidationProbe {
	api: Arc<dyn ExternalApi>,
	clock: Arc<dyn Clock>,
	timeout: Duration,
	concurrency: usize,
}

impl ValidationProbe {
	pub fn new(
		api: Arc<dyn ExternalApi>,
		clock: Arc<dyn Clock>,
		timeout: Duration,
		concurrency: usize,
	) -> Self {
		Self {
			api,
			clock,
			timeout,
			concurrency: concurrency.max(1),
		}
	}

	#[instrument(skip(self))]
	pub async fn validate(&self, process: &str, version: &str) -> ValidationResult {
		let response = match timeout(
			self.timeout,
			AssertUnwindSafe(self.api.probe(process, version)).catch_unwind(),
		)
		.await
		{
			Ok(Ok(response)) => response,
			Ok(Err(_)) => {
				warn!("Validation probe panicked;");
				Err(ApiError::Other("probe panicked".to_owned()))
			}
			Err(_) => Err(ApiError::Timeout),
		};

		let result = classify(process, version, response, self.clock.now());

		debug!(outcome = %result.outcome, status = %result.status, "Validated endpoint;");

		result
	}

	/// Validates every `(process, version)` pair with at most `concurrency` probes in flight.
	///
	/// Results come back in input order and every pair gets one, whatever the others did.
	pub async fn validate_all(
		&self,
		targets: impl IntoIterator<Item = (String, String)>,
	) -> Vec<ValidationResult> {
		stream::iter(targets)
			.map(|(process, version)| async move { self.validate(&process, &version).await })
			.buffered(self.concurrency)
			.collect()
			.await
	}
}
